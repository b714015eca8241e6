//! Execution contexts and context shortcuts.
//!
//! Resources and routines are declared against a [`ContextKey`], which is
//! either a primitive [`Context`] or a shortcut naming several of them:
//!
//! - `local` = `single` + `site`
//! - `global` = `single` + `network`
//! - `universal` = `single` + `site` + `network`

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::InstallError;

/// Scope an install, update or uninstall routine runs in.
///
/// Variant order is execution order: network-level state is written before
/// per-site routines read it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Context {
    /// Network-wide, once per network.
    Network,
    /// One site within a network.
    Site,
    /// A standalone (non-multisite) install.
    Single,
}

impl Context {
    /// All contexts, in execution order.
    pub const ALL: [Context; 3] = [Context::Network, Context::Site, Context::Single];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Site => "site",
            Self::Single => "single",
        }
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A declared context name: a primitive context or a shortcut.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextKey {
    Single,
    Site,
    Network,
    Local,
    Global,
    Universal,
}

/// Valid context key names, for error messages.
pub const CONTEXT_KEYS: &[&str] = &["single", "site", "network", "local", "global", "universal"];

impl ContextKey {
    /// The primitive contexts this key stands for.
    pub fn contexts(self) -> &'static [Context] {
        match self {
            Self::Single => &[Context::Single],
            Self::Site => &[Context::Site],
            Self::Network => &[Context::Network],
            Self::Local => &[Context::Single, Context::Site],
            Self::Global => &[Context::Single, Context::Network],
            Self::Universal => &[Context::Single, Context::Site, Context::Network],
        }
    }

    /// Whether this key is a shortcut rather than a primitive context.
    pub fn is_shortcut(self) -> bool {
        matches!(self, Self::Local | Self::Global | Self::Universal)
    }
}

impl From<Context> for ContextKey {
    fn from(context: Context) -> Self {
        match context {
            Context::Network => Self::Network,
            Context::Site => Self::Site,
            Context::Single => Self::Single,
        }
    }
}

impl FromStr for ContextKey {
    type Err = InstallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(Self::Single),
            "site" => Ok(Self::Site),
            "network" => Ok(Self::Network),
            "local" => Ok(Self::Local),
            "global" => Ok(Self::Global),
            "universal" => Ok(Self::Universal),
            other => Err(InstallError::unknown_context(other, CONTEXT_KEYS)),
        }
    }
}

/// Expand shortcut keys into primitive contexts.
///
/// Contributions for the same primitive context are merged, never replaced.
/// Primitive keys sort before shortcuts, so when a primitive and a shortcut
/// both declare the same resource name the primitive's value is kept.
pub fn expand_shortcuts<T: Clone>(
    declared: &BTreeMap<ContextKey, BTreeMap<String, T>>,
) -> BTreeMap<Context, BTreeMap<String, T>> {
    let mut expanded: BTreeMap<Context, BTreeMap<String, T>> = BTreeMap::new();

    for (key, resources) in declared {
        if resources.is_empty() {
            continue;
        }

        for context in key.contexts() {
            let target = expanded.entry(*context).or_default();
            for (name, resource) in resources {
                target
                    .entry(name.clone())
                    .or_insert_with(|| resource.clone());
            }
        }
    }

    expanded
}

/// How the entity is being activated on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationMode {
    /// Non-multisite host.
    SingleSite,
    /// Multisite host, activated on the current site only.
    PerSite,
    /// Multisite host, activated for every site of the network.
    NetworkWide,
}

impl ActivationMode {
    /// Derive the mode from the host shape and the requested activation.
    pub fn detect(is_multisite: bool, network_wide: bool) -> Self {
        match (is_multisite, network_wide) {
            (false, _) => Self::SingleSite,
            (true, false) => Self::PerSite,
            (true, true) => Self::NetworkWide,
        }
    }

    /// Contexts that run under this mode, in execution order.
    pub fn contexts(self) -> &'static [Context] {
        match self {
            Self::SingleSite => &[Context::Single],
            Self::PerSite | Self::NetworkWide => &[Context::Network, Context::Site],
        }
    }

    pub fn is_network_wide(self) -> bool {
        self == Self::NetworkWide
    }
}

impl fmt::Display for ActivationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SingleSite => "single-site",
            Self::PerSite => "per-site",
            Self::NetworkWide => "network-wide",
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn tables(key: ContextKey, names: &[&str]) -> BTreeMap<ContextKey, BTreeMap<String, String>> {
        let mut declared = BTreeMap::new();
        declared.insert(
            key,
            names
                .iter()
                .map(|n| (n.to_string(), String::new()))
                .collect(),
        );
        declared
    }

    #[test]
    fn shortcuts_map_to_their_contexts() {
        let cases = [
            (ContextKey::Single, vec![Context::Single]),
            (ContextKey::Site, vec![Context::Site]),
            (ContextKey::Network, vec![Context::Network]),
            (ContextKey::Local, vec![Context::Site, Context::Single]),
            (ContextKey::Global, vec![Context::Network, Context::Single]),
            (
                ContextKey::Universal,
                vec![Context::Network, Context::Site, Context::Single],
            ),
        ];

        for (key, expected) in cases {
            let expanded = expand_shortcuts(&tables(key, &["test"]));
            let contexts: Vec<Context> = expanded.keys().copied().collect();
            assert_eq!(contexts, expected, "shortcut {key:?}");
        }
    }

    #[test]
    fn shortcut_merges_with_primitive() {
        let mut declared = tables(ContextKey::Single, &["test"]);
        declared.extend(tables(ContextKey::Local, &["another"]));

        let expanded = expand_shortcuts(&declared);

        assert_eq!(expanded[&Context::Single].len(), 2);
        assert_eq!(expanded[&Context::Site].len(), 1);
        assert!(expanded[&Context::Site].contains_key("another"));
        assert!(!expanded.contains_key(&Context::Network));
    }

    #[test]
    fn primitive_value_wins_on_name_clash() {
        let mut declared = BTreeMap::new();
        declared.insert(
            ContextKey::Universal,
            BTreeMap::from([("logs".to_string(), "from universal".to_string())]),
        );
        declared.insert(
            ContextKey::Single,
            BTreeMap::from([("logs".to_string(), "from single".to_string())]),
        );

        let expanded = expand_shortcuts(&declared);
        assert_eq!(expanded[&Context::Single]["logs"], "from single");
        assert_eq!(expanded[&Context::Network]["logs"], "from universal");
    }

    #[test]
    fn empty_declarations_expand_to_nothing() {
        let declared: BTreeMap<ContextKey, BTreeMap<String, String>> =
            BTreeMap::from([(ContextKey::Universal, BTreeMap::new())]);
        assert!(expand_shortcuts(&declared).is_empty());
    }

    #[test]
    fn parses_context_keys() {
        assert_eq!("local".parse::<ContextKey>().unwrap(), ContextKey::Local);
        assert!(ContextKey::Global.is_shortcut());
        assert!(!ContextKey::Site.is_shortcut());

        let err = "galaxy".parse::<ContextKey>().unwrap_err();
        assert!(err.to_string().contains("universal"));
    }

    #[test]
    fn activation_mode_orders_network_first() {
        assert_eq!(
            ActivationMode::detect(false, true),
            ActivationMode::SingleSite
        );
        assert_eq!(
            ActivationMode::detect(true, true).contexts(),
            &[Context::Network, Context::Site]
        );
        assert_eq!(
            ActivationMode::detect(false, false).contexts(),
            &[Context::Single]
        );
    }
}
