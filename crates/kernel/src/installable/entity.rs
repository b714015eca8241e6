//! An installable entity and its persisted install state.
//!
//! State lives in host options:
//!
//! - `wordpoints_data`: db versions, per site or per network
//! - `wordpoints_network_installed`: `{kind: {slug: true}}`
//! - `wordpoints_network_install_skipped`: `{kind: {slug: true}}`
//! - `wordpoints_network_update_skipped`: `{kind: {slug: version or true}}`

use std::fmt;
use std::str::FromStr;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::debug;

use super::error::{InstallError, InstallResult};
use super::version::Version;
use crate::host::Host;

/// Option holding installed versions of every entity.
pub const DATA_OPTION: &str = "wordpoints_data";
const NETWORK_INSTALLED_OPTION: &str = "wordpoints_network_installed";
const INSTALL_SKIPPED_OPTION: &str = "wordpoints_network_install_skipped";
const UPDATE_SKIPPED_OPTION: &str = "wordpoints_network_update_skipped";

/// Slug of the core plugin, whose state uses top-level keys.
pub const CORE_SLUG: &str = "wordpoints";

/// Kind of installable entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Plugin,
    Component,
    Module,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plugin => "plugin",
            Self::Component => "component",
            Self::Module => "module",
        }
    }

    /// Key of this kind's records in `wordpoints_data`.
    pub fn plural(self) -> &'static str {
        match self {
            Self::Plugin => "plugins",
            Self::Component => "components",
            Self::Module => "modules",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = InstallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plugin" => Ok(Self::Plugin),
            "component" => Ok(Self::Component),
            "module" => Ok(Self::Module),
            other => Err(InstallError::InvalidEntityKind {
                kind: other.to_string(),
            }),
        }
    }
}

/// A plugin, component or module bound to a host.
#[derive(Debug, Clone)]
pub struct Installable {
    kind: EntityKind,
    slug: String,
    version: Version,
    host: Host,
}

impl Installable {
    pub fn new(host: Host, kind: EntityKind, slug: impl Into<String>, version: Version) -> Self {
        Self {
            kind,
            slug: slug.into(),
            version,
            host,
        }
    }

    /// Parse kind and version from strings.
    pub fn parse(host: Host, kind: &str, slug: &str, version: &str) -> InstallResult<Self> {
        Ok(Self::new(host, kind.parse()?, slug, version.parse()?))
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    /// The code version, which installs and updates target.
    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub(crate) fn is_core(&self) -> bool {
        self.kind == EntityKind::Plugin && self.slug == CORE_SLUG
    }

    /// Version recorded as installed in storage, if any.
    pub async fn db_version(&self, network: bool) -> InstallResult<Option<Version>> {
        let data = self.read(DATA_OPTION, network).await?;

        let recorded = if self.is_core() {
            data.get("version")
        } else {
            data.get(self.kind.plural())
                .and_then(|records| records.get(&self.slug))
                .and_then(|record| record.get("version"))
        };

        match recorded.and_then(Value::as_str) {
            Some(version) => Ok(Some(version.parse()?)),
            None => Ok(None),
        }
    }

    /// Record `version` as installed, or the code version when `None`.
    pub async fn set_db_version(&self, version: Option<&Version>, network: bool) -> InstallResult<()> {
        let version = version.unwrap_or(&self.version);
        let mut data = self.read(DATA_OPTION, network).await?;

        self.edit_record(&mut data, |record| {
            record.insert("version".to_string(), json!(version.as_str()));
        });

        debug!(entity = %self, version = %version, network, "setting db version");
        self.write(DATA_OPTION, Value::Object(data), network).await
    }

    /// Remove the recorded version, keeping the rest of the record.
    pub async fn unset_db_version(&self, network: bool) -> InstallResult<()> {
        let mut data = self.read(DATA_OPTION, network).await?;

        self.edit_record(&mut data, |record| {
            record.remove("version");
        });

        self.write(DATA_OPTION, Value::Object(data), network).await
    }

    pub async fn is_network_installed(&self) -> InstallResult<bool> {
        self.has_flag(NETWORK_INSTALLED_OPTION).await
    }

    pub async fn set_network_installed(&self) -> InstallResult<()> {
        self.set_flag(NETWORK_INSTALLED_OPTION, Value::Bool(true)).await
    }

    pub async fn unset_network_installed(&self) -> InstallResult<()> {
        self.unset_flag(NETWORK_INSTALLED_OPTION).await
    }

    pub async fn is_network_install_skipped(&self) -> InstallResult<bool> {
        self.has_flag(INSTALL_SKIPPED_OPTION).await
    }

    /// Mark that per-site install routines were not run network-wide.
    pub async fn set_network_install_skipped(&self) -> InstallResult<()> {
        self.set_flag(INSTALL_SKIPPED_OPTION, Value::Bool(true)).await
    }

    pub async fn unset_network_install_skipped(&self) -> InstallResult<()> {
        self.unset_flag(INSTALL_SKIPPED_OPTION).await
    }

    /// Whether per-site updates were skipped, with or without a known version.
    pub async fn is_network_update_skipped(&self) -> InstallResult<bool> {
        self.has_flag(UPDATE_SKIPPED_OPTION).await
    }

    /// The network db version at which per-site updates were skipped.
    ///
    /// `None` also when the skip happened before any version was recorded.
    pub async fn network_update_skipped(&self) -> InstallResult<Option<Version>> {
        let flags = self.read(UPDATE_SKIPPED_OPTION, true).await?;
        match flags
            .get(self.kind.as_str())
            .and_then(|slugs| slugs.get(&self.slug))
            .and_then(Value::as_str)
        {
            Some(version) => Ok(Some(version.parse()?)),
            None => Ok(None),
        }
    }

    /// Record that per-site updates were skipped from the current network
    /// db version, or `true` when none is recorded.
    pub async fn set_network_update_skipped(&self) -> InstallResult<()> {
        let from = match self.db_version(true).await? {
            Some(version) => json!(version.as_str()),
            None => Value::Bool(true),
        };
        self.set_flag(UPDATE_SKIPPED_OPTION, from).await
    }

    pub async fn unset_network_update_skipped(&self) -> InstallResult<()> {
        self.unset_flag(UPDATE_SKIPPED_OPTION).await
    }

    /// Edit the entity's record inside `wordpoints_data`, created if missing.
    fn edit_record(&self, data: &mut Map<String, Value>, edit: impl FnOnce(&mut Map<String, Value>)) {
        if self.is_core() {
            edit(data);
            return;
        }

        with_object(data, self.kind.plural(), |records| {
            with_object(records, &self.slug, edit);
        });
    }

    async fn has_flag(&self, option: &str) -> InstallResult<bool> {
        let flags = self.read(option, true).await?;
        Ok(flags
            .get(self.kind.as_str())
            .and_then(|slugs| slugs.get(&self.slug))
            .is_some_and(|flag| !flag.is_null() && *flag != Value::Bool(false)))
    }

    async fn set_flag(&self, option: &str, value: Value) -> InstallResult<()> {
        let mut flags = self.read(option, true).await?;
        with_object(&mut flags, self.kind.as_str(), |slugs| {
            slugs.insert(self.slug.clone(), value);
        });
        self.write(option, Value::Object(flags), true).await
    }

    async fn unset_flag(&self, option: &str) -> InstallResult<()> {
        let mut flags = self.read(option, true).await?;
        with_object(&mut flags, self.kind.as_str(), |slugs| {
            slugs.remove(&self.slug);
        });
        self.write(option, Value::Object(flags), true).await
    }

    /// Read an option as an object. Missing or non-object values read empty.
    pub(crate) async fn read(&self, option: &str, network: bool) -> InstallResult<Map<String, Value>> {
        let value = if network {
            self.host.options.get_network_option(option).await
        } else {
            self.host.options.get_option(option).await
        }
        .with_context(|| format!("failed to read option {option}"))?;

        Ok(match value {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        })
    }

    pub(crate) async fn write(&self, option: &str, value: Value, network: bool) -> InstallResult<()> {
        let written = if network {
            self.host.options.update_network_option(option, value).await
        } else {
            self.host.options.update_option(option, value).await
        };
        written.with_context(|| format!("failed to write option {option}"))?;
        Ok(())
    }
}

impl fmt::Display for Installable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.slug)
    }
}

/// Edit the object stored under `key`. A missing or non-object value is
/// replaced by an empty object first.
fn with_object(map: &mut Map<String, Value>, key: &str, edit: impl FnOnce(&mut Map<String, Value>)) {
    let mut inner = match map.remove(key) {
        Some(Value::Object(inner)) => inner,
        _ => Map::new(),
    };
    edit(&mut inner);
    map.insert(key.to_string(), Value::Object(inner));
}
