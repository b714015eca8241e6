//! In-process multisite host.
//!
//! Holds sites, options, roles and tables in memory behind a mutex. The whole
//! state serializes to JSON, which is how the CLI persists it between runs
//! and how tests seed it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{
    CapabilityStore, Charset, NetworkId, OptionStore, SchemaExecutor, SiteId, SiteRoster,
};

const DEFAULT_PREFIX: &str = "wp_";

/// Serializable state of a [`MemoryHost`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryState {
    pub multisite: bool,
    pub table_prefix: String,
    pub current_network: NetworkId,
    pub current_site: SiteId,
    /// Site → network it belongs to.
    pub sites: BTreeMap<SiteId, NetworkId>,
    pub site_options: BTreeMap<SiteId, BTreeMap<String, Value>>,
    pub network_options: BTreeMap<NetworkId, BTreeMap<String, Value>>,
    /// Site → role → capabilities.
    pub roles: BTreeMap<SiteId, BTreeMap<String, BTreeSet<String>>>,
    /// Full table name → column-definition body.
    pub tables: BTreeMap<String, String>,
    /// Raw statements passed to `execute`, in order.
    #[serde(default)]
    pub executed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charset: Option<(String, Option<String>)>,
    #[serde(skip)]
    switched: Vec<SiteId>,
}

impl MemoryState {
    fn new(multisite: bool) -> Self {
        let mut state = Self {
            multisite,
            table_prefix: DEFAULT_PREFIX.to_string(),
            current_network: 1,
            current_site: 1,
            sites: BTreeMap::new(),
            site_options: BTreeMap::new(),
            network_options: BTreeMap::new(),
            roles: BTreeMap::new(),
            tables: BTreeMap::new(),
            executed: Vec::new(),
            charset: Some(("utf8mb4".to_string(), Some("utf8mb4_unicode_ci".to_string()))),
            switched: Vec::new(),
        };
        state.insert_site(1, 1);
        state
    }

    fn insert_site(&mut self, site: SiteId, network: NetworkId) {
        self.sites.insert(site, network);
        self.roles.insert(site, default_roles());
    }

    fn options_mut(&mut self) -> &mut BTreeMap<String, Value> {
        self.site_options.entry(self.current_site).or_default()
    }

    fn network_options_mut(&mut self) -> &mut BTreeMap<String, Value> {
        self.network_options.entry(self.current_network).or_default()
    }
}

fn default_roles() -> BTreeMap<String, BTreeSet<String>> {
    let role = |caps: &[&str]| caps.iter().map(|c| c.to_string()).collect::<BTreeSet<_>>();

    BTreeMap::from([
        (
            "administrator".to_string(),
            role(&["manage_options", "edit_posts", "moderate_comments", "read"]),
        ),
        (
            "editor".to_string(),
            role(&["edit_posts", "moderate_comments", "read"]),
        ),
        ("subscriber".to_string(), role(&["read"])),
    ])
}

/// An in-memory host. Starts with site 1 on network 1.
#[derive(Debug)]
pub struct MemoryHost {
    state: Mutex<MemoryState>,
}

impl MemoryHost {
    /// A standalone, non-multisite host.
    pub fn single_site() -> Self {
        Self::from_state(MemoryState::new(false))
    }

    /// A multisite host with a single site.
    pub fn multisite() -> Self {
        Self::from_state(MemoryState::new(true))
    }

    pub fn from_state(state: MemoryState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// Load state from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read host state: {}", path.display()))?;
        let state: MemoryState = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse host state at {}", path.display()))?;
        Ok(Self::from_state(state))
    }

    /// Write state to a JSON file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.snapshot())
            .context("failed to serialize host state")?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write host state: {}", path.display()))
    }

    /// A copy of the current state.
    pub fn snapshot(&self) -> MemoryState {
        self.state.lock().clone()
    }

    /// Create a new site on `network` and return its id.
    pub fn create_site(&self, network: NetworkId) -> SiteId {
        let mut state = self.state.lock();
        let id = state.sites.keys().next_back().copied().unwrap_or(0) + 1;
        state.insert_site(id, network);
        debug!(site = id, network, "created site");
        id
    }

    /// Override the storage charset reported to routines.
    pub fn set_charset(&self, charset: Option<Charset>) {
        self.state.lock().charset = charset.map(|c| (c.charset, c.collate));
    }

    /// Capabilities of `role` on `site`.
    pub fn role_caps(&self, site: SiteId, role: &str) -> BTreeSet<String> {
        self.state
            .lock()
            .roles
            .get(&site)
            .and_then(|roles| roles.get(role))
            .cloned()
            .unwrap_or_default()
    }

    /// A site option, read without switching.
    pub fn site_option(&self, site: SiteId, name: &str) -> Option<Value> {
        self.state
            .lock()
            .site_options
            .get(&site)
            .and_then(|options| options.get(name))
            .cloned()
    }

    /// Whether a table with this full name exists.
    pub fn has_table(&self, name: &str) -> bool {
        self.state.lock().tables.contains_key(name)
    }

    /// Statements passed to `execute` so far.
    pub fn executed(&self) -> Vec<String> {
        self.state.lock().executed.clone()
    }

    /// How many `switch_to_site` calls are still awaiting a restore.
    pub fn switch_depth(&self) -> usize {
        self.state.lock().switched.len()
    }
}

#[async_trait]
impl OptionStore for MemoryHost {
    async fn get_option(&self, name: &str) -> Result<Option<Value>> {
        let state = self.state.lock();
        Ok(state
            .site_options
            .get(&state.current_site)
            .and_then(|options| options.get(name))
            .cloned())
    }

    async fn update_option(&self, name: &str, value: Value) -> Result<()> {
        self.state.lock().options_mut().insert(name.to_string(), value);
        Ok(())
    }

    async fn delete_option(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().options_mut().remove(name).is_some())
    }

    async fn get_network_option(&self, name: &str) -> Result<Option<Value>> {
        let state = self.state.lock();
        Ok(state
            .network_options
            .get(&state.current_network)
            .and_then(|options| options.get(name))
            .cloned())
    }

    async fn update_network_option(&self, name: &str, value: Value) -> Result<()> {
        self.state
            .lock()
            .network_options_mut()
            .insert(name.to_string(), value);
        Ok(())
    }

    async fn delete_network_option(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().network_options_mut().remove(name).is_some())
    }
}

#[async_trait]
impl SiteRoster for MemoryHost {
    async fn is_multisite(&self) -> Result<bool> {
        Ok(self.state.lock().multisite)
    }

    async fn current_site_id(&self) -> Result<SiteId> {
        Ok(self.state.lock().current_site)
    }

    async fn current_network_id(&self) -> Result<NetworkId> {
        Ok(self.state.lock().current_network)
    }

    async fn site_ids(&self) -> Result<Vec<SiteId>> {
        let state = self.state.lock();
        Ok(state
            .sites
            .iter()
            .filter(|(_, network)| **network == state.current_network)
            .map(|(site, _)| *site)
            .collect())
    }

    async fn network_of(&self, site: SiteId) -> Result<Option<NetworkId>> {
        Ok(self.state.lock().sites.get(&site).copied())
    }

    async fn switch_to_site(&self, site: SiteId) -> Result<()> {
        let mut state = self.state.lock();
        if !state.sites.contains_key(&site) {
            bail!("cannot switch to site {site}: no such site");
        }
        let previous = state.current_site;
        state.switched.push(previous);
        state.current_site = site;
        Ok(())
    }

    async fn restore_current_site(&self) -> Result<()> {
        let mut state = self.state.lock();
        match state.switched.pop() {
            Some(previous) => {
                state.current_site = previous;
                Ok(())
            }
            None => bail!("restore_current_site called without a matching switch"),
        }
    }
}

#[async_trait]
impl CapabilityStore for MemoryHost {
    async fn add_custom_caps(&self, caps: &BTreeMap<String, String>) -> Result<()> {
        let mut state = self.state.lock();
        let site = state.current_site;
        let roles = state.roles.entry(site).or_default();

        for role_caps in roles.values_mut() {
            for (custom, core) in caps {
                if role_caps.contains(core) {
                    role_caps.insert(custom.clone());
                }
            }
        }
        Ok(())
    }

    async fn remove_custom_caps(&self, caps: &[String]) -> Result<()> {
        let mut state = self.state.lock();
        let site = state.current_site;
        if let Some(roles) = state.roles.get_mut(&site) {
            for role_caps in roles.values_mut() {
                for cap in caps {
                    role_caps.remove(cap);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SchemaExecutor for MemoryHost {
    async fn table_prefix(&self, per_site: bool) -> Result<String> {
        let state = self.state.lock();
        if per_site && state.multisite && state.current_site != 1 {
            Ok(format!("{}{}_", state.table_prefix, state.current_site))
        } else {
            Ok(state.table_prefix.clone())
        }
    }

    async fn create_table(&self, name: &str, body: &str) -> Result<()> {
        self.state
            .lock()
            .tables
            .entry(name.to_string())
            .or_insert_with(|| body.to_string());
        Ok(())
    }

    async fn drop_table(&self, name: &str) -> Result<()> {
        self.state.lock().tables.remove(name);
        Ok(())
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        self.state.lock().executed.push(sql.to_string());
        Ok(0)
    }

    async fn charset(&self) -> Result<Option<Charset>> {
        Ok(self
            .state
            .lock()
            .charset
            .clone()
            .map(|(charset, collate)| Charset { charset, collate }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn site_options_follow_the_current_site() {
        let host = MemoryHost::multisite();
        let other = host.create_site(1);

        host.update_option("color", json!("red")).await.unwrap();
        host.switch_to_site(other).await.unwrap();
        assert_eq!(host.get_option("color").await.unwrap(), None);
        host.update_option("color", json!("blue")).await.unwrap();
        host.restore_current_site().await.unwrap();

        assert_eq!(host.get_option("color").await.unwrap(), Some(json!("red")));
        assert_eq!(host.site_option(other, "color"), Some(json!("blue")));
        assert_eq!(host.switch_depth(), 0);
    }

    #[tokio::test]
    async fn roster_is_scoped_to_current_network() {
        let host = MemoryHost::multisite();
        let two = host.create_site(1);
        let foreign = host.create_site(45);

        assert_eq!(host.site_ids().await.unwrap(), vec![1, two]);
        assert_eq!(host.network_of(foreign).await.unwrap(), Some(45));
        assert_eq!(host.network_of(999).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unbalanced_restore_is_an_error() {
        let host = MemoryHost::multisite();
        assert!(host.restore_current_site().await.is_err());
        assert!(host.switch_to_site(42).await.is_err());
    }

    #[tokio::test]
    async fn custom_caps_follow_core_caps() {
        let host = MemoryHost::single_site();
        let caps = BTreeMap::from([("manage_points".to_string(), "manage_options".to_string())]);

        host.add_custom_caps(&caps).await.unwrap();
        assert!(host.role_caps(1, "administrator").contains("manage_points"));
        assert!(!host.role_caps(1, "editor").contains("manage_points"));

        host.remove_custom_caps(&["manage_points".to_string()])
            .await
            .unwrap();
        assert!(!host.role_caps(1, "administrator").contains("manage_points"));
    }

    #[tokio::test]
    async fn per_site_prefix_applies_beyond_the_main_site() {
        let host = MemoryHost::multisite();
        let two = host.create_site(1);

        assert_eq!(host.table_prefix(true).await.unwrap(), "wp_");
        host.switch_to_site(two).await.unwrap();
        assert_eq!(host.table_prefix(true).await.unwrap(), format!("wp_{two}_"));
        assert_eq!(host.table_prefix(false).await.unwrap(), "wp_");
        host.restore_current_site().await.unwrap();
    }

    #[test]
    fn state_round_trips_through_json_file() {
        let host = MemoryHost::multisite();
        host.create_site(1);

        let path = std::env::temp_dir().join(format!(
            "wordpoints-memory-host-{}.json",
            std::process::id()
        ));
        host.save(&path).unwrap();
        let loaded = MemoryHost::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.snapshot().sites, host.snapshot().sites);
        assert!(loaded.snapshot().multisite);
    }
}
