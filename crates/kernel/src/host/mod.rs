//! Host collaborator abstraction layer.
//!
//! The installer never talks to storage directly. Every option read, site
//! switch, capability grant and schema change goes through one of the traits
//! below, bundled in a [`Host`]. Two implementations ship with the kernel:
//!
//! - [`MemoryHost`]: an in-process multisite network, persisted as JSON
//! - [`PgHost`]: PostgreSQL via `sqlx`

mod memory;
mod postgres;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

pub use memory::{MemoryHost, MemoryState};
pub use postgres::{PgHost, PgHostSettings};

/// Identifier of a site within a network.
pub type SiteId = u64;

/// Identifier of a network of sites.
pub type NetworkId = u64;

/// Key/value option storage, scoped per site and per network.
///
/// Site options resolve against the *current* site, which changes with
/// [`SiteRoster::switch_to_site`].
#[async_trait]
pub trait OptionStore: Send + Sync {
    async fn get_option(&self, name: &str) -> Result<Option<Value>>;

    async fn update_option(&self, name: &str, value: Value) -> Result<()>;

    /// Returns true if the option existed.
    async fn delete_option(&self, name: &str) -> Result<bool>;

    /// Store the option only if it does not exist yet. Returns true if added.
    async fn add_option(&self, name: &str, value: Value) -> Result<bool> {
        if self.get_option(name).await?.is_some() {
            return Ok(false);
        }
        self.update_option(name, value).await?;
        Ok(true)
    }

    async fn get_network_option(&self, name: &str) -> Result<Option<Value>>;

    async fn update_network_option(&self, name: &str, value: Value) -> Result<()>;

    async fn delete_network_option(&self, name: &str) -> Result<bool>;
}

/// Enumerates sites and tracks which one is current.
#[async_trait]
pub trait SiteRoster: Send + Sync {
    async fn is_multisite(&self) -> Result<bool>;

    async fn current_site_id(&self) -> Result<SiteId>;

    async fn current_network_id(&self) -> Result<NetworkId>;

    /// All sites on the current network, ascending. Never cached.
    async fn site_ids(&self) -> Result<Vec<SiteId>>;

    /// The network a site belongs to, or `None` if the site doesn't exist.
    async fn network_of(&self, site: SiteId) -> Result<Option<NetworkId>>;

    /// Make `site` current. Must be paired with [`restore_current_site`].
    ///
    /// [`restore_current_site`]: SiteRoster::restore_current_site
    async fn switch_to_site(&self, site: SiteId) -> Result<()>;

    /// Undo the most recent [`switch_to_site`](SiteRoster::switch_to_site).
    async fn restore_current_site(&self) -> Result<()>;
}

/// Role capability storage for the current site.
#[async_trait]
pub trait CapabilityStore: Send + Sync {
    /// Grant each custom capability (key) to every role that has the mapped
    /// core capability (value).
    async fn add_custom_caps(&self, caps: &BTreeMap<String, String>) -> Result<()>;

    /// Remove the named capabilities from every role.
    async fn remove_custom_caps(&self, caps: &[String]) -> Result<()>;
}

/// Schema and raw statement execution.
#[async_trait]
pub trait SchemaExecutor: Send + Sync {
    /// Table prefix: the base prefix, or the current site's when `per_site`.
    async fn table_prefix(&self, per_site: bool) -> Result<String>;

    /// Create `name` from a column-definition body. Existing tables are kept.
    async fn create_table(&self, name: &str, body: &str) -> Result<()>;

    async fn drop_table(&self, name: &str) -> Result<()>;

    async fn execute(&self, sql: &str) -> Result<u64>;

    /// Character set and collation of the storage layer, if it has one.
    async fn charset(&self) -> Result<Option<Charset>>;
}

/// Character set and optional collation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Charset {
    pub charset: String,
    pub collate: Option<String>,
}

/// The bundle of collaborators an installer runs against.
#[derive(Clone)]
pub struct Host {
    pub options: Arc<dyn OptionStore>,
    pub sites: Arc<dyn SiteRoster>,
    pub caps: Arc<dyn CapabilityStore>,
    pub schema: Arc<dyn SchemaExecutor>,
}

impl Host {
    /// Build a host from one value implementing every collaborator trait.
    pub fn from_shared<T>(shared: Arc<T>) -> Self
    where
        T: OptionStore + SiteRoster + CapabilityStore + SchemaExecutor + 'static,
    {
        Self {
            options: shared.clone(),
            sites: shared.clone(),
            caps: shared.clone(),
            schema: shared,
        }
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host").finish_non_exhaustive()
    }
}
