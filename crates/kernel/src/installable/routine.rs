//! Units of install, update and uninstall work.
//!
//! A [`Routine`] receives everything it needs through [`RoutineContext`]:
//! the host, the activation mode, the context and site being processed, and
//! the version being updated from. Nothing is read from ambient state.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use super::SiteId;
use super::context::{ActivationMode, Context};
use super::version::Version;
use crate::host::Host;

/// Which lifecycle operation a routine runs for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    Install,
    Update(Version),
    Uninstall,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Install => f.write_str("install"),
            Self::Update(version) => write!(f, "update to {version}"),
            Self::Uninstall => f.write_str("uninstall"),
        }
    }
}

/// Everything a routine may look at while it runs.
#[derive(Debug, Clone, Copy)]
pub struct RoutineContext<'a> {
    pub host: &'a Host,
    pub mode: ActivationMode,
    pub context: Context,
    /// The site being processed, for the `site` context.
    pub site: Option<SiteId>,
    /// Installed version before the current update began.
    pub updating_from: Option<&'a Version>,
}

/// One unit of work bound to a context.
#[async_trait]
pub trait Routine: Send + Sync {
    /// Short name used in logs and failure reports.
    fn name(&self) -> &str;

    async fn run(&self, cx: &RoutineContext<'_>) -> Result<()>;
}

/// Creates a set of tables. Existing tables are left alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTables {
    tables: BTreeMap<String, String>,
    per_site: bool,
}

impl CreateTables {
    /// `tables` maps unprefixed table names to column-definition bodies.
    pub fn new(tables: BTreeMap<String, String>, per_site: bool) -> Self {
        Self { tables, per_site }
    }

    pub fn tables(&self) -> &BTreeMap<String, String> {
        &self.tables
    }

    /// Whether the current site's table prefix is used instead of the base.
    pub fn per_site(&self) -> bool {
        self.per_site
    }
}

#[async_trait]
impl Routine for CreateTables {
    fn name(&self) -> &str {
        "create_tables"
    }

    async fn run(&self, cx: &RoutineContext<'_>) -> Result<()> {
        let prefix = cx.host.schema.table_prefix(self.per_site).await?;
        for (name, body) in &self.tables {
            let table = format!("{prefix}{name}");
            debug!(table = %table, "creating table");
            cx.host.schema.create_table(&table, body).await?;
        }
        Ok(())
    }
}

/// Drops a set of tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropTables {
    tables: Vec<String>,
    per_site: bool,
}

impl DropTables {
    pub fn new(tables: Vec<String>, per_site: bool) -> Self {
        Self { tables, per_site }
    }

    pub fn tables(&self) -> &[String] {
        &self.tables
    }
}

#[async_trait]
impl Routine for DropTables {
    fn name(&self) -> &str {
        "drop_tables"
    }

    async fn run(&self, cx: &RoutineContext<'_>) -> Result<()> {
        let prefix = cx.host.schema.table_prefix(self.per_site).await?;
        for name in &self.tables {
            let table = format!("{prefix}{name}");
            debug!(table = %table, "dropping table");
            cx.host.schema.drop_table(&table).await?;
        }
        Ok(())
    }
}

/// Grants custom capabilities, mapped to the core capability they follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddCaps {
    caps: BTreeMap<String, String>,
    regenerate: bool,
}

impl AddCaps {
    pub fn new(caps: BTreeMap<String, String>) -> Self {
        Self {
            caps,
            regenerate: false,
        }
    }

    /// Remove the capabilities before adding them again.
    ///
    /// Used on network sites, where the core capability mapping depends on
    /// how the entity was activated.
    pub fn regenerating(mut self) -> Self {
        self.regenerate = true;
        self
    }

    pub fn caps(&self) -> &BTreeMap<String, String> {
        &self.caps
    }

    pub fn regenerates(&self) -> bool {
        self.regenerate
    }
}

#[async_trait]
impl Routine for AddCaps {
    fn name(&self) -> &str {
        "add_custom_caps"
    }

    async fn run(&self, cx: &RoutineContext<'_>) -> Result<()> {
        if self.regenerate {
            let names: Vec<String> = self.caps.keys().cloned().collect();
            cx.host.caps.remove_custom_caps(&names).await?;
        }
        cx.host.caps.add_custom_caps(&self.caps).await
    }
}

/// Removes custom capabilities from every role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveCaps {
    caps: Vec<String>,
}

impl RemoveCaps {
    pub fn new(caps: Vec<String>) -> Self {
        Self { caps }
    }

    pub fn caps(&self) -> &[String] {
        &self.caps
    }
}

#[async_trait]
impl Routine for RemoveCaps {
    fn name(&self) -> &str {
        "remove_custom_caps"
    }

    async fn run(&self, cx: &RoutineContext<'_>) -> Result<()> {
        cx.host.caps.remove_custom_caps(&self.caps).await
    }
}
