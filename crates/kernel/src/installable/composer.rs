//! Builds install and uninstall routines from declared resources.
//!
//! An entity declares database tables (keyed by context or shortcut) and an
//! optional set of custom capabilities. For each context the composer yields
//! at most one tables routine followed by at most one capabilities routine.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::context::{Context, ContextKey, expand_shortcuts};
use super::routine::{AddCaps, CreateTables, DropTables, RemoveCaps, Routine};

/// Produces the custom capability map on demand.
pub type CapsGetter = Arc<dyn Fn() -> BTreeMap<String, String> + Send + Sync>;

/// Where an entity's custom capabilities come from.
#[derive(Clone)]
pub enum CapsSource {
    Static(BTreeMap<String, String>),
    Getter(CapsGetter),
}

impl CapsSource {
    /// Resolve to a `custom cap → core cap` map.
    pub fn resolve(&self) -> BTreeMap<String, String> {
        match self {
            Self::Static(caps) => caps.clone(),
            Self::Getter(getter) => getter(),
        }
    }
}

impl fmt::Debug for CapsSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(caps) => f.debug_tuple("Static").field(caps).finish(),
            Self::Getter(_) => f.write_str("Getter(..)"),
        }
    }
}

/// Resources an entity declares for installation.
#[derive(Debug, Clone, Default)]
pub struct InstallDeclarations {
    /// Context key → table name → column-definition body.
    pub db_tables: BTreeMap<ContextKey, BTreeMap<String, String>>,
    pub custom_caps: Option<CapsSource>,
}

impl InstallDeclarations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a table under a context or shortcut.
    pub fn with_table(
        mut self,
        key: ContextKey,
        name: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        self.db_tables
            .entry(key)
            .or_default()
            .insert(name.into(), body.into());
        self
    }

    pub fn with_caps(mut self, source: CapsSource) -> Self {
        self.custom_caps = Some(source);
        self
    }

    fn caps(&self) -> BTreeMap<String, String> {
        self.custom_caps
            .as_ref()
            .map(CapsSource::resolve)
            .unwrap_or_default()
    }
}

/// Contexts custom capabilities are installed in.
const CAPS_KEY: ContextKey = ContextKey::Local;

/// Composed install routines, kept typed for inspection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallPlan {
    pub tables: BTreeMap<Context, CreateTables>,
    pub caps: BTreeMap<Context, AddCaps>,
}

impl InstallPlan {
    /// Routines per context, tables before capabilities.
    pub fn routines(&self) -> BTreeMap<Context, Vec<Arc<dyn Routine>>> {
        let mut routines: BTreeMap<Context, Vec<Arc<dyn Routine>>> = BTreeMap::new();

        for (context, routine) in &self.tables {
            routines
                .entry(*context)
                .or_default()
                .push(Arc::new(routine.clone()));
        }
        for (context, routine) in &self.caps {
            routines
                .entry(*context)
                .or_default()
                .push(Arc::new(routine.clone()));
        }

        routines
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.caps.is_empty()
    }
}

/// Composed uninstall routines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UninstallPlan {
    pub tables: BTreeMap<Context, DropTables>,
    pub caps: BTreeMap<Context, RemoveCaps>,
}

impl UninstallPlan {
    /// Routines per context, tables before capabilities.
    pub fn routines(&self) -> BTreeMap<Context, Vec<Arc<dyn Routine>>> {
        let mut routines: BTreeMap<Context, Vec<Arc<dyn Routine>>> = BTreeMap::new();

        for (context, routine) in &self.tables {
            routines
                .entry(*context)
                .or_default()
                .push(Arc::new(routine.clone()));
        }
        for (context, routine) in &self.caps {
            routines
                .entry(*context)
                .or_default()
                .push(Arc::new(routine.clone()));
        }

        routines
    }
}

/// Compose install routines from declarations.
pub fn compose_install(declarations: &InstallDeclarations) -> InstallPlan {
    let mut plan = InstallPlan::default();

    for (context, tables) in expand_shortcuts(&declarations.db_tables) {
        plan.tables
            .insert(context, CreateTables::new(tables, context == Context::Site));
    }

    let caps = declarations.caps();
    if !caps.is_empty() {
        for context in CAPS_KEY.contexts() {
            let routine = AddCaps::new(caps.clone());
            let routine = if *context == Context::Site {
                routine.regenerating()
            } else {
                routine
            };
            plan.caps.insert(*context, routine);
        }
    }

    plan
}

/// Compose uninstall routines from declarations.
pub fn compose_uninstall(declarations: &InstallDeclarations) -> UninstallPlan {
    let mut plan = UninstallPlan::default();

    for (context, tables) in expand_shortcuts(&declarations.db_tables) {
        plan.tables.insert(
            context,
            DropTables::new(tables.into_keys().collect(), context == Context::Site),
        );
    }

    let caps: Vec<String> = declarations.caps().into_keys().collect();
    if !caps.is_empty() {
        for context in CAPS_KEY.contexts() {
            plan.caps.insert(*context, RemoveCaps::new(caps.clone()));
        }
    }

    plan
}
