//! Declared updates and pending-update selection.
//!
//! Every version that needs migration work is declared up front with the
//! contexts it touches, an applicability predicate and the routines to run.
//! Nothing is discovered by name at update time.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use super::context::{ActivationMode, Context};
use super::error::InstallResult;
use super::routine::Routine;
use super::version::Version;

/// Which activation modes a declared update runs under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Applicability {
    #[default]
    Always,
    NetworkWideOnly,
    PerSiteOnly,
}

impl Applicability {
    pub fn applies_to(self, mode: ActivationMode) -> bool {
        match self {
            Self::Always => true,
            Self::NetworkWideOnly => mode == ActivationMode::NetworkWide,
            Self::PerSiteOnly => mode == ActivationMode::PerSite,
        }
    }
}

/// One declared update: its contexts and the routines for each.
#[derive(Clone, Default)]
pub struct DeclaredUpdate {
    contexts: BTreeSet<Context>,
    applicability: Applicability,
    routines: BTreeMap<Context, Vec<Arc<dyn Routine>>>,
}

impl DeclaredUpdate {
    /// Restrict the update to some activation modes.
    pub fn applies(&mut self, applicability: Applicability) -> &mut Self {
        self.applicability = applicability;
        self
    }

    /// Append a routine for `context`.
    ///
    /// The context must also be declared for the routine to run.
    pub fn routine(&mut self, context: Context, routine: impl Routine + 'static) -> &mut Self {
        self.routines
            .entry(context)
            .or_default()
            .push(Arc::new(routine));
        self
    }

    pub fn contexts(&self) -> &BTreeSet<Context> {
        &self.contexts
    }

    pub fn applicability(&self) -> Applicability {
        self.applicability
    }

    /// Routines registered for `context`, in registration order.
    pub fn routines_for(&self, context: Context) -> &[Arc<dyn Routine>] {
        self.routines.get(&context).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Declared contexts that run under `mode`, in execution order.
    pub fn contexts_for(&self, mode: ActivationMode) -> Vec<Context> {
        mode.contexts()
            .iter()
            .copied()
            .filter(|context| self.contexts.contains(context))
            .collect()
    }
}

impl fmt::Debug for DeclaredUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let routines: BTreeMap<Context, Vec<&str>> = self
            .routines
            .iter()
            .map(|(context, routines)| (*context, routines.iter().map(|r| r.name()).collect()))
            .collect();

        f.debug_struct("DeclaredUpdate")
            .field("contexts", &self.contexts)
            .field("applicability", &self.applicability)
            .field("routines", &routines)
            .finish()
    }
}

/// Ordered map of version → declared update.
#[derive(Debug, Clone, Default)]
pub struct UpdateRegistry {
    updates: BTreeMap<Version, DeclaredUpdate>,
}

impl UpdateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an update to `version` touching `contexts`.
    ///
    /// Declaring the same version twice merges the contexts.
    pub fn declare(
        &mut self,
        version: &str,
        contexts: &[Context],
    ) -> InstallResult<&mut DeclaredUpdate> {
        let version: Version = version.parse()?;
        let update = self.updates.entry(version).or_default();
        update.contexts.extend(contexts.iter().copied());
        Ok(update)
    }

    pub fn get(&self, version: &Version) -> Option<&DeclaredUpdate> {
        self.updates.get(version)
    }

    pub fn versions(&self) -> impl Iterator<Item = &Version> {
        self.updates.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Updates to run when moving from `installed` to `target` under `mode`.
    ///
    /// Selects every declared version `v` with `installed < v <= target`
    /// (all `v <= target` when nothing is installed), ascending, then drops
    /// versions whose applicability excludes `mode`.
    pub fn pending(
        &self,
        installed: Option<&Version>,
        target: &Version,
        mode: ActivationMode,
    ) -> Vec<(&Version, &DeclaredUpdate)> {
        self.updates
            .iter()
            .filter(|(version, _)| installed.is_none_or(|installed| *version > installed))
            .filter(|(version, _)| *version <= target)
            .filter(|(_, update)| update.applicability.applies_to(mode))
            .collect()
    }
}
