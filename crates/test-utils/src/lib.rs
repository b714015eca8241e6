//! WordPoints test utilities.
//!
//! Helpers for integration testing: in-memory host builders and routines
//! that record where they ran or fail on demand.

use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use parking_lot::Mutex;

use wordpoints_kernel::host::{Host, MemoryHost, NetworkId, SiteId};
use wordpoints_kernel::installable::{Context, Routine, RoutineContext};

/// One recorded routine run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub routine: String,
    pub context: Context,
    pub site: Option<SiteId>,
}

/// Shared record of routine runs, in order.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Routine names in the order they ran.
    pub fn names(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.routine.clone()).collect()
    }

    /// Sites a routine ran on, in order.
    pub fn sites_for(&self, routine: &str) -> Vec<SiteId> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.routine == routine)
            .filter_map(|c| c.site)
            .collect()
    }

    pub fn count(&self, routine: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.routine == routine).count()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, routine: &str, cx: &RoutineContext<'_>) {
        self.calls.lock().push(Call {
            routine: routine.to_string(),
            context: cx.context,
            site: cx.site,
        });
    }

    /// A routine that records its runs into this log.
    pub fn routine(&self, name: &str) -> RecordingRoutine {
        RecordingRoutine {
            name: name.to_string(),
            log: self.clone(),
        }
    }

    /// A routine that records its run, then fails.
    pub fn failing(&self, name: &str) -> FailingRoutine {
        FailingRoutine {
            name: name.to_string(),
            log: self.clone(),
            only_site: None,
        }
    }
}

/// Records every run and succeeds.
#[derive(Debug, Clone)]
pub struct RecordingRoutine {
    name: String,
    log: CallLog,
}

#[async_trait]
impl Routine for RecordingRoutine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, cx: &RoutineContext<'_>) -> Result<()> {
        self.log.record(&self.name, cx);
        Ok(())
    }
}

/// Records every run and fails, optionally only on one site.
#[derive(Debug, Clone)]
pub struct FailingRoutine {
    name: String,
    log: CallLog,
    only_site: Option<SiteId>,
}

impl FailingRoutine {
    /// Fail only while processing `site`. Other runs succeed.
    pub fn on_site(mut self, site: SiteId) -> Self {
        self.only_site = Some(site);
        self
    }
}

#[async_trait]
impl Routine for FailingRoutine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, cx: &RoutineContext<'_>) -> Result<()> {
        self.log.record(&self.name, cx);
        match self.only_site {
            Some(site) if cx.site != Some(site) => Ok(()),
            _ => bail!("{} failed", self.name),
        }
    }
}

/// A single-site memory host and the [`Host`] bundle over it.
pub fn single_site() -> (Arc<MemoryHost>, Host) {
    let memory = Arc::new(MemoryHost::single_site());
    let host = Host::from_shared(memory.clone());
    (memory, host)
}

/// A multisite memory host with `extra_sites` more sites on network 1.
pub fn multisite(extra_sites: usize) -> (Arc<MemoryHost>, Host) {
    let memory = Arc::new(MemoryHost::multisite());
    for _ in 0..extra_sites {
        memory.create_site(1);
    }
    let host = Host::from_shared(memory.clone());
    (memory, host)
}

/// Add a site on another network.
pub fn foreign_site(memory: &MemoryHost, network: NetworkId) -> SiteId {
    memory.create_site(network)
}
