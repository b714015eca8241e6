//! Install, update and uninstall orchestration with multisite fan-out.
//!
//! An [`UnInstaller`] combines an [`Installable`], its declared resources,
//! its [`UpdateRegistry`] and a [`Lifecycle`]. Contexts run network first,
//! then each affected site (switched to and restored), then single.
//!
//! A failing routine aborts the rest of its context (or site) only. Other
//! contexts still run, nothing is rolled back, and the recorded db version
//! never moves past the last update that completed everywhere.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::SiteId;
use super::composer::{InstallDeclarations, compose_install, compose_uninstall};
use super::context::{ActivationMode, Context};
use super::entity::Installable;
use super::error::{InstallError, InstallResult, RoutineFailure};
use super::registry::UpdateRegistry;
use super::routine::{Routine, RoutineContext, Stage};
use super::version::Version;
use crate::host::Host;

/// Default number of sites above which per-site work is skipped.
pub const DEFAULT_LARGE_NETWORK_THRESHOLD: usize = 10_000;

/// What a lifecycle hook gets to see.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleContext<'a> {
    pub entity: &'a Installable,
    pub mode: ActivationMode,
    /// Installed version before the update, for update hooks.
    pub updating_from: Option<&'a Version>,
}

/// Entity-specific hooks and routines. Everything defaults to a no-op.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    async fn before_install(&self, _cx: &LifecycleContext<'_>) -> Result<()> {
        Ok(())
    }

    async fn after_install(&self, _cx: &LifecycleContext<'_>) -> Result<()> {
        Ok(())
    }

    async fn before_update(&self, _cx: &LifecycleContext<'_>) -> Result<()> {
        Ok(())
    }

    async fn after_update(&self, _cx: &LifecycleContext<'_>) -> Result<()> {
        Ok(())
    }

    async fn before_uninstall(&self, _cx: &LifecycleContext<'_>) -> Result<()> {
        Ok(())
    }

    async fn after_uninstall(&self, _cx: &LifecycleContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Install routines run after the declared tables and capabilities.
    fn install_routines(&self, _context: Context) -> Vec<Arc<dyn Routine>> {
        Vec::new()
    }

    /// Uninstall routines run before tables are dropped.
    fn uninstall_routines(&self, _context: Context) -> Vec<Arc<dyn Routine>> {
        Vec::new()
    }
}

/// A lifecycle with no hooks and no extra routines.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLifecycle;

impl Lifecycle for NoopLifecycle {}

/// Tunables for the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Networks with more sites than this skip per-site routines.
    pub large_network_threshold: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            large_network_threshold: DEFAULT_LARGE_NETWORK_THRESHOLD,
        }
    }
}

/// One routine that ran successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub stage: Stage,
    pub context: Context,
    pub site: Option<SiteId>,
    pub routine: String,
}

/// What a successful operation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub steps: Vec<Step>,
    /// Per-site work was skipped because the network is large.
    pub sites_skipped: bool,
    /// Nothing needed doing.
    pub up_to_date: bool,
}

impl RunReport {
    fn up_to_date() -> Self {
        Self {
            up_to_date: true,
            ..Self::default()
        }
    }
}

/// Runs routines and collects steps and failures for one operation.
struct Run<'a> {
    host: &'a Host,
    mode: ActivationMode,
    stage: Stage,
    updating_from: Option<&'a Version>,
    report: RunReport,
    failures: Vec<RoutineFailure>,
}

impl<'a> Run<'a> {
    fn new(host: &'a Host, mode: ActivationMode, stage: Stage) -> Self {
        Self {
            host,
            mode,
            stage,
            updating_from: None,
            report: RunReport::default(),
            failures: Vec::new(),
        }
    }

    /// Run routines in order, stopping at the first failure.
    /// Returns whether all of them succeeded.
    async fn context(
        &mut self,
        context: Context,
        site: Option<SiteId>,
        routines: &[Arc<dyn Routine>],
    ) -> bool {
        if routines.is_empty() {
            debug!(stage = %self.stage, context = %context, "no routines for context");
            return true;
        }

        let cx = RoutineContext {
            host: self.host,
            mode: self.mode,
            context,
            site,
            updating_from: self.updating_from,
        };

        for routine in routines {
            debug!(stage = %self.stage, context = %context, site, routine = routine.name(), "running routine");

            if let Err(error) = routine.run(&cx).await {
                warn!(
                    stage = %self.stage,
                    context = %context,
                    site,
                    routine = routine.name(),
                    error = %error,
                    "routine failed, skipping the rest of this context"
                );
                self.failures.push(RoutineFailure {
                    stage: self.stage.clone(),
                    context,
                    site,
                    routine: routine.name().to_string(),
                    error,
                });
                return false;
            }

            self.report.steps.push(Step {
                stage: self.stage.clone(),
                context,
                site,
                routine: routine.name().to_string(),
            });
        }

        true
    }

    /// Switch to `site`, run its routines, and switch back.
    async fn site(&mut self, site: SiteId, routines: &[Arc<dyn Routine>]) -> InstallResult<bool> {
        if routines.is_empty() {
            return Ok(true);
        }

        if let Err(error) = self.host.sites.switch_to_site(site).await {
            warn!(stage = %self.stage, site, error = %error, "could not switch to site");
            self.failures.push(RoutineFailure {
                stage: self.stage.clone(),
                context: Context::Site,
                site: Some(site),
                routine: "switch_to_site".to_string(),
                error,
            });
            return Ok(false);
        }

        let succeeded = self.context(Context::Site, Some(site), routines).await;

        self.host
            .sites
            .restore_current_site()
            .await
            .context("failed to restore current site")?;

        Ok(succeeded)
    }

    fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }

    fn finish(self, entity: &Installable) -> InstallResult<RunReport> {
        if self.failures.is_empty() {
            Ok(self.report)
        } else {
            Err(InstallError::RoutinesFailed {
                entity: entity.to_string(),
                failures: self.failures,
            })
        }
    }
}

/// Installs, updates and uninstalls one entity.
pub struct UnInstaller {
    entity: Installable,
    declarations: InstallDeclarations,
    updates: UpdateRegistry,
    lifecycle: Arc<dyn Lifecycle>,
    options: EngineOptions,
}

impl UnInstaller {
    pub fn new(entity: Installable) -> Self {
        Self {
            entity,
            declarations: InstallDeclarations::default(),
            updates: UpdateRegistry::default(),
            lifecycle: Arc::new(NoopLifecycle),
            options: EngineOptions::default(),
        }
    }

    pub fn with_declarations(mut self, declarations: InstallDeclarations) -> Self {
        self.declarations = declarations;
        self
    }

    pub fn with_updates(mut self, updates: UpdateRegistry) -> Self {
        self.updates = updates;
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: Arc<dyn Lifecycle>) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn entity(&self) -> &Installable {
        &self.entity
    }

    pub fn updates(&self) -> &UpdateRegistry {
        &self.updates
    }

    fn host(&self) -> &Host {
        self.entity.host()
    }

    async fn detect_mode(&self, network_wide: bool) -> InstallResult<ActivationMode> {
        let multisite = self
            .host()
            .sites
            .is_multisite()
            .await
            .context("failed to read host shape")?;
        Ok(ActivationMode::detect(multisite, network_wide))
    }

    /// Whether the network has too many sites for per-site work.
    async fn is_large_network(&self) -> InstallResult<bool> {
        let sites = self
            .host()
            .sites
            .site_ids()
            .await
            .context("failed to enumerate sites")?;
        Ok(sites.len() > self.options.large_network_threshold)
    }

    async fn current_site(&self) -> InstallResult<SiteId> {
        Ok(self
            .host()
            .sites
            .current_site_id()
            .await
            .context("failed to read current site")?)
    }

    fn install_routines(&self, context: Context) -> Vec<Arc<dyn Routine>> {
        let mut routines = compose_install(&self.declarations)
            .routines()
            .remove(&context)
            .unwrap_or_default();
        routines.extend(self.lifecycle.install_routines(context));
        routines
    }

    fn uninstall_routines(&self, context: Context) -> Vec<Arc<dyn Routine>> {
        let mut routines = self.lifecycle.uninstall_routines(context);
        routines.extend(
            compose_uninstall(&self.declarations)
                .routines()
                .remove(&context)
                .unwrap_or_default(),
        );
        routines
    }

    fn hook_error(&self, hook: &'static str) -> impl FnOnce(anyhow::Error) -> InstallError + '_ {
        move |error| InstallError::hook(self.entity.to_string(), hook, error)
    }

    /// Resolve the operation outcome once the `after_*` hook has run.
    fn conclude(
        &self,
        outcome: InstallResult<RunReport>,
        after: Result<()>,
        hook: &'static str,
    ) -> InstallResult<RunReport> {
        match (outcome, after) {
            (Ok(report), Ok(())) => Ok(report),
            (Ok(_), Err(error)) => Err(self.hook_error(hook)(error)),
            (Err(error), Ok(())) => Err(error),
            (Err(error), Err(hook_error)) => {
                warn!(entity = %self.entity, hook, error = %hook_error, "hook failed after earlier errors");
                Err(error)
            }
        }
    }

    /// Install the entity.
    ///
    /// `network_wide` only matters on multisite hosts.
    pub async fn install(&self, network_wide: bool) -> InstallResult<RunReport> {
        let mode = self.detect_mode(network_wide).await?;
        let cx = LifecycleContext {
            entity: &self.entity,
            mode,
            updating_from: None,
        };

        info!(entity = %self.entity, mode = %mode, version = %self.entity.version(), "installing");

        self.lifecycle
            .before_install(&cx)
            .await
            .map_err(self.hook_error("before_install"))?;

        let outcome = self.run_install(mode).await;
        let after = self.lifecycle.after_install(&cx).await;
        let report = self.conclude(outcome, after, "after_install")?;

        info!(entity = %self.entity, steps = report.steps.len(), "installed");
        Ok(report)
    }

    async fn run_install(&self, mode: ActivationMode) -> InstallResult<RunReport> {
        let mut run = Run::new(self.host(), mode, Stage::Install);

        match mode {
            ActivationMode::NetworkWide => {
                self.entity.set_network_installed().await?;
                run.context(Context::Network, None, &self.install_routines(Context::Network))
                    .await;

                if self.is_large_network().await? {
                    warn!(entity = %self.entity, "network too large, skipping per-site install");
                    self.entity.set_network_install_skipped().await?;
                    run.report.sites_skipped = true;
                } else {
                    let routines = self.install_routines(Context::Site);
                    for site in self.entity.installed_site_ids().await? {
                        run.site(site, &routines).await?;
                    }
                }

                if run.succeeded() {
                    self.entity.set_db_version(None, true).await?;
                }
            }
            ActivationMode::PerSite => {
                run.context(Context::Network, None, &self.install_routines(Context::Network))
                    .await;
                let site = self.current_site().await?;
                run.context(Context::Site, Some(site), &self.install_routines(Context::Site))
                    .await;
                self.entity.add_installed_site_id(Some(site)).await?;

                if run.succeeded() {
                    self.entity.set_db_version(None, false).await?;
                }
            }
            ActivationMode::SingleSite => {
                run.context(Context::Single, None, &self.install_routines(Context::Single))
                    .await;

                if run.succeeded() {
                    self.entity.set_db_version(None, false).await?;
                }
            }
        }

        run.finish(&self.entity)
    }

    /// Run the site install routines on a newly created site.
    ///
    /// Only does anything when the entity is network-installed.
    pub async fn install_on_site(&self, site: SiteId) -> InstallResult<RunReport> {
        if !self.entity.is_network_installed().await? {
            debug!(entity = %self.entity, site, "not network-installed, nothing to do for new site");
            return Ok(RunReport::up_to_date());
        }

        let mode = ActivationMode::NetworkWide;
        let cx = LifecycleContext {
            entity: &self.entity,
            mode,
            updating_from: None,
        };

        info!(entity = %self.entity, site, "installing on new site");

        self.lifecycle
            .before_install(&cx)
            .await
            .map_err(self.hook_error("before_install"))?;

        let outcome = self.run_install_on_site(site).await;

        let after = self.lifecycle.after_install(&cx).await;
        self.conclude(outcome, after, "after_install")
    }

    async fn run_install_on_site(&self, site: SiteId) -> InstallResult<RunReport> {
        let mut run = Run::new(self.host(), ActivationMode::NetworkWide, Stage::Install);
        run.site(site, &self.install_routines(Context::Site)).await?;
        run.finish(&self.entity)
    }

    /// Bring the stored version up to the entity's code version.
    ///
    /// Does nothing if the stored version is already equal or newer.
    pub async fn update(&self, network_wide: bool) -> InstallResult<RunReport> {
        let mode = self.detect_mode(network_wide).await?;
        let network = mode.is_network_wide();
        let from = self.entity.db_version(network).await?;
        let target = self.entity.version();

        if from.as_ref().is_some_and(|from| from >= target) {
            debug!(entity = %self.entity, version = %target, "already up to date");
            return Ok(RunReport::up_to_date());
        }

        let cx = LifecycleContext {
            entity: &self.entity,
            mode,
            updating_from: from.as_ref(),
        };

        info!(
            entity = %self.entity,
            mode = %mode,
            from = from.as_ref().map(Version::as_str).unwrap_or("none"),
            to = %target,
            "updating"
        );

        self.lifecycle
            .before_update(&cx)
            .await
            .map_err(self.hook_error("before_update"))?;

        let outcome = self.run_update(mode, from.as_ref()).await;
        let after = self.lifecycle.after_update(&cx).await;
        let report = self.conclude(outcome, after, "after_update")?;

        info!(entity = %self.entity, version = %target, steps = report.steps.len(), "updated");
        Ok(report)
    }

    async fn run_update(
        &self,
        mode: ActivationMode,
        from: Option<&Version>,
    ) -> InstallResult<RunReport> {
        let network = mode.is_network_wide();
        let target = self.entity.version();
        let pending = self.updates.pending(from, target, mode);

        let mut run = Run::new(self.host(), mode, Stage::Update(target.clone()));
        run.updating_from = from;

        let skip_sites = network && self.is_large_network().await?;
        if skip_sites {
            warn!(entity = %self.entity, "network too large, skipping per-site updates");
            self.entity.set_network_update_skipped().await?;
            run.report.sites_skipped = true;
        }

        for (version, update) in pending {
            run.stage = Stage::Update(version.clone());
            let failures_before = run.failures.len();

            for context in update.contexts_for(mode) {
                let routines = update.routines_for(context);
                if routines.is_empty() {
                    debug!(entity = %self.entity, version = %version, context = %context, "no update routines declared");
                    continue;
                }

                match context {
                    Context::Site if network => {
                        if skip_sites {
                            continue;
                        }
                        for site in self.entity.installed_site_ids().await? {
                            run.site(site, routines).await?;
                        }
                    }
                    Context::Site => {
                        let site = self.current_site().await?;
                        run.context(Context::Site, Some(site), routines).await;
                    }
                    Context::Network | Context::Single => {
                        run.context(context, None, routines).await;
                    }
                }
            }

            if run.failures.len() > failures_before {
                warn!(entity = %self.entity, version = %version, "update incomplete, stopping here");
                return run.finish(&self.entity);
            }

            debug!(entity = %self.entity, version = %version, "update complete");
            self.entity.set_db_version(Some(version), network).await?;
        }

        self.entity.set_db_version(Some(target), network).await?;
        run.finish(&self.entity)
    }

    /// Remove the entity from every site it is installed on.
    pub async fn uninstall(&self) -> InstallResult<RunReport> {
        let multisite = self
            .host()
            .sites
            .is_multisite()
            .await
            .context("failed to read host shape")?;
        let network_installed = multisite && self.entity.is_network_installed().await?;
        let mode = ActivationMode::detect(multisite, network_installed);
        let cx = LifecycleContext {
            entity: &self.entity,
            mode,
            updating_from: None,
        };

        info!(entity = %self.entity, mode = %mode, "uninstalling");

        self.lifecycle
            .before_uninstall(&cx)
            .await
            .map_err(self.hook_error("before_uninstall"))?;

        let outcome = self.run_uninstall(mode).await;
        let after = self.lifecycle.after_uninstall(&cx).await;
        let report = self.conclude(outcome, after, "after_uninstall")?;

        info!(entity = %self.entity, steps = report.steps.len(), "uninstalled");
        Ok(report)
    }

    async fn run_uninstall(&self, mode: ActivationMode) -> InstallResult<RunReport> {
        let mut run = Run::new(self.host(), mode, Stage::Uninstall);

        if mode == ActivationMode::SingleSite {
            run.context(Context::Single, None, &self.uninstall_routines(Context::Single))
                .await;

            if run.succeeded() {
                self.entity.unset_db_version(false).await?;
            }
            return run.finish(&self.entity);
        }

        let sites = self.entity.installed_site_ids().await?;
        let routines = self.uninstall_routines(Context::Site);
        for site in &sites {
            run.site(*site, &routines).await?;
        }

        run.context(Context::Network, None, &self.uninstall_routines(Context::Network))
            .await;

        if run.succeeded() {
            for site in &sites {
                self.forget_site_version(*site).await?;
            }
            self.entity.delete_installed_site_ids().await?;
            self.entity.unset_network_installed().await?;
            self.entity.unset_network_install_skipped().await?;
            self.entity.unset_network_update_skipped().await?;
            self.entity.unset_db_version(true).await?;
        }

        run.finish(&self.entity)
    }

    async fn forget_site_version(&self, site: SiteId) -> InstallResult<()> {
        self.host()
            .sites
            .switch_to_site(site)
            .await
            .with_context(|| format!("failed to switch to site {site}"))?;
        let unset = self.entity.unset_db_version(false).await;
        self.host()
            .sites
            .restore_current_site()
            .await
            .context("failed to restore current site")?;
        unset
    }
}

impl std::fmt::Debug for UnInstaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnInstaller")
            .field("entity", &self.entity)
            .field("declarations", &self.declarations)
            .field("updates", &self.updates)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::host::MemoryHost;
    use crate::installable::composer::CapsSource;
    use crate::installable::context::ContextKey;
    use std::collections::BTreeMap;

    fn uninstaller(memory: &Arc<MemoryHost>) -> UnInstaller {
        let entity =
            Installable::parse(Host::from_shared(memory.clone()), "component", "test", "1.0.0")
                .unwrap();
        UnInstaller::new(entity).with_declarations(
            InstallDeclarations::new()
                .with_table(ContextKey::Global, "test_logs", "id BIGINT")
                .with_caps(CapsSource::Static(BTreeMap::from([(
                    "manage_test".to_string(),
                    "manage_options".to_string(),
                )]))),
        )
    }

    #[tokio::test]
    async fn single_site_install_and_uninstall() {
        let memory = Arc::new(MemoryHost::single_site());
        let engine = uninstaller(&memory);

        let report = engine.install(false).await.unwrap();
        let routines: Vec<&str> = report.steps.iter().map(|s| s.routine.as_str()).collect();
        assert_eq!(routines, vec!["create_tables", "add_custom_caps"]);
        assert!(memory.has_table("wp_test_logs"));
        assert!(memory.role_caps(1, "administrator").contains("manage_test"));
        assert_eq!(
            engine.entity().db_version(false).await.unwrap().unwrap().as_str(),
            "1.0.0"
        );

        engine.uninstall().await.unwrap();
        assert!(!memory.has_table("wp_test_logs"));
        assert!(!memory.role_caps(1, "administrator").contains("manage_test"));
        assert_eq!(engine.entity().db_version(false).await.unwrap(), None);
    }

    #[tokio::test]
    async fn large_network_skips_site_install() {
        let memory = Arc::new(MemoryHost::multisite());
        memory.create_site(1);
        let engine = uninstaller(&memory).with_options(EngineOptions {
            large_network_threshold: 1,
        });

        let report = engine.install(true).await.unwrap();

        assert!(report.sites_skipped);
        assert!(engine.entity().is_network_install_skipped().await.unwrap());
        assert!(report.steps.iter().all(|step| step.context == Context::Network));
        assert!(memory.has_table("wp_test_logs"));
    }

    #[tokio::test]
    async fn install_on_site_requires_network_install() {
        let memory = Arc::new(MemoryHost::multisite());
        let engine = uninstaller(&memory);
        let site = memory.create_site(1);

        assert!(engine.install_on_site(site).await.unwrap().steps.is_empty());

        engine.entity().set_network_installed().await.unwrap();
        let report = engine.install_on_site(site).await.unwrap();
        assert_eq!(report.steps.len(), 1);
        assert_eq!(report.steps[0].site, Some(site));
        assert!(memory.role_caps(site, "administrator").contains("manage_test"));
        assert_eq!(memory.switch_depth(), 0);
    }
}
