#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Install, update and uninstall engine tests.
//!
//! Run against the in-memory host with recording routines.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use parking_lot::Mutex;

use wordpoints_kernel::host::Host;
use wordpoints_kernel::installable::{
    CapsSource, Context, ContextKey, EngineOptions, InstallDeclarations, InstallError,
    Installable, Lifecycle, LifecycleContext, Routine, UnInstaller, UpdateRegistry,
};
use wordpoints_test_utils::{CallLog, multisite, single_site};

fn entity(host: Host, version: &str) -> Installable {
    Installable::parse(host, "module", "test", version).unwrap()
}

/// Declares `version` with one recording routine per context, named
/// `"{version}/{context}"`.
fn declare_recorded(updates: &mut UpdateRegistry, log: &CallLog, version: &str, contexts: &[Context]) {
    let update = updates.declare(version, contexts).unwrap();
    for context in contexts {
        update.routine(*context, log.routine(&format!("{version}/{context}")));
    }
}

#[tokio::test]
async fn test_update_from_declared_version_runs_only_newer_single_routines() {
    let (_memory, host) = single_site();
    let log = CallLog::new();

    let mut updates = UpdateRegistry::new();
    declare_recorded(&mut updates, &log, "1.2.0", &[Context::Single, Context::Network]);
    declare_recorded(
        &mut updates,
        &log,
        "1.4.0",
        &[Context::Single, Context::Site, Context::Network],
    );

    let engine = UnInstaller::new(entity(host, "1.4.0")).with_updates(updates);
    engine
        .entity()
        .set_db_version(Some(&"1.2.0".parse().unwrap()), false)
        .await
        .unwrap();

    engine.update(false).await.unwrap();

    assert_eq!(log.names(), vec!["1.4.0/single"]);
    assert_eq!(
        engine.entity().db_version(false).await.unwrap().unwrap().as_str(),
        "1.4.0"
    );
}

#[tokio::test]
async fn test_update_without_installed_version_runs_everything_ascending() {
    let (_memory, host) = single_site();
    let log = CallLog::new();

    let mut updates = UpdateRegistry::new();
    declare_recorded(&mut updates, &log, "2.0.0", &[Context::Single]);
    declare_recorded(&mut updates, &log, "1.10.0", &[Context::Single]);
    declare_recorded(&mut updates, &log, "1.2.0", &[Context::Single]);
    declare_recorded(&mut updates, &log, "3.0.0", &[Context::Single]);

    let engine = UnInstaller::new(entity(host, "2.0.0")).with_updates(updates);
    engine.update(false).await.unwrap();

    assert_eq!(
        log.names(),
        vec!["1.2.0/single", "1.10.0/single", "2.0.0/single"]
    );
}

#[tokio::test]
async fn test_second_update_is_a_noop() {
    let (memory, host) = single_site();
    let log = CallLog::new();

    let mut updates = UpdateRegistry::new();
    declare_recorded(&mut updates, &log, "1.1.0", &[Context::Single]);

    let engine = UnInstaller::new(entity(host, "1.1.0")).with_updates(updates);
    engine
        .entity()
        .set_db_version(Some(&"1.0.0".parse().unwrap()), false)
        .await
        .unwrap();

    let first = engine.update(false).await.unwrap();
    assert!(!first.up_to_date);
    assert_eq!(log.count("1.1.0/single"), 1);
    let state_after_first = memory.snapshot().site_options;

    let second = engine.update(false).await.unwrap();
    assert!(second.up_to_date);
    assert!(second.steps.is_empty());
    assert_eq!(log.count("1.1.0/single"), 1);
    assert_eq!(memory.snapshot().site_options, state_after_first);
}

#[tokio::test]
async fn test_newer_stored_version_is_left_alone() {
    let (_memory, host) = single_site();
    let log = CallLog::new();

    let mut updates = UpdateRegistry::new();
    declare_recorded(&mut updates, &log, "1.0.0", &[Context::Single]);

    let engine = UnInstaller::new(entity(host, "1.0.0")).with_updates(updates);
    engine
        .entity()
        .set_db_version(Some(&"2.0.0".parse().unwrap()), false)
        .await
        .unwrap();

    assert!(engine.update(false).await.unwrap().up_to_date);
    assert!(log.names().is_empty());
    assert_eq!(
        engine.entity().db_version(false).await.unwrap().unwrap().as_str(),
        "2.0.0"
    );
}

#[tokio::test]
async fn test_failed_site_stops_at_that_version_and_resumes() {
    let (memory, host) = multisite(2);
    let log = CallLog::new();

    let mut failing = UpdateRegistry::new();
    failing
        .declare("1.5.0", &[Context::Site])
        .unwrap()
        .routine(Context::Site, log.failing("1.5.0/site").on_site(2));
    declare_recorded(&mut failing, &log, "2.0.0", &[Context::Network]);

    let engine = UnInstaller::new(entity(host.clone(), "2.0.0")).with_updates(failing);
    engine.entity().set_network_installed().await.unwrap();
    engine
        .entity()
        .set_db_version(Some(&"1.0.0".parse().unwrap()), true)
        .await
        .unwrap();

    let error = engine.update(true).await.unwrap_err();
    match error {
        InstallError::RoutinesFailed { failures, .. } => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].site, Some(2));
            assert_eq!(failures[0].context, Context::Site);
        }
        other => panic!("unexpected error: {other}"),
    }

    // Every site was attempted, later versions were not.
    assert_eq!(log.sites_for("1.5.0/site"), vec![1, 2, 3]);
    assert_eq!(log.count("2.0.0/network"), 0);
    assert_eq!(memory.switch_depth(), 0);
    assert_eq!(
        engine.entity().db_version(true).await.unwrap().unwrap().as_str(),
        "1.0.0"
    );

    // A fixed routine picks up where the failed run stopped.
    log.clear();
    let mut fixed = UpdateRegistry::new();
    declare_recorded(&mut fixed, &log, "1.5.0", &[Context::Site]);
    declare_recorded(&mut fixed, &log, "2.0.0", &[Context::Network]);

    let engine = UnInstaller::new(entity(host, "2.0.0")).with_updates(fixed);
    engine.update(true).await.unwrap();

    assert_eq!(log.sites_for("1.5.0/site"), vec![1, 2, 3]);
    assert_eq!(log.count("2.0.0/network"), 1);
    assert_eq!(
        engine.entity().db_version(true).await.unwrap().unwrap().as_str(),
        "2.0.0"
    );
}

#[tokio::test]
async fn test_large_network_update_records_skip() {
    let (_memory, host) = multisite(3);
    let log = CallLog::new();

    let mut updates = UpdateRegistry::new();
    declare_recorded(&mut updates, &log, "1.1.0", &[Context::Site, Context::Network]);

    let engine = UnInstaller::new(entity(host, "1.1.0"))
        .with_updates(updates)
        .with_options(EngineOptions {
            large_network_threshold: 2,
        });
    engine.entity().set_network_installed().await.unwrap();
    engine
        .entity()
        .set_db_version(Some(&"1.0.0".parse().unwrap()), true)
        .await
        .unwrap();

    let report = engine.update(true).await.unwrap();

    assert!(report.sites_skipped);
    assert_eq!(log.names(), vec!["1.1.0/network"]);
    assert_eq!(
        engine
            .entity()
            .network_update_skipped()
            .await
            .unwrap()
            .unwrap()
            .as_str(),
        "1.0.0"
    );
}

#[tokio::test]
async fn test_large_network_update_without_version_is_marked() {
    let (_memory, host) = multisite(3);
    let log = CallLog::new();

    let mut updates = UpdateRegistry::new();
    declare_recorded(&mut updates, &log, "1.1.0", &[Context::Site, Context::Network]);

    let engine = UnInstaller::new(entity(host, "1.1.0"))
        .with_updates(updates)
        .with_options(EngineOptions {
            large_network_threshold: 2,
        });
    engine.entity().set_network_installed().await.unwrap();

    let report = engine.update(true).await.unwrap();

    assert!(report.sites_skipped);
    assert_eq!(log.names(), vec!["1.1.0/network"]);
    assert!(engine.entity().is_network_update_skipped().await.unwrap());
    assert_eq!(engine.entity().network_update_skipped().await.unwrap(), None);
}

#[tokio::test]
async fn test_per_site_install_records_membership() {
    let (memory, host) = multisite(1);
    let engine = UnInstaller::new(entity(host, "1.0.0")).with_declarations(
        InstallDeclarations::new()
            .with_table(ContextKey::Site, "test_items", "id BIGINT")
            .with_caps(CapsSource::Static(BTreeMap::from([(
                "manage_test".to_string(),
                "manage_options".to_string(),
            )]))),
    );

    engine.install(false).await.unwrap();

    assert_eq!(engine.entity().installed_site_ids().await.unwrap(), vec![1]);
    assert_eq!(
        engine.entity().db_version(false).await.unwrap().unwrap().as_str(),
        "1.0.0"
    );
    assert_eq!(engine.entity().db_version(true).await.unwrap(), None);
    assert!(!engine.entity().is_network_installed().await.unwrap());
    assert!(memory.has_table("wp_test_items"));
    assert!(memory.role_caps(1, "administrator").contains("manage_test"));
    assert!(!memory.role_caps(2, "administrator").contains("manage_test"));
}

#[tokio::test]
async fn test_network_wide_install_then_uninstall_cleans_every_site() {
    let (memory, host) = multisite(2);
    let engine = UnInstaller::new(entity(host, "1.0.0")).with_declarations(
        InstallDeclarations::new()
            .with_table(ContextKey::Global, "test_logs", "id BIGINT")
            .with_table(ContextKey::Site, "test_items", "id BIGINT")
            .with_caps(CapsSource::Static(BTreeMap::from([(
                "manage_test".to_string(),
                "manage_options".to_string(),
            )]))),
    );

    engine.install(true).await.unwrap();

    assert!(engine.entity().is_network_installed().await.unwrap());
    assert!(memory.has_table("wp_test_logs"));
    assert!(memory.has_table("wp_test_items"));
    assert!(memory.has_table("wp_2_test_items"));
    assert!(memory.has_table("wp_3_test_items"));
    for site in [1, 2, 3] {
        assert!(memory.role_caps(site, "administrator").contains("manage_test"));
    }
    assert_eq!(
        engine.entity().db_version(true).await.unwrap().unwrap().as_str(),
        "1.0.0"
    );

    engine.uninstall().await.unwrap();

    assert!(!engine.entity().is_network_installed().await.unwrap());
    assert_eq!(engine.entity().db_version(true).await.unwrap(), None);
    assert!(!memory.has_table("wp_test_logs"));
    assert!(!memory.has_table("wp_3_test_items"));
    for site in [1, 2, 3] {
        assert!(!memory.role_caps(site, "administrator").contains("manage_test"));
    }
    assert_eq!(memory.switch_depth(), 0);
}

/// Records which hooks ran and optionally adds a failing install routine.
#[derive(Default)]
struct RecordingLifecycle {
    hooks: Mutex<Vec<&'static str>>,
    log: CallLog,
    fail_install: bool,
    fail_before: bool,
}

#[async_trait]
impl Lifecycle for RecordingLifecycle {
    async fn before_install(&self, _cx: &LifecycleContext<'_>) -> Result<()> {
        self.hooks.lock().push("before_install");
        if self.fail_before {
            bail!("not ready");
        }
        Ok(())
    }

    async fn after_install(&self, _cx: &LifecycleContext<'_>) -> Result<()> {
        self.hooks.lock().push("after_install");
        Ok(())
    }

    fn install_routines(&self, context: Context) -> Vec<Arc<dyn Routine>> {
        if self.fail_install && context == Context::Single {
            vec![Arc::new(self.log.failing("explode"))]
        } else {
            Vec::new()
        }
    }
}

#[tokio::test]
async fn test_after_hook_runs_when_routines_fail() {
    let (_memory, host) = single_site();
    let lifecycle = Arc::new(RecordingLifecycle {
        fail_install: true,
        ..RecordingLifecycle::default()
    });
    let engine = UnInstaller::new(entity(host, "1.0.0")).with_lifecycle(lifecycle.clone());

    let error = engine.install(false).await.unwrap_err();

    assert!(matches!(error, InstallError::RoutinesFailed { .. }));
    assert_eq!(
        *lifecycle.hooks.lock(),
        vec!["before_install", "after_install"]
    );
    assert_eq!(engine.entity().db_version(false).await.unwrap(), None);
}

#[tokio::test]
async fn test_failed_before_hook_aborts_without_after_hook() {
    let (_memory, host) = single_site();
    let lifecycle = Arc::new(RecordingLifecycle {
        fail_before: true,
        ..RecordingLifecycle::default()
    });
    let engine = UnInstaller::new(entity(host, "1.0.0")).with_lifecycle(lifecycle.clone());

    let error = engine.install(false).await.unwrap_err();

    assert!(matches!(error, InstallError::Hook { .. }));
    assert_eq!(*lifecycle.hooks.lock(), vec!["before_install"]);
    assert!(lifecycle.log.names().is_empty());
}
