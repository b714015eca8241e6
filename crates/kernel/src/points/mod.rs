//! The points component's un-installer.
//!
//! Tables and capabilities are declared; install extras, migrations and
//! uninstall cleanup are routines. [`un_installer`] wires them into an
//! [`UnInstaller`] for a host.

pub mod hooks;
pub mod uninstall;
pub mod updates;

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::{Value, json};
use tracing::debug;

use crate::host::Host;
use crate::installable::{
    CapsSource, Context, ContextKey, EngineOptions, EntityKind, InstallDeclarations,
    InstallResult, Installable, Lifecycle, LifecycleContext, Routine, RoutineContext,
    UnInstaller, Version,
};
use hooks::PointsHooks;
use uninstall::{PointsTypes, UninstallNetwork, UninstallSingle, UninstallSite};

/// Slug of the component.
pub const SLUG: &str = "points";

/// Current code version of the component.
pub const POINTS_VERSION: &str = "2.4.0";

pub const LOGS_TABLE: &str = "wordpoints_points_logs";
pub const LOG_META_TABLE: &str = "wordpoints_points_log_meta";

pub const POINTS_TYPES_OPTION: &str = "wordpoints_points_types";
pub const DEFAULT_POINTS_TYPE_OPTION: &str = "wordpoints_default_points_type";

static POINTS_TYPE_SLUG: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^[a-z0-9_-]+$").expect("points type pattern is valid")
});

/// Whether a points type slug is safe to embed in meta keys.
pub fn is_valid_points_type(slug: &str) -> bool {
    POINTS_TYPE_SLUG.is_match(slug)
}

const LOGS_SCHEMA: &str = "\
    id BIGSERIAL PRIMARY KEY,
    user_id BIGINT NOT NULL,
    log_type VARCHAR(255) NOT NULL,
    points BIGINT NOT NULL,
    points_type VARCHAR(255) NOT NULL,
    text TEXT,
    date TIMESTAMPTZ NOT NULL DEFAULT now(),
    site_id BIGINT NOT NULL DEFAULT 1,
    blog_id BIGINT NOT NULL DEFAULT 1";

const LOG_META_SCHEMA: &str = "\
    meta_id BIGSERIAL PRIMARY KEY,
    log_id BIGINT NOT NULL,
    meta_key VARCHAR(255),
    meta_value TEXT";

/// Custom capability → core capability it follows.
pub fn custom_caps() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("set_wordpoints_points".to_string(), "manage_options".to_string()),
        (
            "manage_wordpoints_points_types".to_string(),
            "manage_options".to_string(),
        ),
    ])
}

/// Tables and capabilities the component declares.
pub fn declarations() -> InstallDeclarations {
    InstallDeclarations::new()
        .with_table(ContextKey::Global, LOGS_TABLE, LOGS_SCHEMA)
        .with_table(ContextKey::Global, LOG_META_TABLE, LOG_META_SCHEMA)
        .with_caps(CapsSource::Getter(Arc::new(custom_caps)))
}

/// Adds the default points type option on single sites.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddDefaultPointsType;

#[async_trait]
impl Routine for AddDefaultPointsType {
    fn name(&self) -> &str {
        "add_default_points_type"
    }

    async fn run(&self, cx: &RoutineContext<'_>) -> Result<()> {
        cx.host
            .options
            .add_option(DEFAULT_POINTS_TYPE_OPTION, json!(""))
            .await?;
        Ok(())
    }
}

/// Version before which hooks were still combined.
fn hooks_split_version() -> Option<Version> {
    "1.4.0".parse().ok()
}

/// Hooks and routines specific to the points component.
#[derive(Debug, Default)]
pub struct PointsLifecycle {
    hooks: Arc<PointsHooks>,
    points_types: PointsTypes,
    /// Hooks network mode saved by `before_update`.
    saved_network_mode: Mutex<Option<bool>>,
}

impl PointsLifecycle {
    pub fn new(hooks: Arc<PointsHooks>) -> Self {
        Self {
            hooks,
            ..Self::default()
        }
    }

    pub fn hooks(&self) -> &Arc<PointsHooks> {
        &self.hooks
    }

    pub fn points_types(&self) -> Vec<String> {
        self.points_types.lock().clone()
    }
}

async fn read_points_types(host: &Host, network: bool) -> Result<Vec<String>> {
    let stored = if network {
        host.options.get_network_option(POINTS_TYPES_OPTION).await
    } else {
        host.options.get_option(POINTS_TYPES_OPTION).await
    };

    Ok(match stored.context("failed to read points types")? {
        Some(Value::Object(types)) => types.keys().cloned().collect(),
        _ => Vec::new(),
    })
}

#[async_trait]
impl Lifecycle for PointsLifecycle {
    async fn before_update(&self, cx: &LifecycleContext<'_>) -> Result<()> {
        let before_split = match (cx.updating_from, hooks_split_version()) {
            (Some(from), Some(split)) => *from < split,
            _ => true,
        };

        if before_split {
            let mode = self.hooks.network_mode();
            debug!(network_mode = mode, "forcing hooks network mode off for update");
            *self.saved_network_mode.lock() = Some(mode);
            self.hooks.set_network_mode(false);
        }
        Ok(())
    }

    async fn after_update(&self, _cx: &LifecycleContext<'_>) -> Result<()> {
        if let Some(mode) = self.saved_network_mode.lock().take() {
            self.hooks.set_network_mode(mode);
        }
        Ok(())
    }

    async fn before_uninstall(&self, cx: &LifecycleContext<'_>) -> Result<()> {
        let types = read_points_types(cx.entity.host(), cx.mode.is_network_wide()).await?;
        debug!(count = types.len(), "captured points types for uninstall");
        *self.points_types.lock() = types;
        Ok(())
    }

    fn install_routines(&self, context: Context) -> Vec<Arc<dyn Routine>> {
        match context {
            Context::Single => vec![Arc::new(AddDefaultPointsType)],
            Context::Network | Context::Site => Vec::new(),
        }
    }

    fn uninstall_routines(&self, context: Context) -> Vec<Arc<dyn Routine>> {
        let types = self.points_types.clone();
        match context {
            Context::Network => vec![Arc::new(UninstallNetwork::new(types))],
            Context::Site => vec![Arc::new(UninstallSite::new(types))],
            Context::Single => vec![Arc::new(UninstallSingle::new(types))],
        }
    }
}

/// Build the points component un-installer for `host`.
pub fn un_installer(host: Host, options: EngineOptions) -> InstallResult<UnInstaller> {
    un_installer_with_hooks(host, options, Arc::new(PointsHooks::new()))
}

/// Build the un-installer around an existing hook instance store.
pub fn un_installer_with_hooks(
    host: Host,
    options: EngineOptions,
    hooks: Arc<PointsHooks>,
) -> InstallResult<UnInstaller> {
    let entity = Installable::new(host, EntityKind::Component, SLUG, POINTS_VERSION.parse()?);
    let lifecycle = PointsLifecycle::new(hooks);
    let updates = updates::registry(&entity, lifecycle.hooks().clone())?;

    Ok(UnInstaller::new(entity)
        .with_declarations(declarations())
        .with_updates(updates)
        .with_lifecycle(Arc::new(lifecycle))
        .with_options(options))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::installable::composer::compose_install;

    #[test]
    fn points_type_slugs() {
        assert!(is_valid_points_type("points"));
        assert!(is_valid_points_type("gold-coins_2"));
        assert!(!is_valid_points_type(""));
        assert!(!is_valid_points_type("a b"));
    }

    #[test]
    fn tables_are_global_and_caps_local() {
        let plan = compose_install(&declarations());

        assert_eq!(plan.tables.len(), 2);
        assert!(plan.tables.contains_key(&Context::Single));
        assert!(plan.tables.contains_key(&Context::Network));
        assert!(!plan.tables.contains_key(&Context::Site));

        assert_eq!(plan.caps.len(), 2);
        assert_eq!(plan.caps[&Context::Site].caps(), &custom_caps());
    }
}
