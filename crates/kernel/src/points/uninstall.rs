//! Removal of points data beyond the declared tables and capabilities.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::hooks::{HookHandler, POINTS_TYPES_HOOKS_OPTION};
use super::updates::Tables;
use super::{DEFAULT_POINTS_TYPE_OPTION, POINTS_TYPES_OPTION, is_valid_points_type};
use crate::installable::{Routine, RoutineContext};

/// Site options removed on uninstall, besides hook options.
const SITE_OPTIONS: &[&str] = &[
    POINTS_TYPES_OPTION,
    DEFAULT_POINTS_TYPE_OPTION,
    POINTS_TYPES_HOOKS_OPTION,
    "widget_wordpoints_points_logs_widget",
    "widget_wordpoints_top_users_widget",
    "widget_wordpoints_points_widget",
];

/// Hook handlers whose options are removed on uninstall.
fn hook_handlers() -> [HookHandler; 4] {
    [
        HookHandler::Other("wordpoints_registration_points_hook".to_string()),
        HookHandler::Post,
        HookHandler::Comment,
        HookHandler::Other("wordpoints_periodic_points_hook".to_string()),
    ]
}

/// Points types captured before uninstalling, shared by the routines.
pub type PointsTypes = Arc<Mutex<Vec<String>>>;

fn captured(points_types: &PointsTypes) -> Vec<String> {
    points_types
        .lock()
        .iter()
        .filter(|slug| {
            let valid = is_valid_points_type(slug);
            if !valid {
                warn!(points_type = %slug, "skipping points type with unexpected characters");
            }
            valid
        })
        .cloned()
        .collect()
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// User meta holding balances, either network-wide or prefixed per site.
fn user_meta_sql(usermeta: &str, meta_prefix: &str, points_types: &[String]) -> Vec<String> {
    let mut keys: Vec<String> = points_types
        .iter()
        .map(|slug| format!("{meta_prefix}wordpoints_points-{slug}"))
        .collect();
    keys.push(format!("{meta_prefix}wordpoints_points_period_start"));

    keys.iter()
        .map(|key| format!("DELETE FROM {usermeta} WHERE meta_key = {}", quote(key)))
        .collect()
}

fn comment_meta_sql(commentmeta: &str, points_types: &[String]) -> Vec<String> {
    points_types
        .iter()
        .map(|slug| {
            format!(
                "DELETE FROM {commentmeta} WHERE meta_key = {}",
                quote(&format!("wordpoints_last_status-{slug}"))
            )
        })
        .collect()
}

/// Network-level data: global balances and network options.
#[derive(Debug, Clone)]
pub struct UninstallNetwork {
    points_types: PointsTypes,
}

impl UninstallNetwork {
    pub fn new(points_types: PointsTypes) -> Self {
        Self { points_types }
    }
}

#[async_trait]
impl Routine for UninstallNetwork {
    fn name(&self) -> &str {
        "uninstall_points_network"
    }

    async fn run(&self, cx: &RoutineContext<'_>) -> Result<()> {
        let tables = Tables::resolve(cx.host).await?;
        for sql in user_meta_sql(&tables.usermeta, "", &captured(&self.points_types)) {
            cx.host.schema.execute(&sql).await?;
        }

        for option in [POINTS_TYPES_OPTION, DEFAULT_POINTS_TYPE_OPTION, POINTS_TYPES_HOOKS_OPTION] {
            cx.host.options.delete_network_option(option).await?;
        }
        Ok(())
    }
}

/// Per-site data: comment and user meta, options and hook settings.
#[derive(Debug, Clone)]
pub struct UninstallSite {
    points_types: PointsTypes,
}

impl UninstallSite {
    pub fn new(points_types: PointsTypes) -> Self {
        Self { points_types }
    }
}

#[async_trait]
impl Routine for UninstallSite {
    fn name(&self) -> &str {
        "uninstall_points_site"
    }

    async fn run(&self, cx: &RoutineContext<'_>) -> Result<()> {
        let points_types = captured(&self.points_types);
        let tables = Tables::resolve(cx.host).await?;
        let site_prefix = cx.host.schema.table_prefix(true).await?;

        let mut statements = comment_meta_sql(&tables.commentmeta, &points_types);
        statements.extend(user_meta_sql(&tables.usermeta, &site_prefix, &points_types));
        for sql in &statements {
            cx.host.schema.execute(sql).await?;
        }

        delete_site_options(cx).await
    }
}

/// Single-site data: global balances and site options.
#[derive(Debug, Clone)]
pub struct UninstallSingle {
    points_types: PointsTypes,
}

impl UninstallSingle {
    pub fn new(points_types: PointsTypes) -> Self {
        Self { points_types }
    }
}

#[async_trait]
impl Routine for UninstallSingle {
    fn name(&self) -> &str {
        "uninstall_points_single"
    }

    async fn run(&self, cx: &RoutineContext<'_>) -> Result<()> {
        let tables = Tables::resolve(cx.host).await?;
        for sql in user_meta_sql(&tables.usermeta, "", &captured(&self.points_types)) {
            cx.host.schema.execute(&sql).await?;
        }

        delete_site_options(cx).await
    }
}

async fn delete_site_options(cx: &RoutineContext<'_>) -> Result<()> {
    let hook_options = hook_handlers().map(|handler| handler.option_name());
    let options = SITE_OPTIONS
        .iter()
        .copied()
        .chain(hook_options.iter().map(String::as_str));

    for option in options {
        if cx.host.options.delete_option(option).await? {
            debug!(option, "deleted option");
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn user_meta_keys_include_site_prefix() {
        let statements = user_meta_sql("wp_usermeta", "wp_2_", &["points".to_string()]);
        assert_eq!(
            statements,
            vec![
                "DELETE FROM wp_usermeta WHERE meta_key = 'wp_2_wordpoints_points-points'",
                "DELETE FROM wp_usermeta WHERE meta_key = 'wp_2_wordpoints_points_period_start'",
            ]
        );
    }

    #[test]
    fn invalid_points_types_are_skipped() {
        let types: PointsTypes = Arc::new(Mutex::new(vec![
            "points".to_string(),
            "x'; DROP TABLE wp_users; --".to_string(),
        ]));
        assert_eq!(captured(&types), vec!["points".to_string()]);
    }

    #[test]
    fn comment_meta_per_points_type() {
        let statements = comment_meta_sql("wp_commentmeta", &["gold".to_string()]);
        assert_eq!(
            statements,
            vec!["DELETE FROM wp_commentmeta WHERE meta_key = 'wordpoints_last_status-gold'"]
        );
    }
}
