//! Data migrations for past points component releases.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use super::hooks::{LegacySplitCleaner, PointsHooks, Split, split_points_hooks};
use super::{LOG_META_TABLE, LOGS_TABLE, custom_caps};
use crate::host::Host;
use crate::installable::routine::AddCaps;
use crate::installable::{
    Applicability, Context, InstallResult, Installable, Routine, RoutineContext, UpdateRegistry,
};

/// Resolved names of the tables the migrations touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Tables {
    pub logs: String,
    pub log_meta: String,
    pub users: String,
    pub usermeta: String,
    pub posts: String,
    pub comments: String,
    pub commentmeta: String,
}

impl Tables {
    pub(crate) fn with_prefixes(base: &str, site: &str) -> Self {
        Self {
            logs: format!("{base}{LOGS_TABLE}"),
            log_meta: format!("{base}{LOG_META_TABLE}"),
            users: format!("{base}users"),
            usermeta: format!("{base}usermeta"),
            posts: format!("{site}posts"),
            comments: format!("{site}comments"),
            commentmeta: format!("{site}commentmeta"),
        }
    }

    /// Table names for the current site.
    pub(crate) async fn resolve(host: &Host) -> Result<Self> {
        let base = host.schema.table_prefix(false).await?;
        let site = host.schema.table_prefix(true).await?;
        Ok(Self::with_prefixes(&base, &site))
    }
}

async fn execute_all(host: &Host, statements: &[String]) -> Result<()> {
    for sql in statements {
        let rows = host.schema.execute(sql).await?;
        debug!(rows, "executed migration statement");
    }
    Ok(())
}

fn deleted_user_logs_sql(t: &Tables) -> Vec<String> {
    vec![
        format!(
            "DELETE FROM {meta} WHERE log_id IN (\
             SELECT l.id FROM {logs} AS l LEFT JOIN {users} AS u ON l.user_id = u.id \
             WHERE u.id IS NULL)",
            meta = t.log_meta,
            logs = t.logs,
            users = t.users,
        ),
        format!(
            "DELETE FROM {logs} AS l WHERE NOT EXISTS (\
             SELECT 1 FROM {users} AS u WHERE u.id = l.user_id)",
            logs = t.logs,
            users = t.users,
        ),
    ]
}

fn orphaned_meta_sql(t: &Tables) -> Vec<String> {
    vec![
        format!(
            "DELETE FROM {meta} AS m WHERE m.meta_key = 'post_id' AND NOT EXISTS (\
             SELECT 1 FROM {posts} AS p WHERE p.id::text = m.meta_value)",
            meta = t.log_meta,
            posts = t.posts,
        ),
        format!(
            "DELETE FROM {meta} AS m WHERE m.meta_key = 'comment_id' AND NOT EXISTS (\
             SELECT 1 FROM {comments} AS c WHERE c.comment_id::text = m.meta_value)",
            meta = t.log_meta,
            comments = t.comments,
        ),
    ]
}

fn comment_approve_logs_sql(t: &Tables) -> Vec<String> {
    vec![format!(
        "DELETE FROM {meta} AS m WHERE m.meta_key = 'post_id' \
         AND m.log_id IN (SELECT id FROM {logs} WHERE log_type = 'comment_approve') \
         AND NOT EXISTS (SELECT 1 FROM {posts} AS p WHERE p.id::text = m.meta_value)",
        meta = t.log_meta,
        logs = t.logs,
        posts = t.posts,
    )]
}

/// 1.2.0: drop logs of deleted users and meta pointing at deleted content.
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanOrphanedLogs;

#[async_trait]
impl Routine for CleanOrphanedLogs {
    fn name(&self) -> &str {
        "clean_orphaned_logs"
    }

    async fn run(&self, cx: &RoutineContext<'_>) -> Result<()> {
        let tables = Tables::resolve(cx.host).await?;
        execute_all(cx.host, &deleted_user_logs_sql(&tables)).await?;
        execute_all(cx.host, &orphaned_meta_sql(&tables)).await
    }
}

/// 1.4.0: split post and comment hooks for the current site.
#[derive(Debug, Clone)]
pub struct SplitPointsHooks {
    hooks: Arc<PointsHooks>,
}

impl SplitPointsHooks {
    pub fn new(hooks: Arc<PointsHooks>) -> Self {
        Self { hooks }
    }
}

async fn split_both(host: &Host, hooks: &PointsHooks) -> Result<()> {
    let cleaner = LegacySplitCleaner;
    split_points_hooks(host, hooks, &Split::post(), &cleaner).await?;
    split_points_hooks(host, hooks, &Split::comment(), &cleaner).await
}

#[async_trait]
impl Routine for SplitPointsHooks {
    fn name(&self) -> &str {
        "split_points_hooks"
    }

    async fn run(&self, cx: &RoutineContext<'_>) -> Result<()> {
        split_both(cx.host, &self.hooks).await
    }
}

/// 1.4.0: split network hooks. Only acts when network-wide.
#[derive(Debug, Clone)]
pub struct SplitNetworkPointsHooks {
    hooks: Arc<PointsHooks>,
}

impl SplitNetworkPointsHooks {
    pub fn new(hooks: Arc<PointsHooks>) -> Self {
        Self { hooks }
    }
}

#[async_trait]
impl Routine for SplitNetworkPointsHooks {
    fn name(&self) -> &str {
        "split_network_points_hooks"
    }

    async fn run(&self, cx: &RoutineContext<'_>) -> Result<()> {
        if !cx.mode.is_network_wide() {
            return Ok(());
        }

        let previous = self.hooks.network_mode();
        self.hooks.set_network_mode(true);
        let split = split_both(cx.host, &self.hooks).await;
        self.hooks.set_network_mode(previous);
        split
    }
}

/// 1.4.0: drop comment approval log meta pointing at deleted posts.
#[derive(Debug, Clone, Copy, Default)]
pub struct CleanCommentApproveLogs;

#[async_trait]
impl Routine for CleanCommentApproveLogs {
    fn name(&self) -> &str {
        "clean_comment_approve_logs"
    }

    async fn run(&self, cx: &RoutineContext<'_>) -> Result<()> {
        let tables = Tables::resolve(cx.host).await?;
        execute_all(cx.host, &comment_approve_logs_sql(&tables)).await
    }
}

/// 1.5.1: convert the points tables to the host character set.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConvertCharset;

#[async_trait]
impl Routine for ConvertCharset {
    fn name(&self) -> &str {
        "convert_charset"
    }

    async fn run(&self, cx: &RoutineContext<'_>) -> Result<()> {
        let Some(charset) = cx.host.schema.charset().await? else {
            debug!("host reports no charset, nothing to convert");
            return Ok(());
        };
        if charset.charset.is_empty() {
            return Ok(());
        }

        let mut target = format!("CHARACTER SET {}", charset.charset);
        if let Some(collate) = charset.collate.filter(|c| !c.is_empty()) {
            target.push_str(&format!(" COLLATE {collate}"));
        }

        let tables = Tables::resolve(cx.host).await?;
        let statements: Vec<String> = [&tables.logs, &tables.log_meta]
            .iter()
            .map(|table| format!("ALTER TABLE {table} CONVERT TO {target}"))
            .collect();
        execute_all(cx.host, &statements).await
    }
}

/// 1.8.0: record the current site in the entity's membership list.
#[derive(Debug, Clone)]
pub struct RecordInstalledSite {
    entity: Installable,
}

impl RecordInstalledSite {
    pub fn new(entity: Installable) -> Self {
        Self { entity }
    }
}

#[async_trait]
impl Routine for RecordInstalledSite {
    fn name(&self) -> &str {
        "record_installed_site"
    }

    async fn run(&self, cx: &RoutineContext<'_>) -> Result<()> {
        self.entity.add_installed_site_id(cx.site).await?;
        Ok(())
    }
}

/// Every update the points component has shipped.
pub fn registry(entity: &Installable, hooks: Arc<PointsHooks>) -> InstallResult<UpdateRegistry> {
    let mut updates = UpdateRegistry::new();

    updates
        .declare("1.2.0", &[Context::Single, Context::Network])?
        .routine(Context::Single, CleanOrphanedLogs)
        .routine(Context::Network, CleanOrphanedLogs);

    updates
        .declare("1.4.0", &[Context::Single, Context::Site, Context::Network])?
        .routine(Context::Network, SplitNetworkPointsHooks::new(hooks.clone()))
        .routine(Context::Site, SplitPointsHooks::new(hooks.clone()))
        .routine(Context::Site, CleanCommentApproveLogs)
        .routine(Context::Single, SplitPointsHooks::new(hooks))
        .routine(Context::Single, CleanCommentApproveLogs);

    // Capabilities weren't added to new sites in network mode before 1.5.0.
    updates
        .declare("1.5.0", &[Context::Site])?
        .applies(Applicability::NetworkWideOnly)
        .routine(Context::Site, AddCaps::new(custom_caps()));

    updates
        .declare("1.5.1", &[Context::Single, Context::Network])?
        .routine(Context::Single, ConvertCharset)
        .routine(Context::Network, ConvertCharset);

    updates
        .declare("1.8.0", &[Context::Site])?
        .applies(Applicability::PerSiteOnly)
        .routine(Context::Site, RecordInstalledSite::new(entity.clone()));

    Ok(updates)
}
