//! PostgreSQL host backed by `sqlx`.
//!
//! Options, sites and role capabilities live in bookkeeping tables created by
//! [`PgHost::ensure_schema`]. Entity tables are created with `raw_sql`
//! because their bodies come from declarations, not prepared statements.
//! Minimal user and content tables are created alongside so data
//! migrations have something to join against.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::Value;
use sqlx::PgPool;
use tracing::{debug, info};

use super::{
    CapabilityStore, Charset, NetworkId, OptionStore, SchemaExecutor, SiteId, SiteRoster,
};

static TABLE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("table name pattern is valid")
});

const BOOTSTRAP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS wordpoints_sites (
    id BIGINT PRIMARY KEY,
    network_id BIGINT NOT NULL
);
CREATE TABLE IF NOT EXISTS wordpoints_options (
    site_id BIGINT NOT NULL,
    name TEXT NOT NULL,
    value JSONB NOT NULL,
    PRIMARY KEY (site_id, name)
);
CREATE TABLE IF NOT EXISTS wordpoints_network_options (
    network_id BIGINT NOT NULL,
    name TEXT NOT NULL,
    value JSONB NOT NULL,
    PRIMARY KEY (network_id, name)
);
CREATE TABLE IF NOT EXISTS wordpoints_role_caps (
    site_id BIGINT NOT NULL,
    role TEXT NOT NULL,
    capability TEXT NOT NULL,
    PRIMARY KEY (site_id, role, capability)
);
"#;

/// Default roles seeded for every new site: (role, capability).
const DEFAULT_ROLE_CAPS: &[(&str, &str)] = &[
    ("administrator", "manage_options"),
    ("administrator", "edit_posts"),
    ("administrator", "moderate_comments"),
    ("administrator", "read"),
    ("editor", "edit_posts"),
    ("editor", "moderate_comments"),
    ("editor", "read"),
    ("subscriber", "read"),
];

/// Host settings for a PostgreSQL deployment.
#[derive(Debug, Clone)]
pub struct PgHostSettings {
    pub multisite: bool,
    pub network_id: NetworkId,
    pub site_id: SiteId,
    pub table_prefix: String,
}

/// A host whose state lives in PostgreSQL.
pub struct PgHost {
    pool: PgPool,
    multisite: bool,
    network_id: NetworkId,
    table_prefix: String,
    current_site: Mutex<SiteId>,
    switched: Mutex<Vec<SiteId>>,
}

impl PgHost {
    pub fn new(pool: PgPool, settings: PgHostSettings) -> Self {
        Self {
            pool,
            multisite: settings.multisite,
            network_id: settings.network_id,
            table_prefix: settings.table_prefix,
            current_site: Mutex::new(settings.site_id),
            switched: Mutex::new(Vec::new()),
        }
    }

    /// Create bookkeeping tables and register the current site.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(BOOTSTRAP_SQL)
            .execute(&self.pool)
            .await
            .context("failed to create host bookkeeping tables")?;

        let users = format!(
            "CREATE TABLE IF NOT EXISTS {prefix}users (id BIGINT PRIMARY KEY);\n\
             CREATE TABLE IF NOT EXISTS {prefix}usermeta (\n\
                 umeta_id BIGSERIAL PRIMARY KEY,\n\
                 user_id BIGINT NOT NULL,\n\
                 meta_key VARCHAR(255),\n\
                 meta_value TEXT\n\
             );",
            prefix = checked_table_name(&self.table_prefix)?,
        );
        sqlx::raw_sql(&users)
            .execute(&self.pool)
            .await
            .context("failed to create user tables")?;

        let site = *self.current_site.lock();
        self.register_site(site, self.network_id).await?;

        info!(site, network = self.network_id, "host schema ready");
        Ok(())
    }

    /// Create a site on `network` and seed its roles. Returns the new id.
    pub async fn create_site(&self, network: NetworkId) -> Result<SiteId> {
        let next: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) + 1 FROM wordpoints_sites")
            .fetch_one(&self.pool)
            .await
            .context("failed to allocate site id")?;

        let site = SiteId::try_from(next).context("site id out of range")?;
        self.register_site(site, network).await?;
        Ok(site)
    }

    async fn register_site(&self, site: SiteId, network: NetworkId) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO wordpoints_sites (id, network_id) VALUES ($1, $2) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(to_db(site)?)
        .bind(to_db(network)?)
        .execute(&mut *tx)
        .await
        .context("failed to register site")?;

        for (role, cap) in DEFAULT_ROLE_CAPS {
            sqlx::query(
                "INSERT INTO wordpoints_role_caps (site_id, role, capability) VALUES ($1, $2, $3) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(to_db(site)?)
            .bind(*role)
            .bind(*cap)
            .execute(&mut *tx)
            .await
            .context("failed to seed site roles")?;
        }

        tx.commit().await?;

        let prefix = self.prefix_for(site);
        let content = format!(
            "CREATE TABLE IF NOT EXISTS {prefix}posts (id BIGINT PRIMARY KEY);\n\
             CREATE TABLE IF NOT EXISTS {prefix}comments (\n\
                 comment_id BIGINT PRIMARY KEY,\n\
                 comment_post_id BIGINT NOT NULL DEFAULT 0\n\
             );\n\
             CREATE TABLE IF NOT EXISTS {prefix}commentmeta (\n\
                 meta_id BIGSERIAL PRIMARY KEY,\n\
                 comment_id BIGINT NOT NULL,\n\
                 meta_key VARCHAR(255),\n\
                 meta_value TEXT\n\
             );",
            prefix = checked_table_name(&prefix)?,
        );
        sqlx::raw_sql(&content)
            .execute(&self.pool)
            .await
            .context("failed to create site content tables")?;

        debug!(site, network, "registered site");
        Ok(())
    }

    /// Table prefix of `site`'s own tables.
    fn prefix_for(&self, site: SiteId) -> String {
        if self.multisite && site != 1 {
            format!("{}{}_", self.table_prefix, site)
        } else {
            self.table_prefix.clone()
        }
    }

    fn site(&self) -> Result<i64> {
        to_db(*self.current_site.lock())
    }
}

fn to_db(id: u64) -> Result<i64> {
    i64::try_from(id).context("id does not fit in BIGINT")
}

fn checked_table_name(name: &str) -> Result<&str> {
    if !TABLE_NAME.is_match(name) {
        bail!("refusing to use '{name}' as a table name");
    }
    Ok(name)
}

#[async_trait]
impl OptionStore for PgHost {
    async fn get_option(&self, name: &str) -> Result<Option<Value>> {
        let value = sqlx::query_scalar::<_, Value>(
            "SELECT value FROM wordpoints_options WHERE site_id = $1 AND name = $2",
        )
        .bind(self.site()?)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to read option '{name}'"))?;

        Ok(value)
    }

    async fn update_option(&self, name: &str, value: Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO wordpoints_options (site_id, name, value) VALUES ($1, $2, $3) \
             ON CONFLICT (site_id, name) DO UPDATE SET value = $3",
        )
        .bind(self.site()?)
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to write option '{name}'"))?;

        Ok(())
    }

    async fn delete_option(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM wordpoints_options WHERE site_id = $1 AND name = $2")
            .bind(self.site()?)
            .bind(name)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete option '{name}'"))?;

        Ok(result.rows_affected() > 0)
    }

    async fn add_option(&self, name: &str, value: Value) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO wordpoints_options (site_id, name, value) VALUES ($1, $2, $3) \
             ON CONFLICT (site_id, name) DO NOTHING",
        )
        .bind(self.site()?)
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to add option '{name}'"))?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_network_option(&self, name: &str) -> Result<Option<Value>> {
        let value = sqlx::query_scalar::<_, Value>(
            "SELECT value FROM wordpoints_network_options WHERE network_id = $1 AND name = $2",
        )
        .bind(to_db(self.network_id)?)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to read network option '{name}'"))?;

        Ok(value)
    }

    async fn update_network_option(&self, name: &str, value: Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO wordpoints_network_options (network_id, name, value) VALUES ($1, $2, $3) \
             ON CONFLICT (network_id, name) DO UPDATE SET value = $3",
        )
        .bind(to_db(self.network_id)?)
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to write network option '{name}'"))?;

        Ok(())
    }

    async fn delete_network_option(&self, name: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM wordpoints_network_options WHERE network_id = $1 AND name = $2",
        )
        .bind(to_db(self.network_id)?)
        .bind(name)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to delete network option '{name}'"))?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl SiteRoster for PgHost {
    async fn is_multisite(&self) -> Result<bool> {
        Ok(self.multisite)
    }

    async fn current_site_id(&self) -> Result<SiteId> {
        Ok(*self.current_site.lock())
    }

    async fn current_network_id(&self) -> Result<NetworkId> {
        Ok(self.network_id)
    }

    async fn site_ids(&self) -> Result<Vec<SiteId>> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM wordpoints_sites WHERE network_id = $1 ORDER BY id",
        )
        .bind(to_db(self.network_id)?)
        .fetch_all(&self.pool)
        .await
        .context("failed to list sites")?;

        ids.into_iter()
            .map(|id| SiteId::try_from(id).context("negative site id"))
            .collect()
    }

    async fn network_of(&self, site: SiteId) -> Result<Option<NetworkId>> {
        let network = sqlx::query_scalar::<_, i64>(
            "SELECT network_id FROM wordpoints_sites WHERE id = $1",
        )
        .bind(to_db(site)?)
        .fetch_optional(&self.pool)
        .await
        .context("failed to look up site")?;

        network
            .map(|id| NetworkId::try_from(id).context("negative network id"))
            .transpose()
    }

    async fn switch_to_site(&self, site: SiteId) -> Result<()> {
        if self.network_of(site).await?.is_none() {
            bail!("cannot switch to site {site}: no such site");
        }
        let mut current = self.current_site.lock();
        self.switched.lock().push(*current);
        *current = site;
        Ok(())
    }

    async fn restore_current_site(&self) -> Result<()> {
        let previous = self.switched.lock().pop();
        match previous {
            Some(site) => {
                *self.current_site.lock() = site;
                Ok(())
            }
            None => bail!("restore_current_site called without a matching switch"),
        }
    }
}

#[async_trait]
impl CapabilityStore for PgHost {
    async fn add_custom_caps(&self, caps: &BTreeMap<String, String>) -> Result<()> {
        let site = self.site()?;
        let mut tx = self.pool.begin().await?;

        for (custom, core) in caps {
            sqlx::query(
                "INSERT INTO wordpoints_role_caps (site_id, role, capability) \
                 SELECT site_id, role, $3 FROM wordpoints_role_caps \
                 WHERE site_id = $1 AND capability = $2 \
                 ON CONFLICT DO NOTHING",
            )
            .bind(site)
            .bind(core)
            .bind(custom)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to grant capability '{custom}'"))?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn remove_custom_caps(&self, caps: &[String]) -> Result<()> {
        sqlx::query("DELETE FROM wordpoints_role_caps WHERE site_id = $1 AND capability = ANY($2)")
            .bind(self.site()?)
            .bind(caps)
            .execute(&self.pool)
            .await
            .context("failed to remove capabilities")?;

        Ok(())
    }
}

#[async_trait]
impl SchemaExecutor for PgHost {
    async fn table_prefix(&self, per_site: bool) -> Result<String> {
        if per_site {
            Ok(self.prefix_for(*self.current_site.lock()))
        } else {
            Ok(self.table_prefix.clone())
        }
    }

    async fn create_table(&self, name: &str, body: &str) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
            checked_table_name(name)?,
            body
        );

        sqlx::raw_sql(&sql)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to create table '{name}'"))?;

        Ok(())
    }

    async fn drop_table(&self, name: &str) -> Result<()> {
        let sql = format!("DROP TABLE IF EXISTS {}", checked_table_name(name)?);

        sqlx::raw_sql(&sql)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to drop table '{name}'"))?;

        Ok(())
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        let result = sqlx::raw_sql(sql)
            .execute(&self.pool)
            .await
            .context("failed to execute statement")?;

        Ok(result.rows_affected())
    }

    async fn charset(&self) -> Result<Option<Charset>> {
        // Encoding is fixed per database in PostgreSQL; tables can't be converted.
        Ok(None)
    }
}
