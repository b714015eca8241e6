//! Configuration loaded from environment variables.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::host::{NetworkId, SiteId};
use crate::installable::engine::DEFAULT_LARGE_NETWORK_THRESHOLD;

/// Installer configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL. When set, the Postgres host is used.
    pub database_url: Option<String>,

    /// Maximum database connections in pool (default: 5).
    pub database_max_connections: u32,

    /// JSON state file for the in-memory host (default: ./wordpoints-state.json).
    pub state_path: PathBuf,

    /// Whether the Postgres host is a multisite network (default: false).
    pub multisite: bool,

    /// Network the installer operates on (default: 1).
    pub network_id: NetworkId,

    /// Site the installer starts on (default: 1).
    pub site_id: SiteId,

    /// Base table prefix (default: wp_).
    pub table_prefix: String,

    /// Networks with more sites than this skip per-site routines (default: 10000).
    pub large_network_threshold: usize,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").ok().filter(|url| !url.is_empty());

        let database_max_connections = env::var("DATABASE_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .context("DATABASE_MAX_CONNECTIONS must be a valid u32")?;

        let state_path = env::var("WORDPOINTS_STATE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./wordpoints-state.json"));

        let multisite = env::var("WORDPOINTS_MULTISITE")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let network_id = env::var("WORDPOINTS_NETWORK_ID")
            .unwrap_or_else(|_| "1".to_string())
            .parse()
            .context("WORDPOINTS_NETWORK_ID must be a valid u64")?;

        let site_id = env::var("WORDPOINTS_SITE_ID")
            .unwrap_or_else(|_| "1".to_string())
            .parse()
            .context("WORDPOINTS_SITE_ID must be a valid u64")?;

        let table_prefix = env::var("WORDPOINTS_TABLE_PREFIX").unwrap_or_else(|_| "wp_".to_string());

        let large_network_threshold = env::var("WORDPOINTS_LARGE_NETWORK")
            .map(|v| v.parse())
            .unwrap_or(Ok(DEFAULT_LARGE_NETWORK_THRESHOLD))
            .context("WORDPOINTS_LARGE_NETWORK must be a valid usize")?;

        Ok(Self {
            database_url,
            database_max_connections,
            state_path,
            multisite,
            network_id,
            site_id,
            table_prefix,
            large_network_threshold,
        })
    }
}
