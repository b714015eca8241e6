//! CLI command implementations.
//!
//! Each command opens the configured backend, runs against a [`Host`] and,
//! for the in-memory backend, writes the state file back afterwards.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::config::Config;
use crate::db;
use crate::host::{Host, MemoryHost, NetworkId, PgHost, PgHostSettings, SiteId};
use crate::installable::{EngineOptions, RunReport, UnInstaller};
use crate::points;

/// Components this binary knows how to install.
pub const COMPONENTS: &[&str] = &[points::SLUG];

/// Where host state lives.
pub enum Backend {
    Memory { host: Arc<MemoryHost>, path: PathBuf },
    Postgres(Arc<PgHost>),
}

impl Backend {
    /// Open the backend selected by `config`.
    pub async fn open(config: &Config) -> Result<Self> {
        match &config.database_url {
            Some(url) => Self::postgres(config, url).await,
            None => {
                let path = &config.state_path;
                if !path.exists() {
                    bail!(
                        "no host state at {}. Run `wordpoints init` first",
                        path.display()
                    );
                }
                let host = MemoryHost::load(path)?;
                Ok(Self::Memory {
                    host: Arc::new(host),
                    path: path.clone(),
                })
            }
        }
    }

    async fn postgres(config: &Config, url: &str) -> Result<Self> {
        let pool = db::create_pool(url, config.database_max_connections).await?;
        let host = PgHost::new(
            pool,
            PgHostSettings {
                multisite: config.multisite,
                network_id: config.network_id,
                site_id: config.site_id,
                table_prefix: config.table_prefix.clone(),
            },
        );
        Ok(Self::Postgres(Arc::new(host)))
    }

    pub fn host(&self) -> Host {
        match self {
            Self::Memory { host, .. } => Host::from_shared(host.clone()),
            Self::Postgres(host) => Host::from_shared(host.clone()),
        }
    }

    /// Save in-memory state. A no-op for Postgres.
    pub fn persist(&self) -> Result<()> {
        match self {
            Self::Memory { host, path } => host.save(path),
            Self::Postgres(_) => Ok(()),
        }
    }

    pub async fn create_site(&self, network: NetworkId) -> Result<SiteId> {
        match self {
            Self::Memory { host, .. } => Ok(host.create_site(network)),
            Self::Postgres(host) => host.create_site(network).await,
        }
    }
}

/// Build the un-installer for a named component.
pub fn component(name: &str, host: Host, config: &Config) -> Result<UnInstaller> {
    let options = EngineOptions {
        large_network_threshold: config.large_network_threshold,
    };

    match name {
        points::SLUG => Ok(points::un_installer(host, options)?),
        other => bail!(
            "unknown component '{other}'. Available: {}",
            COMPONENTS.join(", ")
        ),
    }
}

fn print_report(action: &str, name: &str, report: &RunReport) {
    if report.up_to_date {
        println!("Component '{name}' is up to date.");
        return;
    }

    println!("{action} component '{name}': {} step(s)", report.steps.len());
    for step in &report.steps {
        let site = step.site.map(|s| format!(" site {s}")).unwrap_or_default();
        println!("  [{}] {}{}: {}", step.stage, step.context, site, step.routine);
    }
    if report.sites_skipped {
        println!("  Per-site routines were skipped: the network is too large.");
    }
}

/// Create a fresh host (memory) or bootstrap the schema (Postgres).
pub async fn cmd_init(config: &Config, multisite: bool) -> Result<()> {
    match &config.database_url {
        Some(url) => {
            let Backend::Postgres(host) = Backend::postgres(config, url).await? else {
                bail!("expected a Postgres backend");
            };
            host.ensure_schema().await?;
            println!("Postgres host schema ready.");
        }
        None => {
            let path: &Path = &config.state_path;
            if path.exists() {
                warn!(path = %path.display(), "overwriting existing host state");
            }
            let host = if multisite {
                MemoryHost::multisite()
            } else {
                MemoryHost::single_site()
            };
            host.save(path)?;
            println!(
                "Initialized {} host at {}",
                if multisite { "multisite" } else { "single-site" },
                path.display()
            );
        }
    }
    Ok(())
}

/// Create a site and install network-installed components on it.
pub async fn cmd_site_create(config: &Config, network: NetworkId) -> Result<()> {
    let backend = Backend::open(config).await?;
    let host = backend.host();
    if !host.sites.is_multisite().await? {
        bail!("sites can only be created on a multisite host");
    }

    let site = backend.create_site(network).await?;
    println!("Created site {site} on network {network}.");

    let mut failed = None;
    for name in COMPONENTS {
        let installer = component(name, host.clone(), config)?;
        match installer.install_on_site(site).await {
            Ok(report) if !report.steps.is_empty() => print_report("Installed", name, &report),
            Ok(_) => {}
            Err(error) => {
                warn!(component = %name, site, error = %error, "install on new site failed");
                failed = Some(error);
            }
        }
    }

    backend.persist()?;
    match failed {
        Some(error) => Err(error.into()),
        None => Ok(()),
    }
}

/// List sites on the current network.
pub async fn cmd_site_list(config: &Config) -> Result<()> {
    let backend = Backend::open(config).await?;
    let host = backend.host();

    let current = host.sites.current_site_id().await?;
    let network = host.sites.current_network_id().await?;

    println!("{:<8} {:<10}", "SITE", "NETWORK");
    println!("{}", "-".repeat(19));
    for site in host.sites.site_ids().await? {
        let marker = if site == current { " (current)" } else { "" };
        println!("{site:<8} {network:<10}{marker}");
    }
    Ok(())
}

/// Install a component.
pub async fn cmd_install(config: &Config, name: &str, network_wide: bool) -> Result<()> {
    let backend = Backend::open(config).await?;
    let installer = component(name, backend.host(), config)?;

    if installer
        .entity()
        .db_version(network_wide)
        .await?
        .is_some()
    {
        bail!("component '{name}' is already installed; use `wordpoints update {name}`");
    }

    let result = installer.install(network_wide).await;
    backend.persist()?;

    let report = result.with_context(|| format!("failed to install component '{name}'"))?;
    info!(component = name, "install complete");
    print_report("Installed", name, &report);
    Ok(())
}

/// Update a component to its code version.
pub async fn cmd_update(config: &Config, name: &str, network_wide: bool) -> Result<()> {
    let backend = Backend::open(config).await?;
    let installer = component(name, backend.host(), config)?;

    let result = installer.update(network_wide).await;
    backend.persist()?;

    let report = result.with_context(|| format!("failed to update component '{name}'"))?;
    print_report("Updated", name, &report);
    Ok(())
}

/// Uninstall a component everywhere it is installed.
pub async fn cmd_uninstall(config: &Config, name: &str) -> Result<()> {
    let backend = Backend::open(config).await?;
    let installer = component(name, backend.host(), config)?;

    let result = installer.uninstall().await;
    backend.persist()?;

    let report = result.with_context(|| format!("failed to uninstall component '{name}'"))?;
    print_report("Uninstalled", name, &report);
    Ok(())
}

/// Show install state of a component.
pub async fn cmd_status(config: &Config, name: &str) -> Result<()> {
    let backend = Backend::open(config).await?;
    let host = backend.host();
    let installer = component(name, host.clone(), config)?;
    let entity = installer.entity();

    let show = |version: Option<crate::installable::Version>| {
        version.map_or_else(|| "not installed".to_string(), |v| v.to_string())
    };

    println!("Component:        {name}");
    println!("Code version:     {}", entity.version());
    println!("Site version:     {}", show(entity.db_version(false).await?));

    if host.sites.is_multisite().await? {
        let network_installed = entity.is_network_installed().await?;
        println!("Network version:  {}", show(entity.db_version(true).await?));
        println!("Network-wide:     {}", if network_installed { "yes" } else { "no" });

        let sites: Vec<String> = entity
            .installed_site_ids()
            .await?
            .iter()
            .map(ToString::to_string)
            .collect();
        println!(
            "Installed sites:  {}",
            if sites.is_empty() { "none".to_string() } else { sites.join(", ") }
        );

        if entity.is_network_install_skipped().await? {
            println!("Per-site install was skipped (large network).");
        }
        if entity.is_network_update_skipped().await? {
            match entity.network_update_skipped().await? {
                Some(version) => println!(
                    "Per-site update was skipped from version {version} (large network)."
                ),
                None => println!("Per-site update was skipped (large network)."),
            }
        }
    }

    Ok(())
}
