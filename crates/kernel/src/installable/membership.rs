//! Which sites of a network an entity is installed on.

use anyhow::Context as _;
use serde_json::Value;
use tracing::debug;

use super::SiteId;
use super::entity::{EntityKind, Installable};
use super::error::{InstallError, InstallResult};

impl Installable {
    /// Network option holding the ids of sites the entity is installed on.
    pub fn installed_sites_option(&self) -> String {
        if self.is_core() {
            return "wordpoints_installed_sites".to_string();
        }

        match self.kind() {
            EntityKind::Component => format!("wordpoints_{}_installed_sites", self.slug()),
            EntityKind::Module => format!("wordpoints_module_{}_installed_sites", self.slug()),
            EntityKind::Plugin => format!("wordpoints_plugin_{}_installed_sites", self.slug()),
        }
    }

    /// Sites the entity is installed on.
    ///
    /// When network-installed this is every site on the current network.
    /// Otherwise the stored list is validated against the roster; invalid
    /// entries are dropped silently.
    pub async fn installed_site_ids(&self) -> InstallResult<Vec<SiteId>> {
        if self.is_network_installed().await? {
            return Ok(self
                .host()
                .sites
                .site_ids()
                .await
                .context("failed to enumerate sites")?);
        }

        let stored = self
            .host()
            .options
            .get_network_option(&self.installed_sites_option())
            .await
            .context("failed to read installed sites")?;

        self.validate_site_ids(stored).await
    }

    /// Add a site to the stored list. Defaults to the current site.
    pub async fn add_installed_site_id(&self, site: Option<SiteId>) -> InstallResult<()> {
        if self.is_network_installed().await? {
            return Ok(());
        }

        let site = match site {
            Some(site) => site,
            None => self
                .host()
                .sites
                .current_site_id()
                .await
                .context("failed to read current site")?,
        };

        let network = self
            .host()
            .sites
            .current_network_id()
            .await
            .context("failed to read current network")?;
        let site_network = self
            .host()
            .sites
            .network_of(site)
            .await
            .context("failed to look up site")?;
        if site_network != Some(network) {
            return Err(InstallError::InvalidSiteId { site });
        }

        let mut sites = self.installed_site_ids().await?;
        if sites.contains(&site) {
            return Ok(());
        }
        sites.push(site);

        debug!(entity = %self, site, "recording installed site");
        self.host()
            .options
            .update_network_option(&self.installed_sites_option(), Value::from(sites))
            .await
            .context("failed to write installed sites")?;
        Ok(())
    }

    /// Forget every stored site.
    pub async fn delete_installed_site_ids(&self) -> InstallResult<()> {
        self.host()
            .options
            .delete_network_option(&self.installed_sites_option())
            .await
            .context("failed to delete installed sites")?;
        Ok(())
    }

    /// Keep integer ids of existing sites on the current network, in stored
    /// order, without duplicates.
    async fn validate_site_ids(&self, stored: Option<Value>) -> InstallResult<Vec<SiteId>> {
        let Some(Value::Array(entries)) = stored else {
            return Ok(Vec::new());
        };

        let network = self
            .host()
            .sites
            .current_network_id()
            .await
            .context("failed to read current network")?;

        let mut valid = Vec::with_capacity(entries.len());
        for site in entries.iter().filter_map(Value::as_u64) {
            if valid.contains(&site) {
                continue;
            }
            let site_network = self
                .host()
                .sites
                .network_of(site)
                .await
                .context("failed to look up site")?;
            if site_network == Some(network) {
                valid.push(site);
            }
        }

        Ok(valid)
    }
}
