//! WordPoints installer
//!
//! Installs, updates and uninstalls components against a host.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use wordpoints_kernel::cli;
use wordpoints_kernel::config::Config;
use wordpoints_kernel::host::NetworkId;

#[derive(Parser, Debug)]
#[command(name = "wordpoints", version, about = "WordPoints component installer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a fresh host or bootstrap the database schema
    Init {
        /// Create a multisite host (in-memory backend only)
        #[arg(long)]
        multisite: bool,
    },

    /// Manage sites on a multisite host
    Site {
        #[command(subcommand)]
        command: SiteCommand,
    },

    /// Install a component
    Install {
        component: String,

        /// Install on every site of the network
        #[arg(long)]
        network_wide: bool,
    },

    /// Run pending updates for a component
    Update {
        component: String,

        /// Update the network-wide install
        #[arg(long)]
        network_wide: bool,
    },

    /// Uninstall a component everywhere it is installed
    Uninstall { component: String },

    /// Show install state of a component
    Status { component: String },
}

#[derive(Subcommand, Debug)]
enum SiteCommand {
    /// Create a site
    Create {
        #[arg(long, default_value_t = 1)]
        network: NetworkId,
    },

    /// List sites on the current network
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    init_tracing();

    let config = Config::from_env().context("failed to load configuration")?;
    debug!(
        postgres = config.database_url.is_some(),
        state = %config.state_path.display(),
        "configuration loaded"
    );

    let args = Cli::parse();
    match args.command {
        Command::Init { multisite } => cli::cmd_init(&config, multisite).await,
        Command::Site { command } => match command {
            SiteCommand::Create { network } => cli::cmd_site_create(&config, network).await,
            SiteCommand::List => cli::cmd_site_list(&config).await,
        },
        Command::Install {
            component,
            network_wide,
        } => cli::cmd_install(&config, &component, network_wide).await,
        Command::Update {
            component,
            network_wide,
        } => cli::cmd_update(&config, &component, network_wide).await,
        Command::Uninstall { component } => cli::cmd_uninstall(&config, &component).await,
        Command::Status { component } => cli::cmd_status(&config, &component).await,
    }
}

/// Initialize the tracing subscriber.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
