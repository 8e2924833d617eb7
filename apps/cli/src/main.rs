//! Discovery P2P CLI
//!
//! Command-line interface for creating a node configuration and bringing
//! the node up.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use discovery_daemon::{termination_signals, BroadcastMode, NodeConfig, NodeService};
use discovery_settings::{default_config_path, Config};

/// Discovery P2P - static-membership peer-to-peer node
#[derive(Parser)]
#[command(name = "discovery-p2p")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the config file (default: ./<interface-name>.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the node configuration file
    #[command(alias = "i")]
    Init {
        /// Name of the interface, also the default config file name
        interface_name: String,
    },

    /// Bring the node up and run until interrupted
    Up {
        /// Name of the interface to bring up
        interface_name: String,

        /// Publish a message every second instead of receiving
        #[arg(short, long = "pub")]
        publish: bool,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "info,discovery=debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Init { interface_name } => {
            let path = config_path(cli.config, &interface_name);
            init(&interface_name, &path)?;
        }
        Commands::Up {
            interface_name,
            publish,
        } => {
            let path = config_path(cli.config, &interface_name);
            let mode = if publish {
                BroadcastMode::Publish
            } else {
                BroadcastMode::Receive
            };
            up(&path, mode).await?;
        }
    }

    Ok(())
}

fn config_path(flag: Option<PathBuf>, interface_name: &str) -> PathBuf {
    flag.unwrap_or_else(|| default_config_path(interface_name))
}

fn init(interface_name: &str, path: &Path) -> Result<()> {
    let config = Config::generate(interface_name).context("Failed to generate node identity")?;
    config
        .write(path)
        .with_context(|| format!("Failed to write config to {}", path.display()))?;

    println!("Initialized new config at {}", path.display());
    println!("To edit the config run,");
    println!();
    println!("    {}", edit_hint(path));
    println!();
    Ok(())
}

/// Editor command for a config path; system paths need root
fn edit_hint(path: &Path) -> String {
    if path.starts_with("/etc") {
        format!("sudo vi {}", path.display())
    } else {
        format!("vi {}", path.display())
    }
}

async fn up(path: &Path, mode: BroadcastMode) -> Result<()> {
    let config = Config::read(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let node_config = NodeConfig::from_settings(&config, mode)?;

    info!(
        "Bringing up {} with {} peers in {:?} mode",
        node_config.name,
        node_config.peers.len(),
        mode
    );
    let node = NodeService::start(node_config)
        .await
        .context("Failed to bring node up")?;
    info!("Node {} listening on port {}", node.local_peer_id(), node.port());

    let signals = termination_signals().context("Failed to install signal handlers")?;
    node.run_until_shutdown(signals).await?;
    Ok(())
}
