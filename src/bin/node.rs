//! Node binary

use clap::{Parser, Subcommand};
use minisvc::common::{Config, PeerConfig};
use minisvc::Node;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "minisvc-node")]
#[command(about = "minisvc node: service mounts with leader-routed writes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a node
    Serve {
        /// Config file (TOML)
        #[arg(long, default_value = minisvc::common::config::DEFAULT_CONFIG_FILE)]
        config: PathBuf,

        /// Node ID
        #[arg(long)]
        id: Option<String>,

        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// State directory (in-memory when unset)
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Cluster members as id=url, repeatable
        #[arg(long = "peer", value_parser = parse_peer)]
        peers: Vec<PeerConfig>,

        /// Initial leader id
        #[arg(long)]
        leader: Option<String>,

        /// Periodic heal interval in seconds (0 disables)
        #[arg(long)]
        heal_interval: Option<u64>,
    },
}

fn parse_peer(value: &str) -> Result<PeerConfig, String> {
    let (id, url) = value
        .split_once('=')
        .ok_or_else(|| format!("expected id=url, got {}", value))?;
    if id.is_empty() || url.is_empty() {
        return Err(format!("expected id=url, got {}", value));
    }
    Ok(PeerConfig {
        id: id.to_string(),
        url: url.to_string(),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            id,
            bind,
            data_dir,
            peers,
            leader,
            heal_interval,
        } => {
            // File and environment first, CLI arguments have priority
            let mut config = Config::load_from(&config)?;
            if let Some(id) = id {
                config.node_id = id;
            }
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            if data_dir.is_some() {
                config.data_dir = data_dir;
            }
            if !peers.is_empty() {
                config.peers = peers;
            }
            if leader.is_some() {
                config.leader = leader;
            }
            if let Some(secs) = heal_interval {
                config.heal_interval_secs = secs;
            }

            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| config.log_level.clone().into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            let node = Node::from_config(config)?;
            node.serve().await?;
        }
    }

    Ok(())
}
