use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use stem_chain::api;
use stem_chain::config::NodeConfig;
use stem_chain::crypto::NodeKey;
use stem_chain::node::Node;

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Subchain node committing stem checkpoints to a parent chain"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node and its RPC server
    Run {
        #[arg(short, long, default_value = "config/node.toml")]
        config: PathBuf,
        /// Override the configured relay checkpoint interval
        #[arg(long)]
        relay_interval: Option<u64>,
        /// Override the configured RPC listen address
        #[arg(long)]
        rpc_listen: Option<SocketAddr>,
    },
    /// Write a fresh configuration and node key for a new subchain member
    Init {
        #[arg(short, long, default_value = "config/node.toml")]
        config: PathBuf,
        /// Chain identifier recorded in the genesis section
        #[arg(long, default_value = "stem-local")]
        chain_id: String,
        /// Blocks between parent-chain relay checkpoints
        #[arg(long)]
        relay_interval: Option<u64>,
        /// Verifier address seeding the BFT roster; repeat for more
        #[arg(long = "verifier")]
        verifiers: Vec<String>,
    },
    /// Print the address of the node key, generating the key if absent
    Address {
        #[arg(short, long, default_value = "keys/node.toml")]
        key: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match Cli::parse().command {
        Commands::Run {
            config,
            relay_interval,
            rpc_listen,
        } => run(config, relay_interval, rpc_listen).await,
        Commands::Init {
            config,
            chain_id,
            relay_interval,
            verifiers,
        } => init(config, chain_id, relay_interval, verifiers),
        Commands::Address { key } => show_address(key),
    }
}

async fn run(
    config_path: PathBuf,
    relay_interval: Option<u64>,
    rpc_listen: Option<SocketAddr>,
) -> Result<()> {
    if !config_path.exists() {
        bail!(
            "no configuration at {}; run `stem-chain init` first",
            config_path.display()
        );
    }
    let mut config = NodeConfig::load(&config_path)?;
    if let Some(interval) = relay_interval {
        config.relay_interval = interval;
    }
    if let Some(addr) = rpc_listen {
        config.rpc_listen = addr;
    }
    // the relay interval is fixed for the life of the process
    if config.relay_interval == 0 {
        bail!("relay interval must be positive");
    }

    let rpc_addr = config.rpc_listen;
    let node = Node::new(config)?;
    let handle = node.handle();
    let api_task = tokio::spawn(async move { api::serve(handle, rpc_addr).await });

    tokio::select! {
        res = node.start() => res?,
        res = api_task => res??,
        _ = signal::ctrl_c() => info!("shutdown signal received"),
    }
    Ok(())
}

fn init(
    config_path: PathBuf,
    chain_id: String,
    relay_interval: Option<u64>,
    verifiers: Vec<String>,
) -> Result<()> {
    if config_path.exists() {
        bail!("refusing to overwrite {}", config_path.display());
    }
    let mut config = NodeConfig::default();
    config.genesis.chain_id = chain_id;
    config.genesis.verifiers = verifiers;
    if let Some(interval) = relay_interval {
        if interval == 0 {
            bail!("relay interval must be positive");
        }
        config.relay_interval = interval;
    }
    config.ensure_directories()?;
    let key = NodeKey::load_or_generate(&config.key_path)?;
    config.save(&config_path)?;
    info!(
        path = %config_path.display(),
        address = %key.address(),
        relay_interval = config.relay_interval,
        "wrote node configuration"
    );
    Ok(())
}

fn show_address(key_path: PathBuf) -> Result<()> {
    let key = NodeKey::load_or_generate(&key_path)?;
    println!("{}", key.address());
    Ok(())
}
