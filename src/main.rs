use anyhow::{Context, Result};
use clap::Parser;
use lightnode::{FileStore, LightNode, NodeConfig, PeerAddress, WireBlockDecoder};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "lightnode", version, about = "Minimal Bitcoin header and UTXO node")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seed peer host, overriding the config file
    #[arg(long)]
    seed: Option<String>,

    /// Seed peer port, overriding the config file
    #[arg(long)]
    port: Option<u16>,
}

async fn resolve_seed(host: &str, port: u16) -> Result<PeerAddress> {
    tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("couldn't resolve seed {}", host))?
        .next()
        .map(PeerAddress::from)
        .with_context(|| format!("seed {} resolved to no addresses", host))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(seed) = cli.seed {
        config.network.seed = seed;
    }
    if let Some(port) = cli.port {
        config.network.port = port;
    }

    let store = FileStore::open(&config.storage.path)
        .with_context(|| format!("couldn't open store at {}", config.storage.path.display()))?;
    let seed = resolve_seed(&config.network.seed, config.network.port).await?;
    let node = LightNode::new(config, Arc::new(store), Arc::new(WireBlockDecoder));

    tokio::select! {
        result = node.run(seed) => result.context("node stopped")?,
        _ = signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}
