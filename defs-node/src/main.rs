//! DEFS Storage Node Daemon
//!
//! Runs a storage node that:
//! - Accepts shards from peers on `/defs/slice/upload/1.0.0`
//! - Exchanges peers on `/defs/handshake/1.0.0`
//! - Applies owner-signed delete requests received over pubsub
//! - Reports metrics via a Prometheus endpoint

use anyhow::Context;
use clap::{Parser, Subcommand};
use defs_core::crypto::FILE_KEY_SIZE;
use defs_core::ErasureConfig;
use defs_network::Host;
use defs_node::{init_metrics, install_exporter, AppContext, NodeConfig};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "defs-node")]
#[command(about = "DEFS storage node daemon")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "defs.toml")]
    config: PathBuf,

    /// Node root directory (overrides config file)
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Protocol listen address (overrides config file)
    #[arg(short, long)]
    listen: Option<String>,

    /// Bootstrap peer as `node_id@host:port`, repeatable
    #[arg(short, long)]
    bootstrap: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node until Ctrl+C (default)
    Run,

    /// Shard a file and place its shards on peers
    Upload {
        /// File to upload
        file: PathBuf,

        /// Data shards (requires --parity)
        #[arg(long, requires = "parity")]
        data: Option<usize>,

        /// Parity shards (requires --data)
        #[arg(long, requires = "data")]
        parity: Option<usize>,
    },

    /// Rebuild a file from the shards held by this node
    Download {
        /// File id
        file_id: String,

        /// Hex file key printed by `upload`
        #[arg(short, long)]
        key: String,
    },

    /// Broadcast an owner-signed delete of a file
    Delete {
        /// File id
        file_id: String,
    },
}

fn init_tracing(verbose: bool, json: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn parse_file_key(hex_key: &str) -> anyhow::Result<[u8; FILE_KEY_SIZE]> {
    let bytes = hex::decode(hex_key.trim()).context("file key is not hex")?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| anyhow::anyhow!("file key must be {} bytes, got {}", FILE_KEY_SIZE, b.len()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    info!("DEFS Storage Node starting...");

    // Priority: CLI args > environment > config file > defaults
    let config = NodeConfig::load_or_default(&cli.config)
        .with_env_overrides()
        .with_overrides(cli.root, cli.listen, cli.bootstrap);
    config.validate().context("invalid configuration")?;

    if config.metrics.enabled {
        install_exporter(config.metrics.socket_addr()?)?;
        init_metrics();
    }

    let mut ctx = AppContext::build(config)
        .await
        .context("failed to build node")?;
    ctx.start().await?;

    let connected = ctx.bootstrap().await?;
    if connected == 0 && !ctx.config.network.bootstrap_peers.is_empty() {
        error!("No bootstrap peer answered, continuing alone");
    }
    ctx.refresh_storage_metrics();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&ctx).await,
        Commands::Upload { file, data, parity } => {
            let erasure = match (data, parity) {
                (Some(k), Some(m)) => Some(ErasureConfig::new(k, m)?),
                _ => None,
            };
            let uploaded = ctx.upload_file(&file, erasure).await?;
            // Let the dispatcher finish placing shards before exiting
            ctx.events.wait_async().await;
            println!("file_id: {}", uploaded.file_id);
            println!("key:     {}", hex::encode(uploaded.key));
            println!(
                "shards:  {} data + {} parity, {} batch(es)",
                uploaded.params.erasure.data_shards,
                uploaded.params.erasure.parity_shards,
                uploaded.batches
            );
            for failed in &uploaded.failed {
                error!(index = failed.index, error = %failed.error, "Shard not stored");
            }
        }
        Commands::Download { file_id, key } => {
            let key = parse_file_key(&key)?;
            let path = ctx.download_file(&file_id, key).await?;
            println!("{}", path.display());
        }
        Commands::Delete { file_id } => {
            let outcome = ctx.delete_file(&file_id).await?;
            println!(
                "deleted {} of {} local shards",
                outcome.deleted, outcome.listed
            );
        }
    }

    ctx.shutdown().await;
    Ok(())
}

async fn run(ctx: &AppContext) {
    info!("========================================");
    info!("  DEFS Storage Node Running");
    info!("========================================");
    info!("  Node ID:     {}", ctx.node_id);
    info!("  Listen:      {:?}", ctx.host.listen_addrs());
    info!("  Root:        {}", ctx.config.storage.root.display());
    info!("  Gossip:      {}", if ctx.gossip_enabled() { "on" } else { "off" });
    if ctx.config.metrics.enabled {
        info!("  Metrics:     http://{}/metrics", ctx.config.metrics.addr);
    }
    info!("========================================");
    info!("Press Ctrl+C to shut down");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Received shutdown signal");
}
