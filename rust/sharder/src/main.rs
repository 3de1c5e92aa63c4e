//! Sharder
//!
//! This binary runs both halves of the shard orchestrator. Started normally
//! it is the coordinator; started by the coordinator with `SHARDER_ROLE=worker`
//! it is a worker hosting one cluster's shards.
//!
//! # Usage
//!
//! ```bash
//! # Resolve the shard count from the upstream service
//! SHARDER_TOKEN=... sharder
//!
//! # Fixed topology using the built-in idle client
//! sharder --shards 16 --clusters 4
//!
//! # Start with configuration file
//! sharder --config sharder.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sharding_core::{IdleClient, Role, ShardClient, ShardCount, ShardingConfig, ShardingError};

/// Multi-process shard orchestrator
#[derive(Parser, Debug)]
#[command(name = "sharder")]
#[command(about = "Spawns and supervises worker processes hosting shard ranges")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Worker program (defaults to this executable)
    #[arg(long)]
    path: Option<PathBuf>,

    /// Total shard count, or "auto" to ask the upstream service
    #[arg(long)]
    shards: Option<ShardCount>,

    /// Number of worker processes (defaults to the CPU count)
    #[arg(long)]
    clusters: Option<u32>,

    /// Guild density used to scale the upstream recommendation
    #[arg(long)]
    guilds_per_shard: Option<u32>,

    /// Local IPC socket path
    #[arg(long)]
    ipc_socket: Option<PathBuf>,

    /// Forward worker debug events
    #[arg(long)]
    development: bool,

    /// Respawn crashed workers (true or false)
    #[arg(long)]
    respawn: Option<bool>,

    /// JSON object handed to every worker's client
    #[arg(long)]
    client_options: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(args: &Args) -> sharding_core::Result<ShardingConfig> {
    let mut config = match &args.config {
        Some(path) => ShardingConfig::from_file(path)?,
        None => ShardingConfig::default(),
    }
    .with_env_overrides();

    if let Some(path) = &args.path {
        config.path = path.clone();
    } else if config.path.as_os_str().is_empty() {
        config.path = std::env::current_exe().map_err(|e| {
            ShardingError::io_with_source("<current_exe>", "failed to locate own executable", e)
        })?;
    }
    if let Some(shards) = args.shards {
        config.shard_count = shards;
    }
    if let Some(clusters) = args.clusters {
        config.cluster_count = Some(clusters);
    }
    if let Some(gps) = args.guilds_per_shard {
        config.guilds_per_shard = gps;
    }
    if let Some(socket) = &args.ipc_socket {
        config.ipc_socket = Some(socket.clone());
    }
    if args.development {
        config.development = true;
    }
    if args.respawn.is_some() {
        config.respawn = args.respawn;
    }
    if let Some(raw) = &args.client_options {
        config.client_options = serde_json::from_str(raw)
            .map_err(|e| ShardingError::config_with_source("invalid --client-options", e))?;
    }

    config.validate()?;

    tracing::info!("Starting sharder coordinator");
    tracing::info!("  Worker program: {}", config.path.display());
    tracing::info!("  Shards: {}", config.shard_count);
    tracing::info!("  Clusters: {}", config.resolved_cluster_count());
    tracing::info!("  IPC socket: {}", config.resolved_ipc_socket().display());
    tracing::info!("  Development: {}", config.development);
    tracing::info!("  Respawn: {}", config.respawn_enabled());

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let role = Role::from_env()?;

    sharding_core::entry::run(
        role,
        || load_config(&args),
        |_| Arc::new(IdleClient::new()) as Arc<dyn ShardClient>,
    )
    .await?;

    tracing::info!("Sharder stopped");
    Ok(())
}
