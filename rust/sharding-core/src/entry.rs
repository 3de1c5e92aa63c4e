//! Process entry point shared by the coordinator and its workers.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;

use crate::client::ShardClient;
use crate::config::ShardingConfig;
use crate::error::{Result, ShardingError};
use crate::events::ShardingEvent;
use crate::ipc::worker;
use crate::manager::ShardingManager;
use crate::role::{Role, WorkerContext};

/// Run this process in its role until it is told to stop.
///
/// `load_config` is only called for the coordinator; `make_client` only
/// for a worker.
pub async fn run<L, M>(role: Role, load_config: L, make_client: M) -> Result<()>
where
    L: FnOnce() -> Result<ShardingConfig>,
    M: FnOnce(&WorkerContext) -> Arc<dyn ShardClient>,
{
    match role {
        Role::Coordinator => run_coordinator(load_config()?).await,
        Role::Worker(ctx) => {
            tracing::info!(
                cluster_id = ctx.cluster_id,
                shards = %ctx.shards,
                development = ctx.development,
                "Starting worker"
            );
            let client = make_client(&ctx);
            worker::run(ctx, client).await
        }
    }
}

async fn run_coordinator(config: ShardingConfig) -> Result<()> {
    let manager = ShardingManager::new(config)?;
    let mut events = manager.subscribe();

    let logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event logger fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    if let Err(e) = manager.spawn().await {
        manager.shutdown().await;
        logger.abort();
        return Err(e);
    }

    let result = tokio::signal::ctrl_c()
        .await
        .map_err(|e| ShardingError::io_with_source("<signal>", "failed to listen for ctrl-c", e));
    tracing::info!("Received shutdown signal");

    manager.shutdown().await;
    logger.abort();
    result
}

fn log_event(event: &ShardingEvent) {
    match event {
        // Already logged by the bus
        ShardingEvent::Debug(_) | ShardingEvent::Error { .. } => {}
        ShardingEvent::Message {
            cluster_id,
            payload,
        } => tracing::info!(cluster_id, %payload, "Worker message"),
        ShardingEvent::Spawn(cluster_id) => tracing::info!(cluster_id, "Cluster spawned"),
        ShardingEvent::Ready(info) => {
            tracing::info!(cluster_id = info.id, shards = %info.shards, "Cluster ready")
        }
        ShardingEvent::ShardReady(shard_id) => tracing::info!(shard_id, "Shard ready"),
        ShardingEvent::ShardReconnect(shard_id) => tracing::info!(shard_id, "Shard reconnecting"),
        ShardingEvent::ShardResumed { replayed, shard_id } => {
            tracing::info!(shard_id, replayed, "Shard resumed")
        }
        ShardingEvent::ShardDisconnect {
            close_event,
            shard_id,
        } => tracing::warn!(
            shard_id,
            code = close_event.code,
            reason = %close_event.reason,
            "Shard disconnected"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::IdleClient;

    #[tokio::test]
    async fn test_coordinator_with_invalid_config() {
        let result = run(
            Role::Coordinator,
            || Ok(ShardingConfig::default()),
            |_| Arc::new(IdleClient::new()) as Arc<dyn ShardClient>,
        )
        .await;
        assert!(matches!(result, Err(ShardingError::Config { .. })));
    }

    #[tokio::test]
    async fn test_worker_does_not_load_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ShardingConfig::new("worker");
        config.ipc_socket = Some(dir.path().join("missing.sock"));
        let ctx = WorkerContext::new(&config, 0, crate::partition::ShardRange::new(0, 1), 1);

        let result = run(
            Role::Worker(ctx),
            || panic!("workers must not load coordinator config"),
            |_| Arc::new(IdleClient::new()) as Arc<dyn ShardClient>,
        )
        .await;

        // Nobody is listening on the socket
        assert!(result.is_err());
    }
}
