//! The per-worker shard client seam.
//!
//! A [`ShardClient`] holds the live upstream connections for every shard a
//! worker hosts. The sharding layer only logs it in, reads values from it,
//! hands it expressions and shuts it down.

use std::time::Instant;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::error::Result;
use crate::ipc::ShardEventSink;
use crate::partition::ShardId;
use crate::role::WorkerContext;

/// Client running inside a worker process.
///
/// `value` and `eval` report failures as plain messages; they travel back
/// to the manager as eval errors and never take the worker down.
#[async_trait]
pub trait ShardClient: Send + Sync {
    /// Connect every shard in `ctx.shards`. Resolves once all of them are
    /// usable; an error aborts the worker.
    async fn login(&self, ctx: &WorkerContext, events: ShardEventSink) -> Result<()>;

    /// Read a property of one hosted shard.
    async fn value(&self, shard_id: ShardId, path: &str) -> std::result::Result<Value, String>;

    async fn eval(&self, expression: &str) -> std::result::Result<Value, String>;

    async fn shutdown(&self);
}

struct IdleState {
    ctx: WorkerContext,
    logged_in_at: Instant,
}

/// Client that holds no upstream connection.
///
/// It reports every shard as ready immediately and answers a small fixed
/// set of properties, which is enough to exercise a full topology.
#[derive(Default)]
pub struct IdleClient {
    state: RwLock<Option<IdleState>>,
}

impl IdleClient {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ShardClient for IdleClient {
    async fn login(&self, ctx: &WorkerContext, events: ShardEventSink) -> Result<()> {
        for shard_id in ctx.shards.iter() {
            events.debug(format!("shard {} idle login", shard_id));
            events.shard_ready(shard_id);
        }
        *self.state.write().await = Some(IdleState {
            ctx: ctx.clone(),
            logged_in_at: Instant::now(),
        });
        Ok(())
    }

    async fn value(&self, shard_id: ShardId, path: &str) -> std::result::Result<Value, String> {
        let guard = self.state.read().await;
        let state = guard.as_ref().ok_or("client is not logged in")?;
        if !state.ctx.shards.contains(shard_id) {
            return Err(format!("shard {} is not hosted here", shard_id));
        }

        match path {
            "id" | "shard_id" => Ok(json!(shard_id)),
            "cluster_id" => Ok(json!(state.ctx.cluster_id)),
            "shard_count" => Ok(json!(state.ctx.shard_count)),
            "uptime" => Ok(json!(state.logged_in_at.elapsed().as_millis() as u64)),
            "pid" => Ok(json!(std::process::id())),
            other => match other.strip_prefix("options.") {
                Some(key) => state
                    .ctx
                    .client_options
                    .get(key)
                    .cloned()
                    .ok_or_else(|| format!("no client option '{}'", key)),
                None => Err(format!("unknown property '{}'", other)),
            },
        }
    }

    async fn eval(&self, expression: &str) -> std::result::Result<Value, String> {
        let guard = self.state.read().await;
        let state = guard.as_ref().ok_or("client is not logged in")?;

        match expression.trim() {
            "ping" => Ok(json!("pong")),
            "shards" => Ok(json!(state.ctx.shards.iter().collect::<Vec<_>>())),
            "uptime" => Ok(json!(state.logged_in_at.elapsed().as_millis() as u64)),
            "pid" => Ok(json!(std::process::id())),
            other => Err(format!("unsupported expression '{}'", other)),
        }
    }

    async fn shutdown(&self) {
        self.state.write().await.take();
    }
}
