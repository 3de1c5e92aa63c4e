//! Manager event bus.
//!
//! Every lifecycle, debug and error notification produced by the manager,
//! its clusters, or forwarded from workers is published as a
//! [`ShardingEvent`] on one `tokio::sync::broadcast` channel.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::cluster::ClusterInfo;
use crate::partition::{ClusterId, ShardId};

/// Close frame reported when a shard's connection drops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseEvent {
    pub code: u16,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub was_clean: bool,
}

impl CloseEvent {
    /// Abnormal closure, used when the hosting process died.
    pub const ABNORMAL: u16 = 1006;

    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: Self::ABNORMAL,
            reason: reason.into(),
            was_clean: false,
        }
    }
}

/// Event published to manager subscribers.
#[derive(Debug, Clone)]
pub enum ShardingEvent {
    Debug(String),
    Error {
        cluster_id: Option<ClusterId>,
        message: String,
    },
    /// Free-form payload sent by a worker.
    Message {
        cluster_id: ClusterId,
        payload: serde_json::Value,
    },
    /// A worker process was launched.
    Spawn(ClusterId),
    /// A worker signalled readiness.
    Ready(ClusterInfo),
    ShardReady(ShardId),
    ShardReconnect(ShardId),
    ShardResumed {
        replayed: u64,
        shard_id: ShardId,
    },
    ShardDisconnect {
        close_event: CloseEvent,
        shard_id: ShardId,
    },
}

impl ShardingEvent {
    /// Short name, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Debug(_) => "debug",
            Self::Error { .. } => "error",
            Self::Message { .. } => "message",
            Self::Spawn(_) => "spawn",
            Self::Ready(_) => "ready",
            Self::ShardReady(_) => "shardReady",
            Self::ShardReconnect(_) => "shardReconnect",
            Self::ShardResumed { .. } => "shardResume",
            Self::ShardDisconnect { .. } => "shardDisconnect",
        }
    }
}

/// Cloneable handle to the broadcast channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ShardingEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: ShardingEvent) {
        match &event {
            ShardingEvent::Debug(message) => tracing::debug!("{}", message),
            ShardingEvent::Error {
                cluster_id,
                message,
            } => tracing::error!(?cluster_id, "{}", message),
            other => tracing::trace!(event = other.name(), "Emitting event"),
        }
        let _ = self.tx.send(event);
    }

    /// Convenience for [`ShardingEvent::Debug`].
    pub fn debug(&self, message: impl Into<String>) {
        self.emit(ShardingEvent::Debug(message.into()));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShardingEvent> {
        self.tx.subscribe()
    }

    /// Subscribe as a `Stream`. Lagged receivers observe a
    /// `BroadcastStreamRecvError` item instead of silently skipping.
    pub fn event_stream(&self) -> BroadcastStream<ShardingEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
