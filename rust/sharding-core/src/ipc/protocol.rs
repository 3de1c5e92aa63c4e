//! Frame types exchanged between the manager and worker processes.
//!
//! Every frame is a JSON document adjacently tagged as `{"op": ..., "d": ...}`.
//! Workers only send [`WorkerFrame`]s, the manager only sends
//! [`MasterFrame`]s.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::{CloseEvent, ShardingEvent};
use crate::partition::{ClusterId, ShardId};

/// Correlates a request with its reply.
pub type Nonce = u64;

/// Frames written by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "d", rename_all = "snake_case")]
pub enum WorkerFrame {
    /// First frame on every connection.
    Identify { cluster_id: ClusterId, pid: u32 },
    /// The worker's client is logged in for its whole range.
    Ready { cluster_id: ClusterId },
    Event { event: WorkerEvent },
    Reply {
        nonce: Nonce,
        result: std::result::Result<Value, String>,
    },
}

/// Frames written by the manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "d", rename_all = "snake_case")]
pub enum MasterFrame {
    Request { nonce: Nonce, request: Request },
    /// Log out and exit.
    Shutdown,
}

/// Work the manager asks of a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Read a property from every hosted shard.
    FetchValue { path: String },
    /// Hand an expression to the worker's client.
    Eval { expression: String },
}

/// Notification forwarded from a worker's client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerEvent {
    ShardReady { shard_id: ShardId },
    ShardReconnect { shard_id: ShardId },
    ShardResume { shard_id: ShardId, replayed: u64 },
    ShardDisconnect { shard_id: ShardId, close: CloseEvent },
    Debug { message: String },
    Error { message: String },
    Message { payload: Value },
}

impl WorkerEvent {
    /// Map onto the manager's event type, tagging it with its origin.
    pub fn into_sharding_event(self, cluster_id: ClusterId) -> ShardingEvent {
        match self {
            Self::ShardReady { shard_id } => ShardingEvent::ShardReady(shard_id),
            Self::ShardReconnect { shard_id } => ShardingEvent::ShardReconnect(shard_id),
            Self::ShardResume { shard_id, replayed } => ShardingEvent::ShardResumed {
                replayed,
                shard_id,
            },
            Self::ShardDisconnect { shard_id, close } => ShardingEvent::ShardDisconnect {
                close_event: close,
                shard_id,
            },
            Self::Debug { message } => {
                ShardingEvent::Debug(format!("[cluster {}] {}", cluster_id, message))
            }
            Self::Error { message } => ShardingEvent::Error {
                cluster_id: Some(cluster_id),
                message,
            },
            Self::Message { payload } => ShardingEvent::Message {
                cluster_id,
                payload,
            },
        }
    }
}
