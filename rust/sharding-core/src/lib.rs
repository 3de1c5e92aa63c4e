// rust/sharding-core/src/lib.rs

//! Sharding - Core Library
//!
//! This crate splits the shards of one upstream service across several
//! worker processes, including shard partitioning, process supervision,
//! the manager/worker channel and the manager's event bus.

pub mod config;
pub mod error;
pub mod partition;

// Re-export commonly used types for convenience
pub use config::{ShardCount, ShardingConfig};
pub use error::{Result, ShardingError};
pub use partition::{calc_shards, ClusterId, ShardId, ShardLayout, ShardRange};

pub mod events;
pub use events::{CloseEvent, EventBus, ShardingEvent};

pub mod session;
pub use session::{HttpSessionSource, SessionObject, SessionSource};

pub mod ipc;
pub mod cluster;
pub use cluster::{ClusterInfo, ClusterState, CommandLauncher, WorkerLauncher};

pub mod client;
pub use client::{IdleClient, ShardClient};

pub mod role;
pub use role::{Role, WorkerContext};

pub mod entry;
pub mod manager;
pub use manager::{DiagnosticQuery, ShardingManager};

#[cfg(test)]
mod testing;
