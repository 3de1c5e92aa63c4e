//! Manager/worker channel.
//!
//! This module provides the local socket transport between the manager and
//! its worker processes, including:
//!
//! - Length-delimited JSON framing
//! - Request/reply correlation with per-request timeouts
//! - Broadcast to every live cluster
//! - Forwarding of worker events to the manager's event bus

pub mod codec;
mod master;
pub mod protocol;
pub mod worker;

pub use master::{MasterIpc, SessionInfo};
pub use protocol::{MasterFrame, Request, WorkerEvent, WorkerFrame};
pub use worker::ShardEventSink;
