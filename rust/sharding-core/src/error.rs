// rust/sharding-core/src/error.rs

use std::path::PathBuf;
use thiserror::Error;

use crate::partition::ClusterId;

#[derive(Error, Debug)]
pub enum ShardingError {

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Upstream error{}: {message}", status_suffix(.status))]
    Upstream {
        message: String,
        /// HTTP status of the failed response, when one was received.
        status: Option<u16>,
        /// Raw response body, kept for diagnosis.
        body: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("No cluster with id {cluster_id} found")]
    NotFound {
        cluster_id: ClusterId,
    },

    #[error("Cluster {cluster_id} worker failure: {message}")]
    WorkerFailure {
        cluster_id: ClusterId,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Eval error: {message}")]
    Eval {
        message: String,
    },

    #[error("IPC error: {message}")]
    Ipc {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Nothing was written; the connection is still usable.
    #[error("Frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge {
        size: usize,
        limit: usize,
    },

    #[error("Timed out after {after_ms}ms waiting for {operation}")]
    Timeout {
        operation: String,
        after_ms: u64,
    },

    #[error("Invalid state: {message}")]
    InvalidState {
        message: String,
    },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
    },

    #[error("I/O error at '{path}': {message}")]
    Io {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },
}

pub type Result<T> = std::result::Result<T, ShardingError>;

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

// Required by the frame codec's error type.
impl From<std::io::Error> for ShardingError {
    fn from(source: std::io::Error) -> Self {
        Self::ipc_with_source("transport failure", source)
    }
}

// Convenience constructors
impl ShardingError {

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream {
            message: message.into(),
            status: None,
            body: String::new(),
            source: None,
        }
    }

    pub fn upstream_status(status: u16, body: impl Into<String>) -> Self {
        Self::Upstream {
            message: "session endpoint returned a non-success status".to_string(),
            status: Some(status),
            body: body.into(),
            source: None,
        }
    }

    pub fn upstream_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Upstream {
            message: message.into(),
            status: None,
            body: String::new(),
            source: Some(Box::new(source)),
        }
    }

    pub fn not_found(cluster_id: ClusterId) -> Self {
        Self::NotFound { cluster_id }
    }

    pub fn worker_failure(cluster_id: ClusterId, message: impl Into<String>) -> Self {
        Self::WorkerFailure {
            cluster_id,
            message: message.into(),
            source: None,
        }
    }

    pub fn worker_failure_with_source(
        cluster_id: ClusterId,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::WorkerFailure {
            cluster_id,
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn eval(message: impl Into<String>) -> Self {
        Self::Eval {
            message: message.into(),
        }
    }

    pub fn ipc(message: impl Into<String>) -> Self {
        Self::Ipc {
            message: message.into(),
            source: None,
        }
    }

    pub fn ipc_with_source(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Ipc {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn frame_too_large(size: usize, limit: usize) -> Self {
        Self::FrameTooLarge { size, limit }
    }

    pub fn timeout(operation: impl Into<String>, after_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after_ms,
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Io {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn io_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Io {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    /// HTTP status of an upstream failure, if any.
    pub fn upstream_status_code(&self) -> Option<u16> {
        match self {
            Self::Upstream { status, .. } => *status,
            _ => None,
        }
    }
}
