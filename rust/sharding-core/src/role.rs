//! Process role resolution.
//!
//! The same binary runs as the coordinator or as a worker. Workers are
//! recognised by `SHARDER_ROLE=worker` and receive their assignment through
//! the environment variables below.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::config::{IpcConfig, ShardingConfig};
use crate::error::{Result, ShardingError};
use crate::partition::{ClusterId, ShardRange};

pub const ENV_ROLE: &str = "SHARDER_ROLE";
pub const ENV_CLUSTER_ID: &str = "SHARDER_CLUSTER_ID";
pub const ENV_SHARD_START: &str = "SHARDER_SHARD_START";
pub const ENV_SHARD_END: &str = "SHARDER_SHARD_END";
pub const ENV_SHARD_COUNT: &str = "SHARDER_SHARD_COUNT";
pub const ENV_IPC_SOCKET: &str = "SHARDER_IPC_SOCKET";
pub const ENV_DEVELOPMENT: &str = "SHARDER_DEVELOPMENT";
pub const ENV_CLIENT_OPTIONS: &str = "SHARDER_CLIENT_OPTIONS";
pub const ENV_TOKEN: &str = "SHARDER_TOKEN";
pub const ENV_MAX_FRAME_BYTES: &str = "SHARDER_MAX_FRAME_BYTES";

const WORKER_ROLE: &str = "worker";

/// Everything a worker process needs to know about its assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerContext {
    pub cluster_id: ClusterId,
    pub shards: ShardRange,
    /// Total shard count across all clusters.
    pub shard_count: u32,
    pub ipc_socket: PathBuf,
    pub development: bool,
    pub client_options: serde_json::Map<String, serde_json::Value>,
    pub token: Option<String>,
    pub max_frame_bytes: usize,
}

impl WorkerContext {
    pub fn new(
        config: &ShardingConfig,
        cluster_id: ClusterId,
        shards: ShardRange,
        shard_count: u32,
    ) -> Self {
        Self {
            cluster_id,
            shards,
            shard_count,
            ipc_socket: config.resolved_ipc_socket(),
            development: config.development,
            client_options: config.client_options.clone(),
            token: config.token.clone(),
            max_frame_bytes: config.ipc.max_frame_bytes,
        }
    }

    /// Environment handed to the worker process.
    pub fn to_env(&self) -> Vec<(&'static str, String)> {
        let mut env = vec![
            (ENV_ROLE, WORKER_ROLE.to_string()),
            (ENV_CLUSTER_ID, self.cluster_id.to_string()),
            (ENV_SHARD_START, self.shards.start_shard.to_string()),
            (ENV_SHARD_END, self.shards.end_shard.to_string()),
            (ENV_SHARD_COUNT, self.shard_count.to_string()),
            (ENV_IPC_SOCKET, self.ipc_socket.display().to_string()),
            (ENV_DEVELOPMENT, self.development.to_string()),
            (
                ENV_CLIENT_OPTIONS,
                serde_json::Value::Object(self.client_options.clone()).to_string(),
            ),
            (ENV_MAX_FRAME_BYTES, self.max_frame_bytes.to_string()),
        ];
        if let Some(token) = &self.token {
            env.push((ENV_TOKEN, token.clone()));
        }
        env
    }

    fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let cluster_id = parse_required(vars, ENV_CLUSTER_ID)?;
        let start = parse_required(vars, ENV_SHARD_START)?;
        let end = parse_required(vars, ENV_SHARD_END)?;
        if end <= start {
            return Err(ShardingError::config(format!(
                "worker shard range {}..{} is empty",
                start, end
            )));
        }
        let shard_count = parse_required(vars, ENV_SHARD_COUNT)?;
        if end > shard_count {
            return Err(ShardingError::config(format!(
                "worker shard range ends at {} but there are only {} shards",
                end, shard_count
            )));
        }

        let ipc_socket = vars
            .get(ENV_IPC_SOCKET)
            .map(PathBuf::from)
            .ok_or_else(|| missing(ENV_IPC_SOCKET))?;

        let development = vars
            .get(ENV_DEVELOPMENT)
            .map(|v| v.parse::<bool>())
            .transpose()
            .map_err(|e| ShardingError::config_with_source(format!("invalid {}", ENV_DEVELOPMENT), e))?
            .unwrap_or(false);

        let client_options = match vars.get(ENV_CLIENT_OPTIONS) {
            Some(raw) => serde_json::from_str(raw).map_err(|e| {
                ShardingError::config_with_source(format!("invalid {}", ENV_CLIENT_OPTIONS), e)
            })?,
            None => serde_json::Map::new(),
        };

        let max_frame_bytes = match vars.get(ENV_MAX_FRAME_BYTES) {
            Some(raw) => raw.parse().map_err(|e| {
                ShardingError::config_with_source(format!("invalid {}", ENV_MAX_FRAME_BYTES), e)
            })?,
            None => IpcConfig::default().max_frame_bytes,
        };

        Ok(Self {
            cluster_id,
            shards: ShardRange::new(start, end),
            shard_count,
            ipc_socket,
            development,
            client_options,
            token: vars.get(ENV_TOKEN).cloned(),
            max_frame_bytes,
        })
    }
}

fn missing(name: &str) -> ShardingError {
    ShardingError::config(format!("worker environment is missing {}", name))
}

fn parse_required(vars: &HashMap<String, String>, name: &str) -> Result<u32> {
    let raw = vars.get(name).ok_or_else(|| missing(name))?;
    raw.parse()
        .map_err(|e| ShardingError::config_with_source(format!("invalid {} '{}'", name, raw), e))
}

/// Which half of the system this process runs.
#[derive(Debug, Clone, PartialEq)]
pub enum Role {
    Coordinator,
    Worker(WorkerContext),
}

impl Role {
    /// Resolve the role from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        match vars.get(ENV_ROLE).map(String::as_str) {
            Some(WORKER_ROLE) => WorkerContext::from_vars(&vars).map(Self::Worker),
            Some("") | Some("coordinator") | None => Ok(Self::Coordinator),
            Some(other) => Err(ShardingError::config(format!(
                "unknown {} '{}'",
                ENV_ROLE, other
            ))),
        }
    }

    pub fn is_worker(&self) -> bool {
        matches!(self, Self::Worker(_))
    }
}
