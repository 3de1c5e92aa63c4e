// rust/sharding-core/src/config.rs

//! Configuration for the sharding manager.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, ShardingError};
use crate::partition::DEFAULT_GUILDS_PER_SHARD;

/// Requested shard count: resolved from the upstream service or fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShardCount {
    /// Ask the upstream session endpoint for a recommendation.
    #[default]
    Auto,
    /// Use exactly this many shards.
    Fixed(u32),
}

impl FromStr for ShardCount {
    type Err = ShardingError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        s.parse::<u32>()
            .map(Self::Fixed)
            .map_err(|e| ShardingError::config_with_source(format!("invalid shard count '{}'", s), e))
    }
}

impl fmt::Display for ShardCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Fixed(n) => write!(f, "{}", n),
        }
    }
}

impl Serialize for ShardCount {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Auto => serializer.serialize_str("auto"),
            Self::Fixed(n) => serializer.serialize_u32(*n),
        }
    }
}

impl<'de> Deserialize<'de> for ShardCount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(u32),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(Self::Fixed(n)),
            Repr::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

// Top-level sharding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardingConfig {
    /// Program started for every worker process.
    pub path: PathBuf,
    /// Extra arguments passed to the worker program.
    pub args: Vec<String>,
    /// Upstream credential, required when `shard_count` is `auto`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub shard_count: ShardCount,
    /// Desired cluster count; defaults to the number of logical CPUs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_count: Option<u32>,
    /// Guild density target used to scale the upstream recommendation.
    pub guilds_per_shard: u32,
    pub development: bool,
    /// Respawn crashed workers. Unset means enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub respawn: Option<bool>,
    /// Local socket path override.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipc_socket: Option<PathBuf>,
    /// Opaque options handed to every worker's client.
    pub client_options: serde_json::Map<String, serde_json::Value>,
    pub upstream: UpstreamConfig,
    pub ipc: IpcConfig,
    pub cluster: ClusterConfig,
}

/// Upstream session endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// API base URL, without version segment.
    pub api_base: String,
    /// API version used in the `/v{version}/` path segment.
    pub api_version: u32,
    /// Request timeout in milliseconds.
    pub request_timeout_ms: u64,
}

/// Channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Bound on a single request/reply exchange with one cluster.
    pub request_timeout_ms: u64,
    /// Largest accepted frame in bytes.
    pub max_frame_bytes: usize,
    /// Capacity of the manager's event bus.
    pub event_capacity: usize,
}

/// Cluster lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// How long a worker may take to signal readiness.
    pub spawn_timeout_ms: u64,
    /// How long a worker may take to exit after a shutdown request.
    pub shutdown_grace_ms: u64,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            args: Vec::new(),
            token: None,
            shard_count: ShardCount::Auto,
            cluster_count: None,
            guilds_per_shard: DEFAULT_GUILDS_PER_SHARD,
            development: false,
            respawn: None,
            ipc_socket: None,
            client_options: serde_json::Map::new(),
            upstream: UpstreamConfig::default(),
            ipc: IpcConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_base: "https://discordapp.com/api".to_string(),
            api_version: 8,
            request_timeout_ms: 15_000,
        }
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            max_frame_bytes: 8 * 1024 * 1024, // 8 MB
            event_capacity: 1024,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            spawn_timeout_ms: 120_000,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl IpcConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl ClusterConfig {
    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_millis(self.spawn_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Platform default for the local IPC socket.
pub fn default_ipc_socket() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from("//./pipe/tmp/sharder.sock")
    } else {
        PathBuf::from("/tmp/sharder.sock")
    }
}

/// Number of logical CPUs, used as the default cluster count.
pub fn default_cluster_count() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

impl FromStr for ShardingConfig {
    type Err = ShardingError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| ShardingError::config_with_source("failed to parse TOML config", e))
    }
}

impl ShardingConfig {
    /// Create a configuration for the given worker program with defaults.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ShardingError::io_with_source(path, "failed to read config file", e)
        })?;
        content.parse()
    }

    /// Respawn policy with the unset case resolved.
    pub fn respawn_enabled(&self) -> bool {
        self.respawn.unwrap_or(true)
    }

    /// Cluster count with the CPU default applied.
    pub fn resolved_cluster_count(&self) -> u32 {
        self.cluster_count.unwrap_or_else(default_cluster_count)
    }

    /// Socket path with the platform default applied.
    pub fn resolved_ipc_socket(&self) -> PathBuf {
        self.ipc_socket.clone().unwrap_or_else(default_ipc_socket)
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `SHARDER_`. For example:
    // - `SHARDER_TOKEN` overrides `token`
    // - `SHARDER_SHARDS` overrides `shard_count` ("auto" or a number)
    // - `SHARDER_CLUSTERS` overrides `cluster_count`
    // - `SHARDER_RESPAWN` overrides `respawn`
    // - `SHARDER_IPC_REQUEST_TIMEOUT_MS` overrides `ipc.request_timeout_ms`
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("SHARDER_PATH") {
            self.path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("SHARDER_TOKEN") {
            self.token = Some(val);
        }
        if let Ok(val) = std::env::var("SHARDER_SHARDS") {
            if let Ok(v) = val.parse() {
                self.shard_count = v;
            }
        }
        if let Ok(val) = std::env::var("SHARDER_CLUSTERS") {
            if let Ok(v) = val.parse() {
                self.cluster_count = Some(v);
            }
        }
        if let Ok(val) = std::env::var("SHARDER_GUILDS_PER_SHARD") {
            if let Ok(v) = val.parse() {
                self.guilds_per_shard = v;
            }
        }
        if let Ok(val) = std::env::var("SHARDER_DEVELOPMENT") {
            if let Ok(v) = val.parse() {
                self.development = v;
            }
        }
        if let Ok(val) = std::env::var("SHARDER_RESPAWN") {
            if let Ok(v) = val.parse() {
                self.respawn = Some(v);
            }
        }
        if let Ok(val) = std::env::var("SHARDER_IPC_SOCKET") {
            self.ipc_socket = Some(PathBuf::from(val));
        }

        // Upstream overrides
        if let Ok(val) = std::env::var("SHARDER_API_BASE") {
            self.upstream.api_base = val;
        }
        if let Ok(val) = std::env::var("SHARDER_API_VERSION") {
            if let Ok(v) = val.parse() {
                self.upstream.api_version = v;
            }
        }

        // IPC overrides
        if let Ok(val) = std::env::var("SHARDER_IPC_REQUEST_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.ipc.request_timeout_ms = v;
            }
        }

        // Cluster overrides
        if let Ok(val) = std::env::var("SHARDER_SPAWN_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.cluster.spawn_timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("SHARDER_SHUTDOWN_GRACE_MS") {
            if let Ok(v) = val.parse() {
                self.cluster.shutdown_grace_ms = v;
            }
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(ShardingError::config("a worker path must be supplied"));
        }

        if self.shard_count == ShardCount::Fixed(0) {
            return Err(ShardingError::config("shard_count must be 'auto' or at least 1"));
        }
        if self.cluster_count == Some(0) {
            return Err(ShardingError::config("cluster_count must be at least 1"));
        }
        if self.guilds_per_shard == 0 {
            return Err(ShardingError::config("guilds_per_shard must be greater than 0"));
        }

        if self.upstream.api_base.is_empty() {
            return Err(ShardingError::config("upstream.api_base must not be empty"));
        }

        if self.ipc.request_timeout_ms == 0 {
            return Err(ShardingError::config(
                "ipc.request_timeout_ms must be greater than 0",
            ));
        }
        if self.ipc.max_frame_bytes < 1024 {
            return Err(ShardingError::config(
                "ipc.max_frame_bytes must be at least 1 KB",
            ));
        }
        if self.ipc.event_capacity == 0 {
            return Err(ShardingError::config(
                "ipc.event_capacity must be greater than 0",
            ));
        }

        if self.cluster.spawn_timeout_ms == 0 {
            return Err(ShardingError::config(
                "cluster.spawn_timeout_ms must be greater than 0",
            ));
        }

        Ok(())
    }
}
