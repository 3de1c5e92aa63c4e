//! Worker process launching.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::error::{Result, ShardingError};
use crate::role::WorkerContext;

/// What to start for one cluster.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub context: WorkerContext,
}

impl WorkerSpec {
    pub fn env(&self) -> Vec<(&'static str, String)> {
        self.context.to_env()
    }
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, `None` when killed by a signal.
    pub code: Option<i32>,
    pub success: bool,
}

impl ExitInfo {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            success: code == 0,
        }
    }

    pub fn killed() -> Self {
        Self {
            code: None,
            success: false,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code),
            None => write!(f, "terminated by signal"),
        }
    }
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            success: status.success(),
        }
    }
}

/// A running worker.
#[async_trait]
pub trait WorkerProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Wait for the process to exit. Safe to call again after it returned.
    async fn wait(&mut self) -> Result<ExitInfo>;

    /// Force the process to stop and reap it.
    async fn kill(&mut self) -> Result<()>;
}

/// Process-spawning primitive.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, spec: &WorkerSpec) -> Result<Box<dyn WorkerProcess>>;
}

/// Launches workers as child processes with `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct CommandLauncher;

#[async_trait]
impl WorkerLauncher for CommandLauncher {
    async fn launch(&self, spec: &WorkerSpec) -> Result<Box<dyn WorkerProcess>> {
        let cluster_id = spec.context.cluster_id;
        let child = Command::new(&spec.program)
            .args(&spec.args)
            .envs(spec.env())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ShardingError::worker_failure_with_source(
                    cluster_id,
                    format!("failed to start {}", spec.program.display()),
                    e,
                )
            })?;

        tracing::debug!(cluster_id, pid = ?child.id(), "Worker process started");
        Ok(Box::new(ChildProcess { cluster_id, child }))
    }
}

struct ChildProcess {
    cluster_id: u32,
    child: Child,
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<ExitInfo> {
        self.child.wait().await.map(ExitInfo::from).map_err(|e| {
            ShardingError::worker_failure_with_source(self.cluster_id, "failed to wait on worker", e)
        })
    }

    async fn kill(&mut self) -> Result<()> {
        self.child.kill().await.map_err(|e| {
            ShardingError::worker_failure_with_source(self.cluster_id, "failed to kill worker", e)
        })
    }
}
