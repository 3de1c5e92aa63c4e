//! Cluster lifecycle.
//!
//! A [`Cluster`] owns one worker process and the contiguous shard range it
//! hosts. It spawns the process, waits for the worker to report ready, and
//! hands the process to a supervisor task that reports unexpected exits back
//! to the manager.

mod process;

pub use process::{CommandLauncher, ExitInfo, WorkerLauncher, WorkerProcess, WorkerSpec};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::ShardingConfig;
use crate::error::{Result, ShardingError};
use crate::events::{CloseEvent, EventBus, ShardingEvent};
use crate::ipc::MasterIpc;
use crate::partition::{ClusterId, ShardRange};
use crate::role::WorkerContext;

/// Lifecycle state of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterState {
    Unspawned,
    Spawning,
    Ready,
    Disconnected,
    Respawning,
    /// Exited before readiness, or crashed with respawn disabled.
    Failed,
    Terminated,
}

/// Point-in-time view of a cluster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterInfo {
    pub id: ClusterId,
    pub shards: ShardRange,
    pub state: ClusterState,
    pub pid: Option<u32>,
    pub ready_at: Option<DateTime<Utc>>,
    pub restarts: u32,
}

/// Sent by a supervisor task when its process exits on its own.
pub(crate) struct ExitNotice {
    pub cluster: Weak<Cluster>,
    pub generation: u64,
    pub exit: ExitInfo,
}

/// Dependencies shared by every cluster of one manager.
pub(crate) struct ClusterContext {
    pub config: Arc<ShardingConfig>,
    pub launcher: Arc<dyn WorkerLauncher>,
    pub ipc: Arc<MasterIpc>,
    pub events: EventBus,
    pub shard_count: u32,
    pub exits: mpsc::UnboundedSender<ExitNotice>,
}

struct Supervised {
    stop: oneshot::Sender<()>,
    task: JoinHandle<Option<Box<dyn WorkerProcess>>>,
}

pub struct Cluster {
    id: ClusterId,
    shards: ShardRange,
    ctx: Arc<ClusterContext>,
    status: watch::Sender<ClusterInfo>,
    // Bumped whenever the current process is deliberately replaced, so
    // exit notices from an older process can be told apart.
    generation: AtomicU64,
    process: Mutex<Option<Supervised>>,
}

impl Cluster {
    pub(crate) fn new(id: ClusterId, shards: ShardRange, ctx: Arc<ClusterContext>) -> Self {
        let (status, _) = watch::channel(ClusterInfo {
            id,
            shards,
            state: ClusterState::Unspawned,
            pid: None,
            ready_at: None,
            restarts: 0,
        });
        Self {
            id,
            shards,
            ctx,
            status,
            generation: AtomicU64::new(0),
            process: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ClusterId {
        self.id
    }

    pub fn shards(&self) -> ShardRange {
        self.shards
    }

    pub fn info(&self) -> ClusterInfo {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ClusterState {
        self.status.borrow().state
    }

    /// Watch state changes.
    pub fn watch(&self) -> watch::Receiver<ClusterInfo> {
        self.status.subscribe()
    }

    fn set_state(&self, state: ClusterState) {
        self.status.send_modify(|info| info.state = state);
        tracing::debug!(cluster_id = self.id, ?state, "Cluster state changed");
    }

    /// Start the worker and wait until it reports ready.
    pub async fn spawn(self: &Arc<Self>) -> Result<()> {
        let mut slot = self.process.lock().await;
        if slot.is_some() || self.state() != ClusterState::Unspawned {
            return Err(ShardingError::invalid_state(format!(
                "cluster {} has already been spawned",
                self.id
            )));
        }
        self.set_state(ClusterState::Spawning);
        self.launch(&mut slot).await
    }

    /// Replace the worker with a fresh one hosting the same shards.
    pub async fn respawn(self: &Arc<Self>) -> Result<()> {
        let mut slot = self.process.lock().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.stop(&mut slot).await?;

        self.status.send_modify(|info| info.restarts += 1);
        self.set_state(ClusterState::Respawning);
        self.launch(&mut slot).await
    }

    /// Stop the worker for good.
    pub async fn terminate(&self) -> Result<()> {
        let mut slot = self.process.lock().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        let result = self.stop(&mut slot).await;
        self.status.send_modify(|info| info.pid = None);
        self.set_state(ClusterState::Terminated);
        result
    }

    // Graceful stop: IPC shutdown, wait for the grace period, then kill.
    async fn stop(&self, slot: &mut Option<Supervised>) -> Result<()> {
        let Some(supervised) = slot.take() else {
            return Ok(());
        };
        let _ = supervised.stop.send(());
        let Some(mut process) = supervised.task.await.ok().flatten() else {
            // Already exited on its own.
            return Ok(());
        };

        if !self.ctx.ipc.send_shutdown(self.id).await {
            tracing::debug!(cluster_id = self.id, "No live session; killing worker");
        }

        let grace = self.ctx.config.cluster.shutdown_grace();
        match tokio::time::timeout(grace, process.wait()).await {
            Ok(Ok(exit)) => {
                tracing::debug!(cluster_id = self.id, %exit, "Worker stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::warn!(cluster_id = self.id, "Failed to wait on worker: {}", e);
                process.kill().await
            }
            Err(_) => {
                tracing::warn!(
                    cluster_id = self.id,
                    grace_ms = grace.as_millis() as u64,
                    "Worker ignored shutdown; killing"
                );
                process.kill().await
            }
        }
    }

    async fn launch(self: &Arc<Self>, slot: &mut Option<Supervised>) -> Result<()> {
        let generation = self.generation.load(Ordering::SeqCst);
        let ready = self.ctx.ipc.expect_ready(self.id).await;

        let spec = WorkerSpec {
            program: self.ctx.config.path.clone(),
            args: self.ctx.config.args.clone(),
            context: WorkerContext::new(
                &self.ctx.config,
                self.id,
                self.shards,
                self.ctx.shard_count,
            ),
        };

        let mut process = match self.ctx.launcher.launch(&spec).await {
            Ok(process) => process,
            Err(e) => {
                self.ctx.ipc.cancel_ready(self.id).await;
                self.set_state(ClusterState::Failed);
                return Err(e);
            }
        };

        let pid = process.pid();
        self.status.send_modify(|info| info.pid = pid);
        self.ctx.events.emit(ShardingEvent::Spawn(self.id));
        tracing::info!(cluster_id = self.id, shards = %self.shards, ?pid, "Spawned cluster");

        let timeout = self.ctx.config.cluster.spawn_timeout();
        let outcome = tokio::select! {
            ready = ready => ready.map_err(|_| {
                ShardingError::ipc(format!("readiness wait for cluster {} was cancelled", self.id))
            }),
            exit = process.wait() => Err(match exit {
                Ok(exit) => ShardingError::worker_failure(
                    self.id,
                    format!("worker exited before becoming ready ({})", exit),
                ),
                Err(e) => e,
            }),
            _ = tokio::time::sleep(timeout) => Err(ShardingError::timeout(
                format!("cluster {} to become ready", self.id),
                timeout.as_millis() as u64,
            )),
        };

        if let Err(e) = outcome {
            self.ctx.ipc.cancel_ready(self.id).await;
            if !matches!(e, ShardingError::WorkerFailure { .. }) {
                if let Err(kill_err) = process.kill().await {
                    tracing::warn!(cluster_id = self.id, "Failed to kill worker: {}", kill_err);
                }
            }
            self.status.send_modify(|info| info.pid = None);
            self.set_state(ClusterState::Failed);
            return Err(e);
        }

        self.status.send_modify(|info| {
            info.state = ClusterState::Ready;
            info.ready_at = Some(Utc::now());
        });
        self.ctx.events.emit(ShardingEvent::Ready(self.info()));
        tracing::info!(cluster_id = self.id, "Cluster ready");

        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(supervise(
            Arc::downgrade(self),
            generation,
            process,
            stop_rx,
            self.ctx.exits.clone(),
        ));
        *slot = Some(Supervised { stop, task });
        Ok(())
    }

    /// React to the worker exiting on its own.
    pub(crate) async fn handle_exit(self: &Arc<Self>, generation: u64, exit: ExitInfo) -> Result<()> {
        let mut slot = self.process.lock().await;
        if generation != self.generation.load(Ordering::SeqCst) {
            tracing::debug!(cluster_id = self.id, generation, "Ignoring stale exit notice");
            return Ok(());
        }
        slot.take();

        self.status.send_modify(|info| info.pid = None);
        self.set_state(ClusterState::Disconnected);
        self.ctx.events.emit(ShardingEvent::Error {
            cluster_id: Some(self.id),
            message: format!("Cluster {} exited unexpectedly ({})", self.id, exit),
        });
        for shard_id in self.shards.iter() {
            self.ctx.events.emit(ShardingEvent::ShardDisconnect {
                close_event: CloseEvent::abnormal(format!("cluster process {}", exit)),
                shard_id,
            });
        }

        if !self.ctx.config.respawn_enabled() {
            self.set_state(ClusterState::Failed);
            tracing::warn!(cluster_id = self.id, "Respawn disabled; cluster left failed");
            return Ok(());
        }

        self.generation.fetch_add(1, Ordering::SeqCst);
        self.status.send_modify(|info| info.restarts += 1);
        self.set_state(ClusterState::Respawning);
        self.launch(&mut slot).await
    }
}

// Owns the process while it runs. Hands it back when asked to stop,
// reports it when it exits first.
async fn supervise(
    cluster: Weak<Cluster>,
    generation: u64,
    mut process: Box<dyn WorkerProcess>,
    stop: oneshot::Receiver<()>,
    exits: mpsc::UnboundedSender<ExitNotice>,
) -> Option<Box<dyn WorkerProcess>> {
    let exit = tokio::select! {
        _ = stop => return Some(process),
        exit = process.wait() => exit,
    };

    let exit = exit.unwrap_or_else(|e| {
        tracing::warn!("Failed to wait on worker: {}", e);
        ExitInfo::killed()
    });
    let _ = exits.send(ExitNotice {
        cluster,
        generation,
        exit,
    });
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{InProcessLauncher, Behavior};
    use std::time::Duration;

    struct Harness {
        ipc: Arc<MasterIpc>,
        launcher: Arc<InProcessLauncher>,
        ctx: Arc<ClusterContext>,
        exits: mpsc::UnboundedReceiver<ExitNotice>,
    }

    fn harness(behavior: Behavior, configure: impl FnOnce(&mut ShardingConfig)) -> Harness {
        let mut config = ShardingConfig::new("in-process");
        config.cluster.spawn_timeout_ms = 500;
        config.cluster.shutdown_grace_ms = 200;
        configure(&mut config);

        let events = EventBus::new(256);
        let ipc = Arc::new(MasterIpc::new("/unused.sock", config.ipc.clone(), events.clone()));
        let launcher = Arc::new(InProcessLauncher::new(Arc::clone(&ipc), behavior));
        let (exits_tx, exits) = mpsc::unbounded_channel();

        let ctx = Arc::new(ClusterContext {
            config: Arc::new(config),
            launcher: launcher.clone(),
            ipc: Arc::clone(&ipc),
            events,
            shard_count: 4,
            exits: exits_tx,
        });
        Harness {
            ipc,
            launcher,
            ctx,
            exits,
        }
    }

    #[tokio::test]
    async fn test_spawn_reaches_ready() {
        let h = harness(Behavior::Idle, |_| {});
        let cluster = Arc::new(Cluster::new(0, ShardRange::new(0, 2), h.ctx.clone()));

        cluster.spawn().await.unwrap();
        let info = cluster.info();
        assert_eq!(info.state, ClusterState::Ready);
        assert!(info.ready_at.is_some());
        assert!(info.pid.is_some());
        assert!(h.ipc.is_live(0).await);

        assert!(matches!(
            cluster.spawn().await,
            Err(ShardingError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_spawn_failure_before_ready() {
        let h = harness(Behavior::FailLogin, |_| {});
        let cluster = Arc::new(Cluster::new(1, ShardRange::new(2, 4), h.ctx.clone()));

        let err = cluster.spawn().await.unwrap_err();
        assert!(matches!(err, ShardingError::WorkerFailure { cluster_id: 1, .. }));
        assert_eq!(cluster.state(), ClusterState::Failed);
    }

    #[tokio::test]
    async fn test_spawn_timeout_kills_worker() {
        let h = harness(Behavior::Hang, |c| c.cluster.spawn_timeout_ms = 50);
        let cluster = Arc::new(Cluster::new(0, ShardRange::new(0, 4), h.ctx.clone()));

        let err = cluster.spawn().await.unwrap_err();
        assert!(matches!(err, ShardingError::Timeout { .. }));
        assert_eq!(cluster.state(), ClusterState::Failed);
        assert_eq!(h.launcher.running(), 0);
    }

    #[tokio::test]
    async fn test_respawn_replaces_process() {
        let h = harness(Behavior::Idle, |_| {});
        let cluster = Arc::new(Cluster::new(0, ShardRange::new(0, 2), h.ctx.clone()));
        cluster.spawn().await.unwrap();
        let first_pid = cluster.info().pid;

        cluster.respawn().await.unwrap();
        let info = cluster.info();
        assert_eq!(info.state, ClusterState::Ready);
        assert_eq!(info.restarts, 1);
        assert_ne!(info.pid, first_pid);
        assert_eq!(h.launcher.launches(), vec![0, 0]);
        assert_eq!(h.launcher.running(), 1);
    }

    #[tokio::test]
    async fn test_terminate() {
        let h = harness(Behavior::Idle, |_| {});
        let cluster = Arc::new(Cluster::new(0, ShardRange::new(0, 2), h.ctx.clone()));
        cluster.spawn().await.unwrap();

        cluster.terminate().await.unwrap();
        assert_eq!(cluster.state(), ClusterState::Terminated);
        assert_eq!(h.launcher.running(), 0);

        // Never spawned: nothing to stop
        let idle = Arc::new(Cluster::new(1, ShardRange::new(2, 4), h.ctx.clone()));
        idle.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_crash_sends_exit_notice() {
        let mut h = harness(Behavior::Idle, |_| {});
        let cluster = Arc::new(Cluster::new(0, ShardRange::new(0, 2), h.ctx.clone()));
        cluster.spawn().await.unwrap();

        assert!(h.launcher.crash(0));
        let notice = tokio::time::timeout(Duration::from_secs(1), h.exits.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notice.generation, 0);
        assert!(!notice.exit.success);

        let cluster = notice.cluster.upgrade().unwrap();
        cluster
            .handle_exit(notice.generation, notice.exit)
            .await
            .unwrap();
        assert_eq!(cluster.state(), ClusterState::Ready);
        assert_eq!(cluster.info().restarts, 1);

        // A second delivery of the same notice is stale now
        cluster.handle_exit(0, ExitInfo::killed()).await.unwrap();
        assert_eq!(cluster.info().restarts, 1);
    }
}
