//! Test doubles for running real worker loops without child processes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::{AbortHandle, JoinHandle};

use crate::client::{IdleClient, ShardClient};
use crate::cluster::{ExitInfo, WorkerLauncher, WorkerProcess, WorkerSpec};
use crate::error::{Result, ShardingError};
use crate::ipc::{worker, MasterIpc, ShardEventSink};
use crate::partition::{ClusterId, ShardId};
use crate::role::WorkerContext;

/// How launched workers behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Idle,
    /// Every login fails.
    FailLogin,
    /// Logins for this cluster fail, everything else is idle.
    FailLoginFor(ClusterId),
    /// Login never completes.
    Hang,
}

/// Launches each worker as a task connected over `tokio::io::duplex`.
pub struct InProcessLauncher {
    ipc: Arc<MasterIpc>,
    behavior: Behavior,
    next_pid: AtomicU32,
    launched: Mutex<Vec<(ClusterId, AbortHandle)>>,
}

impl InProcessLauncher {
    pub fn new(ipc: Arc<MasterIpc>, behavior: Behavior) -> Self {
        Self {
            ipc,
            behavior,
            next_pid: AtomicU32::new(10_000),
            launched: Mutex::new(Vec::new()),
        }
    }

    fn client_for(&self, cluster_id: ClusterId) -> Arc<dyn ShardClient> {
        match self.behavior {
            Behavior::Idle => Arc::new(IdleClient::new()),
            Behavior::FailLogin => Arc::new(FailingClient),
            Behavior::FailLoginFor(id) if id == cluster_id => Arc::new(FailingClient),
            Behavior::FailLoginFor(_) => Arc::new(IdleClient::new()),
            Behavior::Hang => Arc::new(HangingClient),
        }
    }

    /// Cluster ids in launch order.
    pub fn launches(&self) -> Vec<ClusterId> {
        self.launched.lock().unwrap().iter().map(|(id, _)| *id).collect()
    }

    /// Workers still running.
    pub fn running(&self) -> usize {
        self.launched
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .count()
    }

    /// Kill the newest worker of a cluster without telling anyone.
    pub fn crash(&self, cluster_id: ClusterId) -> bool {
        let launched = self.launched.lock().unwrap();
        match launched.iter().rev().find(|(id, _)| *id == cluster_id) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(&self, spec: &WorkerSpec) -> Result<Box<dyn WorkerProcess>> {
        let cluster_id = spec.context.cluster_id;
        let (master_end, worker_end) = tokio::io::duplex(64 * 1024);
        self.ipc.attach(master_end);

        let client = self.client_for(cluster_id);
        let task = tokio::spawn(worker::serve(spec.context.clone(), client, worker_end));
        self.launched
            .lock()
            .unwrap()
            .push((cluster_id, task.abort_handle()));

        Ok(Box::new(TaskProcess {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            task: Some(task),
            exit: None,
        }))
    }
}

struct TaskProcess {
    pid: u32,
    task: Option<JoinHandle<Result<()>>>,
    exit: Option<ExitInfo>,
}

#[async_trait]
impl WorkerProcess for TaskProcess {
    fn pid(&self) -> Option<u32> {
        self.exit.is_none().then_some(self.pid)
    }

    async fn wait(&mut self) -> Result<ExitInfo> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let Some(task) = self.task.as_mut() else {
            return Ok(ExitInfo::killed());
        };
        let exit = match task.await {
            Ok(Ok(())) => ExitInfo::code(0),
            Ok(Err(_)) => ExitInfo::code(1),
            Err(_) => ExitInfo::killed(),
        };
        self.task = None;
        self.exit = Some(exit);
        Ok(exit)
    }

    async fn kill(&mut self) -> Result<()> {
        if let Some(task) = &self.task {
            task.abort();
        }
        self.wait().await.map(|_| ())
    }
}

struct FailingClient;

#[async_trait]
impl ShardClient for FailingClient {
    async fn login(&self, _ctx: &WorkerContext, _events: ShardEventSink) -> Result<()> {
        Err(ShardingError::upstream("authentication failed"))
    }

    async fn value(&self, _: ShardId, _: &str) -> std::result::Result<Value, String> {
        Err("not logged in".into())
    }

    async fn eval(&self, _: &str) -> std::result::Result<Value, String> {
        Err("not logged in".into())
    }

    async fn shutdown(&self) {}
}

struct HangingClient;

#[async_trait]
impl ShardClient for HangingClient {
    async fn login(&self, _ctx: &WorkerContext, _events: ShardEventSink) -> Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn value(&self, _: ShardId, _: &str) -> std::result::Result<Value, String> {
        Err("not logged in".into())
    }

    async fn eval(&self, _: &str) -> std::result::Result<Value, String> {
        Err("not logged in".into())
    }

    async fn shutdown(&self) {}
}
