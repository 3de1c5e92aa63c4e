//! Sharding manager.
//!
//! The manager resolves the shard count, partitions shards across
//! clusters, spawns them one at a time, and exposes restart, broadcast and
//! diagnostic operations over the running topology.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::cluster::{
    Cluster, ClusterContext, ClusterInfo, CommandLauncher, ExitNotice, WorkerLauncher,
};
use crate::config::{ShardCount, ShardingConfig};
use crate::error::{Result, ShardingError};
use crate::events::{EventBus, ShardingEvent};
use crate::ipc::{MasterIpc, Request};
use crate::partition::{calc_shards, ClusterId, ShardLayout};
use crate::session::{HttpSessionSource, SessionSource};

/// Closed set of questions the coordinator can answer about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticQuery {
    ShardCount,
    ClusterCount,
    Layout,
    ClusterStates,
    LiveSessions,
    ProcessId,
    /// Milliseconds since the manager was created.
    Uptime,
}

pub struct ShardingManager {
    config: Arc<ShardingConfig>,
    launcher: Arc<dyn WorkerLauncher>,
    session_source: Arc<dyn SessionSource>,
    ipc: Arc<MasterIpc>,
    events: EventBus,
    clusters: RwLock<BTreeMap<ClusterId, Arc<Cluster>>>,
    layout: RwLock<Option<ShardLayout>>,
    spawned: AtomicBool,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    started_at: Instant,
}

impl ShardingManager {
    /// Create a manager. Fails when the configuration is invalid, including
    /// when no worker path is given.
    pub fn new(config: ShardingConfig) -> Result<Self> {
        config.validate()?;

        let events = EventBus::new(config.ipc.event_capacity);
        let ipc = Arc::new(MasterIpc::new(
            config.resolved_ipc_socket(),
            config.ipc.clone(),
            events.clone(),
        ));
        let session_source = Arc::new(HttpSessionSource::from_config(&config)?);

        Ok(Self {
            config: Arc::new(config),
            launcher: Arc::new(CommandLauncher),
            session_source,
            ipc,
            events,
            clusters: RwLock::new(BTreeMap::new()),
            layout: RwLock::new(None),
            spawned: AtomicBool::new(false),
            supervisor: Mutex::new(None),
            started_at: Instant::now(),
        })
    }

    #[must_use]
    pub fn with_launcher(mut self, launcher: Arc<dyn WorkerLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    #[must_use]
    pub fn with_session_source(mut self, source: Arc<dyn SessionSource>) -> Self {
        self.session_source = source;
        self
    }

    pub fn config(&self) -> &ShardingConfig {
        &self.config
    }

    pub fn ipc(&self) -> &Arc<MasterIpc> {
        &self.ipc
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShardingEvent> {
        self.events.subscribe()
    }

    pub fn event_stream(&self) -> BroadcastStream<ShardingEvent> {
        self.events.event_stream()
    }

    /// Resolve the topology and spawn every cluster in order.
    ///
    /// Cluster `i + 1` is launched only after cluster `i` is ready. The
    /// first failure is returned; clusters that were already ready stay
    /// registered. A failure before any cluster is launched leaves the
    /// manager untouched, and `spawn()` may be called again.
    pub async fn spawn(&self) -> Result<()> {
        if self.spawned.load(Ordering::SeqCst) {
            return Err(ShardingError::invalid_state("spawn() has already been called"));
        }

        tracing::info!(
            development = self.config.development,
            respawn = self.config.respawn_enabled(),
            "Starting sharding manager"
        );

        let shard_count = self.resolve_shard_count().await?;
        let layout = ShardLayout::new(shard_count, self.config.resolved_cluster_count())?;

        if self.spawned.swap(true, Ordering::SeqCst) {
            return Err(ShardingError::invalid_state("spawn() has already been called"));
        }
        if let Err(e) = self.ipc.listen().await {
            self.spawned.store(false, Ordering::SeqCst);
            return Err(e);
        }

        tracing::info!(
            shard_count,
            cluster_count = layout.cluster_count(),
            "Resolved shard layout"
        );
        self.events.debug(format!(
            "Starting {} Shards in {} Clusters!",
            shard_count,
            layout.cluster_count()
        ));
        *self.layout.write().await = Some(layout.clone());

        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        self.start_supervisor(exits_rx).await;

        let ctx = Arc::new(ClusterContext {
            config: Arc::clone(&self.config),
            launcher: Arc::clone(&self.launcher),
            ipc: Arc::clone(&self.ipc),
            events: self.events.clone(),
            shard_count,
            exits: exits_tx,
        });

        for (cluster_id, shards) in layout.iter() {
            let cluster = Arc::new(Cluster::new(cluster_id, shards, Arc::clone(&ctx)));
            if let Err(e) = cluster.spawn().await {
                tracing::error!(cluster_id, "Failed to spawn cluster: {}", e);
                return Err(e);
            }
            self.clusters.write().await.insert(cluster_id, cluster);
        }

        tracing::info!("All clusters ready");
        Ok(())
    }

    async fn resolve_shard_count(&self) -> Result<u32> {
        let recommended = match self.config.shard_count {
            ShardCount::Fixed(count) => return Ok(count),
            ShardCount::Auto => {
                self.events.debug("Fetching Session Endpoint");
                self.session_source.fetch_session().await?
            }
        };

        let shard_count = calc_shards(recommended.shards, self.config.guilds_per_shard);
        if shard_count == 0 {
            return Err(ShardingError::upstream("session endpoint recommended zero shards"));
        }

        let limit = &recommended.session_start_limit;
        tracing::info!(
            recommended = recommended.shards,
            shard_count,
            remaining = limit.remaining,
            total = limit.total,
            reset_after_ms = limit.reset_after,
            "Fetched session metadata"
        );
        self.events.debug(format!(
            "Using recommended shard count of {} shards with {} guilds per shard",
            shard_count, self.config.guilds_per_shard
        ));
        if limit.remaining < shard_count {
            tracing::warn!(
                remaining = limit.remaining,
                shard_count,
                "Session start budget is lower than the number of shards to connect"
            );
            self.events.debug(format!(
                "Only {} session starts remain for {} shards; resets in {}ms",
                limit.remaining, shard_count, limit.reset_after
            ));
        }

        Ok(shard_count)
    }

    // Handles crash notices one at a time.
    async fn start_supervisor(&self, mut exits: mpsc::UnboundedReceiver<ExitNotice>) {
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            while let Some(notice) = exits.recv().await {
                let Some(cluster) = notice.cluster.upgrade() else {
                    continue;
                };
                if let Err(e) = cluster.handle_exit(notice.generation, notice.exit).await {
                    events.emit(ShardingEvent::Error {
                        cluster_id: Some(cluster.id()),
                        message: format!("Failed to respawn cluster {}: {}", cluster.id(), e),
                    });
                }
            }
        });
        *self.supervisor.lock().await = Some(handle);
    }

    async fn cluster_list(&self) -> Vec<Arc<Cluster>> {
        self.clusters.read().await.values().cloned().collect()
    }

    async fn cluster(&self, cluster_id: ClusterId) -> Result<Arc<Cluster>> {
        self.clusters
            .read()
            .await
            .get(&cluster_id)
            .cloned()
            .ok_or_else(|| ShardingError::not_found(cluster_id))
    }

    /// Respawn every cluster, one after another, in ascending id order.
    pub async fn restart_all(&self) -> Result<()> {
        self.events.debug("Restarting all Clusters!");
        for cluster in self.cluster_list().await {
            tracing::info!(cluster_id = cluster.id(), "Restarting cluster");
            cluster.respawn().await?;
        }
        Ok(())
    }

    pub async fn restart(&self, cluster_id: ClusterId) -> Result<()> {
        let cluster = self.cluster(cluster_id).await?;
        tracing::info!(cluster_id, "Restarting cluster");
        self.events.debug(format!("Restarting Cluster {}", cluster_id));
        cluster.respawn().await
    }

    /// Send a request to every live cluster and collect per-cluster results.
    pub async fn broadcast(&self, request: Request) -> Vec<(ClusterId, Result<Value>)> {
        self.ipc.broadcast(request).await
    }

    /// Read `path` from every shard across all clusters.
    ///
    /// The order of the returned values is not guaranteed. Any cluster
    /// failing fails the whole call.
    pub async fn fetch_client_values(&self, path: &str) -> Result<Vec<Value>> {
        let replies = self
            .broadcast(Request::FetchValue {
                path: path.to_string(),
            })
            .await;

        let mut values = Vec::new();
        for (cluster_id, reply) in replies {
            match reply {
                Ok(Value::Array(items)) => values.extend(items),
                Ok(other) => values.push(other),
                Err(e) => {
                    tracing::warn!(cluster_id, path, "Failed to fetch client values: {}", e);
                    return Err(e);
                }
            }
        }
        Ok(values)
    }

    /// Answer a diagnostic query from the coordinator's own state.
    pub async fn eval(&self, query: DiagnosticQuery) -> Result<Value> {
        let value = match query {
            DiagnosticQuery::ShardCount => {
                let layout = self.layout().await.ok_or_else(|| {
                    ShardingError::eval("shard count has not been resolved yet")
                })?;
                Value::from(layout.shard_count)
            }
            DiagnosticQuery::ClusterCount => Value::from(self.clusters.read().await.len()),
            DiagnosticQuery::Layout => to_value(&self.layout().await)?,
            DiagnosticQuery::ClusterStates => to_value(&self.clusters().await)?,
            DiagnosticQuery::LiveSessions => to_value(&self.ipc.live_sessions().await)?,
            DiagnosticQuery::ProcessId => Value::from(std::process::id()),
            DiagnosticQuery::Uptime => Value::from(self.started_at.elapsed().as_millis() as u64),
        };
        Ok(value)
    }

    /// Hand an expression to one cluster's client.
    pub async fn eval_on_cluster(&self, cluster_id: ClusterId, expression: &str) -> Result<Value> {
        self.cluster(cluster_id).await?;
        self.ipc
            .request(
                cluster_id,
                Request::Eval {
                    expression: expression.to_string(),
                },
            )
            .await
    }

    /// Terminate every cluster and stop listening.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down sharding manager");
        for cluster in self.cluster_list().await {
            if let Err(e) = cluster.terminate().await {
                tracing::warn!(cluster_id = cluster.id(), "Failed to stop cluster: {}", e);
            }
        }
        if let Some(supervisor) = self.supervisor.lock().await.take() {
            supervisor.abort();
        }
        self.ipc.close().await;
    }

    /// Snapshot of every registered cluster, in id order.
    pub async fn clusters(&self) -> Vec<ClusterInfo> {
        self.cluster_list().await.iter().map(|c| c.info()).collect()
    }

    pub async fn layout(&self) -> Option<ShardLayout> {
        self.layout.read().await.clone()
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| ShardingError::eval(e.to_string()))
}
