//! Manager side of the channel.
//!
//! `MasterIpc` accepts worker connections, tracks one session per cluster,
//! correlates requests with replies and forwards worker events to the
//! manager's [`EventBus`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use uuid::Uuid;

use super::codec::JsonCodec;
use super::protocol::{MasterFrame, Nonce, Request, WorkerFrame};
use crate::config::IpcConfig;
use crate::error::{Result, ShardingError};
use crate::events::EventBus;
use crate::partition::ClusterId;

type PendingMap = HashMap<Nonce, oneshot::Sender<Result<Value>>>;

/// Pause after a failed accept before trying again.
#[cfg(unix)]
const ACCEPT_BACKOFF: std::time::Duration = std::time::Duration::from_millis(100);

/// One live worker connection.
struct Session {
    id: Uuid,
    cluster_id: ClusterId,
    pid: u32,
    connected_at: DateTime<Utc>,
    outbound: mpsc::UnboundedSender<MasterFrame>,
    // `None` once the connection has closed.
    pending: Mutex<Option<PendingMap>>,
}

impl Session {
    fn new(cluster_id: ClusterId, pid: u32, outbound: mpsc::UnboundedSender<MasterFrame>) -> Self {
        Self {
            id: Uuid::new_v4(),
            cluster_id,
            pid,
            connected_at: Utc::now(),
            outbound,
            pending: Mutex::new(Some(HashMap::new())),
        }
    }

    async fn resolve(&self, nonce: Nonce, result: Result<Value>) {
        let sender = self
            .pending
            .lock()
            .await
            .as_mut()
            .and_then(|pending| pending.remove(&nonce));
        match sender {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => tracing::debug!(
                cluster_id = self.cluster_id,
                nonce,
                "Dropping reply for unknown or expired request"
            ),
        }
    }

    /// Fail everything in flight and refuse new requests.
    async fn close(&self) {
        let Some(pending) = self.pending.lock().await.take() else {
            return;
        };
        for (_, tx) in pending {
            let _ = tx.send(Err(ShardingError::ipc(format!(
                "cluster {} disconnected before replying",
                self.cluster_id
            ))));
        }
    }
}

/// Snapshot of a registered session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub cluster_id: ClusterId,
    pub pid: u32,
    pub connected_at: DateTime<Utc>,
}

pub struct MasterIpc {
    socket_path: PathBuf,
    config: IpcConfig,
    events: EventBus,
    sessions: RwLock<HashMap<ClusterId, Arc<Session>>>,
    ready_waiters: Mutex<HashMap<ClusterId, oneshot::Sender<()>>>,
    next_nonce: AtomicU64,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl MasterIpc {
    pub fn new(socket_path: impl Into<PathBuf>, config: IpcConfig, events: EventBus) -> Self {
        Self {
            socket_path: socket_path.into(),
            config,
            events,
            sessions: RwLock::new(HashMap::new()),
            ready_waiters: Mutex::new(HashMap::new()),
            next_nonce: AtomicU64::new(1),
            listener: Mutex::new(None),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket and accept worker connections in the background.
    ///
    /// A stale socket left by a previous run is removed first. Any other
    /// kind of file at the path is left alone and binding fails.
    #[cfg(unix)]
    pub async fn listen(self: &Arc<Self>) -> Result<()> {
        use std::os::unix::fs::FileTypeExt;
        use tokio::net::UnixListener;

        let mut slot = self.listener.lock().await;
        if slot.is_some() {
            return Err(ShardingError::invalid_state("IPC listener already running"));
        }

        match std::fs::symlink_metadata(&self.socket_path) {
            Ok(meta) if meta.file_type().is_socket() => {
                std::fs::remove_file(&self.socket_path).map_err(|e| {
                    ShardingError::io_with_source(
                        &self.socket_path,
                        "failed to remove stale socket",
                        e,
                    )
                })?;
            }
            Ok(_) => {
                return Err(ShardingError::io(
                    &self.socket_path,
                    "path exists and is not a socket",
                ))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(ShardingError::io_with_source(
                    &self.socket_path,
                    "failed to inspect socket path",
                    e,
                ))
            }
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(|e| {
            ShardingError::io_with_source(&self.socket_path, "failed to bind IPC socket", e)
        })?;
        tracing::info!(path = %self.socket_path.display(), "IPC listening");

        let this = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        this.attach(stream);
                    }
                    Err(e) => {
                        // Errors such as EMFILE persist; don't spin on them.
                        tracing::warn!("Failed to accept IPC connection: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }));

        Ok(())
    }

    #[cfg(not(unix))]
    pub async fn listen(self: &Arc<Self>) -> Result<()> {
        Err(ShardingError::ipc(format!(
            "local sockets are not supported on this platform ({})",
            self.socket_path.display()
        )))
    }

    /// Serve one worker connection on any byte stream.
    pub fn attach<S>(self: &Arc<Self>, stream: S) -> JoinHandle<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.handle_connection(stream).await {
                tracing::warn!("IPC connection ended with error: {}", e);
            }
        })
    }

    async fn handle_connection<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let framed = Framed::new(
            stream,
            JsonCodec::<MasterFrame, WorkerFrame>::new(self.config.max_frame_bytes),
        );
        let (mut sink, mut frames) = framed.split();

        let (cluster_id, pid) = match frames.next().await {
            Some(Ok(WorkerFrame::Identify { cluster_id, pid })) => (cluster_id, pid),
            Some(Ok(other)) => {
                return Err(ShardingError::ipc(format!(
                    "expected identify frame, got {:?}",
                    other
                )))
            }
            Some(Err(e)) => return Err(e),
            None => return Ok(()),
        };
        tracing::debug!(cluster_id, pid, "Worker connected");

        let (tx, mut rx) = mpsc::unbounded_channel::<MasterFrame>();
        let session = Arc::new(Session::new(cluster_id, pid, tx));

        // An oversized request fails on its own; any other write failure
        // ends the connection.
        let writer_session = Arc::clone(&session);
        let mut writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let nonce = match &frame {
                    MasterFrame::Request { nonce, .. } => Some(*nonce),
                    MasterFrame::Shutdown => None,
                };
                match (sink.send(frame).await, nonce) {
                    (Ok(()), _) => {}
                    (Err(e @ ShardingError::FrameTooLarge { .. }), Some(nonce)) => {
                        tracing::warn!(cluster_id, nonce, "Request not sent: {}", e);
                        writer_session.resolve(nonce, Err(e)).await;
                    }
                    (Err(e), _) => return Err(e),
                }
            }
            Ok::<_, ShardingError>(())
        });

        let result = loop {
            tokio::select! {
                frame = frames.next() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => break Err(e),
                        None => break Ok(()),
                    };
                    match frame {
                        WorkerFrame::Identify { .. } => {
                            tracing::warn!(cluster_id, "Ignoring repeated identify frame");
                        }
                        WorkerFrame::Ready { .. } => self.register(Arc::clone(&session)).await,
                        WorkerFrame::Event { event } => {
                            self.events.emit(event.into_sharding_event(cluster_id));
                        }
                        WorkerFrame::Reply { nonce, result } => {
                            session
                                .resolve(nonce, result.map_err(ShardingError::eval))
                                .await;
                        }
                    }
                }
                joined = &mut writer => {
                    let e = match joined {
                        Ok(Err(e)) => e,
                        Ok(Ok(())) => ShardingError::ipc("frame writer stopped"),
                        Err(e) => ShardingError::ipc(format!("frame writer failed: {}", e)),
                    };
                    tracing::warn!(cluster_id, "Failed to write frame: {}", e);
                    break Err(e);
                }
            }
        };

        writer.abort();
        self.detach(&session).await;
        tracing::debug!(cluster_id, "Worker disconnected");
        result
    }

    async fn register(&self, session: Arc<Session>) {
        let cluster_id = session.cluster_id;
        let previous = self.sessions.write().await.insert(cluster_id, session);
        if let Some(previous) = previous {
            previous.close().await;
        }

        if let Some(waiter) = self.ready_waiters.lock().await.remove(&cluster_id) {
            let _ = waiter.send(());
        }
    }

    async fn detach(&self, session: &Arc<Session>) {
        {
            let mut sessions = self.sessions.write().await;
            // A replacement may already be registered under the same id.
            if sessions
                .get(&session.cluster_id)
                .is_some_and(|current| current.id == session.id)
            {
                sessions.remove(&session.cluster_id);
            }
        }
        session.close().await;
    }

    /// Register interest in the next `ready` frame from a cluster.
    pub async fn expect_ready(&self, cluster_id: ClusterId) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.ready_waiters.lock().await.insert(cluster_id, tx);
        rx
    }

    pub async fn cancel_ready(&self, cluster_id: ClusterId) {
        self.ready_waiters.lock().await.remove(&cluster_id);
    }

    async fn session(&self, cluster_id: ClusterId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&cluster_id).cloned()
    }

    /// Send a request to one cluster and wait for its reply.
    pub async fn request(&self, cluster_id: ClusterId, request: Request) -> Result<Value> {
        let session = self.session(cluster_id).await.ok_or_else(|| {
            ShardingError::ipc(format!("cluster {} has no live session", cluster_id))
        })?;
        self.request_session(&session, request).await
    }

    async fn request_session(&self, session: &Session, request: Request) -> Result<Value> {
        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = session.pending.lock().await;
            let Some(pending) = pending.as_mut() else {
                return Err(ShardingError::ipc(format!(
                    "cluster {} disconnected",
                    session.cluster_id
                )));
            };
            pending.insert(nonce, tx);
        }

        if session
            .outbound
            .send(MasterFrame::Request { nonce, request })
            .is_err()
        {
            session.resolve(nonce, Err(ShardingError::ipc("connection closed"))).await;
        }

        let timeout = self.config.request_timeout();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ShardingError::ipc(format!(
                "cluster {} dropped the request",
                session.cluster_id
            ))),
            Err(_) => {
                if let Some(pending) = session.pending.lock().await.as_mut() {
                    pending.remove(&nonce);
                }
                Err(ShardingError::timeout(
                    format!("reply from cluster {}", session.cluster_id),
                    timeout.as_millis() as u64,
                ))
            }
        }
    }

    /// Send a request to every live cluster concurrently.
    ///
    /// Results are ordered by cluster id; one cluster failing does not
    /// affect the others.
    pub async fn broadcast(&self, request: Request) -> Vec<(ClusterId, Result<Value>)> {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();

        let replies = sessions.iter().map(|session| {
            let request = request.clone();
            async move {
                (
                    session.cluster_id,
                    self.request_session(session, request).await,
                )
            }
        });

        let mut results = join_all(replies).await;
        results.sort_by_key(|(cluster_id, _)| *cluster_id);
        results
    }

    /// Ask a cluster to log out and exit. Returns `false` when it has no
    /// live session.
    pub async fn send_shutdown(&self, cluster_id: ClusterId) -> bool {
        match self.session(cluster_id).await {
            Some(session) => session.outbound.send(MasterFrame::Shutdown).is_ok(),
            None => false,
        }
    }

    pub async fn is_live(&self, cluster_id: ClusterId) -> bool {
        self.sessions.read().await.contains_key(&cluster_id)
    }

    pub async fn live_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .read()
            .await
            .values()
            .map(|s| SessionInfo {
                cluster_id: s.cluster_id,
                pid: s.pid,
                connected_at: s.connected_at,
            })
            .collect();
        sessions.sort_by_key(|s| s.cluster_id);
        sessions
    }

    /// Stop accepting connections and remove the socket file.
    pub async fn close(&self) {
        if let Some(listener) = self.listener.lock().await.take() {
            listener.abort();
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                tracing::debug!("Failed to remove socket file: {}", e);
            }
        }
        self.ready_waiters.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ShardingEvent;
    use crate::ipc::protocol::WorkerEvent;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{DuplexStream, ReadBuf};

    type WorkerSide = Framed<DuplexStream, JsonCodec<WorkerFrame, MasterFrame>>;

    fn ipc_with_timeout(ms: u64) -> Arc<MasterIpc> {
        let config = IpcConfig {
            request_timeout_ms: ms,
            ..Default::default()
        };
        Arc::new(MasterIpc::new("/unused.sock", config, EventBus::new(64)))
    }

    async fn connect(ipc: &Arc<MasterIpc>, cluster_id: ClusterId) -> WorkerSide {
        let ready = ipc.expect_ready(cluster_id).await;
        let (master_end, worker_end) = tokio::io::duplex(64 * 1024);
        ipc.attach(master_end);

        let mut worker = Framed::new(worker_end, JsonCodec::new(1024 * 1024));
        worker
            .send(WorkerFrame::Identify {
                cluster_id,
                pid: 1000 + cluster_id,
            })
            .await
            .unwrap();
        worker.send(WorkerFrame::Ready { cluster_id }).await.unwrap();
        ready.await.unwrap();
        worker
    }

    // Answer every request with the cluster id, or stall if `silent`.
    fn echo(mut worker: WorkerSide, cluster_id: ClusterId, silent: bool) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(Ok(frame)) = worker.next().await {
                if let MasterFrame::Request { nonce, .. } = frame {
                    if silent {
                        continue;
                    }
                    let reply = WorkerFrame::Reply {
                        nonce,
                        result: Ok(serde_json::json!([cluster_id])),
                    };
                    if worker.send(reply).await.is_err() {
                        break;
                    }
                }
            }
        })
    }

    #[tokio::test]
    async fn test_ready_registers_session() {
        let ipc = ipc_with_timeout(1000);
        let _worker = connect(&ipc, 4).await;

        assert!(ipc.is_live(4).await);
        let sessions = ipc.live_sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].pid, 1004);
    }

    #[tokio::test]
    async fn test_request_reply() {
        let ipc = ipc_with_timeout(1000);
        let worker = connect(&ipc, 0).await;
        let _task = echo(worker, 0, false);

        let value = ipc
            .request(0, Request::Eval { expression: "x".into() })
            .await
            .unwrap();
        assert_eq!(value, serde_json::json!([0]));
    }

    #[tokio::test]
    async fn test_error_reply_is_eval_error() {
        let ipc = ipc_with_timeout(1000);
        let mut worker = connect(&ipc, 0).await;

        let responder = tokio::spawn(async move {
            if let Some(Ok(MasterFrame::Request { nonce, .. })) = worker.next().await {
                worker
                    .send(WorkerFrame::Reply {
                        nonce,
                        result: Err("no such property".into()),
                    })
                    .await
                    .unwrap();
            }
            worker
        });

        let err = ipc
            .request(0, Request::FetchValue { path: "nope".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, ShardingError::Eval { .. }));
        drop(responder.await.unwrap());
    }

    #[tokio::test]
    async fn test_broadcast_isolates_slow_cluster() {
        let ipc = ipc_with_timeout(200);
        let _a = echo(connect(&ipc, 0).await, 0, false);
        let _b = echo(connect(&ipc, 1).await, 1, true);
        let _c = echo(connect(&ipc, 2).await, 2, false);

        let results = ipc
            .broadcast(Request::FetchValue { path: "id".into() })
            .await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].0, 0);
        assert!(results[0].1.is_ok());
        assert!(matches!(results[1].1, Err(ShardingError::Timeout { .. })));
        assert_eq!(results[2].1.as_ref().unwrap(), &serde_json::json!([2]));
    }

    #[tokio::test]
    async fn test_disconnect_fails_in_flight_request() {
        let ipc = ipc_with_timeout(5_000);
        let mut worker = connect(&ipc, 0).await;

        let hangup = tokio::spawn(async move {
            // Read the request, then hang up without replying
            let _ = worker.next().await;
            drop(worker);
        });

        let started = std::time::Instant::now();
        let err = ipc
            .request(0, Request::Eval { expression: "x".into() })
            .await
            .unwrap_err();
        hangup.await.unwrap();

        assert!(matches!(err, ShardingError::Ipc { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));

        // Session is gone after the connection closes
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!ipc.is_live(0).await);
    }

    #[tokio::test]
    async fn test_events_forwarded_with_origin() {
        let ipc = ipc_with_timeout(1000);
        let mut rx = ipc.events.subscribe();
        let mut worker = connect(&ipc, 3).await;

        worker
            .send(WorkerFrame::Event {
                event: WorkerEvent::Message {
                    payload: serde_json::json!({"hello": "world"}),
                },
            })
            .await
            .unwrap();

        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Ok(ShardingEvent::Message {
                cluster_id,
                payload,
            })) => {
                assert_eq!(cluster_id, 3);
                assert_eq!(payload["hello"], "world");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_without_session() {
        let ipc = ipc_with_timeout(1000);
        let err = ipc
            .request(9, Request::Eval { expression: "x".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, ShardingError::Ipc { .. }));
        assert!(!ipc.send_shutdown(9).await);
    }

    // Reads from the worker but fails every write.
    struct BrokenWrites(DuplexStream);

    impl AsyncRead for BrokenWrites {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.0).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for BrokenWrites {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "write refused",
            )))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_write_failure_detaches_session() {
        let ipc = ipc_with_timeout(5_000);
        let ready = ipc.expect_ready(0).await;
        let (master_end, worker_end) = tokio::io::duplex(64 * 1024);
        let connection = ipc.attach(BrokenWrites(master_end));

        let mut worker: WorkerSide = Framed::new(worker_end, JsonCodec::new(1 << 20));
        worker
            .send(WorkerFrame::Identify {
                cluster_id: 0,
                pid: 1,
            })
            .await
            .unwrap();
        worker.send(WorkerFrame::Ready { cluster_id: 0 }).await.unwrap();
        ready.await.unwrap();

        // Fails as soon as the write does, not at the request timeout
        let started = std::time::Instant::now();
        let err = ipc
            .request(0, Request::Eval { expression: "x".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, ShardingError::Ipc { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));

        tokio::time::timeout(Duration::from_secs(1), connection)
            .await
            .unwrap()
            .unwrap();
        assert!(!ipc.is_live(0).await);
    }

    #[tokio::test]
    async fn test_oversized_request_fails_alone() {
        let config = IpcConfig {
            request_timeout_ms: 5_000,
            max_frame_bytes: 1024,
            ..Default::default()
        };
        let ipc = Arc::new(MasterIpc::new("/unused.sock", config, EventBus::new(16)));
        let _task = echo(connect(&ipc, 0).await, 0, false);

        let err = ipc
            .request(
                0,
                Request::Eval {
                    expression: "x".repeat(4096),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ShardingError::FrameTooLarge { limit: 1024, .. }));

        // The session keeps serving
        assert!(ipc.is_live(0).await);
        let value = ipc
            .request(0, Request::Eval { expression: "x".into() })
            .await
            .unwrap();
        assert_eq!(value, serde_json::json!([0]));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_listen_refuses_non_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipc.sock");
        std::fs::write(&path, b"keep me").unwrap();

        let ipc = Arc::new(MasterIpc::new(&path, IpcConfig::default(), EventBus::new(16)));
        assert!(matches!(ipc.listen().await, Err(ShardingError::Io { .. })));
        assert_eq!(std::fs::read(&path).unwrap(), b"keep me");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_listen_over_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipc.sock");
        // Stale socket from a previous run
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let ipc = Arc::new(MasterIpc::new(&path, IpcConfig::default(), EventBus::new(16)));
        ipc.listen().await.unwrap();
        assert!(ipc.listen().await.is_err());

        let ready = ipc.expect_ready(0).await;
        let stream = tokio::net::UnixStream::connect(&path).await.unwrap();
        let mut worker = Framed::new(stream, JsonCodec::<WorkerFrame, MasterFrame>::new(1 << 20));
        worker
            .send(WorkerFrame::Identify {
                cluster_id: 0,
                pid: 1,
            })
            .await
            .unwrap();
        worker.send(WorkerFrame::Ready { cluster_id: 0 }).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), ready)
            .await
            .unwrap()
            .unwrap();

        assert!(ipc.send_shutdown(0).await);
        assert_eq!(worker.next().await.unwrap().unwrap(), MasterFrame::Shutdown);

        ipc.close().await;
        assert!(!path.exists());
    }
}
