//! Worker side of the channel.
//!
//! A worker connects to the manager, identifies itself, logs its client in
//! for its shard range, signals readiness and then serves requests until it
//! is told to shut down or the connection drops.

use std::sync::Arc;

use futures::{Sink, SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;

use super::codec::JsonCodec;
use super::protocol::{MasterFrame, Request, WorkerEvent, WorkerFrame};
use crate::client::ShardClient;
use crate::error::{Result, ShardingError};
use crate::events::CloseEvent;
use crate::partition::ShardId;
use crate::role::WorkerContext;

/// Handle a client uses to report shard events to the manager.
#[derive(Debug, Clone)]
pub struct ShardEventSink {
    tx: mpsc::UnboundedSender<WorkerFrame>,
    development: bool,
}

impl ShardEventSink {
    fn new(tx: mpsc::UnboundedSender<WorkerFrame>, development: bool) -> Self {
        Self { tx, development }
    }

    /// Sink not attached to a connection, for driving a client directly.
    pub fn detached(development: bool) -> (Self, mpsc::UnboundedReceiver<WorkerFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx, development), rx)
    }

    fn send(&self, event: WorkerEvent) {
        // The connection is gone; the worker is about to exit anyway.
        let _ = self.tx.send(WorkerFrame::Event { event });
    }

    pub fn shard_ready(&self, shard_id: ShardId) {
        self.send(WorkerEvent::ShardReady { shard_id });
    }

    pub fn shard_reconnect(&self, shard_id: ShardId) {
        self.send(WorkerEvent::ShardReconnect { shard_id });
    }

    pub fn shard_resume(&self, shard_id: ShardId, replayed: u64) {
        self.send(WorkerEvent::ShardResume { shard_id, replayed });
    }

    pub fn shard_disconnect(&self, shard_id: ShardId, close: CloseEvent) {
        self.send(WorkerEvent::ShardDisconnect { shard_id, close });
    }

    /// Forwarded only when the worker runs in development mode.
    pub fn debug(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!("{}", message);
        if self.development {
            self.send(WorkerEvent::Debug { message });
        }
    }

    pub fn error(&self, message: impl Into<String>) {
        self.send(WorkerEvent::Error {
            message: message.into(),
        });
    }

    pub fn message(&self, payload: Value) {
        self.send(WorkerEvent::Message { payload });
    }
}

/// Connect to the manager's socket and serve until shutdown.
#[cfg(unix)]
pub async fn run(ctx: WorkerContext, client: Arc<dyn ShardClient>) -> Result<()> {
    let stream = tokio::net::UnixStream::connect(&ctx.ipc_socket)
        .await
        .map_err(|e| ShardingError::io_with_source(&ctx.ipc_socket, "failed to connect to manager", e))?;
    serve(ctx, client, stream).await
}

#[cfg(not(unix))]
pub async fn run(ctx: WorkerContext, _client: Arc<dyn ShardClient>) -> Result<()> {
    Err(ShardingError::ipc(format!(
        "local sockets are not supported on this platform ({})",
        ctx.ipc_socket.display()
    )))
}

/// Run the worker protocol over an already connected stream.
pub async fn serve<S>(ctx: WorkerContext, client: Arc<dyn ShardClient>, stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let cluster_id = ctx.cluster_id;
    let framed = Framed::new(
        stream,
        JsonCodec::<WorkerFrame, MasterFrame>::new(ctx.max_frame_bytes),
    );
    let (mut sink, mut frames) = framed.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<WorkerFrame>();
    let (close_tx, mut close_rx) = oneshot::channel::<()>();

    // Frames queued before close are still flushed.
    let mut writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                frame = rx.recv() => match frame {
                    Some(frame) => write_frame(&mut sink, frame).await?,
                    None => break,
                },
                _ = &mut close_rx => {
                    while let Ok(frame) = rx.try_recv() {
                        write_frame(&mut sink, frame).await?;
                    }
                    break;
                }
            }
        }
        sink.close().await
    });

    let outbound = tx.clone();
    let send = move |frame: WorkerFrame| {
        outbound
            .send(frame)
            .map_err(|_| ShardingError::ipc("connection to manager closed"))
    };

    send(WorkerFrame::Identify {
        cluster_id,
        pid: std::process::id(),
    })?;

    tracing::info!(cluster_id, shards = %ctx.shards, "Logging in shard client");
    let events = ShardEventSink::new(tx.clone(), ctx.development);
    if let Err(e) = client.login(&ctx, events.clone()).await {
        events.error(format!("login failed: {}", e));
        let _ = close_tx.send(());
        let _ = writer.await;
        return Err(e);
    }

    send(WorkerFrame::Ready { cluster_id })?;
    tracing::info!(cluster_id, "Cluster ready");

    // The writer only finishes early when the connection is unusable.
    let mut writer_done = false;
    let result = loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(MasterFrame::Request { nonce, request })) => {
                    let client = Arc::clone(&client);
                    let shards = ctx.shards;
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let result = match request {
                            Request::FetchValue { path } => {
                                let mut values = Vec::with_capacity(shards.count() as usize);
                                let mut failure = None;
                                for shard_id in shards.iter() {
                                    match client.value(shard_id, &path).await {
                                        Ok(value) => values.push(value),
                                        Err(e) => {
                                            failure = Some(e);
                                            break;
                                        }
                                    }
                                }
                                match failure {
                                    Some(e) => Err(e),
                                    None => Ok(Value::Array(values)),
                                }
                            }
                            Request::Eval { expression } => client.eval(&expression).await,
                        };
                        let _ = tx.send(WorkerFrame::Reply { nonce, result });
                    });
                }
                Some(Ok(MasterFrame::Shutdown)) => {
                    tracing::info!(cluster_id, "Shutdown requested");
                    break Ok(());
                }
                Some(Err(e)) => break Err(e),
                None => {
                    tracing::warn!(cluster_id, "Manager connection closed");
                    break Ok(());
                }
            },
            joined = &mut writer => {
                writer_done = true;
                let e = match joined {
                    Ok(Err(e)) => e,
                    Ok(Ok(())) => ShardingError::ipc("frame writer stopped"),
                    Err(e) => ShardingError::ipc(format!("frame writer failed: {}", e)),
                };
                tracing::error!(cluster_id, "Failed to write to manager: {}", e);
                break Err(e);
            }
        }
    };

    client.shutdown().await;
    if !writer_done {
        let _ = close_tx.send(());
        match writer.await {
            Ok(Err(e)) => tracing::debug!("Failed to flush frames: {}", e),
            Err(e) => tracing::debug!("Writer task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }
    result
}

// Write one frame. A reply too large for the channel is answered with an
// error so the request does not hang; an oversized event is dropped.
async fn write_frame<S>(sink: &mut S, frame: WorkerFrame) -> Result<()>
where
    S: Sink<WorkerFrame, Error = ShardingError> + Unpin,
{
    let nonce = match &frame {
        WorkerFrame::Reply { nonce, .. } => Some(*nonce),
        _ => None,
    };
    match (sink.send(frame).await, nonce) {
        (Err(ShardingError::FrameTooLarge { size, limit }), Some(nonce)) => {
            tracing::warn!(nonce, size, limit, "Reply exceeds max frame size");
            sink.send(WorkerFrame::Reply {
                nonce,
                result: Err(format!(
                    "reply exceeds max frame size ({} bytes, limit {})",
                    size, limit
                )),
            })
            .await
        }
        (Err(ShardingError::FrameTooLarge { size, limit }), None) => {
            tracing::warn!(size, limit, "Dropping oversized frame");
            Ok(())
        }
        (result, _) => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::IdleClient;
    use crate::config::ShardingConfig;
    use crate::partition::ShardRange;
    use tokio::io::DuplexStream;

    type MasterSide = Framed<DuplexStream, JsonCodec<MasterFrame, WorkerFrame>>;

    fn context(development: bool) -> WorkerContext {
        let mut config = ShardingConfig::new("worker");
        config.development = development;
        WorkerContext::new(&config, 1, ShardRange::new(2, 4), 4)
    }

    fn start(development: bool) -> (MasterSide, tokio::task::JoinHandle<Result<()>>) {
        let (master_end, worker_end) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(serve(
            context(development),
            Arc::new(IdleClient::new()),
            worker_end,
        ));
        (Framed::new(master_end, JsonCodec::new(1 << 20)), task)
    }

    async fn until_ready(master: &mut MasterSide) -> Vec<WorkerFrame> {
        let mut seen = Vec::new();
        while let Some(frame) = master.next().await {
            let frame = frame.unwrap();
            let done = matches!(frame, WorkerFrame::Ready { .. });
            seen.push(frame);
            if done {
                break;
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_handshake_order() {
        let (mut master, task) = start(false);
        let frames = until_ready(&mut master).await;

        assert!(matches!(frames[0], WorkerFrame::Identify { cluster_id: 1, .. }));
        assert!(matches!(frames.last(), Some(WorkerFrame::Ready { cluster_id: 1 })));
        let ready_shards: Vec<_> = frames
            .iter()
            .filter_map(|f| match f {
                WorkerFrame::Event {
                    event: WorkerEvent::ShardReady { shard_id },
                } => Some(*shard_id),
                _ => None,
            })
            .collect();
        assert_eq!(ready_shards, vec![2, 3]);
        // Debug lines stay local outside development mode
        assert!(!frames.iter().any(|f| matches!(
            f,
            WorkerFrame::Event {
                event: WorkerEvent::Debug { .. }
            }
        )));

        master.send(MasterFrame::Shutdown).await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_development_forwards_debug() {
        let (mut master, task) = start(true);
        let frames = until_ready(&mut master).await;
        assert!(frames.iter().any(|f| matches!(
            f,
            WorkerFrame::Event {
                event: WorkerEvent::Debug { .. }
            }
        )));

        drop(master);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_fetch_value_and_eval() {
        let (mut master, task) = start(false);
        until_ready(&mut master).await;

        master
            .send(MasterFrame::Request {
                nonce: 1,
                request: Request::FetchValue { path: "id".into() },
            })
            .await
            .unwrap();
        master
            .send(MasterFrame::Request {
                nonce: 2,
                request: Request::Eval {
                    expression: "rm -rf".into(),
                },
            })
            .await
            .unwrap();

        let mut replies = std::collections::HashMap::new();
        while replies.len() < 2 {
            if let WorkerFrame::Reply { nonce, result } = master.next().await.unwrap().unwrap() {
                replies.insert(nonce, result);
            }
        }

        assert_eq!(replies[&1], Ok(serde_json::json!([2, 3])));
        // A failing eval is answered, not fatal
        assert!(replies[&2].is_err());

        master.send(MasterFrame::Shutdown).await.unwrap();
        task.await.unwrap().unwrap();
    }

    async fn next_reply(
        master: &mut MasterSide,
    ) -> (u64, std::result::Result<Value, String>) {
        loop {
            if let WorkerFrame::Reply { nonce, result } = master.next().await.unwrap().unwrap() {
                return (nonce, result);
            }
        }
    }

    #[tokio::test]
    async fn test_oversized_reply_answered_with_error() {
        let mut config = ShardingConfig::new("worker");
        config.ipc.max_frame_bytes = 1024;
        config
            .client_options
            .insert("big".into(), Value::String("x".repeat(4096)));
        let ctx = WorkerContext::new(&config, 1, ShardRange::new(2, 4), 4);

        let (master_end, worker_end) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(serve(ctx, Arc::new(IdleClient::new()), worker_end));
        let mut master: MasterSide = Framed::new(master_end, JsonCodec::new(1 << 20));
        until_ready(&mut master).await;

        master
            .send(MasterFrame::Request {
                nonce: 1,
                request: Request::FetchValue {
                    path: "options.big".into(),
                },
            })
            .await
            .unwrap();
        let (nonce, result) = next_reply(&mut master).await;
        assert_eq!(nonce, 1);
        assert!(result.unwrap_err().contains("max frame size"));

        // The connection is still serving
        master
            .send(MasterFrame::Request {
                nonce: 2,
                request: Request::Eval {
                    expression: "ping".into(),
                },
            })
            .await
            .unwrap();
        assert_eq!(
            next_reply(&mut master).await,
            (2, Ok(serde_json::json!("pong")))
        );

        master.send(MasterFrame::Shutdown).await.unwrap();
        task.await.unwrap().unwrap();
    }

    struct BrokenClient;

    #[async_trait::async_trait]
    impl ShardClient for BrokenClient {
        async fn login(&self, _ctx: &WorkerContext, _events: ShardEventSink) -> Result<()> {
            Err(ShardingError::upstream("invalid session"))
        }

        async fn value(&self, _: ShardId, _: &str) -> std::result::Result<Value, String> {
            Err("offline".into())
        }

        async fn eval(&self, _: &str) -> std::result::Result<Value, String> {
            Err("offline".into())
        }

        async fn shutdown(&self) {}
    }

    #[tokio::test]
    async fn test_login_failure_reports_and_exits() {
        let (master_end, worker_end) = tokio::io::duplex(64 * 1024);
        let mut master: MasterSide = Framed::new(master_end, JsonCodec::new(1 << 20));
        let result = serve(context(false), Arc::new(BrokenClient), worker_end).await;
        assert!(result.is_err());

        assert!(matches!(
            master.next().await.unwrap().unwrap(),
            WorkerFrame::Identify { .. }
        ));
        assert!(matches!(
            master.next().await.unwrap().unwrap(),
            WorkerFrame::Event {
                event: WorkerEvent::Error { .. }
            }
        ));
    }
}
