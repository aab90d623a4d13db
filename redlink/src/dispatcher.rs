//! Command dispatch and reply correlation
//!
//! This is the synchronization layer between many logical callers and
//! few physical connections. Each connection is wrapped by a writer task
//! and a reader task joined by a FIFO queue of reply slots: the writer
//! appends a slot after every frame it writes, the reader resolves slots
//! strictly in queue order. Head-of-line ordering is therefore
//! structural: a later request cannot resolve before an earlier one on
//! the same connection, no matter how replies are chunked.
//!
//! A caller that gives up on a reply (timeout, dropped future) cannot
//! corrupt the queue: its slot is still consumed when the reply arrives,
//! and the result is simply discarded.

use crate::command::Command;
use crate::connection::{ConnectionReader, ConnectionWriter, RedisConnection};
use crate::pool::{ConnectionPool, ServerConnectionProvider};
use crate::protocol::RespEncoder;
use bytes::Bytes;
use redlink_core::{
    config::ConnectionConfig,
    error::{RedisError, RedisResult},
    types::Endpoint,
    value::Reply,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, warn};

enum DispatchRequest {
    Single {
        frame: Bytes,
        reply_tx: oneshot::Sender<RedisResult<Reply>>,
    },
    Batch {
        frame: Bytes,
        count: usize,
        reply_tx: oneshot::Sender<RedisResult<Vec<Reply>>>,
    },
}

/// One entry in a connection's pending-reply queue
enum PendingReply {
    Single(oneshot::Sender<RedisResult<Reply>>),
    Batch {
        count: usize,
        reply_tx: oneshot::Sender<RedisResult<Vec<Reply>>>,
    },
}

impl PendingReply {
    fn fail(self, context: &str) {
        match self {
            Self::Single(reply_tx) => {
                let _ = reply_tx.send(Err(RedisError::ConnectionLost(context.to_string())));
            }
            Self::Batch { reply_tx, .. } => {
                let _ = reply_tx.send(Err(RedisError::ConnectionLost(context.to_string())));
            }
        }
    }
}

/// A connection wrapped for pipelined use by many callers
///
/// Cheap to clone; all clones share the same underlying connection and
/// its reply queue.
#[derive(Clone)]
pub struct PipelinedConnection {
    request_tx: mpsc::UnboundedSender<DispatchRequest>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl PipelinedConnection {
    /// Split the connection and start its writer/reader task pair
    #[must_use]
    pub fn spawn(connection: RedisConnection) -> Self {
        let (reader, writer) = connection.into_split();
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let closed = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(shutdown_tx);

        tokio::spawn(write_loop(
            writer,
            request_rx,
            pending_tx,
            Arc::clone(&closed),
            Arc::clone(&shutdown),
            shutdown_rx.clone(),
        ));
        tokio::spawn(read_loop(
            reader,
            pending_rx,
            Arc::clone(&closed),
            Arc::clone(&shutdown),
            shutdown_rx,
        ));

        Self {
            request_tx,
            closed,
            shutdown,
        }
    }

    /// Enqueue one frame; the returned receiver resolves with the reply
    /// once it reaches the head of this connection's queue.
    pub(crate) fn submit(
        &self,
        frame: Bytes,
    ) -> RedisResult<oneshot::Receiver<RedisResult<Reply>>> {
        self.ensure_open()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx
            .send(DispatchRequest::Single { frame, reply_tx })
            .map_err(|_| RedisError::ConnectionLost("dispatch task stopped".to_string()))?;
        Ok(reply_rx)
    }

    /// Enqueue a contiguous batch frame expecting `count` replies
    pub(crate) fn submit_batch(
        &self,
        frame: Bytes,
        count: usize,
    ) -> RedisResult<oneshot::Receiver<RedisResult<Vec<Reply>>>> {
        self.ensure_open()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx
            .send(DispatchRequest::Batch {
                frame,
                count,
                reply_tx,
            })
            .map_err(|_| RedisError::ConnectionLost("dispatch task stopped".to_string()))?;
        Ok(reply_rx)
    }

    /// Whether the connection has been lost or poisoned
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Mark the connection unusable and wake its tasks.
    ///
    /// Used when a reply timed out: a slow or partial reply leaves the
    /// stream position ambiguous for every queued request, so the
    /// connection is closed rather than resynchronized.
    pub fn poison(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
    }

    fn ensure_open(&self) -> RedisResult<()> {
        if self.is_closed() {
            return Err(RedisError::ConnectionLost(
                "connection is closed".to_string(),
            ));
        }
        Ok(())
    }
}

async fn write_loop(
    mut writer: ConnectionWriter,
    mut request_rx: mpsc::UnboundedReceiver<DispatchRequest>,
    pending_tx: mpsc::UnboundedSender<PendingReply>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<watch::Sender<bool>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let request = tokio::select! {
            request = request_rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
            _ = shutdown_rx.changed() => break,
        };

        let (frame, pending) = match request {
            DispatchRequest::Single { frame, reply_tx } => (frame, PendingReply::Single(reply_tx)),
            DispatchRequest::Batch {
                frame,
                count,
                reply_tx,
            } => (frame, PendingReply::Batch { count, reply_tx }),
        };

        if let Err(e) = writer.write_frame(&frame).await {
            warn!("dropping connection after write failure: {e}");
            closed.store(true, Ordering::SeqCst);
            let _ = shutdown.send(true);
            pending.fail("connection lost before the request was written");
            break;
        }

        // the slot enters the queue only after a successful write, so
        // the reader's queue order is exactly the write order
        if pending_tx.send(pending).is_err() {
            break;
        }
    }
    writer.shutdown().await;
}

async fn read_loop(
    mut reader: ConnectionReader,
    mut pending_rx: mpsc::UnboundedReceiver<PendingReply>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<watch::Sender<bool>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    'main: loop {
        let pending = tokio::select! {
            pending = pending_rx.recv() => match pending {
                Some(pending) => pending,
                None => break,
            },
            _ = shutdown_rx.changed() => {
                fail_queued(&mut pending_rx, "connection closed");
                break;
            }
        };

        match pending {
            PendingReply::Single(reply_tx) => {
                match next_reply(&mut reader, &mut shutdown_rx).await {
                    Ok(reply) => {
                        // a dropped receiver means the caller went away;
                        // the reply is discarded, ordering is preserved
                        let _ = reply_tx.send(Ok(reply));
                    }
                    Err(e) => {
                        closed.store(true, Ordering::SeqCst);
                        let _ = shutdown.send(true);
                        let _ = reply_tx.send(Err(e));
                        fail_queued(&mut pending_rx, "connection lost with requests in flight");
                        break 'main;
                    }
                }
            }
            PendingReply::Batch { count, reply_tx } => {
                let mut replies = Vec::with_capacity(count);
                let mut failure = None;
                for _ in 0..count {
                    match next_reply(&mut reader, &mut shutdown_rx).await {
                        Ok(reply) => replies.push(reply),
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
                match failure {
                    None => {
                        let _ = reply_tx.send(Ok(replies));
                    }
                    Some(e) => {
                        closed.store(true, Ordering::SeqCst);
                        let _ = shutdown.send(true);
                        let _ = reply_tx.send(Err(e));
                        fail_queued(&mut pending_rx, "connection lost with requests in flight");
                        break 'main;
                    }
                }
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
}

/// Next correlated reply; out-of-band push frames are not part of the
/// request/response stream and are skipped.
async fn next_reply(
    reader: &mut ConnectionReader,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> RedisResult<Reply> {
    loop {
        let reply = tokio::select! {
            reply = reader.read_reply() => reply?,
            _ = shutdown_rx.changed() => {
                return Err(RedisError::ConnectionLost(
                    "connection closed while awaiting a reply".to_string(),
                ));
            }
        };

        if let Reply::Push(items) = reply {
            debug!("ignoring out-of-band push frame ({} elements)", items.len());
            continue;
        }
        return Ok(reply);
    }
}

fn fail_queued(pending_rx: &mut mpsc::UnboundedReceiver<PendingReply>, context: &str) {
    pending_rx.close();
    while let Ok(pending) = pending_rx.try_recv() {
        pending.fail(context);
    }
}

/// Executes commands against one endpoint through a bounded pool of
/// pipelined connections
pub struct Dispatcher {
    pool: ConnectionPool,
    operation_timeout: Duration,
}

impl Dispatcher {
    /// Create a dispatcher over an existing pool
    pub fn new(pool: ConnectionPool, operation_timeout: Duration) -> Self {
        Self {
            pool,
            operation_timeout,
        }
    }

    /// Create a dispatcher that dials the given endpoint on demand
    #[must_use]
    pub fn for_endpoint(endpoint: Endpoint, config: &ConnectionConfig) -> Self {
        let provider = Arc::new(ServerConnectionProvider::new(endpoint, config.clone()));
        Self::new(
            ConnectionPool::new(provider, &config.pool),
            config.operation_timeout,
        )
    }

    /// Execute one command and resolve with its decoded reply.
    ///
    /// The connection returns to the pool as soon as the request is
    /// queued, so other callers can pipeline onto it while this reply is
    /// still in flight.
    pub async fn execute(&self, command: &Command) -> RedisResult<Reply> {
        let frame = RespEncoder::command_bytes(command);
        let pooled = self.pool.acquire().await?;
        let handle = pooled.handle();
        let submitted = handle.submit(frame);
        self.pool.release(pooled).await;
        let reply_rx = submitted?;

        let reply = match timeout(self.operation_timeout, reply_rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => {
                return Err(RedisError::ConnectionLost(
                    "reply slot dropped".to_string(),
                ))
            }
            Err(_) => {
                handle.poison();
                return Err(RedisError::Timeout);
            }
        };

        match reply {
            Reply::Error(msg) => Err(RedisError::from_server_error(&msg)),
            reply => Ok(reply),
        }
    }

    /// Execute a batch: all commands are written back-to-back on one
    /// connection with nothing interleaved, and replies come back in
    /// command order.
    ///
    /// If the server signals an aborted transaction the whole batch
    /// fails with `TransactionAborted`; other per-command error replies
    /// are returned in place.
    pub async fn execute_batch(&self, commands: &[Command]) -> RedisResult<Vec<Reply>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }

        let frame = RespEncoder::batch_bytes(commands);
        let pooled = self.pool.acquire().await?;
        let handle = pooled.handle();
        let submitted = handle.submit_batch(frame, commands.len());
        self.pool.release(pooled).await;
        let reply_rx = submitted?;

        let replies = match timeout(self.operation_timeout, reply_rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => {
                return Err(RedisError::ConnectionLost(
                    "reply slot dropped".to_string(),
                ))
            }
            Err(_) => {
                handle.poison();
                return Err(RedisError::Timeout);
            }
        };

        let abort_reply = replies
            .iter()
            .any(|reply| matches!(reply, Reply::Error(msg) if msg.starts_with("EXECABORT")));
        let nil_exec = commands.first().is_some_and(|c| c.name() == "MULTI")
            && commands.last().is_some_and(|c| c.name() == "EXEC")
            && matches!(replies.last(), Some(Reply::Null));
        if abort_reply || nil_exec {
            return Err(RedisError::TransactionAborted);
        }

        Ok(replies)
    }
}
