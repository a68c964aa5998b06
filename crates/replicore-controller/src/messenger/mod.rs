//! # Messenger
//!
//! One persistent wire connection per worker with a FIFO send queue.
//! Each connection is an actor task owning the socket: outbound exchanges
//! are written in submission order, responses are routed back to the
//! waiting caller by request id, and transport failures abort all in-flight
//! exchanges while the actor reconnects with capped exponential back-off.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use replicore_shared::config::{ReplicoreConfig, WorkerIdentity};
use replicore_shared::errors::{ReplicaError, ReplicaResult};
use replicore_shared::protocol::codec::FrameCodec;
use replicore_shared::protocol::{decode_body, encode_body, RequestHeader, ResponseHeader};

/// Queue depth per worker connection
const SEND_QUEUE_DEPTH: usize = 256;

/// A decoded reply: the response header and its typed body frame
#[derive(Debug, Clone)]
pub struct WireResponse {
    pub header: ResponseHeader,
    pub body: Bytes,
}

#[derive(Debug)]
struct Outbound {
    header: RequestHeader,
    body: Bytes,
    /// Dropped (not sent) for fire-and-forget exchanges
    reply: Option<oneshot::Sender<ReplicaResult<WireResponse>>>,
}

/// The per-worker connection registry
#[derive(Debug)]
pub struct Messenger {
    config: Arc<ReplicoreConfig>,
    channels: std::sync::Mutex<HashMap<String, mpsc::Sender<Outbound>>>,
}

impl Messenger {
    pub fn new(config: Arc<ReplicoreConfig>) -> Arc<Self> {
        Arc::new(Self {
            config,
            channels: std::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Send one exchange and await the worker's reply
    pub async fn send(
        &self,
        worker: &str,
        header: RequestHeader,
        body: Bytes,
    ) -> ReplicaResult<WireResponse> {
        let tx = self.channel(worker)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(Outbound {
            header,
            body,
            reply: Some(reply_tx),
        })
        .await
        .map_err(|_| ReplicaError::transport(format!("connection actor of '{worker}' is gone")))?;
        reply_rx
            .await
            .map_err(|_| ReplicaError::transport(format!("connection to '{worker}' dropped")))?
    }

    /// Enqueue an exchange without awaiting the reply.
    ///
    /// Ordering relative to later `send()` calls on the same worker is
    /// preserved; the reply is read and discarded by the actor.
    pub async fn send_forget(
        &self,
        worker: &str,
        header: RequestHeader,
        body: Bytes,
    ) -> ReplicaResult<()> {
        let tx = self.channel(worker)?;
        tx.send(Outbound {
            header,
            body,
            reply: None,
        })
        .await
        .map_err(|_| ReplicaError::transport(format!("connection actor of '{worker}' is gone")))
    }

    fn channel(&self, worker: &str) -> ReplicaResult<mpsc::Sender<Outbound>> {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(tx) = channels.get(worker) {
            if !tx.is_closed() {
                return Ok(tx.clone());
            }
        }
        let identity = self.config.worker(worker)?.clone();
        let retry_cap = Duration::from_secs(self.config.common.request_retry_interval_sec);
        let (tx, rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        tokio::spawn(connection_loop(identity, retry_cap, rx));
        channels.insert(worker.to_string(), tx.clone());
        Ok(tx)
    }
}

/// Owns the socket of one worker for the process lifetime
async fn connection_loop(
    worker: WorkerIdentity,
    retry_cap: Duration,
    mut rx: mpsc::Receiver<Outbound>,
) {
    let addr = format!("{}:{}", worker.host, worker.port);
    let mut backoff = Duration::from_secs(1);
    loop {
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                info!(worker = %worker.name, %addr, "connected");
                backoff = Duration::from_secs(1);
                match run_connection(stream, &mut rx).await {
                    ConnectionEnd::QueueClosed => {
                        debug!(worker = %worker.name, "send queue closed, actor exiting");
                        return;
                    }
                    ConnectionEnd::Transport(e) => {
                        warn!(worker = %worker.name, "transport failure: {e}");
                    }
                }
            }
            Err(e) => {
                debug!(worker = %worker.name, %addr, "connect failed: {e}");
            }
        }
        // Jittered exponential back-off capped by the configured interval
        let jitter = Duration::from_millis(fastrand::u64(0..250));
        tokio::time::sleep(backoff + jitter).await;
        backoff = (backoff * 2).min(retry_cap);
    }
}

enum ConnectionEnd {
    QueueClosed,
    Transport(ReplicaError),
}

/// Drive one live connection until a transport failure or queue shutdown.
///
/// Exchanges pipeline: outbound frames go out in FIFO order and replies are
/// matched to waiters by the id carried in the response header. Unknown or
/// stale ids are dropped with a warning.
async fn run_connection(stream: TcpStream, rx: &mut mpsc::Receiver<Outbound>) -> ConnectionEnd {
    let mut framed = Framed::new(stream, FrameCodec);
    let mut in_flight: HashMap<String, Option<oneshot::Sender<ReplicaResult<WireResponse>>>> =
        HashMap::new();

    let end = loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(outbound) = outbound else {
                    break ConnectionEnd::QueueClosed;
                };
                let id = outbound.header.id.clone();
                if let Err(e) = framed.send(encode_body(&outbound.header)).await {
                    if let Some(reply) = outbound.reply {
                        let _ = reply.send(Err(ReplicaError::transport(e.to_string())));
                    }
                    break ConnectionEnd::Transport(e);
                }
                if let Err(e) = framed.send(outbound.body).await {
                    if let Some(reply) = outbound.reply {
                        let _ = reply.send(Err(ReplicaError::transport(e.to_string())));
                    }
                    break ConnectionEnd::Transport(e);
                }
                in_flight.insert(id, outbound.reply);
            }
            inbound = framed.next() => {
                let header_frame = match inbound {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => break ConnectionEnd::Transport(e),
                    None => break ConnectionEnd::Transport(
                        ReplicaError::transport("connection closed by the worker")),
                };
                // The body frame follows its header immediately
                let body_frame = match framed.next().await {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => break ConnectionEnd::Transport(e),
                    None => break ConnectionEnd::Transport(
                        ReplicaError::transport("connection closed between header and body")),
                };
                let header: ResponseHeader = match decode_body(&header_frame) {
                    Ok(header) => header,
                    Err(e) => break ConnectionEnd::Transport(e),
                };
                match in_flight.remove(&header.id) {
                    Some(Some(reply)) => {
                        let _ = reply.send(Ok(WireResponse { header, body: body_frame }));
                    }
                    Some(None) => {
                        // Fire-and-forget exchange; reply discarded
                    }
                    None => {
                        warn!(id = %header.id, "dropping a reply with an unknown or stale id");
                    }
                }
            }
        }
    };

    // Abort everything still in flight on this connection
    for (_, reply) in in_flight.drain() {
        if let Some(reply) = reply {
            let _ = reply.send(Err(ReplicaError::transport(
                "connection failed while the exchange was in flight",
            )));
        }
    }
    end
}
