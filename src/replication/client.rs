//! Client half of the replication endpoint (secondary side).
//!
//! Dials the primary at the floating address and multiplexes request/response
//! exchanges with inbound heartbeat requests over one connection. A failed
//! dial is tolerated; the connection is re-established lazily on the next
//! call, which in practice means the next sync tick.

use super::{FailoverHandler, RPC_TIMEOUT};
use crate::{
    error::{Error, Result},
    wire::{FrameDecoder, Message, WireNatState},
};
use dashmap::DashMap;
use std::{sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// Outbound queue depth towards the primary.
const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// Deadline for establishing the TCP connection. Kept short so a transition
/// or sync tick is never stalled for long by an unreachable primary.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

type PendingMap = Arc<DashMap<String, oneshot::Sender<Message>>>;

#[derive(Debug)]
struct Connection {
    tx: mpsc::Sender<Message>,
    pending: PendingMap,
    read_task: JoinHandle<()>,
    write_task: JoinHandle<()>,
}

impl Connection {
    fn is_alive(&self) -> bool {
        !self.tx.is_closed() && !self.read_task.is_finished()
    }

    fn teardown(self) {
        self.read_task.abort();
        self.write_task.abort();
        self.pending.clear();
    }
}

/// Replication RPC client.
#[derive(Debug)]
pub struct ReplicationClient {
    peer_addr: String,
    handler: Arc<FailoverHandler>,
    conn: Mutex<Option<Connection>>,
}

impl ReplicationClient {
    /// Create a client for the primary at `peer_addr` (`host:port`).
    #[must_use]
    pub fn new(peer_addr: String, handler: Arc<FailoverHandler>) -> Self {
        Self { peer_addr, handler, conn: Mutex::new(None) }
    }

    /// Address of the peer this client dials.
    #[must_use]
    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }

    /// Establish the connection now. Failure leaves the client usable; the
    /// next call retries the dial.
    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        self.ensure_connected(&mut guard).await
    }

    /// Pull the full NAT state from the primary.
    pub async fn sync_state(&self) -> Result<WireNatState> {
        let request_id = super::request_id();
        let response =
            self.call(Message::SyncStateRequest { request_id: request_id.clone() }).await?;
        match response {
            Message::SyncStateResponse { success, error_message, state, .. } => {
                if !success {
                    return Err(Error::rpc(
                        error_message.unwrap_or_else(|| "primary returned an error".to_string()),
                    ));
                }
                state.ok_or_else(|| Error::rpc("primary returned empty state"))
            },
            other => Err(Error::rpc(format!("unexpected response {}", other.kind()))),
        }
    }

    /// Query the peer's role and instance id.
    pub async fn health_check(&self) -> Result<(String, String)> {
        let response =
            self.call(Message::HealthCheckRequest { request_id: super::request_id() }).await?;
        match response {
            Message::HealthCheckResponse { success, node_role, instance_id, .. } => {
                if !success {
                    return Err(Error::rpc("peer health check reported failure"));
                }
                Ok((node_role, instance_id))
            },
            other => Err(Error::rpc(format!("unexpected response {}", other.kind()))),
        }
    }

    /// Close the connection and abandon in-flight requests.
    pub async fn close(&self) {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.take() {
            conn.teardown();
            debug!(peer = %self.peer_addr, "replication client closed");
        }
    }

    /// Issue one request and await its correlated response.
    async fn call(&self, request: Message) -> Result<Message> {
        let request_id = request.request_id().to_string();
        let (pending, tx) = {
            let mut guard = self.conn.lock().await;
            self.ensure_connected(&mut guard).await?;
            let conn = guard.as_ref().expect("connection was just established");
            (conn.pending.clone(), conn.tx.clone())
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        pending.insert(request_id.clone(), reply_tx);

        if tx.send(request).await.is_err() {
            pending.remove(&request_id);
            self.drop_connection().await;
            return Err(Error::transport(format!("connection to {} lost", self.peer_addr)));
        }

        match tokio::time::timeout(RPC_TIMEOUT, reply_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                // Read task dropped the pending map: connection died.
                self.drop_connection().await;
                Err(Error::transport(format!("connection to {} closed mid-request", self.peer_addr)))
            },
            Err(_) => {
                pending.remove(&request_id);
                Err(Error::transport(format!(
                    "request to {} timed out after {RPC_TIMEOUT:?}",
                    self.peer_addr
                )))
            },
        }
    }

    async fn drop_connection(&self) {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.take() {
            conn.teardown();
        }
    }

    async fn ensure_connected(&self, guard: &mut Option<Connection>) -> Result<()> {
        if guard.as_ref().is_some_and(Connection::is_alive) {
            return Ok(());
        }
        if let Some(stale) = guard.take() {
            stale.teardown();
        }

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.peer_addr))
            .await
            .map_err(|_| {
                Error::transport(format!(
                    "connect to {} timed out after {CONNECT_TIMEOUT:?}",
                    self.peer_addr
                ))
            })?
            .map_err(|e| {
                Error::transport(format!("failed to connect to {}: {e}", self.peer_addr))
            })?;
        info!(peer = %self.peer_addr, "connected to primary");

        let (read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE_DEPTH);
        let pending: PendingMap = Arc::new(DashMap::new());

        let write_task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let encoded = match message.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(error = %e, "failed to encode outbound message");
                        continue;
                    },
                };
                if let Err(e) = write_half.write_all(&encoded).await {
                    debug!(error = %e, "write to primary failed");
                    break;
                }
            }
        });

        let read_task = tokio::spawn(Self::read_loop(
            read_half,
            self.handler.clone(),
            pending.clone(),
            tx.clone(),
        ));

        *guard = Some(Connection { tx, pending, read_task, write_task });
        Ok(())
    }

    async fn read_loop(
        mut read_half: tokio::net::tcp::OwnedReadHalf,
        handler: Arc<FailoverHandler>,
        pending: PendingMap,
        tx: mpsc::Sender<Message>,
    ) {
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 16 * 1024];
        'conn: loop {
            let n = match read_half.read(&mut buf).await {
                Ok(0) => {
                    debug!("primary closed the connection");
                    break;
                },
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "read from primary failed");
                    break;
                },
            };
            decoder.extend(&buf[..n]);
            loop {
                match decoder.try_decode() {
                    Ok(Some(payload)) => {
                        let message = match Message::decode(&payload) {
                            Ok(message) => message,
                            Err(e) => {
                                warn!(error = %e, "undecodable message from primary");
                                break 'conn;
                            },
                        };
                        if message.is_response() {
                            let request_id = message.request_id().to_string();
                            if let Some((_, waiter)) = pending.remove(&request_id) {
                                let _ = waiter.send(message);
                            } else {
                                debug!(request_id = %request_id, "response without a waiter");
                            }
                        } else if let Some(reply) = handler.handle(message).await {
                            if tx.send(reply).await.is_err() {
                                break 'conn;
                            }
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "framing error from primary");
                        break 'conn;
                    },
                }
            }
        }

        // Wake up in-flight callers with a closed-channel error.
        pending.clear();
    }
}
