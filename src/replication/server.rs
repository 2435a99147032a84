//! Server half of the replication endpoint (primary side).
//!
//! Accepts connections from the peer, answers framed requests, and pushes a
//! heartbeat to every connected peer at each heartbeat tick. The peer's
//! replies flow back through the same dispatcher, which is where a refused
//! heartbeat (split brain) gets logged.

use super::FailoverHandler;
use crate::{
    error::{Error, Result},
    wire::{FrameDecoder, Message},
};
use dashmap::DashMap;
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
    task::{JoinHandle, JoinSet},
    time::interval,
};
use tracing::{debug, error, info, warn};

/// Outbound queue depth per connection.
const PEER_QUEUE_DEPTH: usize = 64;

/// Replication RPC server.
#[derive(Debug)]
pub struct ReplicationServer;

/// Handle to a running replication server. Dropping the handle does not stop
/// the server; call [`shutdown`](ServerHandle::shutdown).
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    pusher_task: JoinHandle<()>,
}

impl ServerHandle {
    /// Address the server is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop the accept loop, the heartbeat pusher and every connection task.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.accept_task.await {
            if !e.is_cancelled() {
                warn!(error = %e, "replication server accept task ended abnormally");
            }
        }
        if let Err(e) = self.pusher_task.await {
            if !e.is_cancelled() {
                warn!(error = %e, "heartbeat pusher task ended abnormally");
            }
        }
        info!("replication server stopped");
    }
}

impl ReplicationServer {
    /// Bind `bind_addr` and start serving. The listener is bound before this
    /// returns, so a successful result means the peer can reach us.
    pub async fn start(
        bind_addr: SocketAddr,
        handler: Arc<FailoverHandler>,
        heartbeat_interval: Duration,
    ) -> Result<ServerHandle> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| Error::transport(format!("failed to bind {bind_addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::transport(format!("failed to read local address: {e}")))?;
        info!(addr = %local_addr, "replication server listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let peers: Arc<DashMap<u64, mpsc::Sender<Message>>> = Arc::new(DashMap::new());

        let accept_task = tokio::spawn(Self::accept_loop(
            listener,
            handler.clone(),
            peers.clone(),
            shutdown_rx.clone(),
        ));
        let pusher_task =
            tokio::spawn(Self::heartbeat_pusher(peers, heartbeat_interval, shutdown_rx));

        Ok(ServerHandle { local_addr, shutdown_tx, accept_task, pusher_task })
    }

    async fn accept_loop(
        listener: TcpListener,
        handler: Arc<FailoverHandler>,
        peers: Arc<DashMap<u64, mpsc::Sender<Message>>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut connections = JoinSet::new();
        let conn_seq = AtomicU64::new(1);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("received shutdown signal, stopping listener");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => {
                            let conn_id = conn_seq.fetch_add(1, Ordering::Relaxed);
                            info!(conn_id, remote = %remote, "accepted peer connection");
                            connections.spawn(Self::serve_connection(
                                conn_id,
                                stream,
                                handler.clone(),
                                peers.clone(),
                                shutdown.clone(),
                            ));
                        },
                        Err(e) => {
                            error!(error = %e, "error accepting connection");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        },
                    }
                }
            }
        }

        connections.shutdown().await;
    }

    async fn serve_connection(
        conn_id: u64,
        stream: TcpStream,
        handler: Arc<FailoverHandler>,
        peers: Arc<DashMap<u64, mpsc::Sender<Message>>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (mut read_half, mut write_half) = stream.into_split();

        let (tx, mut rx) = mpsc::channel::<Message>(PEER_QUEUE_DEPTH);
        peers.insert(conn_id, tx.clone());

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let encoded = match message.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!(error = %e, "failed to encode outbound message");
                        continue;
                    },
                };
                if let Err(e) = write_half.write_all(&encoded).await {
                    debug!(error = %e, "peer connection write failed");
                    break;
                }
            }
        });

        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 16 * 1024];
        'conn: loop {
            tokio::select! {
                _ = shutdown.changed() => break 'conn,
                read = read_half.read(&mut buf) => {
                    let n = match read {
                        Ok(0) => {
                            debug!(conn_id, "peer closed connection");
                            break 'conn;
                        },
                        Ok(n) => n,
                        Err(e) => {
                            debug!(conn_id, error = %e, "peer connection read failed");
                            break 'conn;
                        },
                    };
                    decoder.extend(&buf[..n]);
                    loop {
                        match decoder.try_decode() {
                            Ok(Some(payload)) => {
                                let message = match Message::decode(&payload) {
                                    Ok(message) => message,
                                    Err(e) => {
                                        warn!(conn_id, error = %e, "undecodable message, dropping connection");
                                        break 'conn;
                                    },
                                };
                                if let Some(reply) = handler.handle(message).await {
                                    if tx.send(reply).await.is_err() {
                                        break 'conn;
                                    }
                                }
                            },
                            Ok(None) => break,
                            Err(e) => {
                                warn!(conn_id, error = %e, "framing error, dropping connection");
                                break 'conn;
                            },
                        }
                    }
                }
            }
        }

        peers.remove(&conn_id);
        drop(tx);
        let _ = writer.await;
        debug!(conn_id, "peer connection closed");
    }

    /// Push one heartbeat per tick to every connected peer.
    async fn heartbeat_pusher(
        peers: Arc<DashMap<u64, mpsc::Sender<Message>>>,
        heartbeat_interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("heartbeat pusher stopping");
                    return;
                }
                _ = ticker.tick() => {
                    for entry in peers.iter() {
                        let message = Message::HeartbeatRequest { request_id: super::request_id() };
                        // A full queue means the peer is not draining its
                        // socket; skipping a beat there is the right call.
                        if entry.value().try_send(message).is_err() {
                            warn!(conn_id = *entry.key(), "peer outbound queue full, skipping heartbeat");
                        }
                    }
                }
            }
        }
    }
}
