//! Role manager.
//!
//! Serializes role transitions. Desired-role events from the election
//! supervisor and the heartbeat monitor fan into one bounded channel; this
//! single consumer tears down the previous role's resources and installs the
//! new role's. Each role's resources live in one owned bundle that is
//! replaced atomically on transition, so a stale server or client can never
//! outlive its role.

use crate::{
    config::FailoverConfig,
    dataplane::DataPlaneClient,
    error::Result,
    fabric::CloudFabric,
    heartbeat::{HeartbeatMonitor, HeartbeatTracker},
    replication::{FailoverHandler, ReplicationClient, ReplicationServer, ServerHandle, SyncLoop},
    takeover::TakeoverExecutor,
    types::{InstanceId, NodeRole, SharedRole},
};
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

/// Resources owned by the current role, replaced wholesale on transition.
///
/// At most one of the server and the client exists at any time.
#[derive(Debug, Default)]
enum RoleResources {
    /// No role installed yet, or freshly cleaned up
    #[default]
    Idle,
    /// Primary: the replication server (with its heartbeat pusher)
    Primary { server: ServerHandle },
    /// Secondary: the replication client plus the monitor and sync loops
    Secondary {
        client: Arc<ReplicationClient>,
        monitor: JoinHandle<()>,
        sync: JoinHandle<()>,
        stop: watch::Sender<bool>,
    },
}

/// Single consumer of desired-role events.
pub struct RoleManager {
    config: FailoverConfig,
    fabric: Option<Arc<dyn CloudFabric>>,
    instance: InstanceId,
    dataplane: Arc<DataPlaneClient>,
    handler: Arc<FailoverHandler>,
    heartbeats: Arc<HeartbeatTracker>,
    role: SharedRole,
    events_tx: mpsc::Sender<NodeRole>,
    resources: RoleResources,
}

impl RoleManager {
    /// Create a role manager.
    ///
    /// `events_tx` is the same sender the election supervisor uses; the
    /// manager hands it to heartbeat monitors it spawns so both triggers
    /// fan into one channel.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        config: FailoverConfig,
        fabric: Option<Arc<dyn CloudFabric>>,
        instance: InstanceId,
        dataplane: Arc<DataPlaneClient>,
        handler: Arc<FailoverHandler>,
        heartbeats: Arc<HeartbeatTracker>,
        role: SharedRole,
        events_tx: mpsc::Sender<NodeRole>,
    ) -> Self {
        Self {
            config,
            fabric,
            instance,
            dataplane,
            handler,
            heartbeats,
            role,
            events_tx,
            resources: RoleResources::Idle,
        }
    }

    /// Run the transition loop until shutdown. Consumes the manager.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<NodeRole>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("role manager shutting down");
                    self.cleanup().await;
                    return;
                }
                event = events.recv() => {
                    let Some(target) = event else {
                        debug!("role event channel closed, role manager exiting");
                        self.cleanup().await;
                        return;
                    };
                    let current = self.role.load();
                    if target == current {
                        debug!(role = %current, "already in requested role, ignoring");
                        continue;
                    }
                    info!(
                        current_role = %current,
                        target_role = %target,
                        "received role transition request"
                    );
                    match self.transition(target).await {
                        Ok(()) => {
                            self.role.store(target);
                            info!(role = %target, "transitioned to new role");
                        },
                        Err(e) => {
                            error!(
                                current_role = %current,
                                target_role = %target,
                                error = %e,
                                "failed to transition to new role"
                            );
                        },
                    }
                }
            }
        }
    }

    async fn transition(&mut self, target: NodeRole) -> Result<()> {
        self.cleanup().await;
        match target {
            NodeRole::Primary => self.become_primary().await,
            NodeRole::Secondary => self.become_secondary().await,
            NodeRole::Unknown => {
                // Nothing ever requests Unknown; log and stay put.
                warn!("ignoring transition request to unknown role");
                Ok(())
            },
        }
    }

    /// Tear down whatever the previous role installed. Idempotent; errors
    /// are logged and never abort a transition.
    async fn cleanup(&mut self) {
        match std::mem::take(&mut self.resources) {
            RoleResources::Idle => {},
            RoleResources::Primary { server } => {
                debug!("shutting down replication server");
                server.shutdown().await;
            },
            RoleResources::Secondary { client, monitor, sync, stop } => {
                debug!("shutting down replication client and secondary loops");
                let _ = stop.send(true);
                client.close().await;
                monitor.abort();
                sync.abort();
                let _ = monitor.await;
                let _ = sync.await;
            },
        }
    }

    /// Install the primary role: takeover, then the replication server.
    ///
    /// Only a failure to claim the floating identity aborts; the takeover's
    /// degraded errors are logged inside the executor and promotion stands
    /// so the peer can rediscover us.
    async fn become_primary(&mut self) -> Result<()> {
        info!(port = self.config.port, "becoming primary");

        if let Some(fabric) = &self.fabric {
            let executor = TakeoverExecutor::new(
                fabric.clone(),
                self.instance.clone(),
                self.config.eni_ip.clone(),
                self.config.destination_cidr.clone(),
            );
            executor.execute().await?;
        }

        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.config.port);
        let server = ReplicationServer::start(
            bind_addr,
            self.handler.clone(),
            self.config.heartbeat_interval,
        )
        .await?;
        info!(addr = %server.local_addr(), "replication server started");

        // Heartbeat state is meaningless on a primary.
        self.heartbeats.reset();

        self.resources = RoleResources::Primary { server };
        Ok(())
    }

    /// Install the secondary role: client, heartbeat monitor, sync loop.
    async fn become_secondary(&mut self) -> Result<()> {
        let peer_addr = self.config.peer_addr();
        info!(peer = %peer_addr, "becoming secondary");

        let client = Arc::new(ReplicationClient::new(peer_addr.clone(), self.handler.clone()));
        // Dial in the background so an unreachable primary cannot stall the
        // transition loop; failure is tolerated and the sync loop redials.
        let dial = client.clone();
        tokio::spawn(async move {
            if let Err(e) = dial.connect().await {
                warn!(peer = %dial.peer_addr(), error = %e, "failed to connect to primary, will retry during sync");
            }
        });

        // Grant the new primary a startup grace window.
        self.heartbeats.reset();

        let (stop_tx, stop_rx) = watch::channel(false);
        let monitor = HeartbeatMonitor::new(
            self.heartbeats.clone(),
            self.config.heartbeat_interval,
            self.config.heartbeat_miss_threshold,
            self.role.clone(),
            self.events_tx.clone(),
            stop_rx.clone(),
        )
        .spawn();
        let sync = SyncLoop::new(
            client.clone(),
            self.dataplane.clone(),
            self.config.sync_interval,
            self.role.clone(),
            stop_rx,
        )
        .spawn();

        self.resources = RoleResources::Secondary { client, monitor, sync, stop: stop_tx };
        Ok(())
    }
}

impl std::fmt::Debug for RoleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoleManager")
            .field("instance", &self.instance)
            .field("role", &self.role.load())
            .finish_non_exhaustive()
    }
}
