//! # Switchgear
//!
//! Active/standby failover control plane for a NAT data plane running on
//! cloud virtual machines. Two daemons run on two VMs; exactly one is the
//! primary, holding a floating IP that doubles as the leader lease. The
//! secondary receives heartbeats and replicated NAT state, and on heartbeat
//! loss promotes itself: it claims the floating identity, migrates the NAT
//! address pool, rewrites routes and resumes translation from the most
//! recently replicated state.

use std::sync::Arc;
use tokio::{sync::{mpsc, watch}, task::JoinHandle};
use tracing::info;

/// Daemon configuration and validation
pub mod config;

/// HTTP client for the local NAT data plane
pub mod dataplane;

/// Leader election via floating IP ownership
pub mod election;

/// Error types
pub mod error;

/// Cloud fabric capability interface and the in-memory implementation
pub mod fabric;

/// Heartbeat tracking and the secondary-side monitor
pub mod heartbeat;

/// Replication endpoint: RPC server, client and sync loop
pub mod replication;

/// Role transition management
pub mod role;

/// NAT state data model
pub mod state;

/// Cloud-side takeover sequence
pub mod takeover;

/// Test fixtures (mock data plane)
pub mod testkit;

/// Core types
pub mod types;

/// Wire protocol: message set and framing
pub mod wire;

// Re-export commonly used types for convenience
pub use crate::{
    config::FailoverConfig,
    dataplane::DataPlaneClient,
    election::ElectionSupervisor,
    error::{Error, Result},
    fabric::{CloudFabric, FabricError, InMemoryFabric},
    heartbeat::{HeartbeatMonitor, HeartbeatTracker},
    replication::{FailoverHandler, ReplicationClient, ReplicationServer, SyncLoop},
    role::RoleManager,
    state::NatState,
    takeover::TakeoverExecutor,
    types::{InstanceId, InterfaceId, NodeRole, RouteTableId, SharedRole},
};

/// A running failover node: the election supervisor and the role manager,
/// wired through the shared role and the bounded desired-role channel.
#[derive(Debug)]
pub struct FailoverNode {
    role: SharedRole,
    shutdown_tx: watch::Sender<bool>,
    election_task: JoinHandle<()>,
    manager_task: JoinHandle<()>,
}

impl FailoverNode {
    /// Validate the configuration and start the node.
    ///
    /// A cloud fabric adapter is required unless ownership checks are
    /// disabled; with checks disabled a fabric may still be supplied so the
    /// takeover sequence runs against it on promotion.
    pub async fn start(
        mut config: FailoverConfig,
        fabric: Option<Arc<dyn CloudFabric>>,
    ) -> Result<Self> {
        config.validate()?;
        if !config.disable_eni_check && fabric.is_none() {
            return Err(Error::configuration(
                "ENI ownership checks require a cloud fabric adapter \
                 (or run with --disable-eni-check and --force-role)",
            ));
        }

        // Identity is resolved once; the cloud does not change it under us.
        let instance = match &fabric {
            Some(fabric) => fabric.resolve_self_identity().await?,
            None => InstanceId::from("test-mode"),
        };

        info!(
            eni_ip = %config.eni_ip,
            port = config.port,
            instance_id = %instance,
            local_socket = %config.local_socket.display(),
            destination_cidr = config.destination_cidr.as_deref().unwrap_or(""),
            leader_check_interval = ?config.leader_check_interval,
            sync_interval = ?config.sync_interval,
            heartbeat_interval = ?config.heartbeat_interval,
            heartbeat_miss_threshold = config.heartbeat_miss_threshold,
            disable_eni_check = config.disable_eni_check,
            force_role = %config.force_role,
            "starting failover node"
        );

        let role = SharedRole::new();
        let heartbeats = Arc::new(HeartbeatTracker::new());
        let dataplane = Arc::new(DataPlaneClient::new(config.local_socket.clone()));
        let handler = Arc::new(FailoverHandler::new(
            role.clone(),
            instance.to_string(),
            dataplane.clone(),
            heartbeats.clone(),
        ));

        let (events_tx, events_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let supervisor = if config.disable_eni_check {
            ElectionSupervisor::forced(
                config.eni_ip.clone(),
                config.leader_check_interval,
                config.forced_role(),
                role.clone(),
                events_tx.clone(),
                shutdown_rx.clone(),
            )
        } else {
            ElectionSupervisor::new(
                config.eni_ip.clone(),
                config.leader_check_interval,
                fabric.clone().expect("fabric presence checked above"),
                instance.clone(),
                role.clone(),
                events_tx.clone(),
                shutdown_rx.clone(),
            )
        };
        let election_task = supervisor.spawn();

        let manager = RoleManager::new(
            config,
            fabric,
            instance,
            dataplane,
            handler,
            heartbeats,
            role.clone(),
            events_tx,
        );
        let manager_task = tokio::spawn(manager.run(events_rx, shutdown_rx));

        Ok(Self { role, shutdown_tx, election_task, manager_task })
    }

    /// Current role of this node.
    #[must_use]
    pub fn current_role(&self) -> NodeRole {
        self.role.load()
    }

    /// Stop the node, tearing down whichever role is installed.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.election_task.await;
        let _ = self.manager_task.await;
        info!("failover node stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_start_without_fabric_requires_test_mode() {
        let config = FailoverConfig {
            eni_ip: "10.0.0.5".to_string(),
            local_socket: PathBuf::from("/tmp/dp.sock"),
            ..FailoverConfig::default()
        };
        let err = FailoverNode::start(config, None).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let config = FailoverConfig::default();
        let err = FailoverNode::start(config, None).await.unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
