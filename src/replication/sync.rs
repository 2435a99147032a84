//! Secondary sync loop.
//!
//! While the node is secondary it pulls the full NAT state from the primary
//! every `sync_interval` and replaces the local data plane's state wholesale.
//! Every failure is logged and retried on the next tick; the design accepts
//! staleness bounded by the interval.

use super::ReplicationClient;
use crate::{
    dataplane::DataPlaneClient,
    types::{NodeRole, SharedRole},
};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::interval,
};
use tracing::{debug, error, info};

/// Periodic state replication loop, active only while secondary.
#[derive(Debug)]
pub struct SyncLoop {
    client: Arc<ReplicationClient>,
    dataplane: Arc<DataPlaneClient>,
    sync_interval: Duration,
    role: SharedRole,
    stop: watch::Receiver<bool>,
}

impl SyncLoop {
    /// Create a sync loop. It does nothing until [`spawn`](Self::spawn)ed.
    #[must_use]
    pub fn new(
        client: Arc<ReplicationClient>,
        dataplane: Arc<DataPlaneClient>,
        sync_interval: Duration,
        role: SharedRole,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self { client, dataplane, sync_interval, role, stop }
    }

    /// Spawn the loop.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!(interval = ?self.sync_interval, "starting secondary sync loop");
        let mut ticker = interval(self.sync_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip the immediate tick; the primary gets one interval to settle.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.stop.changed() => {
                    debug!("sync loop stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if self.role.load() != NodeRole::Secondary {
                        debug!("no longer secondary, sync loop exiting");
                        return;
                    }
                    if let Err(e) = self.sync_once().await {
                        error!(error = %e, "failed to sync state from primary");
                    }
                }
            }
        }
    }

    async fn sync_once(&self) -> crate::error::Result<()> {
        let wire = self.client.sync_state().await?;
        let state = wire.into_local();
        self.dataplane.set_state(&state).await?;
        debug!(
            ips = state.ips.len(),
            tcp_inbound = state.tcp_inbound.len(),
            tcp_outbound = state.tcp_outbound.len(),
            udp_inbound = state.udp_inbound.len(),
            udp_outbound = state.udp_outbound.len(),
            nat_ports = state.nat_ports.len(),
            "applied synced state to local data plane"
        );
        Ok(())
    }
}
