//! Election supervisor.
//!
//! Periodically samples the authority signal (ownership of the floating IP
//! on the cloud fabric) and emits the desired role to the role manager.
//! Sampling is suppressed while the node is secondary: heartbeat loss is the
//! authoritative failover trigger there, and cloud polling is far too slow
//! to drive promotion.

use crate::{
    fabric::CloudFabric,
    types::{InstanceId, NodeRole, SharedRole},
};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::interval,
};
use tracing::{debug, error, info, warn};

/// Where the desired role comes from on each election tick.
#[derive(Debug)]
enum RoleSource {
    /// Floating IP ownership sampled from the cloud fabric
    Fabric { fabric: Arc<dyn CloudFabric>, self_instance: InstanceId },
    /// Fixed role for test mode (`--disable-eni-check`)
    Forced(NodeRole),
}

/// Periodic leader-check loop.
#[derive(Debug)]
pub struct ElectionSupervisor {
    floating_ip: String,
    check_interval: Duration,
    source: RoleSource,
    role: SharedRole,
    events: mpsc::Sender<NodeRole>,
    shutdown: watch::Receiver<bool>,
}

impl ElectionSupervisor {
    /// Create a supervisor that samples floating IP ownership on `fabric`.
    #[must_use]
    pub fn new(
        floating_ip: String,
        check_interval: Duration,
        fabric: Arc<dyn CloudFabric>,
        self_instance: InstanceId,
        role: SharedRole,
        events: mpsc::Sender<NodeRole>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            floating_ip,
            check_interval,
            source: RoleSource::Fabric { fabric, self_instance },
            role,
            events,
            shutdown,
        }
    }

    /// Create a supervisor that always derives the given role (test mode).
    #[must_use]
    pub fn forced(
        floating_ip: String,
        check_interval: Duration,
        forced_role: NodeRole,
        role: SharedRole,
        events: mpsc::Sender<NodeRole>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            floating_ip,
            check_interval,
            source: RoleSource::Forced(forced_role),
            role,
            events,
            shutdown,
        }
    }

    /// Spawn the election loop.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!(
            eni_ip = %self.floating_ip,
            interval = ?self.check_interval,
            "starting leader election loop"
        );
        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    debug!("election supervisor stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.check_once().await;
                }
            }
        }
    }

    async fn check_once(&self) {
        let current = self.role.load();

        // Heartbeat monitoring takes precedence while secondary.
        if current == NodeRole::Secondary {
            debug!("skipping ownership check, heartbeat monitoring active");
            return;
        }

        let desired = match &self.source {
            RoleSource::Forced(role) => {
                info!(forced_role = %role, "ownership check disabled, using forced role");
                *role
            },
            RoleSource::Fabric { fabric, self_instance } => {
                match fabric.find_interface_by_address(&self.floating_ip).await {
                    Ok(binding) => {
                        let owns = binding.attached_instance.as_ref() == Some(self_instance);
                        info!(
                            eni_ip = %self.floating_ip,
                            interface = %binding.interface,
                            owns_eni = owns,
                            "ownership check result"
                        );
                        if owns {
                            NodeRole::Primary
                        } else {
                            NodeRole::Secondary
                        }
                    },
                    Err(e) => {
                        // Transient fabric errors never change the role.
                        error!(eni_ip = %self.floating_ip, error = %e, "failed to check ownership");
                        return;
                    },
                }
            },
        };

        if desired == current {
            debug!(role = %current, "role unchanged, no transition needed");
            return;
        }

        info!(old_role = %current, new_role = %desired, "role change detected, triggering transition");
        if self.events.try_send(desired).is_err() {
            warn!(new_role = %desired, "role transition channel full, skipping update");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::InMemoryFabric;

    #[allow(clippy::type_complexity)]
    fn supervisor_parts() -> (
        SharedRole,
        mpsc::Sender<NodeRole>,
        mpsc::Receiver<NodeRole>,
        watch::Sender<bool>,
        watch::Receiver<bool>,
    ) {
        let role = SharedRole::new();
        let (events_tx, events_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);
        (role, events_tx, events_rx, stop_tx, stop_rx)
    }

    #[tokio::test]
    async fn test_owning_node_emits_primary() {
        let fabric = Arc::new(InMemoryFabric::new("i-self"));
        fabric.add_interface("eni-a", "i-self");
        fabric.add_secondary_ip("eni-a", "10.0.0.5");

        let (role, events_tx, mut events_rx, _stop_tx, stop_rx) = supervisor_parts();
        let supervisor = ElectionSupervisor::new(
            "10.0.0.5".to_string(),
            Duration::from_millis(10),
            fabric,
            InstanceId::from("i-self"),
            role,
            events_tx,
            stop_rx,
        );
        let handle = supervisor.spawn();

        let event = tokio::time::timeout(Duration::from_secs(1), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, NodeRole::Primary);
        handle.abort();
    }

    #[tokio::test]
    async fn test_non_owning_node_emits_secondary() {
        let fabric = Arc::new(InMemoryFabric::new("i-self"));
        fabric.add_interface("eni-a", "i-other");
        fabric.add_secondary_ip("eni-a", "10.0.0.5");

        let (role, events_tx, mut events_rx, _stop_tx, stop_rx) = supervisor_parts();
        let supervisor = ElectionSupervisor::new(
            "10.0.0.5".to_string(),
            Duration::from_millis(10),
            fabric,
            InstanceId::from("i-self"),
            role,
            events_tx,
            stop_rx,
        );
        let handle = supervisor.spawn();

        let event = tokio::time::timeout(Duration::from_secs(1), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, NodeRole::Secondary);
        handle.abort();
    }

    #[tokio::test]
    async fn test_fabric_error_changes_nothing() {
        let fabric = Arc::new(InMemoryFabric::new("i-self"));
        fabric.fail_operation("find_interface_by_address");

        let (role, events_tx, mut events_rx, _stop_tx, stop_rx) = supervisor_parts();
        let supervisor = ElectionSupervisor::new(
            "10.0.0.5".to_string(),
            Duration::from_millis(5),
            fabric,
            InstanceId::from("i-self"),
            role.clone(),
            events_tx,
            stop_rx,
        );
        let handle = supervisor.spawn();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events_rx.try_recv().is_err());
        assert_eq!(role.load(), NodeRole::Unknown);
        handle.abort();
    }

    #[tokio::test]
    async fn test_checks_suppressed_while_secondary() {
        let fabric = Arc::new(InMemoryFabric::new("i-self"));
        fabric.add_interface("eni-a", "i-self");
        fabric.add_secondary_ip("eni-a", "10.0.0.5");

        let (role, events_tx, mut events_rx, _stop_tx, stop_rx) = supervisor_parts();
        role.store(NodeRole::Secondary);
        let supervisor = ElectionSupervisor::new(
            "10.0.0.5".to_string(),
            Duration::from_millis(5),
            fabric,
            InstanceId::from("i-self"),
            role,
            events_tx,
            stop_rx,
        );
        let handle = supervisor.spawn();

        // Owning the floating IP would normally emit Primary, but the node
        // is secondary so every tick is skipped.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events_rx.try_recv().is_err());
        handle.abort();
    }

    #[tokio::test]
    async fn test_forced_role_emitted_once() {
        let (role, events_tx, mut events_rx, _stop_tx, stop_rx) = supervisor_parts();
        let supervisor = ElectionSupervisor::forced(
            "10.0.0.5".to_string(),
            Duration::from_millis(10),
            NodeRole::Primary,
            role.clone(),
            events_tx,
            stop_rx,
        );
        let handle = supervisor.spawn();

        let event = tokio::time::timeout(Duration::from_secs(1), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, NodeRole::Primary);

        // Once the role manager applies the transition, further ticks are
        // emit-on-change only.
        role.store(NodeRole::Primary);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(events_rx.try_recv().is_err());
        handle.abort();
    }
}
