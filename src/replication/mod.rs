//! Replication endpoint.
//!
//! A dual-purpose RPC component: the primary serves `SyncState`, `Heartbeat`
//! and `HealthCheck` and pushes heartbeats over connections its peer opened;
//! the secondary dials the primary, pulls state on an interval and answers
//! inbound heartbeats on the same connection. Both halves speak the framed
//! wire protocol from [`crate::wire`] and share one request dispatcher, so
//! the protocol stays symmetric between the peers.

use crate::{
    dataplane::DataPlaneClient,
    heartbeat::HeartbeatTracker,
    types::{NodeRole, SharedRole},
    wire::{Message, WireNatState},
};
use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::{debug, warn};

pub mod client;
pub mod server;
pub mod sync;

pub use client::ReplicationClient;
pub use server::{ReplicationServer, ServerHandle};
pub use sync::SyncLoop;

/// Per-call deadline for RPCs between the pair.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Current wall clock in nanoseconds since the Unix epoch.
#[must_use]
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Generate a fresh opaque request id.
#[must_use]
pub fn request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Request dispatcher shared by the server and client halves.
///
/// Application-level failures become `success=false` responses; only framing
/// and socket failures surface as transport errors.
#[derive(Debug, Clone)]
pub struct FailoverHandler {
    role: SharedRole,
    instance_id: String,
    dataplane: Arc<DataPlaneClient>,
    heartbeats: Arc<HeartbeatTracker>,
}

impl FailoverHandler {
    /// Create a handler over the node's shared role, identity, data plane
    /// client and heartbeat tracker.
    #[must_use]
    pub fn new(
        role: SharedRole,
        instance_id: String,
        dataplane: Arc<DataPlaneClient>,
        heartbeats: Arc<HeartbeatTracker>,
    ) -> Self {
        Self { role, instance_id, dataplane, heartbeats }
    }

    /// Current role as seen by this handler.
    #[must_use]
    pub fn role(&self) -> NodeRole {
        self.role.load()
    }

    /// Dispatch one inbound message. Requests produce a response; inbound
    /// responses are consumed for their side effects (heartbeat refusals are
    /// how a split brain becomes visible) and produce nothing.
    pub async fn handle(&self, message: Message) -> Option<Message> {
        match message {
            Message::SyncStateRequest { request_id } => {
                Some(self.handle_sync_state(request_id).await)
            },
            Message::HeartbeatRequest { request_id } => Some(self.handle_heartbeat(request_id)),
            Message::HealthCheckRequest { request_id } => Some(Message::HealthCheckResponse {
                request_id,
                success: true,
                node_role: self.role.load().as_str().to_string(),
                instance_id: self.instance_id.clone(),
            }),
            Message::HeartbeatResponse { request_id, success, .. } => {
                if !success {
                    warn!(
                        request_id = %request_id,
                        "peer refused heartbeat: it does not consider itself secondary"
                    );
                }
                None
            },
            other => {
                debug!(kind = other.kind(), "ignoring unexpected message");
                None
            },
        }
    }

    async fn handle_sync_state(&self, request_id: String) -> Message {
        debug!(request_id = %request_id, "handling sync state request");
        match self.dataplane.get_state().await {
            Ok(state) => Message::SyncStateResponse {
                request_id,
                success: true,
                error_message: None,
                state: Some(WireNatState::from_local(&state)),
            },
            Err(e) => {
                warn!(error = %e, "failed to capture local NAT state");
                Message::SyncStateResponse {
                    request_id,
                    success: false,
                    error_message: Some(format!("failed to get state: {e}")),
                    state: None,
                }
            },
        }
    }

    fn handle_heartbeat(&self, request_id: String) -> Message {
        // Only a secondary accepts heartbeats; anything else is a split
        // brain attempt and is refused.
        if self.role.load() != NodeRole::Secondary {
            warn!(
                role = %self.role.load(),
                "received heartbeat while not secondary, refusing"
            );
            return Message::HeartbeatResponse {
                request_id,
                success: false,
                timestamp_ns: now_nanos(),
            };
        }
        self.heartbeats.record_beat();
        Message::HeartbeatResponse { request_id, success: true, timestamp_ns: now_nanos() }
    }
}
