//! Wire protocol for the replication endpoint.
//!
//! Defines the RPC message set exchanged between the pair and the wire form
//! of the NAT state. Ports travel as 32-bit integers for codec compatibility
//! but are semantically 16 bits; conversion back to the local form clamps,
//! never truncates. The `destination_ip` of a port bitmap is optional and is
//! carried as an empty string when absent.

use crate::state::{clamp_port, NatBitmapEntry, NatEntry, NatKey, NatState, NatValue};
use serde::{Deserialize, Serialize};

pub mod frame;

pub use frame::{encode_frame, FrameDecoder, FrameError, FrameResult};

/// RPC message envelope. Every message carries an opaque `request_id` that
/// responses echo verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Secondary pulls the full NAT state from the primary
    SyncStateRequest {
        /// Correlation id, echoed by the response
        request_id: String,
    },
    /// Primary's reply to a state pull
    SyncStateResponse {
        /// Correlation id from the request
        request_id: String,
        /// Whether the state was captured successfully
        success: bool,
        /// Failure description when `success` is false
        error_message: Option<String>,
        /// Captured state when `success` is true
        state: Option<WireNatState>,
    },
    /// Liveness signal pushed by the primary
    HeartbeatRequest {
        /// Correlation id, echoed by the response
        request_id: String,
    },
    /// Receiver's reply to a heartbeat
    HeartbeatResponse {
        /// Correlation id from the request
        request_id: String,
        /// False when the receiver is not secondary (split-brain rejection)
        success: bool,
        /// Receiver clock in nanoseconds since epoch
        timestamp_ns: u64,
    },
    /// Diagnostics request, valid in either direction
    HealthCheckRequest {
        /// Correlation id, echoed by the response
        request_id: String,
    },
    /// Diagnostics reply
    HealthCheckResponse {
        /// Correlation id from the request
        request_id: String,
        /// Always true for a reachable node
        success: bool,
        /// Receiver's role: "primary", "secondary" or "unknown"
        node_role: String,
        /// Receiver's cloud instance id
        instance_id: String,
    },
}

impl Message {
    /// Correlation id carried by this message.
    #[must_use]
    pub fn request_id(&self) -> &str {
        match self {
            Self::SyncStateRequest { request_id }
            | Self::SyncStateResponse { request_id, .. }
            | Self::HeartbeatRequest { request_id }
            | Self::HeartbeatResponse { request_id, .. }
            | Self::HealthCheckRequest { request_id }
            | Self::HealthCheckResponse { request_id, .. } => request_id,
        }
    }

    /// Check if the message is a response to a previous request.
    #[must_use]
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Self::SyncStateResponse { .. }
                | Self::HeartbeatResponse { .. }
                | Self::HealthCheckResponse { .. }
        )
    }

    /// Human-readable message type for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SyncStateRequest { .. } => "SyncStateRequest",
            Self::SyncStateResponse { .. } => "SyncStateResponse",
            Self::HeartbeatRequest { .. } => "HeartbeatRequest",
            Self::HeartbeatResponse { .. } => "HeartbeatResponse",
            Self::HealthCheckRequest { .. } => "HealthCheckRequest",
            Self::HealthCheckResponse { .. } => "HealthCheckResponse",
        }
    }

    /// Encode this message into a single transport frame.
    pub fn encode(&self) -> crate::error::Result<bytes::Bytes> {
        let payload = bincode::serialize(self)?;
        Ok(encode_frame(&payload)?)
    }

    /// Decode a message from a frame payload.
    pub fn decode(payload: &[u8]) -> crate::error::Result<Self> {
        Ok(bincode::deserialize(payload)?)
    }
}

/// Wire form of a connection key (ports widened to 32 bits).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireNatKey {
    /// Destination address
    pub destination_ip: String,
    /// Destination port
    pub destination_port: u32,
    /// Source address
    pub source_ip: String,
    /// Source port
    pub source_port: u32,
}

/// Wire form of a connection value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireNatValue {
    /// Last activity timestamp in nanoseconds since epoch
    pub last_seen: u64,
    /// Translated address
    pub translate_ip: String,
    /// Translated port
    pub translate_port: u32,
}

/// Wire form of one connection table entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireNatEntry {
    /// Flow identity
    pub key: WireNatKey,
    /// Translation state
    pub value: WireNatValue,
}

/// Wire form of a port-allocation bitmap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireNatBitmapEntry {
    /// NAT pool address
    pub nat_ip: String,
    /// Per-destination scope, empty when absent
    pub destination_ip: String,
    /// Index of the last allocated chunk
    pub last_chunk: u32,
    /// Opaque allocation bitmap
    pub bitmap: Vec<u8>,
}

/// Wire form of the complete NAT state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireNatState {
    /// Externally visible addresses
    pub ips: Vec<String>,
    /// Inbound TCP connection table
    pub tcp_inbound: Vec<WireNatEntry>,
    /// Outbound TCP connection table
    pub tcp_outbound: Vec<WireNatEntry>,
    /// Inbound UDP connection table
    pub udp_inbound: Vec<WireNatEntry>,
    /// Outbound UDP connection table
    pub udp_outbound: Vec<WireNatEntry>,
    /// Port allocation bitmaps
    pub nat_ports: Vec<WireNatBitmapEntry>,
}

fn entry_to_wire(entry: &NatEntry) -> WireNatEntry {
    WireNatEntry {
        key: WireNatKey {
            destination_ip: entry.key.destination_ip.clone(),
            destination_port: u32::from(entry.key.destination_port),
            source_ip: entry.key.source_ip.clone(),
            source_port: u32::from(entry.key.source_port),
        },
        value: WireNatValue {
            last_seen: entry.value.last_seen,
            translate_ip: entry.value.translate_ip.clone(),
            translate_port: u32::from(entry.value.translate_port),
        },
    }
}

fn entry_to_local(entry: WireNatEntry) -> NatEntry {
    NatEntry {
        key: NatKey {
            destination_ip: entry.key.destination_ip,
            destination_port: clamp_port(entry.key.destination_port),
            source_ip: entry.key.source_ip,
            source_port: clamp_port(entry.key.source_port),
        },
        value: NatValue {
            last_seen: entry.value.last_seen,
            translate_ip: entry.value.translate_ip,
            translate_port: clamp_port(entry.value.translate_port),
        },
    }
}

impl WireNatState {
    /// Convert the local state into its wire form.
    #[must_use]
    pub fn from_local(state: &NatState) -> Self {
        Self {
            ips: state.ips.clone(),
            tcp_inbound: state.tcp_inbound.iter().map(entry_to_wire).collect(),
            tcp_outbound: state.tcp_outbound.iter().map(entry_to_wire).collect(),
            udp_inbound: state.udp_inbound.iter().map(entry_to_wire).collect(),
            udp_outbound: state.udp_outbound.iter().map(entry_to_wire).collect(),
            nat_ports: state
                .nat_ports
                .iter()
                .map(|bp| WireNatBitmapEntry {
                    nat_ip: bp.nat_ip.clone(),
                    destination_ip: bp.destination_ip.clone().unwrap_or_default(),
                    last_chunk: u32::from(bp.last_chunk),
                    bitmap: bp.bitmap.clone(),
                })
                .collect(),
        }
    }

    /// Convert the wire state into the local form, clamping port fields.
    #[must_use]
    pub fn into_local(self) -> NatState {
        NatState {
            ips: self.ips,
            tcp_inbound: self.tcp_inbound.into_iter().map(entry_to_local).collect(),
            tcp_outbound: self.tcp_outbound.into_iter().map(entry_to_local).collect(),
            udp_inbound: self.udp_inbound.into_iter().map(entry_to_local).collect(),
            udp_outbound: self.udp_outbound.into_iter().map(entry_to_local).collect(),
            nat_ports: self
                .nat_ports
                .into_iter()
                .map(|bp| NatBitmapEntry {
                    nat_ip: bp.nat_ip,
                    destination_ip: if bp.destination_ip.is_empty() {
                        None
                    } else {
                        Some(bp.destination_ip)
                    },
                    last_chunk: clamp_port(bp.last_chunk),
                    bitmap: bp.bitmap,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_state() -> NatState {
        NatState {
            ips: vec!["10.0.0.5".to_string(), "10.0.0.20".to_string()],
            tcp_inbound: vec![NatEntry {
                key: NatKey {
                    destination_ip: "10.0.0.5".to_string(),
                    destination_port: 443,
                    source_ip: "172.16.4.4".to_string(),
                    source_port: 40122,
                },
                value: NatValue {
                    last_seen: 1_700_000_000_000_000_000,
                    translate_ip: "10.0.0.20".to_string(),
                    translate_port: 61000,
                },
            }],
            udp_outbound: vec![NatEntry {
                key: NatKey {
                    destination_ip: "8.8.8.8".to_string(),
                    destination_port: 53,
                    source_ip: "172.16.4.5".to_string(),
                    source_port: 5353,
                },
                value: NatValue {
                    last_seen: 1_700_000_000_000_000_111,
                    translate_ip: "10.0.0.5".to_string(),
                    translate_port: 30000,
                },
            }],
            nat_ports: vec![
                NatBitmapEntry {
                    nat_ip: "10.0.0.20".to_string(),
                    destination_ip: Some("8.8.8.8".to_string()),
                    last_chunk: 12,
                    bitmap: vec![0b1010_1010; 16],
                },
                NatBitmapEntry {
                    nat_ip: "10.0.0.5".to_string(),
                    destination_ip: None,
                    last_chunk: 0,
                    bitmap: Vec::new(),
                },
            ],
            ..NatState::default()
        }
    }

    #[test]
    fn test_state_wire_round_trip() {
        let state = sample_state();
        let restored = WireNatState::from_local(&state).into_local();
        assert_eq!(state, restored);
    }

    #[test]
    fn test_wide_ports_clamped_on_conversion() {
        let mut wire = WireNatState::from_local(&sample_state());
        wire.tcp_inbound[0].key.source_port = 70_000;
        wire.tcp_inbound[0].value.translate_port = u32::MAX;

        let local = wire.into_local();
        assert_eq!(local.tcp_inbound[0].key.source_port, 65535);
        assert_eq!(local.tcp_inbound[0].value.translate_port, 65535);
    }

    #[test]
    fn test_empty_destination_ip_means_absent() {
        let wire = WireNatState {
            nat_ports: vec![WireNatBitmapEntry {
                nat_ip: "10.0.0.5".to_string(),
                destination_ip: String::new(),
                last_chunk: 1,
                bitmap: vec![1],
            }],
            ..WireNatState::default()
        };
        let local = wire.into_local();
        assert!(local.nat_ports[0].destination_ip.is_none());
    }

    #[test]
    fn test_message_frame_round_trip() {
        let messages = vec![
            Message::SyncStateRequest { request_id: "r1".to_string() },
            Message::SyncStateResponse {
                request_id: "r1".to_string(),
                success: true,
                error_message: None,
                state: Some(WireNatState::from_local(&sample_state())),
            },
            Message::HeartbeatRequest { request_id: "r2".to_string() },
            Message::HeartbeatResponse {
                request_id: "r2".to_string(),
                success: false,
                timestamp_ns: 42,
            },
            Message::HealthCheckRequest { request_id: "r3".to_string() },
            Message::HealthCheckResponse {
                request_id: "r3".to_string(),
                success: true,
                node_role: "primary".to_string(),
                instance_id: "i-0abc".to_string(),
            },
        ];

        let mut decoder = FrameDecoder::new();
        for message in &messages {
            decoder.extend(&message.encode().unwrap());
        }
        for message in &messages {
            let payload = decoder.try_decode().unwrap().unwrap();
            assert_eq!(&Message::decode(&payload).unwrap(), message);
        }
    }

    #[test]
    fn test_response_classification() {
        let request = Message::HeartbeatRequest { request_id: "x".to_string() };
        let response =
            Message::HeartbeatResponse { request_id: "x".to_string(), success: true, timestamp_ns: 1 };
        assert!(!request.is_response());
        assert!(response.is_response());
        assert_eq!(request.request_id(), response.request_id());
    }

    prop_compose! {
        fn arb_entry()(
            dst_port in 0u16..=65535,
            src_port in 0u16..=65535,
            xlate_port in 0u16..=65535,
            last_seen in any::<u64>(),
        ) -> NatEntry {
            NatEntry {
                key: NatKey {
                    destination_ip: "10.0.0.5".to_string(),
                    destination_port: dst_port,
                    source_ip: "172.16.0.1".to_string(),
                    source_port: src_port,
                },
                value: NatValue {
                    last_seen,
                    translate_ip: "10.0.0.20".to_string(),
                    translate_port: xlate_port,
                },
            }
        }
    }

    proptest! {
        // Any state whose ports fit in 16 bits round-trips exactly.
        #[test]
        fn prop_wire_round_trip(
            entries in proptest::collection::vec(arb_entry(), 0..32),
            last_chunk in 0u16..=65535,
            bitmap in proptest::collection::vec(any::<u8>(), 0..64),
            dest in proptest::option::of("[1-9][0-9.]{2,12}"),
        ) {
            let state = NatState {
                ips: vec!["10.0.0.5".to_string()],
                tcp_inbound: entries.clone(),
                udp_inbound: entries,
                nat_ports: vec![NatBitmapEntry {
                    nat_ip: "10.0.0.5".to_string(),
                    destination_ip: dest,
                    last_chunk,
                    bitmap,
                }],
                ..NatState::default()
            };
            prop_assert_eq!(state.clone(), WireNatState::from_local(&state).into_local());
        }
    }
}
