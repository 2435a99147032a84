//! NAT state data model.
//!
//! This is the local form of the replicated payload, matching the data
//! plane's `GET /state` / `PUT /state` JSON schema. The wire form carried
//! between the two nodes lives in [`crate::wire`].

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Clamp a wire port value to the valid 16-bit range.
///
/// The wire format carries ports as 32-bit integers; values above 65535 are
/// invalid and are clamped, never truncated.
#[must_use]
pub fn clamp_port(port: u32) -> u16 {
    if port > u32::from(u16::MAX) {
        warn!(port, "port value exceeds 16 bits, clamping to 65535");
        u16::MAX
    } else {
        port as u16
    }
}

/// Connection key: the 4-tuple identifying a translated flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatKey {
    /// Destination address
    pub destination_ip: String,
    /// Destination port
    pub destination_port: u16,
    /// Source address
    pub source_ip: String,
    /// Source port
    pub source_port: u16,
}

/// Connection value: the translation applied to a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatValue {
    /// Last activity timestamp in nanoseconds since epoch
    pub last_seen: u64,
    /// Translated address
    pub translate_ip: String,
    /// Translated port
    pub translate_port: u16,
}

/// One entry of a connection table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatEntry {
    /// Flow identity
    pub key: NatKey,
    /// Translation state
    pub value: NatValue,
}

/// Port-allocation bitmap for one NAT address (and optional destination).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatBitmapEntry {
    /// NAT pool address this bitmap belongs to
    pub nat_ip: String,
    /// Optional per-destination scope
    pub destination_ip: Option<String>,
    /// Index of the last allocated chunk
    pub last_chunk: u16,
    /// Opaque allocation bitmap
    pub bitmap: Vec<u8>,
}

/// Complete NAT translation state replicated between the pair.
///
/// Entry order is not semantically significant but is preserved across the
/// wire. Never persisted locally; fetched from and pushed to the data plane
/// on demand.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatState {
    /// Externally visible addresses used for translation
    pub ips: Vec<String>,
    /// Inbound TCP connection table
    pub tcp_inbound: Vec<NatEntry>,
    /// Outbound TCP connection table
    pub tcp_outbound: Vec<NatEntry>,
    /// Inbound UDP connection table
    pub udp_inbound: Vec<NatEntry>,
    /// Outbound UDP connection table
    pub udp_outbound: Vec<NatEntry>,
    /// Port allocation bitmaps
    pub nat_ports: Vec<NatBitmapEntry>,
}

impl NatState {
    /// Total number of connection entries across all four tables.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.tcp_inbound.len()
            + self.tcp_outbound.len()
            + self.udp_inbound.len()
            + self.udp_outbound.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_port_passthrough() {
        assert_eq!(clamp_port(0), 0);
        assert_eq!(clamp_port(1022), 1022);
        assert_eq!(clamp_port(65535), 65535);
    }

    #[test]
    fn test_clamp_port_clamps_wide_values() {
        assert_eq!(clamp_port(65536), 65535);
        assert_eq!(clamp_port(u32::MAX), 65535);
    }

    #[test]
    fn test_state_json_round_trip() {
        let state = NatState {
            ips: vec!["10.0.0.5".to_string()],
            tcp_inbound: vec![NatEntry {
                key: NatKey {
                    destination_ip: "10.0.0.5".to_string(),
                    destination_port: 443,
                    source_ip: "192.168.1.9".to_string(),
                    source_port: 51612,
                },
                value: NatValue {
                    last_seen: 1_700_000_000_000_000_000,
                    translate_ip: "10.0.0.5".to_string(),
                    translate_port: 8443,
                },
            }],
            nat_ports: vec![NatBitmapEntry {
                nat_ip: "10.0.0.5".to_string(),
                destination_ip: None,
                last_chunk: 3,
                bitmap: vec![0xff, 0x01],
            }],
            ..NatState::default()
        };

        let json = serde_json::to_vec(&state).unwrap();
        let decoded: NatState = serde_json::from_slice(&json).unwrap();
        assert_eq!(state, decoded);
    }
}
