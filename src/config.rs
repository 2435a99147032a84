//! Daemon configuration and validation.

use crate::{
    error::{Error, Result},
    types::{NodeRole, ROLE_STR_PRIMARY, ROLE_STR_SECONDARY},
};
use serde::{Deserialize, Serialize};
use std::{net::Ipv4Addr, path::PathBuf, time::Duration};

/// Default RPC port between the two nodes.
pub const DEFAULT_PORT: u16 = 1022;

/// Default election poll interval.
pub const DEFAULT_LEADER_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Default state replication interval while secondary.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(10);

/// Default heartbeat tick. 40ms permits three beats inside the 150ms
/// failover SLA.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(40);

/// Default number of consecutive missed heartbeats before failover.
pub const DEFAULT_HEARTBEAT_MISS_THRESHOLD: u32 = 3;

/// Failover daemon configuration.
///
/// Zero-valued intervals and thresholds are replaced with defaults during
/// [`validate`](FailoverConfig::validate); required fields fail validation
/// when missing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Floating IP address whose ownership acts as the leader lease
    pub eni_ip: String,

    /// Port for RPC communication between the two nodes
    pub port: u16,

    /// Path to the local data plane's unix socket
    pub local_socket: PathBuf,

    /// Destination CIDR whose route should follow the primary (optional)
    pub destination_cidr: Option<String>,

    /// Interval for checking floating IP ownership
    #[serde(with = "humantime_serde")]
    pub leader_check_interval: Duration,

    /// Interval for syncing NAT state while secondary
    #[serde(with = "humantime_serde")]
    pub sync_interval: Duration,

    /// Heartbeat tick interval
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Consecutive missed heartbeats before failover
    pub heartbeat_miss_threshold: u32,

    /// Disable floating IP ownership checks (test mode)
    pub disable_eni_check: bool,

    /// Forced role for test mode ("primary" or "secondary", empty for none)
    pub force_role: String,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            eni_ip: String::new(),
            port: DEFAULT_PORT,
            local_socket: PathBuf::new(),
            destination_cidr: None,
            leader_check_interval: DEFAULT_LEADER_CHECK_INTERVAL,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_miss_threshold: DEFAULT_HEARTBEAT_MISS_THRESHOLD,
            disable_eni_check: false,
            force_role: String::new(),
        }
    }
}

impl FailoverConfig {
    /// Validate the configuration, filling zero values with defaults.
    pub fn validate(&mut self) -> Result<()> {
        if self.eni_ip.is_empty() {
            return Err(Error::configuration("ENI IP address is required"));
        }
        if !self.disable_eni_check && self.eni_ip.parse::<Ipv4Addr>().is_err() {
            return Err(Error::configuration(format!(
                "invalid ENI IP address: {}",
                self.eni_ip
            )));
        }
        if self.local_socket.as_os_str().is_empty() {
            return Err(Error::configuration("local socket path is required"));
        }
        if let Some(cidr) = &self.destination_cidr {
            if cidr.is_empty() {
                self.destination_cidr = None;
            }
        }
        if self.port == 0 {
            self.port = DEFAULT_PORT;
        }
        if self.leader_check_interval.is_zero() {
            self.leader_check_interval = DEFAULT_LEADER_CHECK_INTERVAL;
        }
        if self.sync_interval.is_zero() {
            self.sync_interval = DEFAULT_SYNC_INTERVAL;
        }
        if self.heartbeat_interval.is_zero() {
            self.heartbeat_interval = DEFAULT_HEARTBEAT_INTERVAL;
        }
        if self.heartbeat_miss_threshold == 0 {
            self.heartbeat_miss_threshold = DEFAULT_HEARTBEAT_MISS_THRESHOLD;
        }
        if !self.force_role.is_empty()
            && self.force_role != ROLE_STR_PRIMARY
            && self.force_role != ROLE_STR_SECONDARY
        {
            return Err(Error::configuration(format!(
                "force-role must be '{ROLE_STR_PRIMARY}' or '{ROLE_STR_SECONDARY}', got: {}",
                self.force_role
            )));
        }
        Ok(())
    }

    /// Role forced in test mode. Anything other than an explicit "primary"
    /// forces Secondary, matching the safe default for an undecided node.
    #[must_use]
    pub fn forced_role(&self) -> NodeRole {
        if self.force_role == ROLE_STR_PRIMARY {
            NodeRole::Primary
        } else {
            NodeRole::Secondary
        }
    }

    /// Address the secondary dials to reach the primary.
    #[must_use]
    pub fn peer_addr(&self) -> String {
        format!("{}:{}", self.eni_ip, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> FailoverConfig {
        FailoverConfig {
            eni_ip: "10.0.0.5".to_string(),
            local_socket: PathBuf::from("/run/nat/api.sock"),
            ..FailoverConfig::default()
        }
    }

    #[test]
    fn test_valid_config_passes() {
        let mut config = base_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_eni_ip_rejected() {
        let mut config = base_config();
        config.eni_ip = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_eni_ip_rejected() {
        let mut config = base_config();
        config.eni_ip = "not-an-ip".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_eni_ip_allowed_in_test_mode() {
        let mut config = base_config();
        config.eni_ip = "localhost".to_string();
        config.disable_eni_check = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_local_socket_rejected() {
        let mut config = base_config();
        config.local_socket = PathBuf::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_values_become_defaults() {
        let mut config = base_config();
        config.port = 0;
        config.leader_check_interval = Duration::ZERO;
        config.sync_interval = Duration::ZERO;
        config.heartbeat_interval = Duration::ZERO;
        config.heartbeat_miss_threshold = 0;

        config.validate().unwrap();

        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.leader_check_interval, DEFAULT_LEADER_CHECK_INTERVAL);
        assert_eq!(config.sync_interval, DEFAULT_SYNC_INTERVAL);
        assert_eq!(config.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
        assert_eq!(config.heartbeat_miss_threshold, DEFAULT_HEARTBEAT_MISS_THRESHOLD);
    }

    #[test]
    fn test_invalid_force_role_rejected() {
        let mut config = base_config();
        config.force_role = "leader".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_force_role_accepted() {
        let mut config = base_config();
        config.force_role = String::new();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_forced_role_mapping() {
        let mut config = base_config();
        config.force_role = "primary".to_string();
        assert_eq!(config.forced_role(), NodeRole::Primary);

        config.force_role = "secondary".to_string();
        assert_eq!(config.forced_role(), NodeRole::Secondary);

        config.force_role = String::new();
        assert_eq!(config.forced_role(), NodeRole::Secondary);
    }

    #[test]
    fn test_empty_destination_cidr_normalised() {
        let mut config = base_config();
        config.destination_cidr = Some(String::new());
        config.validate().unwrap();
        assert!(config.destination_cidr.is_none());
    }
}
