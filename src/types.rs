//! Core types used across the failover daemon.

use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Display},
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};

/// Role string constants used on the wire and in logs.
pub const ROLE_STR_PRIMARY: &str = "primary";
pub const ROLE_STR_SECONDARY: &str = "secondary";
pub const ROLE_STR_UNKNOWN: &str = "unknown";

/// Current role of a failover node.
///
/// `Unknown` exists only between startup and the first election result; once
/// a node has been Primary or Secondary it never silently returns to Unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NodeRole {
    /// Role not yet determined
    Unknown = 0,
    /// Actively translating traffic and serving replication
    Primary = 1,
    /// Warm standby receiving state replication
    Secondary = 2,
}

impl NodeRole {
    /// Role as the lowercase string carried in health-check responses.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => ROLE_STR_PRIMARY,
            Self::Secondary => ROLE_STR_SECONDARY,
            Self::Unknown => ROLE_STR_UNKNOWN,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Primary,
            2 => Self::Secondary,
            _ => Self::Unknown,
        }
    }
}

impl Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lock-free shared view of the current role.
///
/// Written only by the role manager; everyone else reads. Stale reads are
/// acceptable and self-correct on the next tick.
#[derive(Debug, Clone, Default)]
pub struct SharedRole(Arc<AtomicU8>);

impl SharedRole {
    /// Create a new shared role initialised to [`NodeRole::Unknown`].
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(NodeRole::Unknown as u8)))
    }

    /// Read the current role.
    #[must_use]
    pub fn load(&self) -> NodeRole {
        NodeRole::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Replace the current role.
    pub fn store(&self, role: NodeRole) {
        self.0.store(role as u8, Ordering::Release);
    }
}

/// Cloud instance identifier, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(String);

impl InstanceId {
    /// Create an instance ID from a cloud-assigned string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Cloud network interface identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InterfaceId(String);

impl InterfaceId {
    /// Create an interface ID from a cloud-assigned string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for InterfaceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Cloud route table identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RouteTableId(String);

impl RouteTableId {
    /// Create a route table ID from a cloud-assigned string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RouteTableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RouteTableId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_strings() {
        assert_eq!(NodeRole::Primary.as_str(), "primary");
        assert_eq!(NodeRole::Secondary.as_str(), "secondary");
        assert_eq!(NodeRole::Unknown.as_str(), "unknown");
    }

    #[test]
    fn test_shared_role_starts_unknown() {
        let role = SharedRole::new();
        assert_eq!(role.load(), NodeRole::Unknown);
    }

    #[test]
    fn test_shared_role_store_load() {
        let role = SharedRole::new();
        let observer = role.clone();

        role.store(NodeRole::Primary);
        assert_eq!(observer.load(), NodeRole::Primary);

        role.store(NodeRole::Secondary);
        assert_eq!(observer.load(), NodeRole::Secondary);
    }
}
