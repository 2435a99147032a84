//! Cloud fabric capability interface.
//!
//! The takeover executor and the election supervisor depend on this narrow
//! capability set instead of a concrete provider SDK. Deployments supply an
//! adapter per cloud provider; tests (and the `--disable-eni-check` mode)
//! use the in-memory implementation.

use crate::types::{InstanceId, InterfaceId, RouteTableId};
use async_trait::async_trait;
use thiserror::Error;

pub mod memory;

pub use memory::InMemoryFabric;

/// Cloud fabric specific error types.
#[derive(Debug, Error)]
pub enum FabricError {
    /// No interface currently holds the requested address
    #[error("no interface found with address {0}")]
    InterfaceNotFound(String),

    /// The node has no attached interface
    #[error("no interface attached to instance {0}")]
    NoInterfaceForInstance(String),

    /// No route table has a route to the requested destination
    #[error("no route tables found with routes to {0}")]
    NoMatchingRouteTable(String),

    /// Instance identity could not be resolved
    #[error("failed to resolve instance identity: {0}")]
    Identity(String),

    /// Any other provider API failure
    #[error("cloud api error: {0}")]
    Api(String),
}

/// Result type for fabric operations.
pub type FabricResult<T> = std::result::Result<T, FabricError>;

/// An interface together with the instance it is attached to, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceBinding {
    /// Interface currently holding the looked-up address
    pub interface: InterfaceId,
    /// Instance the interface is attached to
    pub attached_instance: Option<InstanceId>,
}

/// A public address mapping associated with a private address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicAddress {
    /// Provider allocation id of the public address
    pub allocation_id: String,
    /// The public address itself
    pub public_ip: String,
    /// Current association, if the address is attached anywhere
    pub association_id: Option<String>,
}

/// Narrow capability set the failover daemon needs from the cloud.
///
/// All operations may suspend; implementations must be safe to call from
/// concurrent tasks.
#[async_trait]
pub trait CloudFabric: Send + Sync + std::fmt::Debug {
    /// Resolve this node's cloud instance identity.
    async fn resolve_self_identity(&self) -> FabricResult<InstanceId>;

    /// Find the interface currently holding `ip` as one of its addresses.
    async fn find_interface_by_address(&self, ip: &str) -> FabricResult<InterfaceBinding>;

    /// Find the interface attached to the given instance.
    async fn find_interface_by_node(&self, instance: &InstanceId) -> FabricResult<InterfaceId>;

    /// Assign `ip` to `interface` as a secondary address.
    async fn assign_secondary_address(&self, interface: &InterfaceId, ip: &str)
        -> FabricResult<()>;

    /// Remove `ip` from `interface`'s secondary addresses.
    async fn unassign_secondary_address(
        &self,
        interface: &InterfaceId,
        ip: &str,
    ) -> FabricResult<()>;

    /// List the secondary addresses assigned to `interface`.
    async fn list_secondary_addresses(&self, interface: &InterfaceId)
        -> FabricResult<Vec<String>>;

    /// List every interface in the network.
    async fn list_interfaces(&self) -> FabricResult<Vec<InterfaceId>>;

    /// Find all route tables carrying a route whose destination is `cidr`.
    async fn find_route_tables_with_destination(
        &self,
        cidr: &str,
    ) -> FabricResult<Vec<RouteTableId>>;

    /// Point the `cidr` route of `table` at `interface`.
    async fn replace_route(
        &self,
        table: &RouteTableId,
        cidr: &str,
        interface: &InterfaceId,
    ) -> FabricResult<()>;

    /// Look up the public address mapped to a private address, if any.
    async fn find_public_address_by_private(
        &self,
        ip: &str,
    ) -> FabricResult<Option<PublicAddress>>;

    /// Detach a public address from its current association.
    async fn disassociate_public_address(&self, association_id: &str) -> FabricResult<()>;

    /// Attach a public address to `interface`, targeting `private_ip`.
    /// Reassociation override is implied: an existing association on another
    /// interface is replaced.
    async fn associate_public_address(
        &self,
        allocation_id: &str,
        interface: &InterfaceId,
        private_ip: &str,
    ) -> FabricResult<()>;
}
