//! In-memory cloud fabric.
//!
//! Models interfaces, secondary addresses, route tables and public address
//! associations as plain tables behind a mutex. Supports per-operation
//! failure injection so tests can exercise the takeover failure paths.

use super::{CloudFabric, FabricError, FabricResult, InterfaceBinding, PublicAddress};
use crate::types::{InstanceId, InterfaceId, RouteTableId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Default)]
struct InterfaceRecord {
    attached_instance: Option<InstanceId>,
    secondary_ips: Vec<String>,
}

#[derive(Debug)]
struct PublicRecord {
    allocation_id: String,
    public_ip: String,
    private_ip: String,
    association: Option<(String, InterfaceId)>,
}

#[derive(Debug, Default)]
struct Inner {
    self_instance: Option<InstanceId>,
    interfaces: BTreeMap<InterfaceId, InterfaceRecord>,
    /// table id -> (destination cidr -> target interface)
    route_tables: BTreeMap<RouteTableId, BTreeMap<String, InterfaceId>>,
    public_addresses: Vec<PublicRecord>,
    failing_ops: HashSet<&'static str>,
    association_seq: u64,
}

/// In-memory implementation of [`CloudFabric`].
#[derive(Debug, Default)]
pub struct InMemoryFabric {
    inner: Mutex<Inner>,
}

impl InMemoryFabric {
    /// Create an empty fabric reporting the given self identity.
    #[must_use]
    pub fn new(self_instance: impl Into<InstanceId>) -> Self {
        let fabric = Self::default();
        fabric.inner.lock().self_instance = Some(self_instance.into());
        fabric
    }

    /// Add an interface attached to an instance.
    pub fn add_interface(&self, interface: impl Into<InterfaceId>, instance: impl Into<InstanceId>) {
        self.inner.lock().interfaces.insert(
            interface.into(),
            InterfaceRecord { attached_instance: Some(instance.into()), secondary_ips: Vec::new() },
        );
    }

    /// Add a detached interface.
    pub fn add_detached_interface(&self, interface: impl Into<InterfaceId>) {
        self.inner.lock().interfaces.insert(interface.into(), InterfaceRecord::default());
    }

    /// Assign a secondary address to an interface directly.
    pub fn add_secondary_ip(&self, interface: impl Into<InterfaceId>, ip: impl Into<String>) {
        let interface = interface.into();
        let mut inner = self.inner.lock();
        inner
            .interfaces
            .entry(interface)
            .or_default()
            .secondary_ips
            .push(ip.into());
    }

    /// Add a route table with a single route.
    pub fn add_route(
        &self,
        table: impl Into<RouteTableId>,
        cidr: impl Into<String>,
        target: impl Into<InterfaceId>,
    ) {
        self.inner
            .lock()
            .route_tables
            .entry(table.into())
            .or_default()
            .insert(cidr.into(), target.into());
    }

    /// Register a public address mapped to a private address.
    pub fn add_public_address(
        &self,
        allocation_id: impl Into<String>,
        public_ip: impl Into<String>,
        private_ip: impl Into<String>,
        associated_interface: Option<InterfaceId>,
    ) {
        let mut inner = self.inner.lock();
        let association = associated_interface.map(|interface| {
            inner.association_seq += 1;
            (format!("assoc-{}", inner.association_seq), interface)
        });
        inner.public_addresses.push(PublicRecord {
            allocation_id: allocation_id.into(),
            public_ip: public_ip.into(),
            private_ip: private_ip.into(),
            association,
        });
    }

    /// Make the named operation fail with an API error until cleared.
    /// The name matches the trait method, e.g. `"unassign_secondary_address"`.
    pub fn fail_operation(&self, operation: &'static str) {
        self.inner.lock().failing_ops.insert(operation);
    }

    /// Clear a previously injected failure.
    pub fn clear_failure(&self, operation: &'static str) {
        self.inner.lock().failing_ops.remove(operation);
    }

    /// Current target of a route, for assertions.
    #[must_use]
    pub fn route_target(&self, table: &RouteTableId, cidr: &str) -> Option<InterfaceId> {
        self.inner.lock().route_tables.get(table).and_then(|routes| routes.get(cidr).cloned())
    }

    /// Current secondary addresses of an interface, for assertions.
    #[must_use]
    pub fn secondary_ips(&self, interface: &InterfaceId) -> Vec<String> {
        self.inner
            .lock()
            .interfaces
            .get(interface)
            .map(|rec| rec.secondary_ips.clone())
            .unwrap_or_default()
    }

    /// Interface a public allocation is associated with, for assertions.
    #[must_use]
    pub fn public_association(&self, allocation_id: &str) -> Option<InterfaceId> {
        self.inner
            .lock()
            .public_addresses
            .iter()
            .find(|rec| rec.allocation_id == allocation_id)
            .and_then(|rec| rec.association.as_ref().map(|(_, interface)| interface.clone()))
    }

    fn check_failure(inner: &Inner, operation: &'static str) -> FabricResult<()> {
        if inner.failing_ops.contains(operation) {
            return Err(FabricError::Api(format!("injected failure: {operation}")));
        }
        Ok(())
    }
}

#[async_trait]
impl CloudFabric for InMemoryFabric {
    async fn resolve_self_identity(&self) -> FabricResult<InstanceId> {
        let inner = self.inner.lock();
        Self::check_failure(&inner, "resolve_self_identity")?;
        inner
            .self_instance
            .clone()
            .ok_or_else(|| FabricError::Identity("no self instance configured".to_string()))
    }

    async fn find_interface_by_address(&self, ip: &str) -> FabricResult<InterfaceBinding> {
        let inner = self.inner.lock();
        Self::check_failure(&inner, "find_interface_by_address")?;
        for (interface, record) in &inner.interfaces {
            if record.secondary_ips.iter().any(|addr| addr == ip) {
                return Ok(InterfaceBinding {
                    interface: interface.clone(),
                    attached_instance: record.attached_instance.clone(),
                });
            }
        }
        Err(FabricError::InterfaceNotFound(ip.to_string()))
    }

    async fn find_interface_by_node(&self, instance: &InstanceId) -> FabricResult<InterfaceId> {
        let inner = self.inner.lock();
        Self::check_failure(&inner, "find_interface_by_node")?;
        for (interface, record) in &inner.interfaces {
            if record.attached_instance.as_ref() == Some(instance) {
                return Ok(interface.clone());
            }
        }
        Err(FabricError::NoInterfaceForInstance(instance.to_string()))
    }

    async fn assign_secondary_address(
        &self,
        interface: &InterfaceId,
        ip: &str,
    ) -> FabricResult<()> {
        let mut inner = self.inner.lock();
        Self::check_failure(&inner, "assign_secondary_address")?;
        for record in inner.interfaces.values() {
            if record.secondary_ips.iter().any(|addr| addr == ip) {
                return Err(FabricError::Api(format!("address {ip} is already assigned")));
            }
        }
        let record = inner
            .interfaces
            .get_mut(interface)
            .ok_or_else(|| FabricError::InterfaceNotFound(interface.to_string()))?;
        record.secondary_ips.push(ip.to_string());
        Ok(())
    }

    async fn unassign_secondary_address(
        &self,
        interface: &InterfaceId,
        ip: &str,
    ) -> FabricResult<()> {
        let mut inner = self.inner.lock();
        Self::check_failure(&inner, "unassign_secondary_address")?;
        let record = inner
            .interfaces
            .get_mut(interface)
            .ok_or_else(|| FabricError::InterfaceNotFound(interface.to_string()))?;
        let before = record.secondary_ips.len();
        record.secondary_ips.retain(|addr| addr != ip);
        if record.secondary_ips.len() == before {
            return Err(FabricError::Api(format!(
                "address {ip} is not assigned to {interface}"
            )));
        }
        Ok(())
    }

    async fn list_secondary_addresses(
        &self,
        interface: &InterfaceId,
    ) -> FabricResult<Vec<String>> {
        let inner = self.inner.lock();
        Self::check_failure(&inner, "list_secondary_addresses")?;
        inner
            .interfaces
            .get(interface)
            .map(|record| record.secondary_ips.clone())
            .ok_or_else(|| FabricError::InterfaceNotFound(interface.to_string()))
    }

    async fn list_interfaces(&self) -> FabricResult<Vec<InterfaceId>> {
        let inner = self.inner.lock();
        Self::check_failure(&inner, "list_interfaces")?;
        Ok(inner.interfaces.keys().cloned().collect())
    }

    async fn find_route_tables_with_destination(
        &self,
        cidr: &str,
    ) -> FabricResult<Vec<RouteTableId>> {
        let inner = self.inner.lock();
        Self::check_failure(&inner, "find_route_tables_with_destination")?;
        Ok(inner
            .route_tables
            .iter()
            .filter(|(_, routes)| routes.contains_key(cidr))
            .map(|(table, _)| table.clone())
            .collect())
    }

    async fn replace_route(
        &self,
        table: &RouteTableId,
        cidr: &str,
        interface: &InterfaceId,
    ) -> FabricResult<()> {
        let mut inner = self.inner.lock();
        Self::check_failure(&inner, "replace_route")?;
        let routes = inner
            .route_tables
            .get_mut(table)
            .ok_or_else(|| FabricError::Api(format!("route table {table} not found")))?;
        let target = routes
            .get_mut(cidr)
            .ok_or_else(|| FabricError::Api(format!("no route to {cidr} in table {table}")))?;
        *target = interface.clone();
        Ok(())
    }

    async fn find_public_address_by_private(
        &self,
        ip: &str,
    ) -> FabricResult<Option<PublicAddress>> {
        let inner = self.inner.lock();
        Self::check_failure(&inner, "find_public_address_by_private")?;
        Ok(inner
            .public_addresses
            .iter()
            .find(|rec| rec.private_ip == ip)
            .map(|rec| PublicAddress {
                allocation_id: rec.allocation_id.clone(),
                public_ip: rec.public_ip.clone(),
                association_id: rec.association.as_ref().map(|(id, _)| id.clone()),
            }))
    }

    async fn disassociate_public_address(&self, association_id: &str) -> FabricResult<()> {
        let mut inner = self.inner.lock();
        Self::check_failure(&inner, "disassociate_public_address")?;
        for rec in &mut inner.public_addresses {
            if rec.association.as_ref().is_some_and(|(id, _)| id == association_id) {
                rec.association = None;
                return Ok(());
            }
        }
        Err(FabricError::Api(format!("association {association_id} not found")))
    }

    async fn associate_public_address(
        &self,
        allocation_id: &str,
        interface: &InterfaceId,
        private_ip: &str,
    ) -> FabricResult<()> {
        let mut inner = self.inner.lock();
        Self::check_failure(&inner, "associate_public_address")?;
        inner.association_seq += 1;
        let association = (format!("assoc-{}", inner.association_seq), interface.clone());
        for rec in &mut inner.public_addresses {
            if rec.allocation_id == allocation_id {
                rec.private_ip = private_ip.to_string();
                rec.association = Some(association);
                return Ok(());
            }
        }
        Err(FabricError::Api(format!("allocation {allocation_id} not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_address_lookup_and_move() {
        let fabric = InMemoryFabric::new("i-self");
        fabric.add_interface("eni-a", "i-other");
        fabric.add_interface("eni-b", "i-self");
        fabric.add_secondary_ip("eni-a", "10.0.0.5");

        let binding = fabric.find_interface_by_address("10.0.0.5").await.unwrap();
        assert_eq!(binding.interface, InterfaceId::from("eni-a"));
        assert_eq!(binding.attached_instance, Some(InstanceId::from("i-other")));

        fabric
            .unassign_secondary_address(&InterfaceId::from("eni-a"), "10.0.0.5")
            .await
            .unwrap();
        fabric
            .assign_secondary_address(&InterfaceId::from("eni-b"), "10.0.0.5")
            .await
            .unwrap();

        let binding = fabric.find_interface_by_address("10.0.0.5").await.unwrap();
        assert_eq!(binding.interface, InterfaceId::from("eni-b"));
    }

    #[tokio::test]
    async fn test_duplicate_assignment_rejected() {
        let fabric = InMemoryFabric::new("i-self");
        fabric.add_interface("eni-a", "i-a");
        fabric.add_interface("eni-b", "i-b");
        fabric.add_secondary_ip("eni-a", "10.0.0.5");

        let err = fabric
            .assign_secondary_address(&InterfaceId::from("eni-b"), "10.0.0.5")
            .await
            .unwrap_err();
        assert!(matches!(err, FabricError::Api(_)));
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let fabric = InMemoryFabric::new("i-self");
        fabric.add_interface("eni-a", "i-self");
        fabric.fail_operation("list_interfaces");

        assert!(fabric.list_interfaces().await.is_err());
        fabric.clear_failure("list_interfaces");
        assert_eq!(fabric.list_interfaces().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_route_replacement() {
        let fabric = InMemoryFabric::new("i-self");
        fabric.add_interface("eni-b", "i-self");
        fabric.add_route("rt-1", "10.1.0.0/16", InterfaceId::from("eni-a"));

        let tables = fabric.find_route_tables_with_destination("10.1.0.0/16").await.unwrap();
        assert_eq!(tables, vec![RouteTableId::from("rt-1")]);
        assert!(fabric
            .find_route_tables_with_destination("192.168.0.0/16")
            .await
            .unwrap()
            .is_empty());

        fabric
            .replace_route(&RouteTableId::from("rt-1"), "10.1.0.0/16", &InterfaceId::from("eni-b"))
            .await
            .unwrap();
        assert_eq!(
            fabric.route_target(&RouteTableId::from("rt-1"), "10.1.0.0/16"),
            Some(InterfaceId::from("eni-b"))
        );
    }

    #[tokio::test]
    async fn test_public_address_migration() {
        let fabric = InMemoryFabric::new("i-self");
        fabric.add_interface("eni-a", "i-other");
        fabric.add_interface("eni-b", "i-self");
        fabric.add_public_address(
            "eipalloc-1",
            "54.1.2.3",
            "10.0.0.5",
            Some(InterfaceId::from("eni-a")),
        );

        let public = fabric
            .find_public_address_by_private("10.0.0.5")
            .await
            .unwrap()
            .expect("public address should exist");
        assert_eq!(public.public_ip, "54.1.2.3");
        let association = public.association_id.expect("should be associated");

        fabric.disassociate_public_address(&association).await.unwrap();
        assert_eq!(fabric.public_association("eipalloc-1"), None);

        fabric
            .associate_public_address("eipalloc-1", &InterfaceId::from("eni-b"), "10.0.0.5")
            .await
            .unwrap();
        assert_eq!(
            fabric.public_association("eipalloc-1"),
            Some(InterfaceId::from("eni-b"))
        );
    }
}
