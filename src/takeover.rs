//! Takeover executor.
//!
//! Performs the ordered cloud-side mutations that make this node the
//! primary: claim the floating identity, discover the NAT pool addresses
//! still parked on the old primary's interface, rewrite routes and migrate
//! the pool in parallel, then move any public address attachment. Only the
//! claim step can abort a promotion; everything after it degrades, logs and
//! carries on.

use crate::{
    error::{Error, Result},
    fabric::CloudFabric,
    types::{InstanceId, InterfaceId},
};
use futures::future::join_all;
use std::{net::Ipv4Addr, sync::Arc};
use tracing::{debug, error, info, warn};

/// Lowest last octet a secondary address must have to count as part of the
/// NAT pool. Addresses below this are control-plane addresses and stay put.
pub const FLOATING_POOL_MIN_HOST: u8 = 20;

/// Filter candidate addresses to the NAT pool: same /24 as the floating
/// identity and a host octet in the pool range.
#[must_use]
pub fn filter_floating_pool(candidates: &[String], floating_ip: &str) -> Vec<String> {
    let Ok(base) = floating_ip.parse::<Ipv4Addr>() else {
        return candidates.to_vec();
    };
    let base_octets = base.octets();

    candidates
        .iter()
        .filter(|candidate| {
            let Ok(addr) = candidate.parse::<Ipv4Addr>() else {
                return false;
            };
            let octets = addr.octets();
            octets[..3] == base_octets[..3] && octets[3] >= FLOATING_POOL_MIN_HOST
        })
        .cloned()
        .collect()
}

/// Outcome of a takeover run. `degraded` carries the errors of the
/// non-aborting steps.
#[derive(Debug, Default)]
pub struct TakeoverSummary {
    /// Interface now holding the floating identity
    pub interface: Option<InterfaceId>,
    /// Pool addresses migrated from the old primary
    pub migrated_addresses: Vec<String>,
    /// Number of route tables rewritten
    pub rewritten_route_tables: usize,
    /// Errors from steps that do not abort promotion
    pub degraded: Vec<String>,
}

/// Executes the cloud-side takeover sequence.
#[derive(Debug)]
pub struct TakeoverExecutor {
    fabric: Arc<dyn CloudFabric>,
    instance: InstanceId,
    floating_ip: String,
    destination_cidr: Option<String>,
}

impl TakeoverExecutor {
    /// Create an executor for this node.
    #[must_use]
    pub fn new(
        fabric: Arc<dyn CloudFabric>,
        instance: InstanceId,
        floating_ip: String,
        destination_cidr: Option<String>,
    ) -> Self {
        Self { fabric, instance, floating_ip, destination_cidr }
    }

    /// Run the takeover sequence. Returns an error only when claiming the
    /// floating identity fails; that error must abort the promotion.
    pub async fn execute(&self) -> Result<TakeoverSummary> {
        info!(eni_ip = %self.floating_ip, "executing takeover");

        let new_interface = self.claim_floating_identity().await?;
        info!(interface = %new_interface, eni_ip = %self.floating_ip, "floating identity claimed");

        let mut summary =
            TakeoverSummary { interface: Some(new_interface.clone()), ..TakeoverSummary::default() };

        let pool = self.discover_floating_pool(&new_interface).await;

        let (route_result, pool_result) = tokio::join!(
            self.rewrite_routes(&new_interface),
            self.migrate_floating_pool(pool.clone(), &new_interface),
        );

        match route_result {
            Ok(count) => summary.rewritten_route_tables = count,
            Err(e) => {
                error!(error = %e, "route table update failed");
                summary.degraded.push(format!("route table update failed: {e}"));
            },
        }
        match pool_result {
            Ok(()) => {
                if let Some((_, addresses)) = pool {
                    summary.migrated_addresses = addresses;
                }
            },
            Err(e) => {
                error!(error = %e, "floating pool migration failed");
                summary.degraded.push(format!("floating pool migration failed: {e}"));
            },
        }

        // Public address migration is supplementary; failure is logged and
        // promotion stands.
        if let Err(e) = self.migrate_public_address(&new_interface).await {
            warn!(error = %e, "public address migration failed");
        }

        if summary.degraded.is_empty() {
            info!("takeover completed");
        } else {
            warn!(errors = summary.degraded.len(), "takeover completed degraded");
        }
        Ok(summary)
    }

    /// Step 1: move the floating identity onto our interface and verify.
    async fn claim_floating_identity(&self) -> Result<InterfaceId> {
        let binding = self
            .fabric
            .find_interface_by_address(&self.floating_ip)
            .await
            .map_err(|e| Error::takeover(format!("failed to locate floating identity: {e}")))?;

        let our_interface = self
            .fabric
            .find_interface_by_node(&self.instance)
            .await
            .map_err(|e| Error::takeover(format!("failed to locate our interface: {e}")))?;

        if binding.interface == our_interface {
            debug!(interface = %our_interface, "floating identity already ours");
            return Ok(our_interface);
        }

        self.fabric
            .unassign_secondary_address(&binding.interface, &self.floating_ip)
            .await
            .map_err(|e| {
                Error::takeover(format!(
                    "failed to unassign {} from {}: {e}",
                    self.floating_ip, binding.interface
                ))
            })?;

        self.fabric
            .assign_secondary_address(&our_interface, &self.floating_ip)
            .await
            .map_err(|e| {
                Error::takeover(format!(
                    "failed to assign {} to {}: {e}",
                    self.floating_ip, our_interface
                ))
            })?;

        // Re-resolve to confirm the fabric agrees the address moved.
        let verified = self
            .fabric
            .find_interface_by_address(&self.floating_ip)
            .await
            .map_err(|e| Error::takeover(format!("failed to verify claim: {e}")))?;
        if verified.interface != our_interface {
            return Err(Error::takeover(format!(
                "claim verification failed: {} is on {} instead of {}",
                self.floating_ip, verified.interface, our_interface
            )));
        }

        Ok(our_interface)
    }

    /// Step 3: find the old primary's interface still carrying pool
    /// addresses. Errors here only log; promotion continues without a pool
    /// migration.
    async fn discover_floating_pool(
        &self,
        new_interface: &InterfaceId,
    ) -> Option<(InterfaceId, Vec<String>)> {
        let interfaces = match self.fabric.list_interfaces().await {
            Ok(interfaces) => interfaces,
            Err(e) => {
                warn!(error = %e, "failed to list interfaces, skipping pool migration");
                return None;
            },
        };

        for interface in interfaces {
            if interface == *new_interface {
                continue;
            }
            let addresses = match self.fabric.list_secondary_addresses(&interface).await {
                Ok(addresses) => addresses,
                Err(e) => {
                    debug!(interface = %interface, error = %e, "failed to list addresses");
                    continue;
                },
            };
            let pool = filter_floating_pool(&addresses, &self.floating_ip);
            if !pool.is_empty() {
                info!(
                    old_interface = %interface,
                    count = pool.len(),
                    addresses = %pool.join(","),
                    "found old primary interface with pool addresses"
                );
                return Some((interface, pool));
            }
        }
        None
    }

    /// Step 4a: point every matching route table at the new interface.
    /// A configured destination with no matching route table is an error.
    async fn rewrite_routes(&self, new_interface: &InterfaceId) -> Result<usize> {
        let Some(cidr) = &self.destination_cidr else {
            debug!("no destination CIDR configured, skipping route table update");
            return Ok(0);
        };

        let tables = self.fabric.find_route_tables_with_destination(cidr).await?;
        if tables.is_empty() {
            return Err(Error::takeover(format!("no route tables found with routes to {cidr}")));
        }
        info!(count = tables.len(), cidr = %cidr, "updating route tables");

        let results = join_all(tables.iter().map(|table| {
            let fabric = self.fabric.clone();
            async move { fabric.replace_route(table, cidr, new_interface).await }
        }))
        .await;

        let failures: Vec<String> = tables
            .iter()
            .zip(results)
            .filter_map(|(table, result)| {
                result.err().map(|e| format!("table {table}: {e}"))
            })
            .collect();
        if !failures.is_empty() {
            return Err(Error::takeover(format!(
                "route table update errors: {}",
                failures.join("; ")
            )));
        }
        Ok(tables.len())
    }

    /// Step 4b: move the pool addresses. Every unassign completes before any
    /// assign starts, otherwise the fabric rejects the duplicates.
    async fn migrate_floating_pool(
        &self,
        pool: Option<(InterfaceId, Vec<String>)>,
        new_interface: &InterfaceId,
    ) -> Result<()> {
        let Some((old_interface, addresses)) = pool else {
            info!("no floating pool addresses to migrate");
            return Ok(());
        };
        info!(
            old_interface = %old_interface,
            new_interface = %new_interface,
            count = addresses.len(),
            "migrating floating pool addresses"
        );

        let mut failures = Vec::new();

        let unassigns = join_all(addresses.iter().map(|ip| {
            let fabric = self.fabric.clone();
            let old_interface = old_interface.clone();
            async move { fabric.unassign_secondary_address(&old_interface, ip).await }
        }))
        .await;
        for (ip, result) in addresses.iter().zip(unassigns) {
            if let Err(e) = result {
                failures.push(format!("unassign {ip} from {old_interface}: {e}"));
            }
        }

        let assigns = join_all(addresses.iter().map(|ip| {
            let fabric = self.fabric.clone();
            let new_interface = new_interface.clone();
            async move { fabric.assign_secondary_address(&new_interface, ip).await }
        }))
        .await;
        for (ip, result) in addresses.iter().zip(assigns) {
            if let Err(e) = result {
                failures.push(format!("assign {ip} to {new_interface}: {e}"));
            }
        }

        if !failures.is_empty() {
            return Err(Error::takeover(format!(
                "floating pool migration errors: {}",
                failures.join("; ")
            )));
        }
        Ok(())
    }

    /// Step 5: re-attach the public address mapped to the floating identity.
    async fn migrate_public_address(&self, new_interface: &InterfaceId) -> Result<()> {
        let Some(public) = self.fabric.find_public_address_by_private(&self.floating_ip).await?
        else {
            debug!(eni_ip = %self.floating_ip, "no public address mapped, skipping");
            return Ok(());
        };

        info!(
            allocation_id = %public.allocation_id,
            public_ip = %public.public_ip,
            new_interface = %new_interface,
            "moving public address"
        );

        if let Some(association_id) = &public.association_id {
            self.fabric.disassociate_public_address(association_id).await?;
        }
        self.fabric
            .associate_public_address(&public.allocation_id, new_interface, &self.floating_ip)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::InMemoryFabric;
    use crate::types::RouteTableId;

    fn two_node_fabric() -> Arc<InMemoryFabric> {
        let fabric = Arc::new(InMemoryFabric::new("i-new"));
        fabric.add_interface("eni-old", "i-old");
        fabric.add_interface("eni-new", "i-new");
        fabric.add_secondary_ip("eni-old", "10.0.0.5");
        fabric
    }

    fn executor(fabric: Arc<InMemoryFabric>, cidr: Option<&str>) -> TakeoverExecutor {
        TakeoverExecutor::new(
            fabric,
            InstanceId::from("i-new"),
            "10.0.0.5".to_string(),
            cidr.map(str::to_string),
        )
    }

    #[test]
    fn test_pool_filter_boundary() {
        let candidates = vec![
            "10.0.0.19".to_string(),
            "10.0.0.20".to_string(),
            "10.0.0.250".to_string(),
            "10.0.1.30".to_string(),
            "not-an-ip".to_string(),
        ];
        let filtered = filter_floating_pool(&candidates, "10.0.0.5");
        assert_eq!(filtered, vec!["10.0.0.20".to_string(), "10.0.0.250".to_string()]);
    }

    #[test]
    fn test_pool_filter_unparseable_base_keeps_everything() {
        let candidates = vec!["10.0.0.20".to_string()];
        assert_eq!(filter_floating_pool(&candidates, "floating"), candidates);
    }

    #[tokio::test]
    async fn test_claim_moves_and_verifies() {
        let fabric = two_node_fabric();
        let summary = executor(fabric.clone(), None).execute().await.unwrap();

        assert_eq!(summary.interface, Some(InterfaceId::from("eni-new")));
        assert!(summary.degraded.is_empty());
        assert_eq!(
            fabric.secondary_ips(&InterfaceId::from("eni-new")),
            vec!["10.0.0.5".to_string()]
        );
        assert!(fabric.secondary_ips(&InterfaceId::from("eni-old")).is_empty());
    }

    #[tokio::test]
    async fn test_claim_skipped_when_already_ours() {
        let fabric = Arc::new(InMemoryFabric::new("i-new"));
        fabric.add_interface("eni-new", "i-new");
        fabric.add_secondary_ip("eni-new", "10.0.0.5");

        let summary = executor(fabric, None).execute().await.unwrap();
        assert_eq!(summary.interface, Some(InterfaceId::from("eni-new")));
    }

    #[tokio::test]
    async fn test_claim_failure_aborts() {
        let fabric = two_node_fabric();
        fabric.fail_operation("unassign_secondary_address");

        let err = executor(fabric, None).execute().await.unwrap_err();
        assert!(matches!(err, Error::Takeover(_)));
    }

    #[tokio::test]
    async fn test_pool_and_routes_migrate() {
        let fabric = two_node_fabric();
        fabric.add_secondary_ip("eni-old", "10.0.0.20");
        fabric.add_secondary_ip("eni-old", "10.0.0.21");
        fabric.add_secondary_ip("eni-old", "10.0.0.7"); // below pool range, stays
        fabric.add_route("rt-1", "10.1.0.0/16", InterfaceId::from("eni-old"));
        fabric.add_route("rt-2", "10.1.0.0/16", InterfaceId::from("eni-old"));

        let summary = executor(fabric.clone(), Some("10.1.0.0/16")).execute().await.unwrap();

        assert!(summary.degraded.is_empty());
        assert_eq!(summary.rewritten_route_tables, 2);
        assert_eq!(
            summary.migrated_addresses,
            vec!["10.0.0.20".to_string(), "10.0.0.21".to_string()]
        );
        assert_eq!(
            fabric.route_target(&RouteTableId::from("rt-1"), "10.1.0.0/16"),
            Some(InterfaceId::from("eni-new"))
        );
        assert_eq!(
            fabric.route_target(&RouteTableId::from("rt-2"), "10.1.0.0/16"),
            Some(InterfaceId::from("eni-new"))
        );
        let new_ips = fabric.secondary_ips(&InterfaceId::from("eni-new"));
        assert!(new_ips.contains(&"10.0.0.20".to_string()));
        assert!(new_ips.contains(&"10.0.0.21".to_string()));
        assert_eq!(
            fabric.secondary_ips(&InterfaceId::from("eni-old")),
            vec!["10.0.0.7".to_string()]
        );
    }

    #[tokio::test]
    async fn test_missing_route_degrades_but_does_not_abort() {
        let fabric = two_node_fabric();

        let summary = executor(fabric, Some("10.9.0.0/16")).execute().await.unwrap();
        assert_eq!(summary.rewritten_route_tables, 0);
        assert_eq!(summary.degraded.len(), 1);
        assert!(summary.degraded[0].contains("no route tables"));
    }

    #[tokio::test]
    async fn test_route_failure_does_not_block_pool_migration() {
        let fabric = two_node_fabric();
        fabric.add_secondary_ip("eni-old", "10.0.0.30");
        fabric.add_route("rt-1", "10.1.0.0/16", InterfaceId::from("eni-old"));
        fabric.fail_operation("replace_route");

        let summary = executor(fabric.clone(), Some("10.1.0.0/16")).execute().await.unwrap();
        assert_eq!(summary.degraded.len(), 1);
        assert_eq!(summary.migrated_addresses, vec!["10.0.0.30".to_string()]);
        assert!(fabric
            .secondary_ips(&InterfaceId::from("eni-new"))
            .contains(&"10.0.0.30".to_string()));
    }

    #[tokio::test]
    async fn test_public_address_follows_floating_identity() {
        let fabric = two_node_fabric();
        fabric.add_public_address(
            "eipalloc-9",
            "54.9.9.9",
            "10.0.0.5",
            Some(InterfaceId::from("eni-old")),
        );

        executor(fabric.clone(), None).execute().await.unwrap();
        assert_eq!(
            fabric.public_association("eipalloc-9"),
            Some(InterfaceId::from("eni-new"))
        );
    }
}
