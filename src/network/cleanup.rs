//! Sweep of allocator bridges no VM references any more
//!
//! Runs once per deletion batch, after interfaces were stripped and VMs
//! removed. Only bridges inside the managed ranges are candidates.

use std::collections::BTreeSet;

use tracing::{info, warn};

use super::ranges::BridgePolicy;
use crate::gateway::{referenced_bridges, ClusterGateway, GatewayError};

/// Outcome of a sweep across nodes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeCleanupReport {
    /// `(node, bridge)` pairs removed
    pub removed: Vec<(String, String)>,
    /// Nodes whose usage could not be established
    pub skipped_nodes: Vec<String>,
    pub reloaded_nodes: Vec<String>,
}

/// Managed bridges absent from the in-use set
pub fn unused_bridges(
    bridges: &[String],
    in_use: &BTreeSet<String>,
    policy: &BridgePolicy,
) -> Vec<String> {
    bridges
        .iter()
        .filter(|b| policy.is_managed(b) && !in_use.contains(*b))
        .cloned()
        .collect()
}

async fn bridges_in_use(
    gateway: &dyn ClusterGateway,
    node: &str,
) -> Result<BTreeSet<String>, GatewayError> {
    let mut used = BTreeSet::new();
    for vm in gateway.get_vms_on_node(node).await? {
        let config = gateway.vm_config(node, vm.vmid).await?;
        used.extend(referenced_bridges(&config));
    }
    Ok(used)
}

/// Delete provably unused bridges and reload the network of every node
pub async fn cleanup_unused_bridges(
    gateway: &dyn ClusterGateway,
    policy: &BridgePolicy,
    nodes: &[String],
) -> BridgeCleanupReport {
    let mut report = BridgeCleanupReport::default();

    for node in nodes {
        let usage = match gateway.list_bridges(node).await {
            Ok(bridges) => bridges_in_use(gateway, node).await.map(|used| (bridges, used)),
            Err(e) => Err(e),
        };
        let (bridges, used) = match usage {
            Ok(usage) => usage,
            Err(e) => {
                warn!("Skipping bridge cleanup on {}: {}", node, e);
                report.skipped_nodes.push(node.clone());
                continue;
            }
        };

        for bridge in unused_bridges(&bridges, &used, policy) {
            match gateway.delete_bridge(node, &bridge).await {
                Ok(()) => {
                    info!("Removed unused bridge {} on {}", bridge, node);
                    report.removed.push((node.clone(), bridge));
                }
                Err(e) => warn!("Failed to remove bridge {} on {}: {}", bridge, node, e),
            }
        }

        match gateway.reload_node_network(node).await {
            Ok(()) => report.reloaded_nodes.push(node.clone()),
            Err(e) => warn!("Network reload on {} failed: {}", node, e),
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::InMemoryCluster;

    #[test]
    fn test_unused_bridges_only_managed() {
        let bridges: Vec<String> = ["vmbr0", "vmbr1000", "vmbr1001", "lan"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let used: BTreeSet<String> = ["vmbr1001".to_string()].into_iter().collect();
        assert_eq!(
            unused_bridges(&bridges, &used, &BridgePolicy::default()),
            vec!["vmbr1000"]
        );
    }

    #[tokio::test]
    async fn test_cleanup_keeps_referenced_bridges() {
        let cluster = InMemoryCluster::new(&["pve1"])
            .with_bridge("pve1", "vmbr1000")
            .with_bridge("pve1", "vmbr1001")
            .with_bridge("pve1", "vmbr9000")
            .with_vm("pve1", 150, "other-tenant", &["vmbr1001"]);

        let report =
            cleanup_unused_bridges(&cluster, &BridgePolicy::default(), &["pve1".to_string()]).await;

        let bridges = cluster.bridges_on("pve1");
        assert!(bridges.contains_key("vmbr0"));
        assert!(bridges.contains_key("vmbr1001"));
        assert!(!bridges.contains_key("vmbr1000"));
        assert!(!bridges.contains_key("vmbr9000"));
        assert_eq!(report.removed.len(), 2);
        assert_eq!(report.reloaded_nodes, vec!["pve1"]);
    }

    #[tokio::test]
    async fn test_unreadable_node_is_skipped() {
        let cluster = InMemoryCluster::new(&["pve1"]).with_bridge("pve1", "vmbr1000");
        cluster.fail_node_queries("pve1");

        let report =
            cleanup_unused_bridges(&cluster, &BridgePolicy::default(), &["pve1".to_string()]).await;

        assert_eq!(report.skipped_nodes, vec!["pve1"]);
        assert!(cluster.bridges_on("pve1").contains_key("vmbr1000"));
    }
}
