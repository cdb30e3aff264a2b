//! Per-node load estimates
//!
//! Placement only needs relative load, so CPU, memory and storage are
//! estimated from the number of guests on a node rather than sampled.

use tracing::warn;

use crate::gateway::ClusterGateway;

/// VM count used for a node whose metrics could not be read
pub const POISON_VM_COUNT: u32 = 999;

#[derive(Debug, Clone, PartialEq)]
pub struct NodeMetrics {
    pub vm_count: u32,
    /// Fraction 0.0..=1.0
    pub cpu: f64,
    /// Fraction 0.0..=1.0
    pub memory: f64,
    /// Percent available, 0.0..=100.0
    pub storage: f64,
    /// Metrics query failed; never a placement target
    pub degraded: bool,
}

impl NodeMetrics {
    pub fn estimate(vm_count: u32) -> Self {
        let vms = vm_count as f64;
        Self {
            vm_count,
            cpu: (vms * 0.10).min(1.0),
            memory: (vms * 0.15).min(1.0),
            storage: (100.0 - vms * 5.0).max(0.0),
            degraded: false,
        }
    }

    pub fn poisoned() -> Self {
        Self {
            vm_count: POISON_VM_COUNT,
            cpu: 1.0,
            memory: 1.0,
            storage: 0.0,
            degraded: true,
        }
    }

    /// Estimates after `additional` more VMs land on the node
    pub fn projected(&self, additional: u32) -> Self {
        if self.degraded {
            return self.clone();
        }
        Self::estimate(self.vm_count + additional)
    }
}

/// Fresh metrics for each node, in the given order
pub async fn collect_metrics(
    gateway: &dyn ClusterGateway,
    nodes: &[String],
) -> Vec<(String, NodeMetrics)> {
    let mut collected = Vec::with_capacity(nodes.len());
    for node in nodes {
        let metrics = match gateway.get_vms_on_node(node).await {
            Ok(vms) => NodeMetrics::estimate(vms.iter().filter(|vm| !vm.template).count() as u32),
            Err(e) => {
                warn!("Metrics for node {} unavailable, excluding it: {}", node, e);
                NodeMetrics::poisoned()
            }
        };
        collected.push((node.clone(), metrics));
    }
    collected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::InMemoryCluster;

    #[test]
    fn test_estimates_are_capped() {
        let metrics = NodeMetrics::estimate(30);
        assert_eq!(metrics.cpu, 1.0);
        assert_eq!(metrics.memory, 1.0);
        assert_eq!(metrics.storage, 0.0);

        let light = NodeMetrics::estimate(2);
        assert!((light.cpu - 0.2).abs() < 1e-9);
        assert!((light.memory - 0.3).abs() < 1e-9);
        assert!((light.storage - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_projection_keeps_poison() {
        let poisoned = NodeMetrics::poisoned();
        assert_eq!(poisoned.projected(4), poisoned);
        assert_eq!(NodeMetrics::estimate(1).projected(2).vm_count, 3);
    }

    #[tokio::test]
    async fn test_collect_metrics_counts_guests_only() {
        let cluster = InMemoryCluster::new(&["pve1", "pve2"])
            .with_template("pve1", 100)
            .with_vm("pve1", 200, "a", &[])
            .with_vm("pve1", 201, "b", &[]);
        cluster.fail_node_queries("pve2");

        let nodes = vec!["pve1".to_string(), "pve2".to_string()];
        let metrics = collect_metrics(&cluster, &nodes).await;
        assert_eq!(metrics[0].1.vm_count, 2);
        assert!(!metrics[0].1.degraded);
        assert!(metrics[1].1.degraded);
    }
}
