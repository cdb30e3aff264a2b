//! Node placement for user stands
//!
//! A [`LoadBalancer`] maps users to nodes. [`RoundRobinBalancer`] is purely
//! positional; [`WeightedBalancer`] scores nodes from fresh metrics and
//! projects the load of every assignment it makes.

pub mod metrics;
pub mod scoring;
pub mod weighted;

pub use metrics::{collect_metrics, NodeMetrics};
pub use scoring::{calculate_node_score, normalize, ScoringWeights};
pub use weighted::WeightedBalancer;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::{StandError, StandResult};

/// Node -> users placed on it, in assignment order
pub type Distribution = BTreeMap<String, Vec<String>>;

/// Users of a distribution, node by node
pub fn flatten(distribution: &Distribution) -> Vec<String> {
    distribution.values().flatten().cloned().collect()
}

// ============================================================================
// SBIO: Trait for abstraction (strategies pick their balancer)
// ============================================================================

#[async_trait]
pub trait LoadBalancer: Send + Sync {
    async fn distribute(
        &self,
        users: &[String],
        nodes: &[String],
        machines_per_user: usize,
    ) -> StandResult<Distribution>;

    /// Re-plan an existing distribution from scratch
    async fn optimize_distribution(
        &self,
        current: &Distribution,
        machines_per_user: usize,
    ) -> StandResult<Distribution>;
}

/// User `i` goes to `nodes[i % nodes.len()]`
#[derive(Debug, Default, Clone)]
pub struct RoundRobinBalancer;

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LoadBalancer for RoundRobinBalancer {
    async fn distribute(
        &self,
        users: &[String],
        nodes: &[String],
        _machines_per_user: usize,
    ) -> StandResult<Distribution> {
        if nodes.is_empty() {
            return Err(StandError::ClusterUnavailable(
                "no nodes available for placement".to_string(),
            ));
        }
        let mut distribution = Distribution::new();
        for (i, user) in users.iter().enumerate() {
            distribution
                .entry(nodes[i % nodes.len()].clone())
                .or_default()
                .push(user.clone());
        }
        Ok(distribution)
    }

    async fn optimize_distribution(
        &self,
        current: &Distribution,
        machines_per_user: usize,
    ) -> StandResult<Distribution> {
        let nodes: Vec<String> = current.keys().cloned().collect();
        self.distribute(&flatten(current), &nodes, machines_per_user)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{}{}", prefix, i)).collect()
    }

    #[tokio::test]
    async fn test_round_robin_balance_within_one() {
        let balancer = RoundRobinBalancer::new();
        for (users, nodes) in [(7, 3), (3, 3), (2, 5), (10, 4)] {
            let distribution = balancer
                .distribute(&names("u", users), &names("pve", nodes), 2)
                .await
                .unwrap();
            let counts: Vec<usize> = distribution.values().map(Vec::len).collect();
            let max = counts.iter().max().copied().unwrap_or(0);
            let min = if distribution.len() < nodes {
                0
            } else {
                counts.iter().min().copied().unwrap_or(0)
            };
            assert!(max - min <= 1, "{} users on {} nodes: {:?}", users, nodes, counts);
            assert_eq!(counts.iter().sum::<usize>(), users);
        }
    }

    #[tokio::test]
    async fn test_round_robin_order() {
        let distribution = RoundRobinBalancer::new()
            .distribute(&names("u", 3), &names("pve", 2), 1)
            .await
            .unwrap();
        assert_eq!(distribution["pve0"], vec!["u0", "u2"]);
        assert_eq!(distribution["pve1"], vec!["u1"]);
    }

    #[tokio::test]
    async fn test_round_robin_without_nodes() {
        let result = RoundRobinBalancer::new().distribute(&names("u", 1), &[], 1).await;
        assert!(matches!(result, Err(StandError::ClusterUnavailable(_))));
    }
}
