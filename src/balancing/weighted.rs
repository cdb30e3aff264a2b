use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::metrics::{collect_metrics, NodeMetrics};
use super::scoring::{best_candidate, calculate_node_score, normalize, ScoringWeights};
use super::{flatten, Distribution, LoadBalancer};
use crate::error::{StandError, StandResult};
use crate::gateway::ClusterGateway;

/// Greedy placement on the best-scoring node.
///
/// Metrics are fetched fresh on every call. After each pick the chosen
/// node is re-estimated as if `machines_per_user` more guests had landed.
pub struct WeightedBalancer {
    gateway: Arc<dyn ClusterGateway>,
    weights: ScoringWeights,
}

impl WeightedBalancer {
    pub fn new(gateway: Arc<dyn ClusterGateway>) -> Self {
        Self {
            gateway,
            weights: ScoringWeights::default(),
        }
    }

    pub fn with_weights(mut self, weights: ScoringWeights) -> Self {
        self.weights = weights;
        self
    }

    fn assign(
        &self,
        users: &[String],
        mut metrics: Vec<(String, NodeMetrics)>,
        machines_per_user: usize,
    ) -> StandResult<Distribution> {
        let eligible: Vec<bool> = metrics.iter().map(|(_, m)| !m.degraded).collect();
        if !eligible.iter().any(|e| *e) {
            return Err(StandError::ClusterUnavailable(
                "metrics unavailable on every node".to_string(),
            ));
        }

        let mut distribution = Distribution::new();
        for user in users {
            let raw: Vec<f64> = metrics
                .iter()
                .map(|(_, m)| calculate_node_score(m, &self.weights))
                .collect();
            let scores = normalize(&raw);
            let Some(index) = best_candidate(&scores, &eligible) else {
                return Err(StandError::ClusterUnavailable(
                    "no eligible node".to_string(),
                ));
            };

            let (node, current) = &mut metrics[index];
            debug!("Placing {} on {} (score {:.3})", user, node, scores[index]);
            *current = current.projected(machines_per_user as u32);
            distribution
                .entry(node.clone())
                .or_default()
                .push(user.clone());
        }
        Ok(distribution)
    }
}

#[async_trait]
impl LoadBalancer for WeightedBalancer {
    async fn distribute(
        &self,
        users: &[String],
        nodes: &[String],
        machines_per_user: usize,
    ) -> StandResult<Distribution> {
        if nodes.is_empty() {
            return Err(StandError::ClusterUnavailable(
                "no nodes available for placement".to_string(),
            ));
        }
        let metrics = collect_metrics(self.gateway.as_ref(), nodes).await;
        let distribution = self.assign(users, metrics, machines_per_user)?;
        info!(
            "Weighted placement of {} users over {} nodes",
            users.len(),
            distribution.len()
        );
        Ok(distribution)
    }

    async fn optimize_distribution(
        &self,
        current: &Distribution,
        machines_per_user: usize,
    ) -> StandResult<Distribution> {
        let nodes = self.gateway.get_nodes().await?;
        self.distribute(&flatten(current), &nodes, machines_per_user)
            .await
    }
}
