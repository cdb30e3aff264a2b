use std::sync::Arc;

use futures::future::join_all;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::{DeploymentResult, Strategy};
use crate::balancing::{Distribution, LoadBalancer, RoundRobinBalancer, ScoringWeights, WeightedBalancer};
use crate::config::{validate_users, StandConfig};
use crate::error::{StandError, StandResult};
use crate::gateway::ClusterGateway;
use crate::lifecycle::{PlannedMachine, ResourceLifecycleManager};
use crate::network::{BridgeAllocator, BridgePolicy};
use crate::templates::TemplateManager;

/// Users sharing a target (or a template layout, for local placement)
struct Batch {
    label: String,
    users: Vec<String>,
    plan: StandResult<Vec<PlannedMachine>>,
}

/// Validates a batch, places users, prepares templates and runs the
/// per-node stand creation concurrently.
pub struct DeploymentCoordinator {
    gateway: Arc<dyn ClusterGateway>,
    templates: Arc<TemplateManager>,
    lifecycle: Arc<ResourceLifecycleManager>,
    bridge_policy: BridgePolicy,
    weights: ScoringWeights,
}

impl DeploymentCoordinator {
    pub fn new(
        gateway: Arc<dyn ClusterGateway>,
        templates: Arc<TemplateManager>,
        lifecycle: Arc<ResourceLifecycleManager>,
    ) -> Self {
        Self {
            gateway,
            templates,
            lifecycle,
            bridge_policy: BridgePolicy::default(),
            weights: ScoringWeights::default(),
        }
    }

    pub fn with_bridge_policy(mut self, policy: BridgePolicy) -> Self {
        self.bridge_policy = policy;
        self
    }

    pub fn with_scoring_weights(mut self, weights: ScoringWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Deploy one stand per user.
    ///
    /// Input problems fail before anything is created. After that, a
    /// user's failure is recorded in the result and the batch continues.
    pub async fn deploy(
        &self,
        strategy: &Strategy,
        users: &[String],
        config: &StandConfig,
    ) -> StandResult<DeploymentResult> {
        let run_id = Uuid::new_v4();
        let span = info_span!("deploy", run = %run_id, strategy = %strategy);
        self.run(strategy, users, config).instrument(span).await
    }

    async fn run(
        &self,
        strategy: &Strategy,
        users: &[String],
        config: &StandConfig,
    ) -> StandResult<DeploymentResult> {
        let users = self.validate(strategy, users, config).await?;
        info!(
            "Deploying {} machines for {} users",
            config.machines.len(),
            users.len()
        );

        let batches = self.plan_batches(strategy, &users, config).await?;
        let allocator = BridgeAllocator::new(self.gateway.clone(), self.bridge_policy.clone())
            .with_vlan_plan(config);

        let mut result = DeploymentResult::default();
        let outcomes = join_all(batches.iter().map(|batch| self.run_batch(batch, &allocator))).await;
        for (batch, outcome) in batches.iter().zip(outcomes) {
            for (user, created) in batch.users.iter().zip(outcome) {
                match created {
                    Ok((password, vmids)) => {
                        result.record_success(user, &batch.label, password, vmids)
                    }
                    Err(reason) => result.record_failure(user, &batch.label, reason),
                }
            }
        }

        for node in allocator.touched_nodes() {
            if let Err(e) = self.gateway.reload_node_network(&node).await {
                warn!("Network reload on {} failed: {}", node, e);
            }
        }

        info!(
            "Deployment finished: {} of {} stands created",
            result.total() - result.failed_count(),
            result.total()
        );
        Ok(result)
    }

    async fn validate(
        &self,
        strategy: &Strategy,
        users: &[String],
        config: &StandConfig,
    ) -> StandResult<Vec<String>> {
        let report = config.validate();
        if report.has_errors() {
            return Err(StandError::Validation(report.error_summary()));
        }
        for warning in report.warnings() {
            warn!("{}", warning.message);
        }

        let (users, report) = validate_users(users);
        if report.has_errors() {
            return Err(StandError::Validation(report.error_summary()));
        }

        if let Strategy::Remote { target } = strategy {
            let nodes = self.gateway.get_nodes().await?;
            if !nodes.iter().any(|n| n == target) {
                return Err(StandError::Validation(format!(
                    "target node '{}' is not a cluster node",
                    target
                )));
            }
        }
        Ok(users)
    }

    /// Assign users to targets and resolve every target's clone plan.
    /// All template preparation happens here, before any stand is cloned.
    async fn plan_batches(
        &self,
        strategy: &Strategy,
        users: &[String],
        config: &StandConfig,
    ) -> StandResult<Vec<Batch>> {
        let machines_per_user = config.machines.len();
        let distribution: Distribution = match strategy {
            // Every local stand spans all template nodes, so one sequential
            // worker keeps each node's clones and bridge lookups in order
            Strategy::Local => {
                let label = config
                    .template_nodes()
                    .into_iter()
                    .collect::<Vec<_>>()
                    .join(",");
                let plan = config.machines.iter().map(PlannedMachine::local).collect();
                return Ok(vec![Batch {
                    label,
                    users: users.to_vec(),
                    plan: Ok(plan),
                }]);
            }
            Strategy::Remote { target } => {
                let mut distribution = Distribution::new();
                distribution.insert(target.clone(), users.to_vec());
                distribution
            }
            Strategy::Balanced => {
                let nodes = self.gateway.get_nodes().await?;
                RoundRobinBalancer::new()
                    .distribute(users, &nodes, machines_per_user)
                    .await?
            }
            Strategy::Smart => {
                let nodes = self.gateway.get_nodes().await?;
                WeightedBalancer::new(self.gateway.clone())
                    .with_weights(self.weights.clone())
                    .distribute(users, &nodes, machines_per_user)
                    .await?
            }
        };

        let mut batches = Vec::with_capacity(distribution.len());
        for (node, users) in distribution {
            let plan = match strategy {
                Strategy::Balanced => self.mixed_plan(config, &node).await,
                _ => self.prepared_plan(config, &node).await,
            };
            if let Err(e) = &plan {
                error!("Template preparation for {} failed: {}", node, e);
            }
            batches.push(Batch {
                label: node,
                users,
                plan,
            });
        }
        Ok(batches)
    }

    /// Every machine clones from a template copy on `node`
    async fn prepared_plan(
        &self,
        config: &StandConfig,
        node: &str,
    ) -> StandResult<Vec<PlannedMachine>> {
        let mapping = self.templates.prepare(config, node).await?;
        config
            .machines
            .iter()
            .map(|spec| {
                let local = mapping.get(&spec.template_key()).copied().ok_or_else(|| {
                    StandError::ClusterUnavailable(format!(
                        "no template for {} on {}",
                        spec.template_key(),
                        node
                    ))
                })?;
                Ok(PlannedMachine::prepared(spec, node, local))
            })
            .collect()
    }

    /// Machines whose template already lives on `node` use the original,
    /// the rest use copies prepared for `node`
    async fn mixed_plan(&self, config: &StandConfig, node: &str) -> StandResult<Vec<PlannedMachine>> {
        let remote = config.filtered(|m| m.template_node != node);
        let mapping = if remote.machines.is_empty() {
            Default::default()
        } else {
            self.templates.prepare(&remote, node).await?
        };
        config
            .machines
            .iter()
            .map(|spec| {
                if spec.template_node == node {
                    return Ok(PlannedMachine::local(spec));
                }
                let local = mapping.get(&spec.template_key()).copied().ok_or_else(|| {
                    StandError::ClusterUnavailable(format!(
                        "no template for {} on {}",
                        spec.template_key(),
                        node
                    ))
                })?;
                Ok(PlannedMachine::prepared(spec, node, local))
            })
            .collect()
    }

    /// Users of one batch, one after another. Failures become reasons.
    async fn run_batch(
        &self,
        batch: &Batch,
        allocator: &BridgeAllocator,
    ) -> Vec<Result<(String, Vec<u32>), String>> {
        let plan = match &batch.plan {
            Ok(plan) => plan,
            Err(e) => {
                let reason = format!("template preparation failed: {}", e);
                return batch.users.iter().map(|_| Err(reason.clone())).collect();
            }
        };

        let mut outcomes = Vec::with_capacity(batch.users.len());
        for user in &batch.users {
            let outcome = self
                .lifecycle
                .create_user_stand(user, plan, allocator)
                .await
                .map_err(|e| e.to_string());
            if let Err(reason) = &outcome {
                warn!("Stand for {} on {} failed: {}", user, batch.label, reason);
            }
            outcomes.push(outcome);
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::{MachineSpec, NetworkSpec};
    use crate::gateway::InMemoryCluster;
    use crate::tasks::TaskPolicy;
    use crate::templates::MemoryTemplateStore;

    fn coordinator(cluster: Arc<InMemoryCluster>) -> DeploymentCoordinator {
        let policy = TaskPolicy::new(Duration::from_millis(5), Duration::from_millis(100));
        let templates = Arc::new(
            TemplateManager::new(cluster.clone(), Arc::new(MemoryTemplateStore::new()))
                .with_task_policy(policy),
        );
        let lifecycle = Arc::new(
            ResourceLifecycleManager::new(cluster.clone())
                .with_task_policy(policy)
                .with_verify_delays(Duration::from_millis(1), Duration::from_millis(1)),
        );
        DeploymentCoordinator::new(cluster, templates, lifecycle)
    }

    fn two_node_cluster() -> Arc<InMemoryCluster> {
        Arc::new(
            InMemoryCluster::new(&["pve1", "pve2"])
                .with_template("pve1", 100)
                .with_template("pve2", 110),
        )
    }

    fn stand() -> StandConfig {
        StandConfig::new(vec![
            MachineSpec::new(100, "pve1").with_network(NetworkSpec::new("hq")),
            MachineSpec::new(110, "pve2").with_network(NetworkSpec::new("hq")),
        ])
    }

    fn users(list: &[&str]) -> Vec<String> {
        list.iter().map(|u| u.to_string()).collect()
    }

    #[tokio::test]
    async fn test_validation_happens_before_mutation() {
        let cluster = two_node_cluster();
        let coordinator = coordinator(cluster.clone());

        let empty = coordinator
            .deploy(&Strategy::Local, &users(&["a", "a@pve"]), &stand())
            .await;
        assert!(matches!(empty, Err(StandError::Validation(_))));

        let bad_target = coordinator
            .deploy(
                &Strategy::Remote {
                    target: "pve9".into(),
                },
                &users(&["a"]),
                &stand(),
            )
            .await;
        assert!(matches!(bad_target, Err(StandError::Validation(_))));

        let no_machines = coordinator
            .deploy(&Strategy::Local, &users(&["a"]), &StandConfig::default())
            .await;
        assert!(matches!(no_machines, Err(StandError::Validation(_))));
        assert_eq!(cluster.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_balanced_uses_original_template_when_local() {
        let cluster = two_node_cluster();
        let result = coordinator(cluster.clone())
            .deploy(&Strategy::Balanced, &users(&["alice", "bob"]), &stand())
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(result.placement["alice@pve"], "pve1");
        assert_eq!(result.placement["bob@pve"], "pve2");
        // One prepared copy per node for the template living elsewhere
        let copies: Vec<_> = cluster
            .vms()
            .into_iter()
            .filter(|vm| vm.name.starts_with("template-clone-"))
            .collect();
        assert_eq!(copies.len(), 2);
        assert_eq!(cluster.guests_on("pve1").len(), 2);
        assert_eq!(cluster.guests_on("pve2").len(), 2);
    }

    #[tokio::test]
    async fn test_prepare_failure_fails_node_users_only() {
        let cluster = Arc::new(
            InMemoryCluster::new(&["pve1", "pve2"])
                .with_template("pve1", 100),
        );
        cluster.fail_clones_of(100);
        let config = StandConfig::new(vec![MachineSpec::new(100, "pve1")]);

        let result = coordinator(cluster.clone())
            .deploy(
                &Strategy::Remote {
                    target: "pve2".into(),
                },
                &users(&["alice", "bob"]),
                &config,
            )
            .await
            .unwrap();
        assert_eq!(result.failed_count(), 2);
        assert_eq!(result.passwords["alice@pve"], "");
        assert!(result.failures["bob@pve"].contains("template preparation failed"));
    }

    #[tokio::test]
    async fn test_reload_runs_on_touched_nodes() {
        let cluster = two_node_cluster();
        coordinator(cluster.clone())
            .deploy(
                &Strategy::Remote {
                    target: "pve2".into(),
                },
                &users(&["alice"]),
                &stand(),
            )
            .await
            .unwrap();
        assert_eq!(cluster.reloaded_nodes(), vec!["pve2"]);
    }
}
