//! Ordered, verified stand deletion
//!
//! ```text
//! pool absent?  -> delete user (if any), done
//! strip net*    -> stop running -> delete VMs -> verify absent (+1 retry)
//!               -> delete pool  -> delete user
//! ```

use std::collections::BTreeSet;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::manager::ResourceLifecycleManager;
use super::{DeletionReport, UserOutcome};
use crate::config::pool_name;
use crate::error::{StandError, StandResult};
use crate::gateway::is_interface_key;
use crate::network::cleanup_unused_bridges;
use crate::tasks::wait_for_task;

impl ResourceLifecycleManager {
    /// Remove a user's stand, verifying every VM is gone before the pool
    pub async fn delete_user_stand(&self, user: &str) -> StandResult<()> {
        let mut nodes = BTreeSet::new();
        self.teardown(user, &mut nodes).await
    }

    /// Tear down several stands, then sweep unused bridges on the nodes
    /// that hosted them. One user's failure does not stop the others.
    pub async fn delete_stands(&self, users: &[String]) -> DeletionReport {
        let mut report = DeletionReport::default();
        let mut nodes = BTreeSet::new();

        for user in users {
            let outcome = match self.teardown(user, &mut nodes).await {
                Ok(()) => UserOutcome::Deleted,
                Err(e) => {
                    warn!("Deletion of stand for {} failed: {}", user, e);
                    UserOutcome::Failed(e.to_string())
                }
            };
            report.outcomes.insert(user.clone(), outcome);
        }

        if !nodes.is_empty() {
            let nodes: Vec<String> = nodes.into_iter().collect();
            report.bridges =
                cleanup_unused_bridges(self.gateway.as_ref(), &self.bridge_policy, &nodes).await;
        }
        info!(
            "Deleted {} of {} stands",
            report.deleted_count(),
            report.outcomes.len()
        );
        report
    }

    async fn teardown(&self, user: &str, nodes: &mut BTreeSet<String>) -> StandResult<()> {
        let pool = pool_name(user);
        let gateway = self.gateway.as_ref();

        if !gateway.pool_exists(pool).await? {
            if gateway.user_exists(user).await? {
                info!("Pool {} absent, deleting user {}", pool, user);
                gateway.delete_user(user).await?;
            } else {
                debug!("Nothing to delete for {}", user);
            }
            return Ok(());
        }

        let members = gateway.pool_members(pool).await?;
        info!("Deleting {} VMs of pool {}", members.len(), pool);
        nodes.extend(members.iter().map(|vm| vm.node.clone()));

        for vm in &members {
            let slots: Vec<String> = gateway
                .vm_config(&vm.node, vm.vmid)
                .await?
                .into_keys()
                .filter(|key| is_interface_key(key))
                .collect();
            if !slots.is_empty() {
                gateway.remove_vm_interfaces(&vm.node, vm.vmid, &slots).await?;
            }
        }

        for vm in members.iter().filter(|vm| vm.is_running()) {
            debug!("Stopping VM {} on {}", vm.vmid, vm.node);
            let task = gateway.stop_vm(&vm.node, vm.vmid).await?;
            wait_for_task(gateway, &vm.node, &task, &self.task_policy).await?;
        }

        for vm in &members {
            let task = gateway.delete_vm(&vm.node, vm.vmid).await?;
            wait_for_task(gateway, &vm.node, &task, &self.task_policy).await?;
        }

        let vmids: Vec<u32> = members.iter().map(|vm| vm.vmid).collect();
        let remaining = self.verify_absent(&vmids).await?;
        if !remaining.is_empty() {
            return Err(StandError::VerificationTimeout {
                pool: pool.to_string(),
                remaining,
            });
        }

        gateway.delete_pool(pool).await?;
        if gateway.user_exists(user).await? {
            gateway.delete_user(user).await?;
        }
        info!("Stand of {} deleted", user);
        Ok(())
    }

    /// Wait, look the VMs up, and look the survivors up once more after the
    /// retry delay. Returns the vmids that are still discoverable.
    pub(super) async fn verify_absent(&self, vmids: &[u32]) -> StandResult<Vec<u32>> {
        sleep(self.verify_delay).await;
        let remaining = self.still_present(vmids).await?;
        if remaining.is_empty() {
            return Ok(remaining);
        }
        warn!(
            "VMs {:?} still visible, retrying verification",
            remaining
        );
        sleep(self.verify_retry_delay).await;
        self.still_present(&remaining).await
    }

    async fn still_present(&self, vmids: &[u32]) -> StandResult<Vec<u32>> {
        let mut present = Vec::new();
        for vmid in vmids {
            if self.gateway.find_vm(*vmid).await?.is_some() {
                present.push(*vmid);
            }
        }
        Ok(present)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::gateway::{ClusterGateway, InMemoryCluster};
    use crate::tasks::TaskPolicy;

    fn manager(cluster: Arc<InMemoryCluster>) -> ResourceLifecycleManager {
        ResourceLifecycleManager::new(cluster)
            .with_task_policy(TaskPolicy::new(
                Duration::from_millis(5),
                Duration::from_millis(100),
            ))
            .with_verify_delays(Duration::from_millis(1), Duration::from_millis(1))
    }

    fn populated() -> Arc<InMemoryCluster> {
        Arc::new(
            InMemoryCluster::new(&["pve1"])
                .with_user("alice@pve")
                .with_pool("alice")
                .with_bridge("pve1", "vmbr1000")
                .with_bridge("pve1", "vmbr1001")
                .with_vm("pve1", 200, "client", &["vmbr1000"])
                .with_vm("pve1", 201, "router", &["vmbr1000", "vmbr0"])
                .with_vm("pve1", 300, "other", &["vmbr1001"])
                .with_running_pool_vm("alice", 200)
                .with_running_pool_vm("alice", 201),
        )
    }

    #[tokio::test]
    async fn test_delete_user_stand() {
        let cluster = populated();
        tokio_test::assert_ok!(manager(cluster.clone()).delete_user_stand("alice@pve").await);

        assert!(cluster.find_vm(200).await.unwrap().is_none());
        assert!(cluster.find_vm(201).await.unwrap().is_none());
        assert!(cluster.find_vm(300).await.unwrap().is_some());
        assert!(!cluster.has_pool("alice"));
        assert!(!cluster.has_user("alice@pve"));
    }

    #[tokio::test]
    async fn test_absent_pool_deletes_user_only() {
        let cluster = Arc::new(InMemoryCluster::new(&["pve1"]).with_user("bob@pve"));
        manager(cluster.clone())
            .delete_user_stand("bob@pve")
            .await
            .unwrap();
        assert!(!cluster.has_user("bob@pve"));
        // Nothing at all is fine too
        manager(cluster.clone())
            .delete_user_stand("bob@pve")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pool_kept_while_vm_discoverable() {
        let cluster = populated();
        cluster.linger_deleted_vms(5);

        let result = manager(cluster.clone()).delete_user_stand("alice@pve").await;
        tokio_test::assert_err!(&result);
        match result {
            Err(StandError::VerificationTimeout { pool, remaining }) => {
                assert_eq!(pool, "alice");
                assert_eq!(remaining, vec![200, 201]);
            }
            other => panic!("expected verification timeout, got {:?}", other),
        }
        assert!(cluster.has_pool("alice"));
        assert!(cluster.has_user("alice@pve"));
    }

    #[tokio::test]
    async fn test_slow_deletion_passes_on_retry() {
        let cluster = populated();
        cluster.linger_deleted_vms(1);

        manager(cluster.clone())
            .delete_user_stand("alice@pve")
            .await
            .unwrap();
        assert!(!cluster.has_pool("alice"));
    }

    #[tokio::test]
    async fn test_delete_stands_reports_and_sweeps_bridges() {
        let cluster = populated();
        let users = vec!["alice@pve".to_string(), "ghost@pve".to_string()];

        let report = manager(cluster.clone()).delete_stands(&users).await;
        assert_eq!(report.deleted_count(), 2);
        assert!(report.is_success());

        // vmbr1000 lost its last user, vmbr1001 is still referenced by VM 300
        let bridges = cluster.bridges_on("pve1");
        assert!(!bridges.contains_key("vmbr1000"));
        assert!(bridges.contains_key("vmbr1001"));
        assert!(bridges.contains_key("vmbr0"));
        assert_eq!(report.bridges.removed, vec![("pve1".to_string(), "vmbr1000".to_string())]);
        assert_eq!(cluster.reloaded_nodes(), vec!["pve1"]);
    }

    #[tokio::test]
    async fn test_delete_stands_records_failures() {
        let cluster = populated();
        cluster.linger_deleted_vms(5);
        let report = manager(cluster.clone())
            .delete_stands(&["alice@pve".to_string()])
            .await;
        assert_eq!(report.failed_count(), 1);
        assert!(matches!(
            report.outcomes.get("alice@pve"),
            Some(UserOutcome::Failed(_))
        ));
    }
}
