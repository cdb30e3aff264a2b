use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::naming::stand_machine_names;
use super::PlannedMachine;
use crate::config::{pool_name, RoleSettings, Settings};
use crate::credentials::{generate_password, DEFAULT_PASSWORD_LENGTH};
use crate::error::StandResult;
use crate::gateway::{CloneRequest, ClusterGateway, VmidAllocator};
use crate::network::{build_interfaces, BridgeAllocator, BridgePolicy};
use crate::tasks::{wait_for_task, TaskPolicy};

/// What a creation attempt changed, for reverse-order rollback
#[derive(Debug, Default)]
struct Journal {
    user_created: bool,
    pool_created: bool,
    /// `(node, vmid)` of every clone submitted
    vms: Vec<(String, u32)>,
}

/// Creates and tears down one user's stand
pub struct ResourceLifecycleManager {
    pub(super) gateway: Arc<dyn ClusterGateway>,
    vmids: Arc<VmidAllocator>,
    pub(super) task_policy: TaskPolicy,
    roles: RoleSettings,
    pub(super) bridge_policy: BridgePolicy,
    pub(super) verify_delay: Duration,
    pub(super) verify_retry_delay: Duration,
    password_length: usize,
}

impl ResourceLifecycleManager {
    pub fn new(gateway: Arc<dyn ClusterGateway>) -> Self {
        Self {
            gateway,
            vmids: Arc::new(VmidAllocator::new()),
            task_policy: TaskPolicy::default(),
            roles: RoleSettings::default(),
            bridge_policy: BridgePolicy::default(),
            verify_delay: Duration::from_secs(3),
            verify_retry_delay: Duration::from_secs(10),
            password_length: DEFAULT_PASSWORD_LENGTH,
        }
    }

    /// Apply timeouts, roles, bridge ranges and password length from settings
    pub fn from_settings(gateway: Arc<dyn ClusterGateway>, settings: &Settings) -> Self {
        Self::new(gateway)
            .with_task_policy(settings.timeouts.task_policy())
            .with_roles(settings.roles.clone())
            .with_bridge_policy(settings.bridges.clone())
            .with_verify_delays(
                Duration::from_secs(settings.timeouts.verify_delay_secs),
                Duration::from_secs(settings.timeouts.verify_retry_delay_secs),
            )
            .with_password_length(settings.password_length)
    }

    pub fn with_task_policy(mut self, policy: TaskPolicy) -> Self {
        self.task_policy = policy;
        self
    }

    pub fn with_vmid_allocator(mut self, vmids: Arc<VmidAllocator>) -> Self {
        self.vmids = vmids;
        self
    }

    pub fn with_roles(mut self, roles: RoleSettings) -> Self {
        self.roles = roles;
        self
    }

    pub fn with_bridge_policy(mut self, policy: BridgePolicy) -> Self {
        self.bridge_policy = policy;
        self
    }

    pub fn with_verify_delays(mut self, delay: Duration, retry_delay: Duration) -> Self {
        self.verify_delay = delay;
        self.verify_retry_delay = retry_delay;
        self
    }

    pub fn with_password_length(mut self, length: usize) -> Self {
        self.password_length = length;
        self
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// Provision the user, pool and every planned machine.
    ///
    /// Returns the password that is now set on the account and the vmids of
    /// the stand. Machines whose name already exists in the pool are kept
    /// as they are. On failure everything this call created is removed
    /// again and the original error is returned.
    pub async fn create_user_stand(
        &self,
        user: &str,
        plan: &[PlannedMachine],
        allocator: &BridgeAllocator,
    ) -> StandResult<(String, Vec<u32>)> {
        let pool = pool_name(user);
        let password = generate_password(self.password_length);
        let mut journal = Journal::default();

        info!("Creating stand for {} ({} machines)", user, plan.len());
        match self
            .provision(user, pool, &password, plan, allocator, &mut journal)
            .await
        {
            Ok(vmids) => {
                info!("Stand for {} ready: {:?}", user, vmids);
                Ok((password, vmids))
            }
            Err(e) => {
                error!("Stand creation for {} failed: {}", user, e);
                self.rollback(user, pool, &journal).await;
                Err(e)
            }
        }
    }

    async fn provision(
        &self,
        user: &str,
        pool: &str,
        password: &str,
        plan: &[PlannedMachine],
        allocator: &BridgeAllocator,
        journal: &mut Journal,
    ) -> StandResult<Vec<u32>> {
        let existing_user = self.gateway.user_exists(user).await?;
        if !existing_user {
            self.gateway.create_user(user, password).await?;
            journal.user_created = true;
        }

        if !self.gateway.pool_exists(pool).await? {
            self.gateway
                .create_pool(pool, &format!("Stand of {}", user))
                .await?;
            journal.pool_created = true;
        }

        self.gateway
            .set_pool_permissions(user, pool, &[self.roles.pool_role.clone()])
            .await?;

        let existing: BTreeMap<String, u32> = self
            .gateway
            .pool_members(pool)
            .await?
            .into_iter()
            .map(|vm| (vm.name, vm.vmid))
            .collect();

        let names = stand_machine_names(plan.iter().map(|m| &m.spec), pool);
        let mut vmids = Vec::with_capacity(plan.len());
        for (machine, name) in plan.iter().zip(names) {
            if let Some(vmid) = existing.get(&name) {
                info!("VM {} ({}) already in pool {}, skipping", name, vmid, pool);
                vmids.push(*vmid);
                continue;
            }
            let vmid = self
                .create_machine(user, pool, name, machine, allocator, journal)
                .await?;
            vmids.push(vmid);
        }

        // An existing account keeps its old password unless the stand is complete
        if existing_user {
            debug!("User {} exists, resetting password", user);
            self.gateway.set_user_password(user, password).await?;
        }
        Ok(vmids)
    }

    async fn create_machine(
        &self,
        user: &str,
        pool: &str,
        name: String,
        machine: &PlannedMachine,
        allocator: &BridgeAllocator,
        journal: &mut Journal,
    ) -> StandResult<u32> {
        let request = CloneRequest {
            source_node: machine.source_node.clone(),
            source_vmid: machine.source_vmid,
            target_node: machine.target_node.clone(),
            new_vmid: 0,
            name,
            pool: Some(pool.to_string()),
            full_clone: machine.spec.full_clone,
        };
        let (vmid, task) = self
            .vmids
            .clone_with_fresh_vmid(self.gateway.as_ref(), request)
            .await?;
        journal.vms.push((machine.target_node.clone(), vmid));
        debug!(
            "Cloning {}:{} to {} on {}",
            machine.source_node, machine.source_vmid, vmid, machine.target_node
        );
        wait_for_task(
            self.gateway.as_ref(),
            &machine.source_node,
            &task,
            &self.task_policy,
        )
        .await?;

        let mut resolved = Vec::with_capacity(machine.spec.networks.len());
        for network in &machine.spec.networks {
            resolved.push(allocator.resolve(&machine.target_node, pool, network).await?);
        }
        let interfaces = build_interfaces(machine.spec.device_type, &resolved);
        if !interfaces.is_empty() {
            self.gateway
                .configure_vm_network(&machine.target_node, vmid, &interfaces)
                .await?;
        }

        self.gateway
            .grant_vm_permission(user, &machine.target_node, vmid, &self.roles.vm_role)
            .await?;
        Ok(vmid)
    }

    async fn rollback(&self, user: &str, pool: &str, journal: &Journal) {
        warn!(
            "Rolling back {} VMs for {} (pool created: {}, user created: {})",
            journal.vms.len(),
            user,
            journal.pool_created,
            journal.user_created
        );
        for (node, vmid) in journal.vms.iter().rev() {
            match self.gateway.delete_vm(node, *vmid).await {
                Ok(task) => {
                    if let Err(e) =
                        wait_for_task(self.gateway.as_ref(), node, &task, &self.task_policy).await
                    {
                        error!("Rollback: deletion of VM {} did not finish: {}", vmid, e);
                    }
                }
                Err(e) => error!("Rollback: cannot delete VM {} on {}: {}", vmid, node, e),
            }
        }

        let vmids: Vec<u32> = journal.vms.iter().map(|(_, vmid)| *vmid).collect();
        if !vmids.is_empty() {
            match self.verify_absent(&vmids).await {
                Ok(remaining) if remaining.is_empty() => {}
                Ok(remaining) => {
                    error!(
                        "Rollback: VMs {:?} of pool {} still present, keeping pool and user",
                        remaining, pool
                    );
                    return;
                }
                Err(e) => {
                    error!(
                        "Rollback: cannot verify VM removal for pool {}, keeping pool and user: {}",
                        pool, e
                    );
                    return;
                }
            }
        }

        if journal.pool_created {
            if let Err(e) = self.gateway.delete_pool(pool).await {
                error!("Rollback: cannot delete pool {}: {}", pool, e);
            }
        }
        if journal.user_created {
            if let Err(e) = self.gateway.delete_user(user).await {
                error!("Rollback: cannot delete user {}: {}", user, e);
            }
        }
    }
}
