//! In-process cluster used by tests and dry runs
//!
//! Mirrors the cluster rules the orchestration depends on: linked clones need
//! a template source, running VMs and non-empty pools cannot be deleted, and
//! interfaces can only attach to existing bridges. Faults can be injected to
//! exercise timeouts, failed metrics and slow deletions.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{
    is_interface_key, CloneRequest, ClusterGateway, GatewayError, InterfaceMap, TaskId, TaskStatus,
    VmInfo,
};

/// Bridge present on every node
pub const DEFAULT_BRIDGE: &str = "vmbr0";

#[derive(Debug, Clone)]
struct Vm {
    info: VmInfo,
    pool: Option<String>,
    config: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct Faults {
    hang_tasks: bool,
    failing_nodes: BTreeSet<String>,
    failing_clone_sources: BTreeSet<u32>,
    fail_bridge_creation: bool,
    /// Number of lookups a deleted VM stays discoverable for
    linger_lookups: usize,
}

#[derive(Debug, Default)]
struct State {
    nodes: Vec<String>,
    vms: BTreeMap<u32, Vm>,
    /// node -> bridge -> vlan aware
    bridges: BTreeMap<String, BTreeMap<String, bool>>,
    users: BTreeMap<String, String>,
    pools: BTreeSet<String>,
    acl: BTreeSet<(String, String, String)>,
    tasks: HashMap<String, TaskStatus>,
    task_counter: u64,
    reloads: Vec<String>,
    lingering: HashMap<u32, (VmInfo, usize)>,
    faults: Faults,
}

impl State {
    fn require_node(&self, node: &str) -> Result<(), GatewayError> {
        if self.nodes.iter().any(|n| n == node) {
            Ok(())
        } else {
            Err(GatewayError::NotFound(format!("node '{}'", node)))
        }
    }

    fn vm_on(&mut self, node: &str, vmid: u32) -> Result<&mut Vm, GatewayError> {
        match self.vms.get_mut(&vmid) {
            Some(vm) if vm.info.node == node => Ok(vm),
            _ => Err(GatewayError::NotFound(format!("VM {} on node {}", vmid, node))),
        }
    }

    fn spawn_task(&mut self, node: &str, kind: &str, vmid: u32) -> TaskId {
        self.task_counter += 1;
        let id = format!("UPID:{}:{:08X}:{}:{}:", node, self.task_counter, kind, vmid);
        let status = if self.faults.hang_tasks {
            TaskStatus::Running
        } else {
            TaskStatus::Completed
        };
        self.tasks.insert(id.clone(), status);
        TaskId(id)
    }
}

/// Deterministic fake implementing [`ClusterGateway`]
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    state: Mutex<State>,
    mutations: AtomicUsize,
}

impl InMemoryCluster {
    pub fn new(nodes: &[&str]) -> Self {
        let cluster = Self::default();
        {
            let mut state = cluster.state();
            for node in nodes {
                state.nodes.push(node.to_string());
                state
                    .bridges
                    .entry(node.to_string())
                    .or_default()
                    .insert(DEFAULT_BRIDGE.to_string(), false);
            }
        }
        cluster
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mutated(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }

    // -- seeding -------------------------------------------------------------

    /// Add a template VM named `template-{vmid}`
    pub fn with_template(self, node: &str, vmid: u32) -> Self {
        self.insert_vm(node, vmid, &format!("template-{}", vmid), true, None);
        self
    }

    /// Add a plain VM attached to the given bridges
    pub fn with_vm(self, node: &str, vmid: u32, name: &str, bridges: &[&str]) -> Self {
        self.insert_vm(node, vmid, name, false, None);
        {
            let mut state = self.state();
            if let Some(vm) = state.vms.get_mut(&vmid) {
                for (i, bridge) in bridges.iter().enumerate() {
                    vm.config
                        .insert(format!("net{}", i), format!("model=virtio,bridge={}", bridge));
                }
            }
        }
        self
    }

    pub fn with_bridge(self, node: &str, name: &str) -> Self {
        self.state()
            .bridges
            .entry(node.to_string())
            .or_default()
            .insert(name.to_string(), false);
        self
    }

    pub fn with_user(self, userid: &str) -> Self {
        self.state()
            .users
            .insert(userid.to_string(), String::new());
        self
    }

    pub fn with_pool(self, poolid: &str) -> Self {
        self.state().pools.insert(poolid.to_string());
        self
    }

    /// Put an existing VM into a pool and mark it running
    pub fn with_running_pool_vm(self, poolid: &str, vmid: u32) -> Self {
        {
            let mut state = self.state();
            if let Some(vm) = state.vms.get_mut(&vmid) {
                vm.pool = Some(poolid.to_string());
                vm.info.status = "running".to_string();
            }
        }
        self
    }

    fn insert_vm(&self, node: &str, vmid: u32, name: &str, template: bool, pool: Option<String>) {
        self.state().vms.insert(
            vmid,
            Vm {
                info: VmInfo {
                    vmid,
                    name: name.to_string(),
                    node: node.to_string(),
                    status: "stopped".to_string(),
                    template,
                },
                pool,
                config: BTreeMap::new(),
            },
        );
    }

    // -- fault injection -----------------------------------------------------

    /// Tasks started from now on never finish
    pub fn hang_tasks(&self) {
        self.state().faults.hang_tasks = true;
    }

    /// Node listing for this node fails
    pub fn fail_node_queries(&self, node: &str) {
        self.state().faults.failing_nodes.insert(node.to_string());
    }

    /// Clones from this source vmid are rejected
    pub fn fail_clones_of(&self, source_vmid: u32) {
        self.state().faults.failing_clone_sources.insert(source_vmid);
    }

    pub fn fail_bridge_creation(&self) {
        self.state().faults.fail_bridge_creation = true;
    }

    /// Deleted VMs stay visible to `find_vm` for this many lookups
    pub fn linger_deleted_vms(&self, lookups: usize) {
        self.state().faults.linger_lookups = lookups;
    }

    // -- inspection ----------------------------------------------------------

    /// Number of mutating calls served so far
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    pub fn vms(&self) -> Vec<VmInfo> {
        self.state().vms.values().map(|vm| vm.info.clone()).collect()
    }

    /// Non-template VMs on a node
    pub fn guests_on(&self, node: &str) -> Vec<VmInfo> {
        self.state()
            .vms
            .values()
            .filter(|vm| vm.info.node == node && !vm.info.template)
            .map(|vm| vm.info.clone())
            .collect()
    }

    pub fn vm_pool(&self, vmid: u32) -> Option<String> {
        self.state().vms.get(&vmid).and_then(|vm| vm.pool.clone())
    }

    pub fn interfaces_of(&self, vmid: u32) -> InterfaceMap {
        self.state()
            .vms
            .get(&vmid)
            .map(|vm| {
                vm.config
                    .iter()
                    .filter(|(k, _)| is_interface_key(k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Bridges on a node with their VLAN awareness
    pub fn bridges_on(&self, node: &str) -> BTreeMap<String, bool> {
        self.state().bridges.get(node).cloned().unwrap_or_default()
    }

    pub fn has_user(&self, userid: &str) -> bool {
        self.state().users.contains_key(userid)
    }

    pub fn user_password(&self, userid: &str) -> Option<String> {
        self.state().users.get(userid).cloned()
    }

    pub fn has_pool(&self, poolid: &str) -> bool {
        self.state().pools.contains(poolid)
    }

    /// ACL entries as `(path, user, role)`
    pub fn acl_entries(&self) -> Vec<(String, String, String)> {
        self.state().acl.iter().cloned().collect()
    }

    pub fn reloaded_nodes(&self) -> Vec<String> {
        self.state().reloads.clone()
    }
}

#[async_trait]
impl ClusterGateway for InMemoryCluster {
    async fn get_nodes(&self) -> Result<Vec<String>, GatewayError> {
        Ok(self.state().nodes.clone())
    }

    async fn get_vms_on_node(&self, node: &str) -> Result<Vec<VmInfo>, GatewayError> {
        let state = self.state();
        state.require_node(node)?;
        if state.faults.failing_nodes.contains(node) {
            return Err(GatewayError::Http(format!("node {} unreachable", node)));
        }
        Ok(state
            .vms
            .values()
            .filter(|vm| vm.info.node == node)
            .map(|vm| vm.info.clone())
            .collect())
    }

    async fn find_vm(&self, vmid: u32) -> Result<Option<VmInfo>, GatewayError> {
        let mut state = self.state();
        if let Some(vm) = state.vms.get(&vmid) {
            return Ok(Some(vm.info.clone()));
        }
        if let Some((info, remaining)) = state.lingering.get_mut(&vmid) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(Some(info.clone()));
            }
        }
        Ok(None)
    }

    async fn get_next_vmid(&self) -> Result<u32, GatewayError> {
        let state = self.state();
        let highest = state
            .vms
            .keys()
            .chain(state.lingering.keys())
            .copied()
            .max()
            .unwrap_or(99);
        Ok((highest + 1).max(100))
    }

    async fn clone_vm(&self, request: &CloneRequest) -> Result<TaskId, GatewayError> {
        self.mutated();
        let mut state = self.state();
        state.require_node(&request.target_node)?;
        if state.faults.failing_clone_sources.contains(&request.source_vmid) {
            return Err(GatewayError::Api {
                status: 500,
                message: format!("clone of {} failed: storage error", request.source_vmid),
            });
        }
        let source = state
            .vm_on(&request.source_node, request.source_vmid)?
            .clone();
        if !request.full_clone && !source.info.template {
            return Err(GatewayError::Api {
                status: 400,
                message: "linked clone requires a template source".to_string(),
            });
        }
        if state.vms.contains_key(&request.new_vmid) {
            return Err(GatewayError::Conflict(format!("VM {}", request.new_vmid)));
        }
        if let Some(ref pool) = request.pool {
            if !state.pools.contains(pool) {
                return Err(GatewayError::NotFound(format!("pool '{}'", pool)));
            }
        }
        state.vms.insert(
            request.new_vmid,
            Vm {
                info: VmInfo {
                    vmid: request.new_vmid,
                    name: request.name.clone(),
                    node: request.target_node.clone(),
                    status: "stopped".to_string(),
                    template: false,
                },
                pool: request.pool.clone(),
                config: source.config.clone(),
            },
        );
        Ok(state.spawn_task(&request.source_node, "qmclone", request.source_vmid))
    }

    async fn task_status(&self, node: &str, task: &TaskId) -> Result<TaskStatus, GatewayError> {
        let state = self.state();
        state.require_node(node)?;
        state
            .tasks
            .get(&task.0)
            .cloned()
            .ok_or_else(|| GatewayError::TaskGone(format!("no such task '{}'", task)))
    }

    async fn convert_to_template(&self, node: &str, vmid: u32) -> Result<(), GatewayError> {
        self.mutated();
        let mut state = self.state();
        let vm = state.vm_on(node, vmid)?;
        if vm.info.is_running() {
            return Err(GatewayError::Api {
                status: 500,
                message: format!("VM {} is running", vmid),
            });
        }
        vm.info.template = true;
        Ok(())
    }

    async fn migrate_vm(
        &self,
        source_node: &str,
        vmid: u32,
        target_node: &str,
        online: bool,
    ) -> Result<TaskId, GatewayError> {
        self.mutated();
        let mut state = self.state();
        state.require_node(target_node)?;
        let vm = state.vm_on(source_node, vmid)?;
        if online && vm.info.template {
            return Err(GatewayError::Api {
                status: 400,
                message: "templates cannot be migrated online".to_string(),
            });
        }
        vm.info.node = target_node.to_string();
        Ok(state.spawn_task(source_node, "qmigrate", vmid))
    }

    async fn stop_vm(&self, node: &str, vmid: u32) -> Result<TaskId, GatewayError> {
        self.mutated();
        let mut state = self.state();
        state.vm_on(node, vmid)?.info.status = "stopped".to_string();
        Ok(state.spawn_task(node, "qmstop", vmid))
    }

    async fn delete_vm(&self, node: &str, vmid: u32) -> Result<TaskId, GatewayError> {
        self.mutated();
        let mut state = self.state();
        if state.vm_on(node, vmid)?.info.is_running() {
            return Err(GatewayError::Api {
                status: 500,
                message: format!("VM {} is running - destroy failed", vmid),
            });
        }
        if let Some(vm) = state.vms.remove(&vmid) {
            let linger = state.faults.linger_lookups;
            if linger > 0 {
                state.lingering.insert(vmid, (vm.info, linger));
            }
        }
        Ok(state.spawn_task(node, "qmdestroy", vmid))
    }

    async fn vm_config(
        &self,
        node: &str,
        vmid: u32,
    ) -> Result<BTreeMap<String, String>, GatewayError> {
        Ok(self.state().vm_on(node, vmid)?.config.clone())
    }

    async fn configure_vm_network(
        &self,
        node: &str,
        vmid: u32,
        interfaces: &InterfaceMap,
    ) -> Result<(), GatewayError> {
        self.mutated();
        let mut state = self.state();
        let known = state.bridges.get(node).cloned().unwrap_or_default();
        for definition in interfaces.values() {
            if let Some(bridge) = super::interface_bridge(definition) {
                if !known.contains_key(bridge) {
                    return Err(GatewayError::Api {
                        status: 400,
                        message: format!("bridge '{}' does not exist", bridge),
                    });
                }
            }
        }
        let vm = state.vm_on(node, vmid)?;
        for (slot, definition) in interfaces {
            vm.config.insert(slot.clone(), definition.clone());
        }
        Ok(())
    }

    async fn remove_vm_interfaces(
        &self,
        node: &str,
        vmid: u32,
        slots: &[String],
    ) -> Result<(), GatewayError> {
        self.mutated();
        let mut state = self.state();
        let vm = state.vm_on(node, vmid)?;
        for slot in slots {
            vm.config.remove(slot);
        }
        Ok(())
    }

    async fn list_bridges(&self, node: &str) -> Result<Vec<String>, GatewayError> {
        let state = self.state();
        state.require_node(node)?;
        Ok(state
            .bridges
            .get(node)
            .map(|b| b.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn create_bridge(&self, node: &str, name: &str) -> Result<(), GatewayError> {
        self.insert_bridge(node, name, false)
    }

    async fn create_vlan_bridge(&self, node: &str, name: &str) -> Result<(), GatewayError> {
        self.insert_bridge(node, name, true)
    }

    async fn delete_bridge(&self, node: &str, name: &str) -> Result<(), GatewayError> {
        self.mutated();
        let mut state = self.state();
        match state.bridges.get_mut(node).and_then(|b| b.remove(name)) {
            Some(_) => Ok(()),
            None => Err(GatewayError::NotFound(format!("bridge '{}' on {}", name, node))),
        }
    }

    async fn reload_node_network(&self, node: &str) -> Result<(), GatewayError> {
        self.mutated();
        let mut state = self.state();
        state.require_node(node)?;
        state.reloads.push(node.to_string());
        Ok(())
    }

    async fn user_exists(&self, userid: &str) -> Result<bool, GatewayError> {
        Ok(self.state().users.contains_key(userid))
    }

    async fn create_user(&self, userid: &str, password: &str) -> Result<(), GatewayError> {
        self.mutated();
        let mut state = self.state();
        if state.users.contains_key(userid) {
            return Err(GatewayError::Conflict(format!("user '{}'", userid)));
        }
        state.users.insert(userid.to_string(), password.to_string());
        Ok(())
    }

    async fn set_user_password(&self, userid: &str, password: &str) -> Result<(), GatewayError> {
        self.mutated();
        match self.state().users.get_mut(userid) {
            Some(stored) => {
                *stored = password.to_string();
                Ok(())
            }
            None => Err(GatewayError::NotFound(format!("user '{}'", userid))),
        }
    }

    async fn delete_user(&self, userid: &str) -> Result<(), GatewayError> {
        self.mutated();
        let mut state = self.state();
        if state.users.remove(userid).is_none() {
            return Err(GatewayError::NotFound(format!("user '{}'", userid)));
        }
        state.acl.retain(|(_, user, _)| user != userid);
        Ok(())
    }

    async fn pool_exists(&self, poolid: &str) -> Result<bool, GatewayError> {
        Ok(self.state().pools.contains(poolid))
    }

    async fn create_pool(&self, poolid: &str, _comment: &str) -> Result<(), GatewayError> {
        self.mutated();
        if !self.state().pools.insert(poolid.to_string()) {
            return Err(GatewayError::Conflict(format!("pool '{}'", poolid)));
        }
        Ok(())
    }

    async fn delete_pool(&self, poolid: &str) -> Result<(), GatewayError> {
        self.mutated();
        let mut state = self.state();
        if state
            .vms
            .values()
            .any(|vm| vm.pool.as_deref() == Some(poolid))
        {
            return Err(GatewayError::Api {
                status: 500,
                message: format!("pool '{}' is not empty", poolid),
            });
        }
        if !state.pools.remove(poolid) {
            return Err(GatewayError::NotFound(format!("pool '{}'", poolid)));
        }
        Ok(())
    }

    async fn pool_members(&self, poolid: &str) -> Result<Vec<VmInfo>, GatewayError> {
        let state = self.state();
        if !state.pools.contains(poolid) {
            return Err(GatewayError::NotFound(format!("pool '{}'", poolid)));
        }
        Ok(state
            .vms
            .values()
            .filter(|vm| vm.pool.as_deref() == Some(poolid))
            .map(|vm| vm.info.clone())
            .collect())
    }

    async fn set_pool_permissions(
        &self,
        userid: &str,
        poolid: &str,
        roles: &[String],
    ) -> Result<(), GatewayError> {
        self.mutated();
        let mut state = self.state();
        for role in roles {
            state.acl.insert((
                format!("/pool/{}", poolid),
                userid.to_string(),
                role.clone(),
            ));
        }
        Ok(())
    }

    async fn grant_vm_permission(
        &self,
        userid: &str,
        node: &str,
        vmid: u32,
        role: &str,
    ) -> Result<(), GatewayError> {
        self.mutated();
        let mut state = self.state();
        state.vm_on(node, vmid)?;
        state.acl.insert((
            format!("/vms/{}", vmid),
            userid.to_string(),
            role.to_string(),
        ));
        Ok(())
    }
}

impl InMemoryCluster {
    fn insert_bridge(&self, node: &str, name: &str, vlan_aware: bool) -> Result<(), GatewayError> {
        self.mutated();
        let mut state = self.state();
        state.require_node(node)?;
        if state.faults.fail_bridge_creation {
            return Err(GatewayError::Api {
                status: 500,
                message: format!("cannot create bridge '{}'", name),
            });
        }
        let bridges = state.bridges.entry(node.to_string()).or_default();
        if bridges.contains_key(name) {
            return Err(GatewayError::Conflict(format!("bridge '{}' on {}", name, node)));
        }
        bridges.insert(name.to_string(), vlan_aware);
        Ok(())
    }
}
