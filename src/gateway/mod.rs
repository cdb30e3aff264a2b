//! Cluster gateway: the raw operations the orchestration layers consume
//!
//! ```text
//!   deploy ─┬─ templates ─┐
//!           ├─ lifecycle ─┼──> dyn ClusterGateway ──┬── ProxmoxGateway (REST)
//!           └─ balancing ─┘                         └── InMemoryCluster (tests)
//! ```
//!
//! Calls that start a cluster task return a [`TaskId`]; completion is
//! observed through [`ClusterGateway::task_status`] by [`crate::tasks`].

pub mod memory;
pub mod proxmox;

pub use memory::InMemoryCluster;
pub use proxmox::ProxmoxGateway;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

/// Interface slot to interface definition, e.g. `net0 -> model=virtio,bridge=vmbr1000,firewall=1`
pub type InterfaceMap = BTreeMap<String, String>;

#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("JSON parse error: {0}")]
    Parse(String),

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    /// The task endpoint answered 404: the task log was already reaped
    #[error("Task gone: {0}")]
    TaskGone(String),

    #[error("Already exists: {0}")]
    Conflict(String),

    #[error("Gateway configuration error: {0}")]
    Config(String),
}

/// A VM as listed by the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInfo {
    pub vmid: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub template: bool,
}

impl VmInfo {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

/// Identifier of an asynchronous cluster task (a UPID on Proxmox)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// State of a cluster task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Completed,
    /// Finished with a non-OK exit status
    Failed(String),
}

/// Parameters of a VM clone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneRequest {
    pub source_node: String,
    pub source_vmid: u32,
    pub target_node: String,
    pub new_vmid: u32,
    pub name: String,
    pub pool: Option<String>,
    pub full_clone: bool,
}

/// Whether a config key is a network interface slot (`net0`, `net12`)
pub fn is_interface_key(key: &str) -> bool {
    key.strip_prefix("net")
        .map(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}

/// Bridge referenced by an interface definition (`...,bridge=vmbr1000,...`)
pub fn interface_bridge(definition: &str) -> Option<&str> {
    definition
        .split(',')
        .find_map(|part| part.trim().strip_prefix("bridge="))
}

/// Bridges referenced by a VM config
pub fn referenced_bridges(config: &BTreeMap<String, String>) -> Vec<String> {
    config
        .iter()
        .filter(|(key, _)| is_interface_key(key))
        .filter_map(|(_, value)| interface_bridge(value).map(str::to_string))
        .collect()
}

// ============================================================================
// SBIO: Trait for abstraction (allows an in-memory cluster in tests)
// ============================================================================

#[async_trait]
pub trait ClusterGateway: Send + Sync {
    // -- nodes and VMs -------------------------------------------------------

    async fn get_nodes(&self) -> Result<Vec<String>, GatewayError>;

    async fn get_vms_on_node(&self, node: &str) -> Result<Vec<VmInfo>, GatewayError>;

    /// Look a VM up anywhere in the cluster
    async fn find_vm(&self, vmid: u32) -> Result<Option<VmInfo>, GatewayError>;

    async fn get_next_vmid(&self) -> Result<u32, GatewayError>;

    async fn clone_vm(&self, request: &CloneRequest) -> Result<TaskId, GatewayError>;

    async fn task_status(&self, node: &str, task: &TaskId) -> Result<TaskStatus, GatewayError>;

    async fn convert_to_template(&self, node: &str, vmid: u32) -> Result<(), GatewayError>;

    async fn migrate_vm(
        &self,
        source_node: &str,
        vmid: u32,
        target_node: &str,
        online: bool,
    ) -> Result<TaskId, GatewayError>;

    async fn stop_vm(&self, node: &str, vmid: u32) -> Result<TaskId, GatewayError>;

    async fn delete_vm(&self, node: &str, vmid: u32) -> Result<TaskId, GatewayError>;

    async fn vm_config(&self, node: &str, vmid: u32)
        -> Result<BTreeMap<String, String>, GatewayError>;

    async fn configure_vm_network(
        &self,
        node: &str,
        vmid: u32,
        interfaces: &InterfaceMap,
    ) -> Result<(), GatewayError>;

    async fn remove_vm_interfaces(
        &self,
        node: &str,
        vmid: u32,
        slots: &[String],
    ) -> Result<(), GatewayError>;

    // -- bridges -------------------------------------------------------------

    async fn list_bridges(&self, node: &str) -> Result<Vec<String>, GatewayError>;

    async fn bridge_exists(&self, node: &str, name: &str) -> Result<bool, GatewayError> {
        Ok(self.list_bridges(node).await?.iter().any(|b| b == name))
    }

    async fn create_bridge(&self, node: &str, name: &str) -> Result<(), GatewayError>;

    async fn create_vlan_bridge(&self, node: &str, name: &str) -> Result<(), GatewayError>;

    async fn delete_bridge(&self, node: &str, name: &str) -> Result<(), GatewayError>;

    /// Whether any VM on the node has an interface attached to the bridge
    async fn bridge_in_use(&self, node: &str, name: &str) -> Result<bool, GatewayError> {
        for vm in self.get_vms_on_node(node).await? {
            let config = self.vm_config(node, vm.vmid).await?;
            if referenced_bridges(&config).iter().any(|b| b == name) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn reload_node_network(&self, node: &str) -> Result<(), GatewayError>;

    // -- users, pools, permissions --------------------------------------------

    async fn user_exists(&self, userid: &str) -> Result<bool, GatewayError>;

    async fn create_user(&self, userid: &str, password: &str) -> Result<(), GatewayError>;

    async fn set_user_password(&self, userid: &str, password: &str) -> Result<(), GatewayError>;

    async fn delete_user(&self, userid: &str) -> Result<(), GatewayError>;

    async fn pool_exists(&self, poolid: &str) -> Result<bool, GatewayError>;

    async fn create_pool(&self, poolid: &str, comment: &str) -> Result<(), GatewayError>;

    async fn delete_pool(&self, poolid: &str) -> Result<(), GatewayError>;

    async fn pool_members(&self, poolid: &str) -> Result<Vec<VmInfo>, GatewayError>;

    async fn set_pool_permissions(
        &self,
        userid: &str,
        poolid: &str,
        roles: &[String],
    ) -> Result<(), GatewayError>;

    async fn grant_vm_permission(
        &self,
        userid: &str,
        node: &str,
        vmid: u32,
        role: &str,
    ) -> Result<(), GatewayError>;
}

/// Serializes VMID reservation across concurrent node workers.
///
/// `next_vmid` only reports the first free id; the id is taken once the
/// clone is submitted, so the lock spans both calls.
#[derive(Debug, Default)]
pub struct VmidAllocator {
    lock: Mutex<()>,
}

impl VmidAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a fresh vmid and submit the clone while holding the lock
    pub async fn clone_with_fresh_vmid(
        &self,
        gateway: &dyn ClusterGateway,
        mut request: CloneRequest,
    ) -> Result<(u32, TaskId), GatewayError> {
        let _guard = self.lock.lock().await;
        let vmid = gateway.get_next_vmid().await?;
        request.new_vmid = vmid;
        let task = gateway.clone_vm(&request).await?;
        Ok((vmid, task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_keys() {
        assert!(is_interface_key("net0"));
        assert!(is_interface_key("net12"));
        assert!(!is_interface_key("net"));
        assert!(!is_interface_key("netx"));
        assert!(!is_interface_key("scsi0"));
    }

    #[test]
    fn test_interface_bridge() {
        assert_eq!(
            interface_bridge("model=virtio,bridge=vmbr1000,tag=50,firewall=1"),
            Some("vmbr1000")
        );
        assert_eq!(interface_bridge("virtio=AA:BB:CC:DD:EE:FF"), None);
    }

    #[test]
    fn test_referenced_bridges_ignores_other_keys() {
        let mut config = BTreeMap::new();
        config.insert("net0".to_string(), "model=virtio,bridge=vmbr0".to_string());
        config.insert("net1".to_string(), "model=virtio,bridge=vmbr9000".to_string());
        config.insert("scsi0".to_string(), "local-lvm:vm-100-disk-0".to_string());
        assert_eq!(referenced_bridges(&config), vec!["vmbr0", "vmbr9000"]);
    }

    #[tokio::test]
    async fn test_vmid_allocator_hands_out_distinct_ids() {
        let cluster = InMemoryCluster::new(&["pve1"]).with_template("pve1", 100);
        let allocator = VmidAllocator::new();
        let request = CloneRequest {
            source_node: "pve1".into(),
            source_vmid: 100,
            target_node: "pve1".into(),
            new_vmid: 0,
            name: "a".into(),
            pool: None,
            full_clone: false,
        };
        let (first, _) = allocator
            .clone_with_fresh_vmid(&cluster, request.clone())
            .await
            .unwrap();
        let (second, _) = allocator
            .clone_with_fresh_vmid(&cluster, request)
            .await
            .unwrap();
        assert_ne!(first, second);
    }
}
