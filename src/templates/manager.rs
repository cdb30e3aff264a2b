//! Template preparation pipeline
//!
//! ```text
//! cache hit?  ──yes──> live check on target ──ok──> use it
//!     │                      │ stale
//!     no <───── purge ───────┘
//!     │
//! adopt a live `template-clone-{orig}-*` on target? ──yes──> persist, use it
//!     │ no
//! full clone on source node -> wait -> convert to template
//!     -> migrate offline to target (if different) -> wait -> persist
//! ```
//!
//! A failure after the clone was submitted deletes the clone on a best
//! effort basis; no mapping is recorded for that key.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::store::{TemplateRecord, TemplateStore};
use crate::config::{StandConfig, TemplateKey};
use crate::error::{StandError, StandResult};
use crate::gateway::{CloneRequest, ClusterGateway, VmidAllocator};
use crate::tasks::{wait_for_task, TaskPolicy};

/// Source template -> local template vmid on one target node
pub type TemplateMapping = BTreeMap<TemplateKey, u32>;

/// Name prefix shared by all local copies of one template
pub fn clone_prefix(original_vmid: u32) -> String {
    format!("template-clone-{}-", original_vmid)
}

/// Name given to a fresh local copy
pub fn clone_name(original_vmid: u32, timestamp: i64) -> String {
    format!("{}{}", clone_prefix(original_vmid), timestamp)
}

pub struct TemplateManager {
    gateway: Arc<dyn ClusterGateway>,
    store: Arc<dyn TemplateStore>,
    vmids: Arc<VmidAllocator>,
    task_policy: TaskPolicy,
    /// Guards read-modify-write of the store across node workers
    store_lock: Mutex<()>,
}

impl TemplateManager {
    pub fn new(gateway: Arc<dyn ClusterGateway>, store: Arc<dyn TemplateStore>) -> Self {
        Self {
            gateway,
            store,
            vmids: Arc::new(VmidAllocator::new()),
            task_policy: TaskPolicy::default(),
            store_lock: Mutex::new(()),
        }
    }

    pub fn with_task_policy(mut self, policy: TaskPolicy) -> Self {
        self.task_policy = policy;
        self
    }

    /// Share vmid reservation with other components cloning concurrently
    pub fn with_vmid_allocator(mut self, vmids: Arc<VmidAllocator>) -> Self {
        self.vmids = vmids;
        self
    }

    /// Make every template referenced by `config` available on `target`.
    ///
    /// Keys resolved before a failure keep their persisted mapping.
    pub async fn prepare(&self, config: &StandConfig, target: &str) -> StandResult<TemplateMapping> {
        let mut mapping = TemplateMapping::new();
        for key in config.template_keys() {
            let local = match self.lookup(&key, target).await? {
                Some(local) => {
                    debug!("Template {} already on {} as {}", key, target, local);
                    local
                }
                None => self.localize(&key, target).await?,
            };
            mapping.insert(key, local);
        }
        Ok(mapping)
    }

    /// Cached or discoverable local copy, validated against the cluster
    pub async fn lookup(&self, key: &TemplateKey, target: &str) -> StandResult<Option<u32>> {
        let live = self.gateway.get_vms_on_node(target).await?;
        let _guard = self.store_lock.lock().await;

        if let Some(local) = self.store.get(key.vmid, target)? {
            if live.iter().any(|vm| vm.vmid == local && vm.template) {
                return Ok(Some(local));
            }
            warn!(
                "Cached template {} for {} on {} is gone, purging",
                local, key, target
            );
            self.store.remove(key.vmid, target)?;
        }

        let prefix = clone_prefix(key.vmid);
        if let Some(vm) = live
            .iter()
            .find(|vm| vm.template && vm.name.starts_with(&prefix))
        {
            info!("Adopting existing template {} ({}) for {}", vm.vmid, vm.name, key);
            self.store.put(key.vmid, target, vm.vmid)?;
            return Ok(Some(vm.vmid));
        }

        Ok(None)
    }

    async fn localize(&self, key: &TemplateKey, target: &str) -> StandResult<u32> {
        info!("Preparing template {} for node {}", key, target);
        let request = CloneRequest {
            source_node: key.node.clone(),
            source_vmid: key.vmid,
            target_node: key.node.clone(),
            new_vmid: 0,
            name: clone_name(key.vmid, Utc::now().timestamp()),
            pool: None,
            full_clone: true,
        };
        let (vmid, task) = self
            .vmids
            .clone_with_fresh_vmid(self.gateway.as_ref(), request)
            .await?;

        let pipeline = async {
            wait_for_task(self.gateway.as_ref(), &key.node, &task, &self.task_policy).await?;
            self.gateway.convert_to_template(&key.node, vmid).await?;
            if key.node != target {
                debug!("Migrating template {} from {} to {}", vmid, key.node, target);
                let migration = self
                    .gateway
                    .migrate_vm(&key.node, vmid, target, false)
                    .await?;
                wait_for_task(self.gateway.as_ref(), &key.node, &migration, &self.task_policy)
                    .await?;
            }
            Ok::<(), StandError>(())
        };

        if let Err(e) = pipeline.await {
            warn!("Template pipeline for {} failed: {}", key, e);
            self.discard_clone(vmid).await;
            return Err(e);
        }

        {
            let _guard = self.store_lock.lock().await;
            self.store.put(key.vmid, target, vmid)?;
        }
        info!("Template {} available on {} as {}", key, target, vmid);
        Ok(vmid)
    }

    async fn discard_clone(&self, vmid: u32) {
        match self.gateway.find_vm(vmid).await {
            Ok(Some(vm)) => {
                if let Err(e) = self.gateway.delete_vm(&vm.node, vmid).await {
                    warn!("Failed to delete orphaned clone {}: {}", vmid, e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Cannot locate orphaned clone {}: {}", vmid, e),
        }
    }

    /// Every persisted mapping
    pub fn records(&self) -> StandResult<Vec<TemplateRecord>> {
        Ok(self.store.records()?)
    }

    /// Drop one mapping without touching the cluster
    pub async fn forget(&self, original_vmid: u32, node: &str) -> StandResult<bool> {
        let _guard = self.store_lock.lock().await;
        Ok(self.store.remove(original_vmid, node)?)
    }
}
