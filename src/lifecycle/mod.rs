//! Per-user stand lifecycle: user, pool, VMs, interfaces and permissions
//!
//! Creation is journaled and rolled back in reverse on failure. Deletion
//! is ordered so that a pool only disappears after each of its VMs has
//! been verified absent cluster-wide.

pub mod manager;
pub mod naming;
mod teardown;

pub use manager::ResourceLifecycleManager;
pub use naming::{machine_name, sanitize_machine_name, stand_machine_names};

use std::collections::BTreeMap;

use crate::config::MachineSpec;
use crate::network::BridgeCleanupReport;

/// One machine of a stand with its clone source already decided
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedMachine {
    pub spec: MachineSpec,
    pub source_node: String,
    pub source_vmid: u32,
    pub target_node: String,
}

impl PlannedMachine {
    /// Clone straight from the original template on its own node
    pub fn local(spec: &MachineSpec) -> Self {
        Self {
            spec: spec.clone(),
            source_node: spec.template_node.clone(),
            source_vmid: spec.template_vmid,
            target_node: spec.template_node.clone(),
        }
    }

    /// Clone from a template copy that already lives on `node`
    pub fn prepared(spec: &MachineSpec, node: &str, local_vmid: u32) -> Self {
        Self {
            spec: spec.clone(),
            source_node: node.to_string(),
            source_vmid: local_vmid,
            target_node: node.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserOutcome {
    Deleted,
    Failed(String),
}

/// Result of a deletion batch
#[derive(Debug, Clone, Default)]
pub struct DeletionReport {
    pub outcomes: BTreeMap<String, UserOutcome>,
    pub bridges: BridgeCleanupReport,
}

impl DeletionReport {
    pub fn deleted_count(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| **o == UserOutcome::Deleted)
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.len() - self.deleted_count()
    }

    pub fn is_success(&self) -> bool {
        self.failed_count() == 0
    }
}
