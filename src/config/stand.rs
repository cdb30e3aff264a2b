//! Stand definition: the machines every user receives

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Kind of guest, drives the interface layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Linux,
    Ecorouter,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Linux => write!(f, "linux"),
            DeviceType::Ecorouter => write!(f, "ecorouter"),
        }
    }
}

/// One interface of a machine, attached to a bridge alias
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// User-facing alias, optionally with a `.vlan` suffix (e.g. `hq.50`)
    pub bridge: String,
    /// Map the alias 1:1 onto a literal bridge, bypassing per-pool numbering
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reserved: bool,
}

impl NetworkSpec {
    pub fn new(bridge: impl Into<String>) -> Self {
        Self {
            bridge: bridge.into(),
            reserved: false,
        }
    }

    pub fn reserved(bridge: impl Into<String>) -> Self {
        Self {
            bridge: bridge.into(),
            reserved: true,
        }
    }
}

/// A machine cloned once per user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSpec {
    pub template_vmid: u32,
    pub template_node: String,
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Independent disk copy instead of a linked clone
    #[serde(default)]
    pub full_clone: bool,
    #[serde(default)]
    pub networks: Vec<NetworkSpec>,
}

impl MachineSpec {
    pub fn new(template_vmid: u32, template_node: impl Into<String>) -> Self {
        Self {
            template_vmid,
            template_node: template_node.into(),
            device_type: DeviceType::Linux,
            name: None,
            full_clone: false,
            networks: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_device_type(mut self, device_type: DeviceType) -> Self {
        self.device_type = device_type;
        self
    }

    pub fn with_full_clone(mut self, full_clone: bool) -> Self {
        self.full_clone = full_clone;
        self
    }

    pub fn with_network(mut self, network: NetworkSpec) -> Self {
        self.networks.push(network);
        self
    }

    /// Key identifying the source template: `"{vmid}:{node}"`
    pub fn template_key(&self) -> TemplateKey {
        TemplateKey::new(self.template_vmid, &self.template_node)
    }
}

/// An original template, identified by vmid and the node storing it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TemplateKey {
    pub vmid: u32,
    pub node: String,
}

impl TemplateKey {
    pub fn new(vmid: u32, node: &str) -> Self {
        Self {
            vmid,
            node: node.to_string(),
        }
    }
}

impl std::fmt::Display for TemplateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.vmid, self.node)
    }
}

/// Ordered list of machines making up one stand
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StandConfig {
    #[serde(default)]
    pub machines: Vec<MachineSpec>,
}

impl StandConfig {
    pub fn new(machines: Vec<MachineSpec>) -> Self {
        Self { machines }
    }

    /// Unique source templates, in first-seen order
    pub fn template_keys(&self) -> Vec<TemplateKey> {
        let mut seen = BTreeSet::new();
        self.machines
            .iter()
            .map(MachineSpec::template_key)
            .filter(|key| seen.insert(key.clone()))
            .collect()
    }

    /// Distinct nodes holding the original templates
    pub fn template_nodes(&self) -> BTreeSet<String> {
        self.machines
            .iter()
            .map(|m| m.template_node.clone())
            .collect()
    }

    /// A copy restricted to machines matching `keep`
    pub fn filtered<F>(&self, keep: F) -> StandConfig
    where
        F: Fn(&MachineSpec) -> bool,
    {
        StandConfig {
            machines: self.machines.iter().filter(|m| keep(m)).cloned().collect(),
        }
    }
}

impl StandConfig {
    /// Structural check; see [`super::validation::validate_stand`]
    pub fn validate(&self) -> super::ValidationReport {
        super::validation::validate_stand(self)
    }
}
