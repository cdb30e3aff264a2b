//! Stand and user-list validation
//!
//! Runs before any cluster mutation. Errors reject the input, warnings are
//! surfaced to the operator but do not block a deployment.

use std::collections::{BTreeSet, HashSet};

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::stand::StandConfig;
use super::users::normalize_userid;
use crate::network::{parse_bridge_ref, AliasError};

/// Longest VM name accepted by the cluster
pub const MAX_MACHINE_NAME_LEN: usize = 40;

const MACHINE_COUNT_WARNING: usize = 50;
const BRIDGE_COUNT_WARNING: usize = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ValidationSeverity {
    /// May work but is likely unintended
    Warning,
    /// Rejects the input
    Error,
}

/// A single validation message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationMessage {
    pub severity: ValidationSeverity,
    pub code: String,
    pub message: String,
}

/// Collected validation messages for one input
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub messages: Vec<ValidationMessage>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, severity: ValidationSeverity, code: &str, message: String) {
        self.messages.push(ValidationMessage {
            severity,
            code: code.to_string(),
            message,
        });
    }

    pub fn error(&mut self, code: &str, message: impl Into<String>) {
        self.push(ValidationSeverity::Error, code, message.into());
    }

    pub fn warning(&mut self, code: &str, message: impl Into<String>) {
        self.push(ValidationSeverity::Warning, code, message.into());
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationMessage> {
        self.messages
            .iter()
            .filter(|m| m.severity == ValidationSeverity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationMessage> {
        self.messages
            .iter()
            .filter(|m| m.severity == ValidationSeverity::Warning)
    }

    pub fn has_errors(&self) -> bool {
        self.errors().next().is_some()
    }

    pub fn has_warnings(&self) -> bool {
        self.warnings().next().is_some()
    }

    /// All error messages joined into one line
    pub fn error_summary(&self) -> String {
        self.errors()
            .map(|m| m.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

// ============================================================================
// SBIO: Pure validation logic (no I/O)
// ============================================================================

/// Whether a VM name is acceptable as-is: `[A-Za-z0-9_-]{1,40}`
pub fn is_valid_machine_name(name: &str) -> bool {
    name.len() <= MAX_MACHINE_NAME_LEN
        && Regex::new(r"^[a-zA-Z0-9_-]+$")
            .map(|re| re.is_match(name))
            .unwrap_or(false)
}

/// Validate a stand definition
pub fn validate_stand(config: &StandConfig) -> ValidationReport {
    let mut report = ValidationReport::new();

    if config.machines.is_empty() {
        report.error("no-machines", "Stand defines no machines");
        return report;
    }

    for (index, machine) in config.machines.iter().enumerate() {
        if machine.template_node.trim().is_empty() {
            report.error(
                "template-node",
                format!("Machine {}: template_node must not be empty", index),
            );
        }
        if machine.template_vmid < 100 {
            report.warning(
                "low-vmid",
                format!(
                    "Machine {}: template vmid {} is below the usual minimum of 100",
                    index, machine.template_vmid
                ),
            );
        }
        if let Some(ref name) = machine.name {
            if !is_valid_machine_name(name) {
                report.error(
                    "machine-name",
                    format!("Machine {}: invalid name '{}'", index, name),
                );
            }
        }

        if machine.networks.is_empty() {
            report.warning(
                "no-networks",
                format!("Machine {}: no network interfaces", index),
            );
        }
        let mut seen = HashSet::new();
        for (net_index, network) in machine.networks.iter().enumerate() {
            match parse_bridge_ref(network) {
                Ok(_) => {}
                Err(AliasError::Empty) => report.error(
                    "bridge",
                    format!("Machine {}, network {}: bridge must not be empty", index, net_index),
                ),
                Err(e) => report.error(
                    "vlan",
                    format!("Machine {}, network {}: {}", index, net_index, e),
                ),
            }
            if !seen.insert(network.bridge.as_str()) {
                report.warning(
                    "duplicate-bridge",
                    format!(
                        "Machine {}: bridge '{}' is attached more than once",
                        index, network.bridge
                    ),
                );
            }
        }
    }

    let mut names = HashSet::new();
    if config
        .machines
        .iter()
        .filter_map(|m| m.name.as_deref())
        .any(|name| !names.insert(name))
    {
        report.warning("duplicate-names", "Duplicate machine names in stand");
    }

    let mut templates = HashSet::new();
    for machine in &config.machines {
        let key = machine.template_key();
        if !templates.insert(key.clone()) {
            report.warning(
                "template-reuse",
                format!("Template {} is used more than once", key),
            );
        }
    }

    if config.machines.len() > MACHINE_COUNT_WARNING {
        report.warning(
            "many-machines",
            format!(
                "Large stand ({} machines) may deploy slowly",
                config.machines.len()
            ),
        );
    }

    let bridges: BTreeSet<&str> = config
        .machines
        .iter()
        .flat_map(|m| m.networks.iter().map(|n| n.bridge.as_str()))
        .collect();
    if bridges.len() > BRIDGE_COUNT_WARNING {
        report.warning(
            "many-bridges",
            format!("Stand uses {} distinct bridges", bridges.len()),
        );
    }

    report
}

/// Validate a user list, returning the normalized ids alongside the report
pub fn validate_users(users: &[String]) -> (Vec<String>, ValidationReport) {
    let mut report = ValidationReport::new();
    let mut normalized = Vec::with_capacity(users.len());

    if users.is_empty() {
        report.error("no-users", "User list is empty");
        return (normalized, report);
    }

    let mut seen = HashSet::new();
    for (index, user) in users.iter().enumerate() {
        let trimmed = user.trim();
        if trimmed.is_empty() || trimmed.starts_with('@') {
            report.error("user", format!("User {}: empty user name", index));
            continue;
        }
        if !trimmed.contains('@') {
            report.warning(
                "realm",
                format!("User {}: no realm given, using '{}@pve'", index, trimmed),
            );
        }
        let userid = normalize_userid(trimmed);
        if !seen.insert(userid.clone()) {
            report.error("duplicate-user", format!("User {}: duplicate '{}'", index, userid));
            continue;
        }
        normalized.push(userid);
    }

    (normalized, report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MachineSpec, NetworkSpec};

    fn stand() -> StandConfig {
        StandConfig::new(vec![
            MachineSpec::new(100, "pve1").with_network(NetworkSpec::new("hq")),
            MachineSpec::new(101, "pve1").with_network(NetworkSpec::new("hq.50")),
        ])
    }

    #[test]
    fn test_valid_stand() {
        let report = validate_stand(&stand());
        assert!(!report.has_errors());
        assert!(!report.has_warnings());
    }

    #[test]
    fn test_empty_stand_is_rejected() {
        let report = validate_stand(&StandConfig::default());
        assert!(report.has_errors());
    }

    #[test]
    fn test_bad_name_and_vlan_are_errors() {
        let config = StandConfig::new(vec![MachineSpec::new(100, "pve1")
            .with_name("bad name!")
            .with_network(NetworkSpec::new("hq.9999"))]);
        let report = validate_stand(&config);
        let codes: Vec<&str> = report.errors().map(|m| m.code.as_str()).collect();
        assert!(codes.contains(&"machine-name"));
        assert!(codes.contains(&"vlan"));
    }

    #[test]
    fn test_empty_template_node_is_error() {
        let config = StandConfig::new(vec![MachineSpec::new(100, " ")]);
        assert!(validate_stand(&config).has_errors());
    }

    #[test]
    fn test_template_reuse_is_warning() {
        let config = StandConfig::new(vec![
            MachineSpec::new(100, "pve1").with_network(NetworkSpec::new("hq")),
            MachineSpec::new(100, "pve1").with_network(NetworkSpec::new("hq")),
        ]);
        let report = validate_stand(&config);
        assert!(!report.has_errors());
        assert!(report.warnings().any(|m| m.code == "template-reuse"));
    }

    #[test]
    fn test_machine_name_length_limit() {
        assert!(is_valid_machine_name("router-1"));
        assert!(is_valid_machine_name(&"a".repeat(40)));
        assert!(!is_valid_machine_name(&"a".repeat(41)));
        assert!(!is_valid_machine_name(""));
    }

    #[test]
    fn test_users_normalized_and_deduplicated() {
        let users = vec!["alice".to_string(), "bob@pve".to_string(), "alice@pve".to_string()];
        let (normalized, report) = validate_users(&users);
        assert_eq!(normalized, vec!["alice@pve", "bob@pve"]);
        assert!(report.errors().any(|m| m.code == "duplicate-user"));
        assert!(report.warnings().any(|m| m.code == "realm"));
    }

    #[test]
    fn test_empty_user_list_is_rejected() {
        let (_, report) = validate_users(&[]);
        assert!(report.has_errors());
    }
}
