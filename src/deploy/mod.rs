//! Placement strategies and batch dispatch
//!
//! | strategy | placement              | clone source                              |
//! |----------|------------------------|-------------------------------------------|
//! | local    | template node          | original template                         |
//! | remote   | one target node        | template prepared for the target          |
//! | balanced | round robin            | original if on the node, else prepared    |
//! | smart    | weighted scores        | template prepared for each node           |

pub mod coordinator;

pub use coordinator::DeploymentCoordinator;

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{StandError, StandResult};

/// Where stands are placed and which templates they clone from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    Local,
    Remote { target: String },
    Balanced,
    Smart,
}

impl Strategy {
    /// Build from a strategy name; `remote` requires a target node
    pub fn from_name(name: &str, target: Option<&str>) -> StandResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "local" => Ok(Strategy::Local),
            "remote" => match target {
                Some(node) if !node.trim().is_empty() => Ok(Strategy::Remote {
                    target: node.trim().to_string(),
                }),
                _ => Err(StandError::Validation(
                    "remote strategy requires a target node".to_string(),
                )),
            },
            "balanced" => Ok(Strategy::Balanced),
            "smart" => Ok(Strategy::Smart),
            other => Err(StandError::Validation(format!(
                "unknown strategy '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Local => write!(f, "local"),
            Strategy::Remote { target } => write!(f, "remote({})", target),
            Strategy::Balanced => write!(f, "balanced"),
            Strategy::Smart => write!(f, "smart"),
        }
    }
}

/// Outcome of one deployment batch
#[derive(Debug, Clone, Default)]
pub struct DeploymentResult {
    /// User -> password, empty for users whose stand failed
    pub passwords: BTreeMap<String, String>,
    /// User -> failure reason
    pub failures: BTreeMap<String, String>,
    /// User -> vmids of the stand
    pub vmids: BTreeMap<String, Vec<u32>>,
    /// User -> node (or node list for local placement)
    pub placement: BTreeMap<String, String>,
}

impl DeploymentResult {
    pub fn record_success(&mut self, user: &str, node: &str, password: String, vmids: Vec<u32>) {
        self.passwords.insert(user.to_string(), password);
        self.vmids.insert(user.to_string(), vmids);
        self.placement.insert(user.to_string(), node.to_string());
    }

    pub fn record_failure(&mut self, user: &str, node: &str, reason: impl Into<String>) {
        self.passwords.insert(user.to_string(), String::new());
        self.failures.insert(user.to_string(), reason.into());
        self.placement.insert(user.to_string(), node.to_string());
    }

    pub fn total(&self) -> usize {
        self.passwords.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failures.len()
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// `PartialFailure` when any user failed
    pub fn ensure_complete(&self) -> StandResult<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(StandError::PartialFailure {
                failed: self.failed_count(),
                total: self.total(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_from_name() {
        assert_eq!(Strategy::from_name("local", None).unwrap(), Strategy::Local);
        assert_eq!(Strategy::from_name("SMART", None).unwrap(), Strategy::Smart);
        assert_eq!(
            Strategy::from_name("remote", Some("pve2")).unwrap(),
            Strategy::Remote {
                target: "pve2".to_string()
            }
        );
        assert!(matches!(
            Strategy::from_name("remote", None),
            Err(StandError::Validation(_))
        ));
        assert!(Strategy::from_name("random", None).is_err());
    }

    #[test]
    fn test_result_accounting() {
        let mut result = DeploymentResult::default();
        result.record_success("alice@pve", "pve1", "12345678".into(), vec![200]);
        assert!(result.ensure_complete().is_ok());

        result.record_failure("bob@pve", "pve2", "clone failed");
        assert_eq!(result.passwords["bob@pve"], "");
        assert!(matches!(
            result.ensure_complete(),
            Err(StandError::PartialFailure { failed: 1, total: 2 })
        ));
    }
}
