//! Error taxonomy shared by the orchestration layers
//!
//! Gateway, store and config errors stay local to their modules and are
//! folded into [`StandError`] at the orchestration boundary.

use thiserror::Error;

use crate::gateway::GatewayError;
use crate::templates::StoreError;

/// Errors surfaced by template preparation, stand lifecycle and deployment
#[derive(Error, Debug)]
pub enum StandError {
    /// Malformed input, rejected before any cluster mutation
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Cluster unavailable: {0}")]
    ClusterUnavailable(String),

    /// VMID or bridge collision, or an exhausted bridge range
    #[error("Resource conflict: {0}")]
    ResourceConflict(String),

    #[error("Partial failure: {failed} of {total} users failed")]
    PartialFailure { failed: usize, total: usize },

    /// VMs of a pool were still discoverable after the retry budget
    #[error("Deletion of pool '{pool}' could not be verified, still present: {remaining:?}")]
    VerificationTimeout { pool: String, remaining: Vec<u32> },

    #[error("Task {task} on node {node} did not finish within {timeout_secs}s")]
    TaskTimeout {
        task: String,
        node: String,
        timeout_secs: u64,
    },

    #[error("Task {task} on node {node} failed: {status}")]
    TaskFailed {
        task: String,
        node: String,
        status: String,
    },

    #[error("Template store error: {0}")]
    Store(#[from] StoreError),
}

impl From<GatewayError> for StandError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Conflict(msg) => StandError::ResourceConflict(msg),
            other => StandError::ClusterUnavailable(other.to_string()),
        }
    }
}

/// Result type for orchestration operations
pub type StandResult<T> = Result<T, StandError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_maps_to_resource_conflict() {
        let err: StandError = GatewayError::Conflict("vmid 105 already exists".into()).into();
        assert!(matches!(err, StandError::ResourceConflict(_)));
    }

    #[test]
    fn test_http_maps_to_cluster_unavailable() {
        let err: StandError = GatewayError::Http("connection refused".into()).into();
        assert!(matches!(err, StandError::ClusterUnavailable(_)));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_verification_timeout_lists_vmids() {
        let err = StandError::VerificationTimeout {
            pool: "alice".into(),
            remaining: vec![101, 102],
        };
        assert!(err.to_string().contains("alice"));
        assert!(err.to_string().contains("101"));
    }
}
