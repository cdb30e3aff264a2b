//! Bounded polling of asynchronous cluster tasks
//!
//! Every clone, migration, stop and delete blocks here until the task
//! finishes, fails, or the timeout elapses. A timeout is a hard error.

use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::error::{StandError, StandResult};
use crate::gateway::{ClusterGateway, GatewayError, TaskId, TaskStatus};

/// Poll interval and upper bound for one task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for TaskPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(300),
        }
    }
}

impl TaskPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Wait for a task to finish successfully.
///
/// A task the cluster reports as gone has already been reaped and counts
/// as finished. Any other lookup error, such as an unknown node, fails the
/// wait. Transport errors are retried until the deadline.
pub async fn wait_for_task(
    gateway: &dyn ClusterGateway,
    node: &str,
    task: &TaskId,
    policy: &TaskPolicy,
) -> StandResult<()> {
    let poll = async {
        loop {
            match gateway.task_status(node, task).await {
                Ok(TaskStatus::Completed) => return Ok(()),
                Ok(TaskStatus::Failed(status)) => {
                    return Err(StandError::TaskFailed {
                        task: task.to_string(),
                        node: node.to_string(),
                        status,
                    })
                }
                Ok(TaskStatus::Running) => {}
                Err(GatewayError::TaskGone(_)) => {
                    debug!("Task {} on {} no longer listed, treating as done", task, node);
                    return Ok(());
                }
                Err(GatewayError::Http(e)) => {
                    warn!("Polling task {} on {} failed: {}", task, node, e);
                }
                Err(e) => return Err(e.into()),
            }
            sleep(policy.interval).await;
        }
    };

    match timeout(policy.timeout, poll).await {
        Ok(result) => result,
        Err(_) => Err(StandError::TaskTimeout {
            task: task.to_string(),
            node: node.to_string(),
            timeout_secs: policy.timeout.as_secs(),
        }),
    }
}
