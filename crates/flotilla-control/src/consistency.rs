//! Waiting for the store to reflect prior writes.
//!
//! The backing store may serve stale list results for a short while after a
//! write. Code that must observe its own writes before continuing polls with
//! [`wait_for_count`] instead of assuming the reads are immediate.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::ConsistencyConfig;
use crate::error::{ControlError, ControlResult};

/// How long and how often to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    /// Delay between polls.
    pub poll_interval: Duration,
    /// Give up once this much time has elapsed.
    pub deadline: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            deadline: Duration::from_secs(30),
        }
    }
}

impl From<&ConsistencyConfig> for WaitPolicy {
    fn from(config: &ConsistencyConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            deadline: Duration::from_secs(config.deadline_secs),
        }
    }
}

/// Poll `query` until it returns at least `expected` items.
///
/// The query runs once immediately and then every `policy.poll_interval`
/// until the count is reached or `policy.deadline` has elapsed. Query errors
/// are returned as-is.
pub async fn wait_for_count<T, F, Fut>(
    what: &str,
    expected: usize,
    mut query: F,
    policy: WaitPolicy,
) -> ControlResult<Vec<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ControlResult<Vec<T>>>,
{
    let deadline = tokio::time::Instant::now() + policy.deadline;

    let mut items = query().await?;
    while items.len() < expected && tokio::time::Instant::now() < deadline {
        debug!(what, expected, observed = items.len(), "store not yet consistent");
        tokio::time::sleep(policy.poll_interval).await;
        items = query().await?;
    }

    if items.len() < expected {
        warn!(what, expected, observed = items.len(), "timed out waiting for store");
        return Err(ControlError::ConsistencyTimeout {
            what: what.to_owned(),
            expected,
            observed: items.len(),
        });
    }

    Ok(items)
}
