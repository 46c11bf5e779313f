//! Execution state machine.
//!
//! Executions are persisted and mutated by remote workers, so their status is
//! only known at runtime. Every status write made by this crate is checked
//! against the edge set below.
//!
//! ```text
//! Pending         -> Started, Cancelling, ForceCancelling
//! Started         -> Terminated, Failed, Cancelled, Cancelling, ForceCancelling
//! Cancelling      -> Cancelled, ForceCancelling, Terminated
//! ForceCancelling -> Cancelled
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Persisted, not yet picked up by a worker.
    Pending,
    /// A worker is running the workflow.
    Started,
    /// Graceful cancellation was requested.
    Cancelling,
    /// Forced cancellation was requested.
    ForceCancelling,
    /// The workflow stopped after a cancellation request.
    Cancelled,
    /// The workflow completed successfully.
    Terminated,
    /// The workflow failed.
    Failed,
}

impl ExecutionStatus {
    /// All statuses, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::Pending,
        Self::Started,
        Self::Cancelling,
        Self::ForceCancelling,
        Self::Cancelled,
        Self::Terminated,
        Self::Failed,
    ];

    /// Statuses an execution never leaves.
    pub const END_STATES: [Self; 3] = [Self::Terminated, Self::Failed, Self::Cancelled];

    /// Get the status name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Cancelling => "cancelling",
            Self::ForceCancelling => "force_cancelling",
            Self::Cancelled => "cancelled",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }

    /// Check if the execution has finished.
    #[must_use]
    pub const fn is_end(&self) -> bool {
        matches!(self, Self::Terminated | Self::Failed | Self::Cancelled)
    }

    /// Check if `next` is a legal successor of this status.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (
                Self::Pending,
                Self::Started | Self::Cancelling | Self::ForceCancelling
            ) | (
                Self::Started,
                Self::Terminated
                    | Self::Failed
                    | Self::Cancelled
                    | Self::Cancelling
                    | Self::ForceCancelling
            ) | (
                Self::Cancelling,
                Self::Cancelled | Self::ForceCancelling | Self::Terminated
            ) | (Self::ForceCancelling, Self::Cancelled)
        )
    }

    /// Check if cancellation may be requested from this status.
    ///
    /// A graceful cancellation may only be initiated from `Pending` or
    /// `Started`; a forced one may additionally escalate a `Cancelling`
    /// execution.
    #[must_use]
    pub const fn can_cancel(&self, force: bool) -> bool {
        match self {
            Self::Pending | Self::Started => true,
            Self::Cancelling => force,
            _ => false,
        }
    }

    /// Status written when cancellation is requested.
    #[must_use]
    pub const fn cancellation_target(force: bool) -> Self {
        if force {
            Self::ForceCancelling
        } else {
            Self::Cancelling
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "started" => Ok(Self::Started),
            "cancelling" => Ok(Self::Cancelling),
            "force_cancelling" => Ok(Self::ForceCancelling),
            "cancelled" => Ok(Self::Cancelled),
            "terminated" => Ok(Self::Terminated),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("unknown execution status: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_states() {
        for status in ExecutionStatus::ALL {
            assert_eq!(
                status.is_end(),
                ExecutionStatus::END_STATES.contains(&status),
                "{status}"
            );
        }
    }

    #[test]
    fn end_states_have_no_successors() {
        for from in ExecutionStatus::END_STATES {
            for to in ExecutionStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn documented_edges() {
        use ExecutionStatus::*;

        let edges = [
            (Pending, Started),
            (Pending, Cancelling),
            (Pending, ForceCancelling),
            (Started, Terminated),
            (Started, Failed),
            (Started, Cancelled),
            (Started, Cancelling),
            (Started, ForceCancelling),
            (Cancelling, Cancelled),
            (Cancelling, ForceCancelling),
            (Cancelling, Terminated),
            (ForceCancelling, Cancelled),
        ];

        for from in ExecutionStatus::ALL {
            for to in ExecutionStatus::ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    edges.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn cancellation_preconditions() {
        use ExecutionStatus::*;

        for status in ExecutionStatus::ALL {
            assert_eq!(status.can_cancel(false), matches!(status, Pending | Started));
            assert_eq!(
                status.can_cancel(true),
                matches!(status, Pending | Started | Cancelling)
            );
        }
    }

    #[test]
    fn cancellation_targets_are_reachable() {
        for status in ExecutionStatus::ALL {
            for force in [false, true] {
                if status.can_cancel(force) {
                    assert!(status.can_transition_to(ExecutionStatus::cancellation_target(force)));
                }
            }
        }
    }

    #[test]
    fn parse_roundtrip() {
        for status in ExecutionStatus::ALL {
            let parsed: ExecutionStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("running".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&ExecutionStatus::ForceCancelling).unwrap();
        assert_eq!(json, r#""force_cancelling""#);
    }
}
