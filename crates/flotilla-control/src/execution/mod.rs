//! Workflow execution lifecycle.
//!
//! Starting a workflow records a `PENDING` execution and hands the workflow to
//! the remote task system; from then on the execution only moves along the
//! edges of [`ExecutionStatus`](crate::ExecutionStatus), driven by worker
//! status reports and cancellation requests.

mod manager;

pub use manager::{ExecutionManager, ExecutionRequest};
