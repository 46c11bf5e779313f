//! Remote task dispatch.
//!
//! Workflows and environment bring-up run on remote workers. The control plane
//! only submits tasks, asks for their state and optionally blocks on their
//! completion; everything else happens out of process.

mod client;

pub use client::BrokerClient;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{ControlError, ControlResult};
use crate::state::ExecutionStatus;
use crate::store::ResourceStore;
use crate::types::{BlueprintId, DeploymentId, Execution, ExecutionId, Parameters};

/// Keyword argument carrying the [`ExecutionContext`] of a task.
pub const EXECUTION_CONTEXT_KWARG: &str = "__execution_context";

/// Identifies the execution a remote task runs for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Task identifier; equal to the execution id.
    pub task_id: String,
    /// Fully qualified task name.
    pub task_name: String,
    /// Queue the task is routed to.
    pub task_target: String,
    /// Blueprint of the deployment.
    pub blueprint_id: BlueprintId,
    /// Target deployment.
    pub deployment_id: DeploymentId,
    /// Execution the task runs for.
    pub execution_id: ExecutionId,
    /// Workflow being run.
    pub workflow_id: String,
}

impl ExecutionContext {
    /// Build the context of the task that runs `execution`.
    #[must_use]
    pub fn for_execution(
        execution: &Execution,
        task_name: impl Into<String>,
        task_target: impl Into<String>,
    ) -> Self {
        Self {
            task_id: execution.id.to_string(),
            task_name: task_name.into(),
            task_target: task_target.into(),
            blueprint_id: execution.blueprint_id.clone(),
            deployment_id: execution.deployment_id.clone(),
            execution_id: execution.id.clone(),
            workflow_id: execution.workflow_id.clone(),
        }
    }
}

/// A task to submit to the remote task system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSubmission {
    /// Task identifier, chosen by the caller.
    pub task_id: String,
    /// Fully qualified task name.
    pub task_name: String,
    /// Queue the task is routed to.
    pub target: String,
    /// Keyword arguments for the task.
    #[serde(default)]
    pub kwargs: Parameters,
}

impl TaskSubmission {
    /// Build the submission for a context, adding the context to `kwargs`.
    pub fn with_context(context: &ExecutionContext, mut kwargs: Parameters) -> ControlResult<Self> {
        let value = serde_json::to_value(context)
            .map_err(|e| ControlError::Serialisation(format!("failed to serialise context: {e}")))?;
        kwargs.insert(EXECUTION_CONTEXT_KWARG.to_owned(), value);

        Ok(Self {
            task_id: context.task_id.clone(),
            task_name: context.task_name.clone(),
            target: context.task_target.clone(),
            kwargs,
        })
    }
}

/// Handle to a submitted task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskHandle {
    /// Task identifier.
    pub task_id: String,
}

/// State of a remote task as reported by the task system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Unknown to the workers or waiting in a queue.
    #[default]
    Pending,
    /// Picked up by a worker.
    Received,
    /// Running.
    Started,
    /// Scheduled for another attempt.
    Retry,
    /// Finished successfully.
    Success,
    /// Finished with an error.
    Failure,
    /// Revoked before completion.
    Revoked,
}

impl TaskState {
    /// Get the state name as the task system spells it.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Received => "RECEIVED",
            Self::Started => "STARTED",
            Self::Retry => "RETRY",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Revoked => "REVOKED",
        }
    }

    /// Returns true if the task will not change state again.
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Revoked)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "RECEIVED" => Ok(Self::Received),
            "STARTED" => Ok(Self::Started),
            "RETRY" => Ok(Self::Retry),
            "SUCCESS" => Ok(Self::Success),
            "FAILURE" => Ok(Self::Failure),
            "REVOKED" => Ok(Self::Revoked),
            _ => Err(format!("invalid task state: {s}")),
        }
    }
}

/// Failure details of a remote task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTaskError {
    /// Exception or error type name.
    #[serde(rename = "type")]
    pub error_type: String,
    /// Error message.
    pub message: String,
}

impl fmt::Display for RemoteTaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)
    }
}

/// Trait for remote task system implementations.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Submit a task. Returns once the task is queued.
    async fn submit(&self, submission: TaskSubmission) -> ControlResult<TaskHandle>;

    /// Block until the task finishes or `timeout` elapses.
    ///
    /// Returns the task result on success. Remote failures, revocations and
    /// timeouts are reported as [`ControlError::RemoteTask`]. Status polls that
    /// fail are retried until the deadline, then reported the same way.
    async fn wait(&self, handle: &TaskHandle, timeout: Duration) -> ControlResult<Value>;

    /// Get the current state of a task.
    async fn task_state(&self, task_id: &str) -> ControlResult<TaskState>;

    /// Get the failure details of a task, if it failed.
    async fn failed_task_error(&self, task_id: &str) -> ControlResult<Option<RemoteTaskError>>;
}

/// Queue-consuming worker simulated by [`MockDispatcher`].
struct SimulatedWorker {
    store: Arc<dyn ResourceStore>,
    target: String,
}

#[derive(Default)]
struct MockTasks {
    submissions: Vec<TaskSubmission>,
    states: HashMap<String, TaskState>,
    results: HashMap<String, Value>,
    errors: HashMap<String, RemoteTaskError>,
}

/// Mock task dispatcher for testing.
///
/// Records every submission and serves scripted task states. Submitted tasks
/// stay `PENDING` unless a simulated worker is attached with
/// [`MockDispatcher::with_worker`], in which case tasks routed to the worker's
/// target run to completion immediately and their execution is reported
/// `TERMINATED` to the store.
#[derive(Default)]
pub struct MockDispatcher {
    tasks: RwLock<MockTasks>,
    worker: Option<SimulatedWorker>,
}

impl MockDispatcher {
    /// Create a dispatcher with no worker attached.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a worker that completes every task routed to `target`.
    #[must_use]
    pub fn with_worker(mut self, store: Arc<dyn ResourceStore>, target: impl Into<String>) -> Self {
        self.worker = Some(SimulatedWorker {
            store,
            target: target.into(),
        });
        self
    }

    /// All submissions so far, oldest first.
    pub fn submissions(&self) -> ControlResult<Vec<TaskSubmission>> {
        let tasks = self.read()?;
        Ok(tasks.submissions.clone())
    }

    /// Submissions routed to `target`.
    pub fn submissions_to(&self, target: &str) -> ControlResult<Vec<TaskSubmission>> {
        let tasks = self.read()?;
        Ok(tasks
            .submissions
            .iter()
            .filter(|s| s.target == target)
            .cloned()
            .collect())
    }

    /// Force the state of a task.
    pub fn set_state(&self, task_id: &str, state: TaskState) -> ControlResult<()> {
        let mut tasks = self.write()?;
        tasks.states.insert(task_id.to_owned(), state);
        Ok(())
    }

    /// Mark a task as succeeded with a result.
    pub fn succeed(&self, task_id: &str, result: Value) -> ControlResult<()> {
        let mut tasks = self.write()?;
        tasks.states.insert(task_id.to_owned(), TaskState::Success);
        tasks.results.insert(task_id.to_owned(), result);
        Ok(())
    }

    /// Mark a task as failed.
    pub fn fail(&self, task_id: &str, error: RemoteTaskError) -> ControlResult<()> {
        let mut tasks = self.write()?;
        tasks.states.insert(task_id.to_owned(), TaskState::Failure);
        tasks.errors.insert(task_id.to_owned(), error);
        Ok(())
    }

    fn read(&self) -> ControlResult<std::sync::RwLockReadGuard<'_, MockTasks>> {
        self.tasks
            .read()
            .map_err(|_| ControlError::internal("lock poisoned"))
    }

    fn write(&self) -> ControlResult<std::sync::RwLockWriteGuard<'_, MockTasks>> {
        self.tasks
            .write()
            .map_err(|_| ControlError::internal("lock poisoned"))
    }

    async fn run_on_worker(worker: &SimulatedWorker, task_id: &str) -> ControlResult<()> {
        let id = ExecutionId::new(task_id);
        let Some(execution) = worker.store.get_execution(&id).await? else {
            return Ok(());
        };

        for next in [ExecutionStatus::Started, ExecutionStatus::Terminated] {
            let current = worker
                .store
                .get_execution(&id)
                .await?
                .map_or(execution.status, |e| e.status);
            if current.can_transition_to(next) {
                worker.store.update_execution_status(&id, next, "").await?;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl TaskDispatcher for MockDispatcher {
    async fn submit(&self, submission: TaskSubmission) -> ControlResult<TaskHandle> {
        let handle = TaskHandle {
            task_id: submission.task_id.clone(),
        };
        let consumed = self
            .worker
            .as_ref()
            .filter(|w| w.target == submission.target);

        {
            let mut tasks = self.write()?;
            tasks
                .states
                .insert(handle.task_id.clone(), TaskState::Pending);
            tasks.submissions.push(submission);
        }

        if let Some(worker) = consumed {
            Self::run_on_worker(worker, &handle.task_id).await?;
            self.succeed(&handle.task_id, Value::Null)?;
        }

        Ok(handle)
    }

    async fn wait(&self, handle: &TaskHandle, timeout: Duration) -> ControlResult<Value> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let state = self.task_state(&handle.task_id).await?;
            match state {
                TaskState::Success => {
                    let tasks = self.read()?;
                    return Ok(tasks
                        .results
                        .get(&handle.task_id)
                        .cloned()
                        .unwrap_or(Value::Null));
                }
                TaskState::Failure | TaskState::Revoked => {
                    let message = self
                        .failed_task_error(&handle.task_id)
                        .await?
                        .map_or_else(|| state.to_string(), |e| e.to_string());
                    return Err(ControlError::RemoteTask {
                        task_id: handle.task_id.clone(),
                        message,
                    });
                }
                _ => {}
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(ControlError::RemoteTask {
                    task_id: handle.task_id.clone(),
                    message: format!("timed out after {}s", timeout.as_secs()),
                });
            }

            debug!(task_id = %handle.task_id, %state, "waiting for mock task");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn task_state(&self, task_id: &str) -> ControlResult<TaskState> {
        let tasks = self.read()?;
        Ok(tasks.states.get(task_id).copied().unwrap_or_default())
    }

    async fn failed_task_error(&self, task_id: &str) -> ControlResult<Option<RemoteTaskError>> {
        let tasks = self.read()?;
        Ok(tasks.errors.get(task_id).cloned())
    }
}

impl fmt::Debug for MockDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockDispatcher")
            .field("worker_target", &self.worker.as_ref().map(|w| &w.target))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::Deployment;

    fn deployment() -> Deployment {
        Deployment {
            id: DeploymentId::new("dep"),
            blueprint_id: BlueprintId::new("bp"),
            workflows: Default::default(),
            inputs: Parameters::new(),
            outputs: Parameters::new(),
            policy_types: Parameters::new(),
            policy_triggers: Parameters::new(),
            groups: Parameters::new(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    fn submission(task_id: &str, target: &str) -> TaskSubmission {
        TaskSubmission {
            task_id: task_id.to_owned(),
            task_name: "workflows.install".to_owned(),
            target: target.to_owned(),
            kwargs: Parameters::new(),
        }
    }

    #[test]
    fn task_state_roundtrip() {
        for state in [
            TaskState::Pending,
            TaskState::Started,
            TaskState::Success,
            TaskState::Failure,
            TaskState::Revoked,
        ] {
            assert_eq!(state.as_str().parse::<TaskState>().unwrap(), state);
        }
        assert_eq!("failure".parse::<TaskState>().unwrap(), TaskState::Failure);
        assert!("LOST".parse::<TaskState>().is_err());
    }

    #[test]
    fn ready_states() {
        assert!(TaskState::Success.is_ready());
        assert!(TaskState::Failure.is_ready());
        assert!(TaskState::Revoked.is_ready());
        assert!(!TaskState::Pending.is_ready());
        assert!(!TaskState::Retry.is_ready());
    }

    #[test]
    fn remote_error_wire_format() {
        let error: RemoteTaskError =
            serde_json::from_str(r#"{"type": "NonRecoverableError", "message": "boom"}"#).unwrap();
        assert_eq!(error.error_type, "NonRecoverableError");
        assert_eq!(error.to_string(), "NonRecoverableError: boom");
    }

    #[test]
    fn submission_carries_context() {
        let deployment = deployment();
        let execution = Execution::pending(
            ExecutionId::new("exec-1"),
            &deployment,
            "install",
            Parameters::new(),
        );
        let context =
            ExecutionContext::for_execution(&execution, "workflows.install", "dep_workflows");
        let kwargs = Parameters::from([("nodes".to_owned(), serde_json::json!(["web"]))]);

        let submission = TaskSubmission::with_context(&context, kwargs).unwrap();
        assert_eq!(submission.task_id, "exec-1");
        assert_eq!(submission.target, "dep_workflows");
        assert_eq!(submission.kwargs["nodes"], serde_json::json!(["web"]));
        assert_eq!(
            submission.kwargs[EXECUTION_CONTEXT_KWARG],
            serde_json::json!({
                "task_id": "exec-1",
                "task_name": "workflows.install",
                "task_target": "dep_workflows",
                "blueprint_id": "bp",
                "deployment_id": "dep",
                "execution_id": "exec-1",
                "workflow_id": "install"
            })
        );
    }

    #[tokio::test]
    async fn mock_records_submissions() {
        let dispatcher = MockDispatcher::new();
        let handle = dispatcher.submit(submission("t1", "dep_workflows")).await.unwrap();

        assert_eq!(handle.task_id, "t1");
        assert_eq!(dispatcher.submissions().unwrap().len(), 1);
        assert_eq!(dispatcher.submissions_to("management").unwrap().len(), 0);
        assert_eq!(dispatcher.task_state("t1").await.unwrap(), TaskState::Pending);
    }

    #[tokio::test]
    async fn mock_reports_scripted_failure() {
        let dispatcher = MockDispatcher::new();
        let handle = dispatcher.submit(submission("t1", "q")).await.unwrap();
        dispatcher
            .fail(
                "t1",
                RemoteTaskError {
                    error_type: "RuntimeError".to_owned(),
                    message: "worker crashed".to_owned(),
                },
            )
            .unwrap();

        let err = dispatcher
            .wait(&handle, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("worker crashed"));
    }

    #[tokio::test(start_paused = true)]
    async fn mock_wait_times_out() {
        let dispatcher = MockDispatcher::new();
        let handle = dispatcher.submit(submission("t1", "q")).await.unwrap();

        let err = dispatcher
            .wait(&handle, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::RemoteTask { .. }));
    }

    #[tokio::test]
    async fn worker_completes_executions_on_its_target() {
        let store: Arc<dyn ResourceStore> = Arc::new(MemoryStore::new());
        let deployment = deployment();
        let execution = Execution::pending(
            ExecutionId::new("t1"),
            &deployment,
            "install",
            Parameters::new(),
        );
        store.put_execution(&execution).await.unwrap();

        let dispatcher = MockDispatcher::new().with_worker(store.clone(), "management");
        let handle = dispatcher.submit(submission("t1", "management")).await.unwrap();

        dispatcher.wait(&handle, Duration::from_secs(1)).await.unwrap();
        let stored = store.get_execution(&execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Terminated);
    }
}
