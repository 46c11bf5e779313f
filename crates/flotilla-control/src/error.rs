//! Error types for flotilla-control.

use std::fmt;

use crate::parameters::ParameterError;
use crate::state::ExecutionStatus;

/// Result type alias using [`ControlError`].
pub type ControlResult<T> = Result<T, ControlError>;

/// Broad classification of a [`ControlError`].
///
/// Callers branch on the kind rather than on individual variants: validation
/// errors go back to the user verbatim, state conflicts need a change of
/// intent (for example passing `force`), transient errors may be retried and
/// fatal errors abort the current call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request itself is invalid.
    Validation,
    /// The request conflicts with the current state of a resource.
    StateConflict,
    /// The request may succeed if retried later.
    Transient,
    /// Unrecoverable for the current call.
    Fatal,
}

impl ErrorKind {
    /// Get the kind name as a static string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::StateConflict => "state_conflict",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors that can occur in the control plane.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    // ---------------------------------------------------------------------
    // Validation
    // ---------------------------------------------------------------------
    /// A resource was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Resource kind (e.g. "deployment").
        kind: &'static str,
        /// Requested identifier.
        id: String,
    },

    /// A resource with the same identifier already exists.
    #[error("{kind} already exists: {id}")]
    AlreadyExists {
        /// Resource kind.
        kind: &'static str,
        /// Conflicting identifier.
        id: String,
    },

    /// The workflow is not declared on the deployment.
    #[error("workflow {workflow_id} does not exist in deployment {deployment_id}")]
    UnknownWorkflow {
        /// Deployment identifier.
        deployment_id: String,
        /// Requested workflow.
        workflow_id: String,
    },

    /// A required deployment input was not supplied.
    #[error("missing required deployment input: {0}")]
    MissingRequiredInput(String),

    /// A supplied deployment input is not declared by the blueprint.
    #[error("unknown deployment input: {0}")]
    UnknownInput(String),

    /// Execution parameters failed validation.
    #[error("invalid parameters for workflow {workflow_id}: {source}")]
    InvalidParameters {
        /// Workflow being executed.
        workflow_id: String,
        /// Underlying merge failure.
        #[source]
        source: ParameterError,
    },

    /// The blueprint could not be compiled.
    #[error("failed to compile blueprint: {0}")]
    PlanCompilation(String),

    /// Deployment outputs could not be evaluated.
    #[error("failed to evaluate deployment outputs: {0}")]
    OutputsEvaluation(String),

    // ---------------------------------------------------------------------
    // State conflicts
    // ---------------------------------------------------------------------
    /// Another execution is still running for the deployment.
    #[error(
        "the following executions are currently running for deployment {deployment_id}: {}; \
         pass force to execute the workflow anyway",
        running.join(",")
    )]
    ConcurrentExecution {
        /// Deployment identifier.
        deployment_id: String,
        /// Identifiers of the running executions.
        running: Vec<String>,
    },

    /// Cancellation was requested from a status that does not allow it.
    #[error("can't {}cancel execution {execution_id} because it's in status {status}", if *force { "force-" } else { "" })]
    IllegalCancellation {
        /// Execution identifier.
        execution_id: String,
        /// Status at the time of the request.
        status: ExecutionStatus,
        /// Whether a forced cancellation was requested.
        force: bool,
    },

    /// Invalid state transition attempted.
    #[error("invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: &'static str,
        /// Attempted target state.
        to: &'static str,
    },

    /// A resource still has dependents and cannot be deleted.
    #[error("can't delete {kind} {id} - {reason}: {}", dependents.join(","))]
    DependentExists {
        /// Resource kind.
        kind: &'static str,
        /// Resource identifier.
        id: String,
        /// Why the dependents block deletion.
        reason: &'static str,
        /// Identifiers of the dependents.
        dependents: Vec<String>,
    },

    // ---------------------------------------------------------------------
    // Transient
    // ---------------------------------------------------------------------
    /// The deployment environment is still being created.
    #[error(
        "deployment environment creation is still in progress for {deployment_id}, try again in a minute"
    )]
    EnvironmentCreationInProgress {
        /// Deployment identifier.
        deployment_id: String,
    },

    // ---------------------------------------------------------------------
    // Fatal
    // ---------------------------------------------------------------------
    /// No environment creation execution exists for the deployment.
    #[error("failed to find \"create_deployment_environment\" execution for deployment {deployment_id}")]
    MissingEnvironmentExecution {
        /// Deployment identifier.
        deployment_id: String,
    },

    /// Environment creation finished with a failure.
    #[error("can't launch executions since environment creation for deployment {deployment_id} has failed: {error}")]
    EnvironmentCreationFailed {
        /// Deployment identifier.
        deployment_id: String,
        /// Error recorded on the execution.
        error: String,
    },

    /// Environment creation was cancelled.
    #[error("can't launch executions since the environment creation for deployment {deployment_id} has been cancelled [status={status}]")]
    EnvironmentCreationCancelled {
        /// Deployment identifier.
        deployment_id: String,
        /// Status of the environment execution.
        status: ExecutionStatus,
    },

    /// Environment creation never left the pending state.
    #[error(
        "can't launch executions since environment for deployment {deployment_id} hasn't been created \
         (execution status is still '{status}'); task status is {task_state}{}",
        remote_error.as_ref().map(|e| format!("; error is of type {}; error message: {}", e.error_type, e.message)).unwrap_or_default()
    )]
    EnvironmentStuck {
        /// Deployment identifier.
        deployment_id: String,
        /// Status of the environment execution.
        status: ExecutionStatus,
        /// State reported by the task system.
        task_state: String,
        /// Remote failure details, when the task system reports one.
        remote_error: Option<crate::tasks::RemoteTaskError>,
    },

    /// Environment deletion did not terminate successfully.
    #[error("failed to delete environment for deployment {deployment_id} (execution status {status})")]
    EnvironmentDeletionFailed {
        /// Deployment identifier.
        deployment_id: String,
        /// Status of the deletion execution.
        status: ExecutionStatus,
    },

    /// The store did not reflect the expected writes in time.
    #[error("timed out waiting for {what}: expected {expected}, observed {observed}")]
    ConsistencyTimeout {
        /// What was being counted.
        what: String,
        /// Expected item count.
        expected: usize,
        /// Last observed item count.
        observed: usize,
    },

    /// The remote task system reported a failure.
    #[error("remote task {task_id} failed: {message}")]
    RemoteTask {
        /// Task identifier.
        task_id: String,
        /// Failure description.
        message: String,
    },

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Task broker returned an unexpected response.
    #[error("task broker error: {0}")]
    Broker(String),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Create a not-found error.
    #[must_use]
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Create an already-exists error.
    #[must_use]
    pub fn already_exists(kind: &'static str, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind,
            id: id.into(),
        }
    }

    /// Create a task broker error.
    #[must_use]
    pub fn broker(msg: impl Into<String>) -> Self {
        Self::Broker(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Classify the error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. }
            | Self::AlreadyExists { .. }
            | Self::UnknownWorkflow { .. }
            | Self::MissingRequiredInput(_)
            | Self::UnknownInput(_)
            | Self::InvalidParameters { .. }
            | Self::PlanCompilation(_)
            | Self::OutputsEvaluation(_) => ErrorKind::Validation,

            Self::ConcurrentExecution { .. }
            | Self::IllegalCancellation { .. }
            | Self::InvalidStateTransition { .. }
            | Self::DependentExists { .. } => ErrorKind::StateConflict,

            Self::EnvironmentCreationInProgress { .. } => ErrorKind::Transient,

            Self::MissingEnvironmentExecution { .. }
            | Self::EnvironmentCreationFailed { .. }
            | Self::EnvironmentCreationCancelled { .. }
            | Self::EnvironmentStuck { .. }
            | Self::EnvironmentDeletionFailed { .. }
            | Self::ConsistencyTimeout { .. }
            | Self::RemoteTask { .. }
            | Self::Database(_)
            | Self::Http(_)
            | Self::Broker(_)
            | Self::Serialisation(_)
            | Self::Config(_)
            | Self::Internal(_) => ErrorKind::Fatal,
        }
    }

    /// Returns true if the caller may retry the same request later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_in_progress_is_retryable() {
        let err = ControlError::EnvironmentCreationInProgress {
            deployment_id: "dep".to_owned(),
        };
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.is_retryable());
    }

    #[test]
    fn illegal_cancellation_message_names_status() {
        let err = ControlError::IllegalCancellation {
            execution_id: "exec-1".to_owned(),
            status: ExecutionStatus::Terminated,
            force: true,
        };
        assert_eq!(err.kind(), ErrorKind::StateConflict);
        assert_eq!(
            err.to_string(),
            "can't force-cancel execution exec-1 because it's in status terminated"
        );
    }

    #[test]
    fn stuck_environment_embeds_remote_error() {
        let err = ControlError::EnvironmentStuck {
            deployment_id: "dep".to_owned(),
            status: ExecutionStatus::Pending,
            task_state: "FAILURE".to_owned(),
            remote_error: Some(crate::tasks::RemoteTaskError {
                error_type: "ImportError".to_owned(),
                message: "no module named plugin".to_owned(),
            }),
        };
        let message = err.to_string();
        assert!(message.contains("FAILURE"));
        assert!(message.contains("ImportError"));
        assert!(message.contains("no module named plugin"));
        assert_eq!(err.kind(), ErrorKind::Fatal);
    }

    #[test]
    fn dependents_are_listed() {
        let err = ControlError::DependentExists {
            kind: "deployment",
            id: "dep".to_owned(),
            reason: "there are live nodes for this deployment",
            dependents: vec!["web_1".to_owned(), "db_2".to_owned()],
        };
        assert!(err.to_string().ends_with("web_1,db_2"));
    }
}
