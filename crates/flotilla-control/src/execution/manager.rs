//! Execution state machine enforcement and workflow dispatch.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::environment::EnvironmentOrchestrator;
use crate::error::{ControlError, ControlResult};
use crate::parameters;
use crate::state::ExecutionStatus;
use crate::store::{ListFilter, ResourceStore};
use crate::tasks::{ExecutionContext, TaskDispatcher, TaskSubmission};
use crate::types::{DeploymentId, Execution, ExecutionId, Parameters};

/// Request to run a workflow against a deployment.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Target deployment.
    pub deployment_id: DeploymentId,
    /// Workflow to run.
    pub workflow_id: String,
    /// Caller-supplied parameters.
    pub parameters: Parameters,
    /// Accept parameters the workflow does not declare.
    pub allow_custom_parameters: bool,
    /// Run even if other executions are still running.
    pub force: bool,
}

impl ExecutionRequest {
    /// Create a request with no parameters.
    #[must_use]
    pub fn new(deployment_id: DeploymentId, workflow_id: impl Into<String>) -> Self {
        Self {
            deployment_id,
            workflow_id: workflow_id.into(),
            parameters: Parameters::new(),
            allow_custom_parameters: false,
            force: false,
        }
    }

    /// Set the caller-supplied parameters.
    #[must_use]
    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    /// Accept undeclared parameters.
    #[must_use]
    pub const fn allow_custom_parameters(mut self, allow: bool) -> Self {
        self.allow_custom_parameters = allow;
        self
    }

    /// Skip the running-execution check.
    #[must_use]
    pub const fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

/// Starts, cancels and tracks workflow executions.
pub struct ExecutionManager {
    store: Arc<dyn ResourceStore>,
    dispatcher: Arc<dyn TaskDispatcher>,
    environments: Arc<EnvironmentOrchestrator>,
}

impl ExecutionManager {
    /// Create a new execution manager.
    pub fn new(
        store: Arc<dyn ResourceStore>,
        dispatcher: Arc<dyn TaskDispatcher>,
        environments: Arc<EnvironmentOrchestrator>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            environments,
        }
    }

    /// Start a workflow execution.
    ///
    /// 1. Resolve the deployment and its workflow
    /// 2. Verify the deployment environment was created
    /// 3. Unless forced, refuse while other executions are running
    /// 4. Merge and validate parameters
    /// 5. Persist a `PENDING` execution and dispatch the workflow
    pub async fn start_execution(&self, request: ExecutionRequest) -> ControlResult<Execution> {
        let deployment = self
            .store
            .get_deployment(&request.deployment_id)
            .await?
            .ok_or_else(|| ControlError::not_found("deployment", request.deployment_id.as_str()))?;

        let workflow = deployment
            .workflows
            .get(&request.workflow_id)
            .ok_or_else(|| ControlError::UnknownWorkflow {
                deployment_id: deployment.id.to_string(),
                workflow_id: request.workflow_id.clone(),
            })?;

        self.environments
            .verify_environment_ready(&deployment.id)
            .await?;

        if !request.force {
            let running = self.running_executions(&deployment.id, false).await?;
            if !running.is_empty() {
                warn!(
                    deployment_id = %deployment.id,
                    running = ?running,
                    "refusing to start concurrent execution"
                );
                return Err(ControlError::ConcurrentExecution {
                    deployment_id: deployment.id.to_string(),
                    running,
                });
            }
        }

        let merged = parameters::merge(
            &workflow.parameters,
            &request.parameters,
            request.allow_custom_parameters,
        )
        .map_err(|source| ControlError::InvalidParameters {
            workflow_id: request.workflow_id.clone(),
            source,
        })?;

        let execution = Execution::pending(
            ExecutionId::generate(),
            &deployment,
            request.workflow_id.as_str(),
            parameters::user_visible(&merged),
        );
        self.store.put_execution(&execution).await?;

        let context = ExecutionContext::for_execution(
            &execution,
            workflow.operation.as_str(),
            format!("{}_workflows", deployment.id),
        );
        let dispatched = match TaskSubmission::with_context(&context, merged) {
            Ok(submission) => self.dispatcher.submit(submission).await,
            Err(e) => Err(e),
        };

        if let Err(e) = dispatched {
            error!(
                deployment_id = %deployment.id,
                execution_id = %execution.id,
                error = %e,
                "failed to dispatch workflow"
            );
            // Nothing will ever pick the execution up.
            if let Err(cleanup) = self.store.delete_execution(&execution.id).await {
                warn!(execution_id = %execution.id, error = %cleanup, "failed to remove undispatched execution");
            }
            return Err(e);
        }

        info!(
            deployment_id = %deployment.id,
            execution_id = %execution.id,
            workflow_id = %execution.workflow_id,
            force = request.force,
            "execution started"
        );

        Ok(execution)
    }

    /// Request cancellation of an execution.
    ///
    /// Graceful cancellation is allowed from `PENDING` and `STARTED`; forced
    /// cancellation additionally escalates a `CANCELLING` execution. The
    /// execution is not stopped when this returns, only marked.
    pub async fn cancel_execution(
        &self,
        execution_id: &ExecutionId,
        force: bool,
    ) -> ControlResult<Execution> {
        let execution = self.get_execution(execution_id).await?;

        if !execution.status.can_cancel(force) {
            return Err(ControlError::IllegalCancellation {
                execution_id: execution_id.to_string(),
                status: execution.status,
                force,
            });
        }

        let target = ExecutionStatus::cancellation_target(force);
        let execution = self.update_execution_status(execution_id, target, "").await?;

        info!(execution_id = %execution_id, status = %execution.status, "cancellation requested");
        Ok(execution)
    }

    /// Record a status reported for an execution.
    ///
    /// Reporting the current status again is a no-op. Any other status must
    /// be reachable from the current one.
    pub async fn update_execution_status(
        &self,
        execution_id: &ExecutionId,
        status: ExecutionStatus,
        error: &str,
    ) -> ControlResult<Execution> {
        let current = self.get_execution(execution_id).await?;

        if current.status == status {
            debug!(execution_id = %execution_id, %status, "status unchanged");
            return Ok(current);
        }

        if !current.status.can_transition_to(status) {
            return Err(ControlError::InvalidStateTransition {
                from: current.status.as_str(),
                to: status.as_str(),
            });
        }

        self.store
            .update_execution_status(execution_id, status, error)
            .await?;

        debug!(
            execution_id = %execution_id,
            from = %current.status,
            to = %status,
            "execution status updated"
        );

        self.get_execution(execution_id).await
    }

    /// Get an execution by ID.
    pub async fn get_execution(&self, execution_id: &ExecutionId) -> ControlResult<Execution> {
        self.store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| ControlError::not_found("execution", execution_id.as_str()))
    }

    /// List executions, oldest first.
    pub async fn list_executions(&self, filter: &ListFilter) -> ControlResult<Vec<Execution>> {
        self.store.list_executions(filter).await
    }

    /// IDs of executions of a deployment that have not ended.
    ///
    /// Environment executions are only counted with `include_system`. Each
    /// listed execution is re-read by id since list views may be stale.
    pub(crate) async fn running_executions(
        &self,
        deployment_id: &DeploymentId,
        include_system: bool,
    ) -> ControlResult<Vec<String>> {
        let filter = ListFilter::new()
            .with_deployment(deployment_id.clone())
            .with_include(["id", "status", "workflow_id"]);

        let mut running = Vec::new();
        for listed in self.store.list_executions(&filter).await? {
            if listed.is_system_workflow() && !include_system {
                continue;
            }
            let status = self
                .store
                .get_execution(&listed.id)
                .await?
                .map_or(listed.status, |e| e.status);
            if !status.is_end() {
                running.push(listed.id.to_string());
            }
        }

        Ok(running)
    }
}

impl std::fmt::Debug for ExecutionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionManager").finish_non_exhaustive()
    }
}
