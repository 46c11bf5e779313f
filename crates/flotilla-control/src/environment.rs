//! Deployment environment bring-up and tear-down.
//!
//! Every deployment owns a remote environment (workers, installed plugins,
//! policy engine configuration) that is created by a system task right after
//! the deployment is stored and destroyed before the deployment is deleted.
//! Each of those tasks is tracked by a synthetic [`Execution`] so its outcome
//! can be inspected like any workflow run.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::EnvironmentConfig;
use crate::error::{ControlError, ControlResult};
use crate::parameters;
use crate::plan::DeploymentPlan;
use crate::state::ExecutionStatus;
use crate::store::{ListFilter, ResourceStore};
use crate::tasks::{ExecutionContext, TaskDispatcher, TaskState, TaskSubmission};
use crate::types::{
    Deployment, DeploymentId, Execution, ExecutionId, Parameters, CREATE_ENVIRONMENT_WORKFLOW,
    DELETE_ENVIRONMENT_WORKFLOW,
};

/// Task that creates a deployment environment.
pub const CREATE_ENVIRONMENT_TASK: &str = "system_workflows.deployment_environment.create";

/// Task that deletes a deployment environment.
pub const DELETE_ENVIRONMENT_TASK: &str = "system_workflows.deployment_environment.delete";

/// Creates, deletes and checks deployment environments.
pub struct EnvironmentOrchestrator {
    store: Arc<dyn ResourceStore>,
    dispatcher: Arc<dyn TaskDispatcher>,
    config: EnvironmentConfig,
}

impl EnvironmentOrchestrator {
    /// Create a new environment orchestrator.
    pub fn new(
        store: Arc<dyn ResourceStore>,
        dispatcher: Arc<dyn TaskDispatcher>,
        config: EnvironmentConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            config,
        }
    }

    /// Record and dispatch the environment creation task.
    ///
    /// Returns as soon as the task is submitted; the remote worker reports
    /// progress on the returned execution.
    pub async fn create_environment(
        &self,
        deployment: &Deployment,
        plan: &DeploymentPlan,
    ) -> ControlResult<Execution> {
        let policy_configuration = Value::Object(
            [
                ("policy_types", &plan.policy_types),
                ("policy_triggers", &plan.policy_triggers),
                ("groups", &plan.groups),
            ]
            .into_iter()
            .map(|(key, map)| (key.to_owned(), object(map)))
            .collect(),
        );
        let kwargs = Parameters::from([
            (
                "deployment_plugins_to_install".to_owned(),
                Value::Array(plan.deployment_plugins_to_install.clone()),
            ),
            (
                "workflow_plugins_to_install".to_owned(),
                Value::Array(plan.workflow_plugins_to_install.clone()),
            ),
            ("policy_configuration".to_owned(), policy_configuration),
        ]);

        let execution = Execution::pending(
            ExecutionId::generate(),
            deployment,
            CREATE_ENVIRONMENT_WORKFLOW,
            parameters::user_visible(&kwargs),
        );
        self.store.put_execution(&execution).await?;

        let context = ExecutionContext::for_execution(
            &execution,
            CREATE_ENVIRONMENT_TASK,
            &self.config.management_target,
        );
        self.dispatcher
            .submit(TaskSubmission::with_context(&context, kwargs)?)
            .await?;

        info!(
            deployment_id = %deployment.id,
            execution_id = %execution.id,
            "dispatched environment creation"
        );

        Ok(execution)
    }

    /// Record and dispatch the environment deletion task, then block on it.
    ///
    /// Fails if the task fails or times out, or if the deletion execution is
    /// not `TERMINATED` once the task has finished.
    pub async fn delete_environment(&self, deployment: &Deployment) -> ControlResult<Execution> {
        let execution = Execution::pending(
            ExecutionId::generate(),
            deployment,
            DELETE_ENVIRONMENT_WORKFLOW,
            Parameters::new(),
        );
        self.store.put_execution(&execution).await?;

        let context = ExecutionContext::for_execution(
            &execution,
            DELETE_ENVIRONMENT_TASK,
            &self.config.management_target,
        );
        let handle = self
            .dispatcher
            .submit(TaskSubmission::with_context(&context, Parameters::new())?)
            .await?;

        info!(
            deployment_id = %deployment.id,
            execution_id = %execution.id,
            timeout_secs = self.config.deletion_timeout_secs,
            "waiting for environment deletion"
        );

        let timeout = Duration::from_secs(self.config.deletion_timeout_secs);
        if let Err(e) = self.dispatcher.wait(&handle, timeout).await {
            error!(
                deployment_id = %deployment.id,
                execution_id = %execution.id,
                error = %e,
                "environment deletion task failed"
            );
            return Err(e);
        }

        let execution = self
            .store
            .get_execution(&execution.id)
            .await?
            .ok_or_else(|| ControlError::not_found("execution", execution.id.as_str()))?;

        if execution.status != ExecutionStatus::Terminated {
            error!(
                deployment_id = %deployment.id,
                execution_id = %execution.id,
                status = %execution.status,
                "environment deletion did not terminate"
            );
            return Err(ControlError::EnvironmentDeletionFailed {
                deployment_id: deployment.id.to_string(),
                status: execution.status,
            });
        }

        info!(deployment_id = %deployment.id, "environment deleted");
        Ok(execution)
    }

    /// Check that the deployment's environment was created successfully.
    ///
    /// A `PENDING` creation execution is read a second time after the
    /// configured delay, since the store may not have caught up with the
    /// worker's status report. If it is still pending the task system is asked
    /// what happened to the task.
    pub async fn verify_environment_ready(&self, deployment_id: &DeploymentId) -> ControlResult<()> {
        let mut retried = false;

        loop {
            let execution = self.find_creation_execution(deployment_id).await?;

            match execution.status {
                ExecutionStatus::Terminated => return Ok(()),
                ExecutionStatus::Started => {
                    debug!(%deployment_id, "environment creation in progress");
                    return Err(ControlError::EnvironmentCreationInProgress {
                        deployment_id: deployment_id.to_string(),
                    });
                }
                ExecutionStatus::Failed => {
                    error!(
                        %deployment_id,
                        execution_id = %execution.id,
                        error = %execution.error,
                        "environment creation failed"
                    );
                    return Err(ControlError::EnvironmentCreationFailed {
                        deployment_id: deployment_id.to_string(),
                        error: execution.error,
                    });
                }
                status @ (ExecutionStatus::Cancelled
                | ExecutionStatus::Cancelling
                | ExecutionStatus::ForceCancelling) => {
                    error!(%deployment_id, %status, "environment creation cancelled");
                    return Err(ControlError::EnvironmentCreationCancelled {
                        deployment_id: deployment_id.to_string(),
                        status,
                    });
                }
                ExecutionStatus::Pending if !retried => {
                    warn!(
                        %deployment_id,
                        execution_id = %execution.id,
                        delay_ms = self.config.verify_retry_delay_ms,
                        "environment creation still pending, re-checking"
                    );
                    retried = true;
                    tokio::time::sleep(Duration::from_millis(self.config.verify_retry_delay_ms))
                        .await;
                }
                ExecutionStatus::Pending => return Err(self.diagnose_stuck(&execution).await?),
            }
        }
    }

    async fn find_creation_execution(&self, deployment_id: &DeploymentId) -> ControlResult<Execution> {
        let filter = ListFilter::new()
            .with_deployment(deployment_id.clone())
            .with_include(["id", "workflow_id", "created_at"]);
        let listed = self
            .store
            .list_executions(&filter)
            .await?
            .into_iter()
            .filter(|e| e.workflow_id == CREATE_ENVIRONMENT_WORKFLOW)
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let Some(listed) = listed else {
            error!(%deployment_id, "environment creation execution not found");
            return Err(ControlError::MissingEnvironmentExecution {
                deployment_id: deployment_id.to_string(),
            });
        };

        // List views may lag; the status is only trusted when read by id.
        self.store
            .get_execution(&listed.id)
            .await?
            .ok_or_else(|| ControlError::not_found("execution", listed.id.as_str()))
    }

    async fn diagnose_stuck(&self, execution: &Execution) -> ControlResult<ControlError> {
        let task_id = execution.id.as_str();
        let task_state = self.dispatcher.task_state(task_id).await?;
        let remote_error = if task_state == TaskState::Failure {
            self.dispatcher.failed_task_error(task_id).await?
        } else {
            None
        };

        error!(
            deployment_id = %execution.deployment_id,
            execution_id = %execution.id,
            %task_state,
            error_type = remote_error.as_ref().map(|e| e.error_type.as_str()),
            error_message = remote_error.as_ref().map(|e| e.message.as_str()),
            "environment creation stuck"
        );

        Ok(ControlError::EnvironmentStuck {
            deployment_id: execution.deployment_id.to_string(),
            status: execution.status,
            task_state: task_state.to_string(),
            remote_error,
        })
    }
}

fn object(map: &Parameters) -> Value {
    Value::Object(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

impl std::fmt::Debug for EnvironmentOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentOrchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::error::ErrorKind;
    use crate::store::MemoryStore;
    use crate::tasks::{MockDispatcher, RemoteTaskError, EXECUTION_CONTEXT_KWARG};
    use crate::types::BlueprintId;

    struct Fixture {
        store: Arc<MemoryStore>,
        dispatcher: Arc<MockDispatcher>,
        environments: EnvironmentOrchestrator,
        deployment: Deployment,
    }

    fn fixture_with(dispatcher: impl FnOnce(Arc<MemoryStore>) -> MockDispatcher) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Arc::new(dispatcher(store.clone()));
        let environments = EnvironmentOrchestrator::new(
            store.clone(),
            dispatcher.clone(),
            EnvironmentConfig::default(),
        );
        let deployment = Deployment {
            id: DeploymentId::new("dep"),
            blueprint_id: BlueprintId::new("bp"),
            workflows: Default::default(),
            inputs: Parameters::new(),
            outputs: Parameters::new(),
            policy_types: Parameters::new(),
            policy_triggers: Parameters::new(),
            groups: Parameters::from([("web_group".to_owned(), json!({"members": ["web"]}))]),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        Fixture {
            store,
            dispatcher,
            environments,
            deployment,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(|_| MockDispatcher::new())
    }

    fn plan(deployment: &Deployment) -> DeploymentPlan {
        DeploymentPlan {
            groups: deployment.groups.clone(),
            deployment_plugins_to_install: vec![json!({"name": "diamond"})],
            ..DeploymentPlan::default()
        }
    }

    async fn create(f: &Fixture) -> Execution {
        f.environments
            .create_environment(&f.deployment, &plan(&f.deployment))
            .await
            .unwrap()
    }

    async fn set_status(f: &Fixture, id: &ExecutionId, path: &[ExecutionStatus], error: &str) {
        for status in path {
            f.store.update_execution_status(id, *status, error).await.unwrap();
        }
    }

    #[tokio::test]
    async fn creation_records_execution_and_dispatches() {
        let f = fixture();
        let execution = create(&f).await;

        assert_eq!(execution.workflow_id, CREATE_ENVIRONMENT_WORKFLOW);
        assert_eq!(execution.status, ExecutionStatus::Pending);
        assert!(execution.parameters.keys().all(|k| !k.starts_with("__")));
        assert_eq!(
            execution.parameters["policy_configuration"]["groups"],
            json!({"web_group": {"members": ["web"]}})
        );

        let submissions = f.dispatcher.submissions_to("management").unwrap();
        assert_eq!(submissions.len(), 1);
        let submission = &submissions[0];
        assert_eq!(submission.task_id, execution.id.as_str());
        assert_eq!(submission.task_name, CREATE_ENVIRONMENT_TASK);
        assert_eq!(
            submission.kwargs[EXECUTION_CONTEXT_KWARG]["execution_id"],
            json!(execution.id.as_str())
        );
        assert_eq!(
            submission.kwargs["deployment_plugins_to_install"],
            json!([{"name": "diamond"}])
        );

        let stored = f.store.get_execution(&execution.id).await.unwrap();
        assert_eq!(stored, Some(execution));
    }

    #[tokio::test]
    async fn verify_succeeds_when_terminated() {
        let f = fixture();
        let execution = create(&f).await;
        set_status(&f, &execution.id, &[ExecutionStatus::Started, ExecutionStatus::Terminated], "").await;

        f.environments
            .verify_environment_ready(&f.deployment.id)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn verify_in_progress_is_retryable() {
        let f = fixture();
        let execution = create(&f).await;
        set_status(&f, &execution.id, &[ExecutionStatus::Started], "").await;

        let err = f
            .environments
            .verify_environment_ready(&f.deployment.id)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn verify_checks_newest_creation() {
        let f = fixture();
        let current = create(&f).await;
        set_status(&f, &current.id, &[ExecutionStatus::Started], "").await;

        let mut earlier = Execution::pending(
            ExecutionId::new("earlier-create"),
            &f.deployment,
            CREATE_ENVIRONMENT_WORKFLOW,
            Parameters::new(),
        );
        earlier.status = ExecutionStatus::Terminated;
        earlier.created_at = current.created_at - chrono::Duration::minutes(5);
        f.store.put_execution(&earlier).await.unwrap();

        let err = f
            .environments
            .verify_environment_ready(&f.deployment.id)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::EnvironmentCreationInProgress { .. }));
    }

    #[tokio::test]
    async fn verify_reports_failure_error() {
        let f = fixture();
        let execution = create(&f).await;
        set_status(
            &f,
            &execution.id,
            &[ExecutionStatus::Started, ExecutionStatus::Failed],
            "plugin installation failed",
        )
        .await;

        let err = f
            .environments
            .verify_environment_ready(&f.deployment.id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(err.to_string().contains("plugin installation failed"));
    }

    #[tokio::test]
    async fn verify_reports_cancellation() {
        let f = fixture();
        let execution = create(&f).await;
        set_status(&f, &execution.id, &[ExecutionStatus::Cancelling], "").await;

        let err = f
            .environments
            .verify_environment_ready(&f.deployment.id)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ControlError::EnvironmentCreationCancelled {
                status: ExecutionStatus::Cancelling,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn verify_without_execution_is_fatal() {
        let f = fixture();
        let err = f
            .environments
            .verify_environment_ready(&f.deployment.id)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::MissingEnvironmentExecution { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn verify_retries_pending_once() {
        let f = fixture();
        let execution = create(&f).await;

        let store = f.store.clone();
        let id = execution.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            store
                .update_execution_status(&id, ExecutionStatus::Started, "")
                .await
                .unwrap();
            store
                .update_execution_status(&id, ExecutionStatus::Terminated, "")
                .await
                .unwrap();
        });

        let start = tokio::time::Instant::now();
        f.environments
            .verify_environment_ready(&f.deployment.id)
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn verify_stuck_pending_reports_task_state() {
        let f = fixture();
        create(&f).await;

        let err = f
            .environments
            .verify_environment_ready(&f.deployment.id)
            .await
            .unwrap_err();
        match err {
            ControlError::EnvironmentStuck {
                task_state,
                remote_error,
                ..
            } => {
                assert_eq!(task_state, "PENDING");
                assert!(remote_error.is_none());
            }
            other => panic!("expected EnvironmentStuck, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn verify_stuck_pending_includes_remote_error() {
        let f = fixture();
        let execution = create(&f).await;
        f.dispatcher
            .fail(
                execution.id.as_str(),
                RemoteTaskError {
                    error_type: "ImportError".to_owned(),
                    message: "no module named diamond".to_owned(),
                },
            )
            .unwrap();

        let err = f
            .environments
            .verify_environment_ready(&f.deployment.id)
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("FAILURE"));
        assert!(message.contains("ImportError"));
        assert!(message.contains("no module named diamond"));
    }

    #[tokio::test]
    async fn deletion_waits_for_worker() {
        let f = fixture_with(|store| MockDispatcher::new().with_worker(store, "management"));

        let execution = f.environments.delete_environment(&f.deployment).await.unwrap();
        assert_eq!(execution.workflow_id, DELETE_ENVIRONMENT_WORKFLOW);
        assert_eq!(execution.status, ExecutionStatus::Terminated);

        let submissions = f.dispatcher.submissions().unwrap();
        assert_eq!(submissions[0].task_name, DELETE_ENVIRONMENT_TASK);
    }

    #[tokio::test(start_paused = true)]
    async fn deletion_times_out_without_worker() {
        let f = fixture();

        let err = f
            .environments
            .delete_environment(&f.deployment)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::RemoteTask { .. }));
    }

    #[tokio::test]
    async fn deletion_requires_terminated_status() {
        let f = fixture();
        let environments = &f.environments;

        let deleting = environments.delete_environment(&f.deployment);
        let fail_task = async {
            // Let the deletion record its execution and start waiting.
            tokio::task::yield_now().await;
            let submissions = f.dispatcher.submissions().unwrap();
            let id = ExecutionId::new(submissions[0].task_id.clone());
            set_status(&f, &id, &[ExecutionStatus::Started, ExecutionStatus::Failed], "boom").await;
            f.dispatcher.succeed(id.as_str(), Value::Null).unwrap();
        };

        let (result, ()) = tokio::join!(deleting, fail_task);
        assert!(matches!(
            result,
            Err(ControlError::EnvironmentDeletionFailed {
                status: ExecutionStatus::Failed,
                ..
            })
        ));
    }
}
