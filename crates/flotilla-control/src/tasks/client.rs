//! HTTP client for the task broker API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::error::{ControlError, ControlResult};

use super::{RemoteTaskError, TaskDispatcher, TaskHandle, TaskState, TaskSubmission};

/// Task status response from the broker API.
#[derive(Debug, Deserialize)]
struct TaskStatusResponse {
    state: TaskState,
    #[serde(default)]
    result: Option<Value>,
}

/// HTTP client for submitting and tracking remote tasks.
#[derive(Debug, Clone)]
pub struct BrokerClient {
    client: Client,
    base_url: String,
    poll_interval: Duration,
}

impl BrokerClient {
    /// Create a new broker client from configuration.
    pub fn new(config: &BrokerConfig) -> ControlResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(ControlError::Http)?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_owned(),
            poll_interval: Duration::from_millis(config.result_poll_interval_ms),
        })
    }

    /// Create a new broker client with a custom base URL.
    pub fn with_url(url: impl Into<String>) -> ControlResult<Self> {
        let config = BrokerConfig {
            url: url.into(),
            ..BrokerConfig::default()
        };
        Self::new(&config)
    }

    async fn status(&self, task_id: &str) -> ControlResult<TaskStatusResponse> {
        let url = format!("{}/tasks/{}", self.base_url, task_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(ControlError::Http)?;

        match response.status() {
            StatusCode::OK => response.json().await.map_err(ControlError::Http),
            // Unknown ids are reported as pending, like the workers do.
            StatusCode::NOT_FOUND => Ok(TaskStatusResponse {
                state: TaskState::Pending,
                result: None,
            }),
            status => Err(ControlError::broker(format!(
                "failed to get task {task_id}: {status}"
            ))),
        }
    }
}

#[async_trait]
impl TaskDispatcher for BrokerClient {
    async fn submit(&self, submission: TaskSubmission) -> ControlResult<TaskHandle> {
        let url = format!("{}/tasks", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&submission)
            .send()
            .await
            .map_err(ControlError::Http)?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::ACCEPTED => {
                info!(
                    task_id = %submission.task_id,
                    task_name = %submission.task_name,
                    target = %submission.target,
                    "submitted task"
                );
                Ok(TaskHandle {
                    task_id: submission.task_id,
                })
            }
            status => Err(ControlError::broker(format!(
                "failed to submit task {}: {status}",
                submission.task_id
            ))),
        }
    }

    async fn wait(&self, handle: &TaskHandle, timeout: Duration) -> ControlResult<Value> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let poll_error = match self.status(&handle.task_id).await {
                Ok(status) => match status.state {
                    TaskState::Success => return Ok(status.result.unwrap_or(Value::Null)),
                    TaskState::Failure | TaskState::Revoked => {
                        let message = match self.failed_task_error(&handle.task_id).await {
                            Ok(Some(e)) => e.to_string(),
                            Ok(None) => status.state.to_string(),
                            Err(e) => {
                                warn!(
                                    task_id = %handle.task_id,
                                    error = %e,
                                    "failed to fetch task error"
                                );
                                status.state.to_string()
                            }
                        };
                        return Err(ControlError::RemoteTask {
                            task_id: handle.task_id.clone(),
                            message,
                        });
                    }
                    state => {
                        debug!(task_id = %handle.task_id, %state, "task not ready");
                        None
                    }
                },
                Err(e) => {
                    warn!(task_id = %handle.task_id, error = %e, "failed to poll task status");
                    Some(e)
                }
            };

            if tokio::time::Instant::now() >= deadline {
                let message = match poll_error {
                    Some(e) => format!("failed to poll task status: {e}"),
                    None => format!("timed out after {}s", timeout.as_secs()),
                };
                return Err(ControlError::RemoteTask {
                    task_id: handle.task_id.clone(),
                    message,
                });
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn task_state(&self, task_id: &str) -> ControlResult<TaskState> {
        self.status(task_id).await.map(|s| s.state)
    }

    async fn failed_task_error(&self, task_id: &str) -> ControlResult<Option<RemoteTaskError>> {
        let url = format!("{}/tasks/{}/error", self.base_url, task_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(ControlError::Http)?;

        match response.status() {
            StatusCode::OK => response.json().await.map(Some).map_err(ControlError::Http),
            StatusCode::NOT_FOUND | StatusCode::NO_CONTENT => Ok(None),
            status => Err(ControlError::broker(format!(
                "failed to get error for task {task_id}: {status}"
            ))),
        }
    }
}
