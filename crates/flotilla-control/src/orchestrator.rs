//! Wiring of the lifecycle managers.

use std::sync::Arc;

use tracing::info;

use crate::config::{ControlConfig, StoreBackend};
use crate::consistency::WaitPolicy;
use crate::deployment::DeploymentManager;
use crate::environment::EnvironmentOrchestrator;
use crate::error::ControlResult;
use crate::execution::ExecutionManager;
use crate::plan::{DocumentPlanCompiler, PlanCompiler};
use crate::store::{MemoryStore, PostgresStore, ResourceStore};
use crate::tasks::{BrokerClient, TaskDispatcher};

/// Entry point to the control plane.
///
/// Owns one instance of each manager, all sharing the same store and task
/// dispatcher.
pub struct Orchestrator {
    deployments: DeploymentManager,
    executions: Arc<ExecutionManager>,
    environments: Arc<EnvironmentOrchestrator>,
    store: Arc<dyn ResourceStore>,
}

impl Orchestrator {
    /// Wire the managers over the given collaborators.
    pub fn new(
        store: Arc<dyn ResourceStore>,
        dispatcher: Arc<dyn TaskDispatcher>,
        compiler: Arc<dyn PlanCompiler>,
        config: &ControlConfig,
    ) -> Self {
        let environments = Arc::new(EnvironmentOrchestrator::new(
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            config.environment.clone(),
        ));
        let executions = Arc::new(ExecutionManager::new(
            Arc::clone(&store),
            dispatcher,
            Arc::clone(&environments),
        ));
        let deployments = DeploymentManager::new(
            Arc::clone(&store),
            compiler,
            Arc::clone(&environments),
            Arc::clone(&executions),
            WaitPolicy::from(&config.consistency),
        );

        Self {
            deployments,
            executions,
            environments,
            store,
        }
    }

    /// Build an orchestrator from configuration.
    ///
    /// Connects the configured store backend and the task broker client, and
    /// compiles blueprints from local files.
    pub async fn from_config(config: &ControlConfig) -> ControlResult<Self> {
        let store: Arc<dyn ResourceStore> = match config.store.backend {
            StoreBackend::Memory => {
                info!("using in-memory store");
                Arc::new(MemoryStore::new())
            }
            StoreBackend::Postgres => {
                let store =
                    PostgresStore::new(&config.store.url, config.store.max_connections).await?;
                info!(url = %config.store.url, "connected to PostgreSQL");
                Arc::new(store)
            }
        };

        let dispatcher = BrokerClient::new(&config.broker)?;
        info!(url = %config.broker.url, "task broker client configured");

        Ok(Self::new(
            store,
            Arc::new(dispatcher),
            Arc::new(DocumentPlanCompiler::new()),
            config,
        ))
    }

    /// Blueprint and deployment operations.
    pub const fn deployments(&self) -> &DeploymentManager {
        &self.deployments
    }

    /// Workflow execution operations.
    pub fn executions(&self) -> &ExecutionManager {
        &self.executions
    }

    /// Deployment environment operations.
    pub fn environments(&self) -> &EnvironmentOrchestrator {
        &self.environments
    }

    /// The shared resource store.
    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("deployments", &self.deployments)
            .finish_non_exhaustive()
    }
}
