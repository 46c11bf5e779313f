//! Common test utilities for control plane integration tests.

pub mod fixtures;

use std::sync::Arc;

use flotilla_control::config::EnvironmentConfig;
use flotilla_control::{
    BlueprintId, ControlConfig, Deployment, DeploymentId, DocumentPlanCompiler, MemoryStore,
    MockDispatcher, Orchestrator, Parameters, ResourceStore,
};
use tempfile::TempDir;

/// Control plane wired over an in-memory store and a mock task dispatcher.
pub struct TestControlPlane {
    pub store: Arc<MemoryStore>,
    pub dispatcher: Arc<MockDispatcher>,
    pub orchestrator: Orchestrator,
    pub blueprints: TempDir,
}

impl TestControlPlane {
    /// Creates a control plane whose management worker completes system
    /// workflows immediately.
    pub fn new() -> Self {
        Self::build(MemoryStore::new(), true)
    }

    /// Creates a control plane with no worker attached; every task stays
    /// pending until a test reports on it.
    pub fn without_worker() -> Self {
        Self::build(MemoryStore::new(), false)
    }

    /// Creates a control plane whose store hides the latest write from lists.
    pub fn with_list_lag(calls: usize) -> Self {
        Self::build(MemoryStore::with_list_lag(calls), true)
    }

    fn build(store: MemoryStore, worker: bool) -> Self {
        let store = Arc::new(store);
        let config = ControlConfig {
            environment: EnvironmentConfig {
                verify_retry_delay_ms: 100,
                ..EnvironmentConfig::default()
            },
            ..ControlConfig::default()
        };

        let dispatcher = if worker {
            let shared: Arc<dyn ResourceStore> = store.clone();
            MockDispatcher::new().with_worker(shared, config.environment.management_target.clone())
        } else {
            MockDispatcher::new()
        };
        let dispatcher = Arc::new(dispatcher);

        let blueprints = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(
            store.clone(),
            dispatcher.clone(),
            Arc::new(DocumentPlanCompiler::with_base_dir(blueprints.path())),
            &config,
        );

        Self {
            store,
            dispatcher,
            orchestrator,
            blueprints,
        }
    }

    /// Writes a blueprint document and publishes it.
    pub async fn publish(&self, id: &str, document: &serde_json::Value) -> BlueprintId {
        let file = format!("{id}.json");
        std::fs::write(
            self.blueprints.path().join(&file),
            serde_json::to_vec_pretty(document).unwrap(),
        )
        .unwrap();

        self.orchestrator
            .deployments()
            .publish_blueprint(BlueprintId::new(id), &file)
            .await
            .unwrap()
            .id
    }

    /// Publishes the web application blueprint and deploys it.
    pub async fn deploy_web_app(&self, deployment_id: &str) -> Deployment {
        let blueprint_id = self.publish("web-app", &fixtures::web_app()).await;
        self.orchestrator
            .deployments()
            .create_deployment(
                &blueprint_id,
                DeploymentId::new(deployment_id),
                &Parameters::from([("port".to_owned(), serde_json::json!(8080))]),
            )
            .await
            .unwrap()
    }
}

impl Default for TestControlPlane {
    fn default() -> Self {
        Self::new()
    }
}
