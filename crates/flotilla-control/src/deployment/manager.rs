//! Core deployment orchestration logic.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::consistency::{wait_for_count, WaitPolicy};
use crate::environment::EnvironmentOrchestrator;
use crate::error::{ControlError, ControlResult};
use crate::execution::ExecutionManager;
use crate::plan::{self, PlanCompiler, PlanDocument};
use crate::store::{ListFilter, ResourceStore};
use crate::types::{
    Blueprint, BlueprintId, Deployment, DeploymentId, Node, NodeInstance, Parameters,
};

/// Orchestrates blueprint and deployment lifecycle operations.
pub struct DeploymentManager {
    store: Arc<dyn ResourceStore>,
    compiler: Arc<dyn PlanCompiler>,
    environments: Arc<EnvironmentOrchestrator>,
    executions: Arc<ExecutionManager>,
    wait_policy: WaitPolicy,
}

impl DeploymentManager {
    /// Create a new deployment manager.
    pub fn new(
        store: Arc<dyn ResourceStore>,
        compiler: Arc<dyn PlanCompiler>,
        environments: Arc<EnvironmentOrchestrator>,
        executions: Arc<ExecutionManager>,
        wait_policy: WaitPolicy,
    ) -> Self {
        Self {
            store,
            compiler,
            environments,
            executions,
            wait_policy,
        }
    }

    /// Compile and store a blueprint.
    pub async fn publish_blueprint(
        &self,
        blueprint_id: BlueprintId,
        dsl_location: &str,
    ) -> ControlResult<Blueprint> {
        let document = self.compiler.compile(dsl_location).await.map_err(|e| {
            warn!(blueprint_id = %blueprint_id, error = %e, "blueprint compilation failed");
            ControlError::PlanCompilation(e.to_string())
        })?;

        if self.store.get_blueprint(&blueprint_id).await?.is_some() {
            return Err(ControlError::already_exists("blueprint", blueprint_id.as_str()));
        }

        let plan = serde_json::to_value(&document)
            .map_err(|e| ControlError::Serialisation(format!("failed to serialise plan: {e}")))?;
        let now = Utc::now();
        let blueprint = Blueprint {
            id: blueprint_id,
            plan,
            created_at: now,
            updated_at: now,
        };
        self.store.put_blueprint(&blueprint).await?;

        info!(blueprint_id = %blueprint.id, location = dsl_location, "blueprint published");
        Ok(blueprint)
    }

    /// Delete a blueprint no deployment refers to.
    pub async fn delete_blueprint(&self, blueprint_id: &BlueprintId) -> ControlResult<Blueprint> {
        let blueprint = self.get_blueprint(blueprint_id).await?;

        let filter = ListFilter::new()
            .with_blueprint(blueprint_id.clone())
            .with_include(["id"]);
        let deployments = self.store.list_deployments(&filter).await?;
        if !deployments.is_empty() {
            return Err(ControlError::DependentExists {
                kind: "blueprint",
                id: blueprint_id.to_string(),
                reason: "there are deployments for this blueprint",
                dependents: deployments.into_iter().map(|d| d.id.to_string()).collect(),
            });
        }

        self.store.delete_blueprint(blueprint_id).await?;
        info!(blueprint_id = %blueprint_id, "blueprint deleted");
        Ok(blueprint)
    }

    /// Get a blueprint by ID.
    pub async fn get_blueprint(&self, blueprint_id: &BlueprintId) -> ControlResult<Blueprint> {
        self.store
            .get_blueprint(blueprint_id)
            .await?
            .ok_or_else(|| ControlError::not_found("blueprint", blueprint_id.as_str()))
    }

    /// List blueprints.
    pub async fn list_blueprints(&self, filter: &ListFilter) -> ControlResult<Vec<Blueprint>> {
        self.store.list_blueprints(filter).await
    }

    /// Create a deployment from a blueprint.
    ///
    /// This orchestrates the full creation:
    /// 1. Materialise the blueprint plan with the given inputs
    /// 2. Store the deployment and its nodes
    /// 3. Dispatch environment creation (not awaited)
    /// 4. Store the node instances, uninitialised
    ///
    /// Each batch of writes is awaited until list queries observe it.
    pub async fn create_deployment(
        &self,
        blueprint_id: &BlueprintId,
        deployment_id: DeploymentId,
        inputs: &Parameters,
    ) -> ControlResult<Deployment> {
        let blueprint = self.get_blueprint(blueprint_id).await?;

        if self.store.get_deployment(&deployment_id).await?.is_some() {
            return Err(ControlError::already_exists("deployment", deployment_id.as_str()));
        }

        let document: PlanDocument = serde_json::from_value(blueprint.plan)
            .map_err(|e| ControlError::PlanCompilation(format!("stored plan is invalid: {e}")))?;
        let plan = self.compiler.materialize(&document, inputs).await?;

        let now = Utc::now();
        let deployment = Deployment {
            id: deployment_id,
            blueprint_id: blueprint.id.clone(),
            workflows: plan.workflows.clone(),
            inputs: plan.inputs.clone(),
            outputs: plan.outputs.clone(),
            policy_types: plan.policy_types.clone(),
            policy_triggers: plan.policy_triggers.clone(),
            groups: plan.groups.clone(),
            created_at: now,
            updated_at: now,
        };

        info!(
            deployment_id = %deployment.id,
            blueprint_id = %blueprint.id,
            nodes = plan.nodes.len(),
            node_instances = plan.node_instances.len(),
            "creating deployment"
        );

        self.store.put_deployment(&deployment).await?;

        for node in &plan.nodes {
            self.store
                .put_node(&node.to_node(&deployment.id, &blueprint.id))
                .await?;
        }
        let filter = ListFilter::new().with_deployment(deployment.id.clone());
        wait_for_count(
            "nodes",
            plan.nodes.len(),
            || self.store.list_nodes(&filter),
            self.wait_policy,
        )
        .await?;

        self.environments
            .create_environment(&deployment, &plan)
            .await?;

        for instance in &plan.node_instances {
            self.store
                .put_node_instance(&instance.to_node_instance(&deployment.id))
                .await?;
        }
        wait_for_count(
            "node instances",
            plan.node_instances.len(),
            || self.store.list_node_instances(&filter),
            self.wait_policy,
        )
        .await?;

        info!(deployment_id = %deployment.id, "deployment created");
        Ok(deployment)
    }

    /// Delete a deployment, its nodes, node instances and executions.
    ///
    /// Refused while any execution of the deployment is running, and unless
    /// `ignore_live_nodes` is set, while any node instance is neither
    /// uninitialised nor deleted. The deployment environment is deleted
    /// first, synchronously.
    pub async fn delete_deployment(
        &self,
        deployment_id: &DeploymentId,
        ignore_live_nodes: bool,
    ) -> ControlResult<Deployment> {
        let deployment = self.get_deployment(deployment_id).await?;

        let running = self
            .executions
            .running_executions(deployment_id, true)
            .await?;
        if !running.is_empty() {
            return Err(ControlError::DependentExists {
                kind: "deployment",
                id: deployment_id.to_string(),
                reason: "there are running executions for this deployment",
                dependents: running,
            });
        }

        let filter = ListFilter::new().with_deployment(deployment_id.clone());
        let instances = self.store.list_node_instances(&filter).await?;

        if !ignore_live_nodes {
            let live: Vec<String> = instances
                .iter()
                .filter(|i| !i.is_terminal())
                .map(|i| i.id.clone())
                .collect();
            if !live.is_empty() {
                return Err(ControlError::DependentExists {
                    kind: "deployment",
                    id: deployment_id.to_string(),
                    reason: "there are live nodes for this deployment",
                    dependents: live,
                });
            }
        } else if instances.iter().any(|i| !i.is_terminal()) {
            warn!(deployment_id = %deployment_id, "deleting deployment with live nodes");
        }

        if let Err(e) = self.environments.delete_environment(&deployment).await {
            error!(deployment_id = %deployment_id, error = %e, "deployment deletion aborted");
            return Err(e);
        }

        for instance in &instances {
            self.store.delete_node_instance(&instance.id).await?;
        }
        for node in self.store.list_nodes(&filter).await? {
            self.store.delete_node(deployment_id, &node.id).await?;
        }
        // A later deployment under the same id must not see these.
        for execution in self.store.list_executions(&filter).await? {
            self.store.delete_execution(&execution.id).await?;
        }
        self.store.delete_deployment(deployment_id).await?;

        info!(deployment_id = %deployment_id, "deployment deleted");
        Ok(deployment)
    }

    /// Get a deployment by ID.
    pub async fn get_deployment(&self, deployment_id: &DeploymentId) -> ControlResult<Deployment> {
        self.store
            .get_deployment(deployment_id)
            .await?
            .ok_or_else(|| ControlError::not_found("deployment", deployment_id.as_str()))
    }

    /// List deployments.
    pub async fn list_deployments(&self, filter: &ListFilter) -> ControlResult<Vec<Deployment>> {
        self.store.list_deployments(filter).await
    }

    /// Evaluate a deployment's outputs against its node instances.
    pub async fn evaluate_outputs(&self, deployment_id: &DeploymentId) -> ControlResult<Parameters> {
        let deployment = self.get_deployment(deployment_id).await?;

        let filter = ListFilter::new()
            .with_deployment(deployment_id.clone())
            .with_include(["id", "node_id", "runtime_properties"]);
        let instances = self.store.list_node_instances(&filter).await?;

        plan::evaluate_outputs(&deployment.outputs, &instances)
    }

    /// List nodes.
    pub async fn list_nodes(&self, filter: &ListFilter) -> ControlResult<Vec<Node>> {
        self.store.list_nodes(filter).await
    }

    /// Get a node by deployment and node ID.
    pub async fn get_node(&self, deployment_id: &DeploymentId, node_id: &str) -> ControlResult<Node> {
        self.store
            .get_node(deployment_id, node_id)
            .await?
            .ok_or_else(|| ControlError::not_found("node", node_id))
    }

    /// List node instances.
    pub async fn list_node_instances(&self, filter: &ListFilter) -> ControlResult<Vec<NodeInstance>> {
        self.store.list_node_instances(filter).await
    }

    /// Get a node instance by ID.
    pub async fn get_node_instance(&self, instance_id: &str) -> ControlResult<NodeInstance> {
        self.store
            .get_node_instance(instance_id)
            .await?
            .ok_or_else(|| ControlError::not_found("node instance", instance_id))
    }
}

impl std::fmt::Debug for DeploymentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentManager")
            .field("wait_policy", &self.wait_policy)
            .finish_non_exhaustive()
    }
}
