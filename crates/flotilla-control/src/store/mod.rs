//! Resource storage backends.
//!
//! The orchestrator treats its store as an eventually-consistent document
//! store: single-record reads by id are authoritative, list results may lag
//! behind recent writes. An in-memory implementation is provided for testing
//! and single-process use, and a PostgreSQL document table for production.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;

use crate::error::ControlResult;
use crate::state::ExecutionStatus;
use crate::types::{
    Blueprint, BlueprintId, Deployment, DeploymentId, Execution, ExecutionId, Node, NodeInstance,
};

/// Filter criteria for list operations.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Only records belonging to this deployment.
    pub deployment_id: Option<DeploymentId>,
    /// Only records created from this blueprint.
    pub blueprint_id: Option<BlueprintId>,
    /// Fields the caller needs.
    ///
    /// Advisory only: every backend returns complete records, so callers may
    /// read any field of a listed record.
    pub include: Option<Vec<String>>,
}

impl ListFilter {
    /// Create a new empty filter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            deployment_id: None,
            blueprint_id: None,
            include: None,
        }
    }

    /// Filter by deployment.
    #[must_use]
    pub fn with_deployment(mut self, deployment_id: DeploymentId) -> Self {
        self.deployment_id = Some(deployment_id);
        self
    }

    /// Filter by blueprint.
    #[must_use]
    pub fn with_blueprint(mut self, blueprint_id: BlueprintId) -> Self {
        self.blueprint_id = Some(blueprint_id);
        self
    }

    /// Hint which fields are needed. Listed records stay complete.
    #[must_use]
    pub fn with_include<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub(crate) fn matches_deployment(&self, deployment_id: &DeploymentId) -> bool {
        self.deployment_id
            .as_ref()
            .map_or(true, |wanted| wanted == deployment_id)
    }

    pub(crate) fn matches_blueprint(&self, blueprint_id: &BlueprintId) -> bool {
        self.blueprint_id
            .as_ref()
            .map_or(true, |wanted| wanted == blueprint_id)
    }
}

/// Backend for storing blueprints, deployments, nodes, node instances and
/// executions.
///
/// `put_*` operations upsert by id. `delete_*` operations fail with
/// [`ControlError::NotFound`](crate::ControlError::NotFound) when the record
/// does not exist. List operations are not guaranteed to observe writes
/// immediately.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Store a blueprint.
    async fn put_blueprint(&self, blueprint: &Blueprint) -> ControlResult<()>;

    /// Get a blueprint by ID.
    async fn get_blueprint(&self, id: &BlueprintId) -> ControlResult<Option<Blueprint>>;

    /// List blueprints.
    async fn list_blueprints(&self, filter: &ListFilter) -> ControlResult<Vec<Blueprint>>;

    /// Delete a blueprint.
    async fn delete_blueprint(&self, id: &BlueprintId) -> ControlResult<()>;

    /// Store a deployment.
    async fn put_deployment(&self, deployment: &Deployment) -> ControlResult<()>;

    /// Get a deployment by ID.
    async fn get_deployment(&self, id: &DeploymentId) -> ControlResult<Option<Deployment>>;

    /// List deployments, optionally by blueprint.
    async fn list_deployments(&self, filter: &ListFilter) -> ControlResult<Vec<Deployment>>;

    /// Delete a deployment.
    async fn delete_deployment(&self, id: &DeploymentId) -> ControlResult<()>;

    /// Store a node.
    async fn put_node(&self, node: &Node) -> ControlResult<()>;

    /// Get a node by deployment and node ID.
    async fn get_node(&self, deployment_id: &DeploymentId, id: &str) -> ControlResult<Option<Node>>;

    /// List nodes, optionally by deployment.
    async fn list_nodes(&self, filter: &ListFilter) -> ControlResult<Vec<Node>>;

    /// Delete a node.
    async fn delete_node(&self, deployment_id: &DeploymentId, id: &str) -> ControlResult<()>;

    /// Store a node instance.
    async fn put_node_instance(&self, instance: &NodeInstance) -> ControlResult<()>;

    /// Get a node instance by ID.
    async fn get_node_instance(&self, id: &str) -> ControlResult<Option<NodeInstance>>;

    /// List node instances, optionally by deployment.
    async fn list_node_instances(&self, filter: &ListFilter) -> ControlResult<Vec<NodeInstance>>;

    /// Delete a node instance.
    async fn delete_node_instance(&self, id: &str) -> ControlResult<()>;

    /// Store an execution.
    async fn put_execution(&self, execution: &Execution) -> ControlResult<()>;

    /// Get an execution by ID.
    async fn get_execution(&self, id: &ExecutionId) -> ControlResult<Option<Execution>>;

    /// List executions, optionally by deployment, oldest first.
    async fn list_executions(&self, filter: &ListFilter) -> ControlResult<Vec<Execution>>;

    /// Delete an execution.
    async fn delete_execution(&self, id: &ExecutionId) -> ControlResult<()>;

    /// Atomically set an execution's status and error.
    ///
    /// This is a plain write; callers check transition legality first.
    async fn update_execution_status(
        &self,
        id: &ExecutionId,
        status: ExecutionStatus,
        error: &str,
    ) -> ControlResult<()>;
}
