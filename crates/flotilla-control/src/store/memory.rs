//! In-memory resource store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;

use crate::error::{ControlError, ControlResult};
use crate::state::ExecutionStatus;
use crate::types::{
    Blueprint, BlueprintId, Deployment, DeploymentId, Execution, ExecutionId, Node, NodeInstance,
};

use super::{ListFilter, ResourceStore};

/// Identifies the most recent write for simulated list lag.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RecordKey {
    Blueprint(String),
    Deployment(String),
    Node(String, String),
    NodeInstance(String),
    Execution(String),
}

/// In-memory resource store.
///
/// Data is lost when the process exits. With [`MemoryStore::with_list_lag`]
/// the store imitates an eventually-consistent backend: list calls made
/// shortly after a write do not return the written record yet, while reads by
/// id always do.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blueprints: RwLock<BTreeMap<String, Blueprint>>,
    deployments: RwLock<BTreeMap<String, Deployment>>,
    nodes: RwLock<BTreeMap<(String, String), Node>>,
    node_instances: RwLock<BTreeMap<String, NodeInstance>>,
    executions: RwLock<BTreeMap<String, Execution>>,
    list_lag: usize,
    lag_remaining: AtomicUsize,
    last_write: Mutex<Option<RecordKey>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Hide the most recent write from the next `calls` list operations.
    #[must_use]
    pub fn with_list_lag(calls: usize) -> Self {
        Self {
            list_lag: calls,
            ..Self::default()
        }
    }

    fn record_write(&self, key: RecordKey) -> ControlResult<()> {
        if self.list_lag == 0 {
            return Ok(());
        }
        let mut last = self
            .last_write
            .lock()
            .map_err(|_| ControlError::internal("lock poisoned"))?;
        *last = Some(key);
        self.lag_remaining.store(self.list_lag, Ordering::SeqCst);
        Ok(())
    }

    /// Returns the key hidden from the current list call, if any.
    fn lagging_key(&self) -> ControlResult<Option<RecordKey>> {
        let decremented = self
            .lag_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if decremented.is_err() {
            return Ok(None);
        }
        let last = self
            .last_write
            .lock()
            .map_err(|_| ControlError::internal("lock poisoned"))?;
        Ok(last.clone())
    }
}

fn poisoned<T>(_: T) -> ControlError {
    ControlError::internal("lock poisoned")
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn put_blueprint(&self, blueprint: &Blueprint) -> ControlResult<()> {
        let key = blueprint.id.as_str().to_owned();
        self.blueprints
            .write()
            .map_err(poisoned)?
            .insert(key.clone(), blueprint.clone());
        self.record_write(RecordKey::Blueprint(key))
    }

    async fn get_blueprint(&self, id: &BlueprintId) -> ControlResult<Option<Blueprint>> {
        Ok(self.blueprints.read().map_err(poisoned)?.get(id.as_str()).cloned())
    }

    async fn list_blueprints(&self, _filter: &ListFilter) -> ControlResult<Vec<Blueprint>> {
        let hidden = self.lagging_key()?;
        let blueprints = self.blueprints.read().map_err(poisoned)?;
        Ok(blueprints
            .iter()
            .filter(|(k, _)| hidden != Some(RecordKey::Blueprint((*k).clone())))
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn delete_blueprint(&self, id: &BlueprintId) -> ControlResult<()> {
        self.blueprints
            .write()
            .map_err(poisoned)?
            .remove(id.as_str())
            .map(drop)
            .ok_or_else(|| ControlError::not_found("blueprint", id.as_str()))
    }

    async fn put_deployment(&self, deployment: &Deployment) -> ControlResult<()> {
        let key = deployment.id.as_str().to_owned();
        self.deployments
            .write()
            .map_err(poisoned)?
            .insert(key.clone(), deployment.clone());
        self.record_write(RecordKey::Deployment(key))
    }

    async fn get_deployment(&self, id: &DeploymentId) -> ControlResult<Option<Deployment>> {
        Ok(self.deployments.read().map_err(poisoned)?.get(id.as_str()).cloned())
    }

    async fn list_deployments(&self, filter: &ListFilter) -> ControlResult<Vec<Deployment>> {
        let hidden = self.lagging_key()?;
        let deployments = self.deployments.read().map_err(poisoned)?;
        Ok(deployments
            .iter()
            .filter(|(k, _)| hidden != Some(RecordKey::Deployment((*k).clone())))
            .map(|(_, v)| v)
            .filter(|d| filter.matches_blueprint(&d.blueprint_id))
            .cloned()
            .collect())
    }

    async fn delete_deployment(&self, id: &DeploymentId) -> ControlResult<()> {
        self.deployments
            .write()
            .map_err(poisoned)?
            .remove(id.as_str())
            .map(drop)
            .ok_or_else(|| ControlError::not_found("deployment", id.as_str()))
    }

    async fn put_node(&self, node: &Node) -> ControlResult<()> {
        let key = (node.deployment_id.as_str().to_owned(), node.id.clone());
        self.nodes
            .write()
            .map_err(poisoned)?
            .insert(key.clone(), node.clone());
        self.record_write(RecordKey::Node(key.0, key.1))
    }

    async fn get_node(&self, deployment_id: &DeploymentId, id: &str) -> ControlResult<Option<Node>> {
        let key = (deployment_id.as_str().to_owned(), id.to_owned());
        Ok(self.nodes.read().map_err(poisoned)?.get(&key).cloned())
    }

    async fn list_nodes(&self, filter: &ListFilter) -> ControlResult<Vec<Node>> {
        let hidden = self.lagging_key()?;
        let nodes = self.nodes.read().map_err(poisoned)?;
        Ok(nodes
            .iter()
            .filter(|((dep, id), _)| hidden != Some(RecordKey::Node(dep.clone(), id.clone())))
            .map(|(_, v)| v)
            .filter(|n| filter.matches_deployment(&n.deployment_id))
            .cloned()
            .collect())
    }

    async fn delete_node(&self, deployment_id: &DeploymentId, id: &str) -> ControlResult<()> {
        let key = (deployment_id.as_str().to_owned(), id.to_owned());
        self.nodes
            .write()
            .map_err(poisoned)?
            .remove(&key)
            .map(drop)
            .ok_or_else(|| ControlError::not_found("node", id))
    }

    async fn put_node_instance(&self, instance: &NodeInstance) -> ControlResult<()> {
        let key = instance.id.clone();
        self.node_instances
            .write()
            .map_err(poisoned)?
            .insert(key.clone(), instance.clone());
        self.record_write(RecordKey::NodeInstance(key))
    }

    async fn get_node_instance(&self, id: &str) -> ControlResult<Option<NodeInstance>> {
        Ok(self.node_instances.read().map_err(poisoned)?.get(id).cloned())
    }

    async fn list_node_instances(&self, filter: &ListFilter) -> ControlResult<Vec<NodeInstance>> {
        let hidden = self.lagging_key()?;
        let instances = self.node_instances.read().map_err(poisoned)?;
        Ok(instances
            .iter()
            .filter(|(k, _)| hidden != Some(RecordKey::NodeInstance((*k).clone())))
            .map(|(_, v)| v)
            .filter(|i| filter.matches_deployment(&i.deployment_id))
            .cloned()
            .collect())
    }

    async fn delete_node_instance(&self, id: &str) -> ControlResult<()> {
        self.node_instances
            .write()
            .map_err(poisoned)?
            .remove(id)
            .map(drop)
            .ok_or_else(|| ControlError::not_found("node instance", id))
    }

    async fn put_execution(&self, execution: &Execution) -> ControlResult<()> {
        let key = execution.id.as_str().to_owned();
        self.executions
            .write()
            .map_err(poisoned)?
            .insert(key.clone(), execution.clone());
        self.record_write(RecordKey::Execution(key))
    }

    async fn get_execution(&self, id: &ExecutionId) -> ControlResult<Option<Execution>> {
        Ok(self.executions.read().map_err(poisoned)?.get(id.as_str()).cloned())
    }

    async fn list_executions(&self, filter: &ListFilter) -> ControlResult<Vec<Execution>> {
        let hidden = self.lagging_key()?;
        let executions = self.executions.read().map_err(poisoned)?;
        let mut results: Vec<_> = executions
            .iter()
            .filter(|(k, _)| hidden != Some(RecordKey::Execution((*k).clone())))
            .map(|(_, v)| v)
            .filter(|e| filter.matches_deployment(&e.deployment_id))
            .cloned()
            .collect();
        results.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(results)
    }

    async fn delete_execution(&self, id: &ExecutionId) -> ControlResult<()> {
        self.executions
            .write()
            .map_err(poisoned)?
            .remove(id.as_str())
            .map(drop)
            .ok_or_else(|| ControlError::not_found("execution", id.as_str()))
    }

    async fn update_execution_status(
        &self,
        id: &ExecutionId,
        status: ExecutionStatus,
        error: &str,
    ) -> ControlResult<()> {
        let mut executions = self.executions.write().map_err(poisoned)?;
        let execution = executions
            .get_mut(id.as_str())
            .ok_or_else(|| ControlError::not_found("execution", id.as_str()))?;

        execution.status = status;
        error.clone_into(&mut execution.error);
        Ok(())
    }
}
