//! Blueprint plans and their materialisation into deployments.
//!
//! A [`PlanDocument`] is the parsed, input-independent form of a blueprint. A
//! [`PlanCompiler`] turns a blueprint location into a plan document and later
//! materialises that plan with concrete inputs into a [`DeploymentPlan`]: the
//! node templates, the expanded node instances and everything the deployment
//! record carries.

mod document;
mod outputs;

pub use document::{materialize_document, DocumentPlanCompiler};
pub use outputs::evaluate_outputs;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ControlError;
use crate::types::{
    BlueprintId, DeploymentId, InstanceRelationship, Node, NodeInstance, ParameterSpec, Parameters,
    Relationship, WorkflowDefinition, NODE_STATE_UNINITIALIZED,
};

/// Errors raised while compiling or materialising a plan.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PlanError {
    /// Declared inputs without a default were not supplied.
    #[error("required inputs {0} were not specified")]
    MissingRequiredInput(String),

    /// Supplied inputs are not declared by the plan.
    #[error("unknown inputs {0} specified")]
    UnknownInput(String),

    /// The plan document is malformed.
    #[error("invalid plan: {0}")]
    Invalid(String),

    /// The plan document could not be read.
    #[error("failed to read plan from {location}: {message}")]
    Io {
        /// Location that was read.
        location: String,
        /// Underlying error message.
        message: String,
    },
}

impl From<PlanError> for ControlError {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::MissingRequiredInput(names) => Self::MissingRequiredInput(names),
            PlanError::UnknownInput(names) => Self::UnknownInput(names),
            other @ (PlanError::Invalid(_) | PlanError::Io { .. }) => {
                Self::PlanCompilation(other.to_string())
            }
        }
    }
}

/// How many instances of a node to deploy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstancesSpec {
    /// Instances per containing host instance.
    #[serde(default = "default_deploy")]
    pub deploy: u32,
}

const fn default_deploy() -> u32 {
    1
}

impl Default for InstancesSpec {
    fn default() -> Self {
        Self {
            deploy: default_deploy(),
        }
    }
}

/// A node template as declared in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    /// Node name.
    pub id: String,
    /// Node type.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Type hierarchy, most generic first.
    #[serde(default)]
    pub type_hierarchy: Vec<String>,
    /// Containing node.
    #[serde(default)]
    pub host_id: Option<String>,
    /// Node properties. May reference inputs with `{"get_input": name}`.
    #[serde(default)]
    pub properties: Parameters,
    /// Operation mapping.
    #[serde(default)]
    pub operations: Parameters,
    /// Plugins used by the node.
    #[serde(default)]
    pub plugins: Vec<Value>,
    /// Plugins to install on the node's agent.
    #[serde(default)]
    pub plugins_to_install: Vec<Value>,
    /// Outgoing relationships.
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    /// Instance count.
    #[serde(default)]
    pub instances: InstancesSpec,
}

impl PlanNode {
    /// Scope the template to a deployment.
    #[must_use]
    pub fn to_node(&self, deployment_id: &DeploymentId, blueprint_id: &BlueprintId) -> Node {
        Node {
            id: self.id.clone(),
            deployment_id: deployment_id.clone(),
            blueprint_id: blueprint_id.clone(),
            node_type: self.node_type.clone(),
            type_hierarchy: self.type_hierarchy.clone(),
            number_of_instances: self.instances.deploy,
            host_id: self.host_id.clone(),
            properties: self.properties.clone(),
            operations: self.operations.clone(),
            plugins: self.plugins.clone(),
            plugins_to_install: self.plugins_to_install.clone(),
            relationships: self.relationships.clone(),
        }
    }
}

/// Parsed, input-independent blueprint plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanDocument {
    /// Declared deployment inputs.
    #[serde(default)]
    pub inputs: BTreeMap<String, ParameterSpec>,
    /// Node templates.
    #[serde(default)]
    pub nodes: Vec<PlanNode>,
    /// Declared workflows.
    #[serde(default)]
    pub workflows: BTreeMap<String, WorkflowDefinition>,
    /// Output definitions.
    #[serde(default)]
    pub outputs: Parameters,
    /// Policy types.
    #[serde(default)]
    pub policy_types: Parameters,
    /// Policy triggers.
    #[serde(default)]
    pub policy_triggers: Parameters,
    /// Node groups.
    #[serde(default)]
    pub groups: Parameters,
    /// Plugins installed on the deployment's management worker.
    #[serde(default)]
    pub deployment_plugins_to_install: Vec<Value>,
    /// Plugins providing workflows.
    #[serde(default)]
    pub workflow_plugins_to_install: Vec<Value>,
}

/// A node instance produced by materialisation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedInstance {
    /// Instance identifier.
    pub id: String,
    /// Node this is an instance of.
    pub node_id: String,
    /// Host instance.
    #[serde(default)]
    pub host_id: Option<String>,
    /// Outgoing instance relationships.
    #[serde(default)]
    pub relationships: Vec<InstanceRelationship>,
}

impl PlannedInstance {
    /// Create the stored, uninitialised instance.
    #[must_use]
    pub fn to_node_instance(&self, deployment_id: &DeploymentId) -> NodeInstance {
        NodeInstance {
            id: self.id.clone(),
            node_id: self.node_id.clone(),
            deployment_id: deployment_id.clone(),
            host_id: self.host_id.clone(),
            relationships: self.relationships.clone(),
            state: NODE_STATE_UNINITIALIZED.to_owned(),
            runtime_properties: Parameters::new(),
            version: None,
        }
    }
}

/// A plan materialised with concrete inputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    /// Resolved inputs, defaults applied.
    pub inputs: Parameters,
    /// Node templates with input references resolved.
    pub nodes: Vec<PlanNode>,
    /// Expanded node instances.
    pub node_instances: Vec<PlannedInstance>,
    /// Declared workflows.
    pub workflows: BTreeMap<String, WorkflowDefinition>,
    /// Output definitions with input references resolved.
    pub outputs: Parameters,
    /// Policy types.
    pub policy_types: Parameters,
    /// Policy triggers.
    pub policy_triggers: Parameters,
    /// Node groups.
    pub groups: Parameters,
    /// Plugins installed on the deployment's management worker.
    pub deployment_plugins_to_install: Vec<Value>,
    /// Plugins providing workflows.
    pub workflow_plugins_to_install: Vec<Value>,
}

/// Trait for blueprint compilers.
#[async_trait]
pub trait PlanCompiler: Send + Sync {
    /// Parse the blueprint at `dsl_location` into a plan document.
    async fn compile(&self, dsl_location: &str) -> Result<PlanDocument, PlanError>;

    /// Materialise a plan with concrete deployment inputs.
    async fn materialize(
        &self,
        plan: &PlanDocument,
        inputs: &Parameters,
    ) -> Result<DeploymentPlan, PlanError>;
}
