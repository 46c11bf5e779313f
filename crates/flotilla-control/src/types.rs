//! Core types for flotilla-control.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::state::ExecutionStatus;

/// Workflow id of the synthetic execution that creates a deployment environment.
pub const CREATE_ENVIRONMENT_WORKFLOW: &str = "create_deployment_environment";

/// Workflow id of the synthetic execution that deletes a deployment environment.
pub const DELETE_ENVIRONMENT_WORKFLOW: &str = "delete_deployment_environment";

/// Node instance state before any operation ran.
pub const NODE_STATE_UNINITIALIZED: &str = "uninitialized";

/// Node instance state after the instance was torn down.
pub const NODE_STATE_DELETED: &str = "deleted";

/// Free-form parameter or property map.
pub type Parameters = BTreeMap<String, Value>;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create an ID from an existing string.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the ID as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self::new(id)
            }
        }
    };
}

string_id!(
    /// Unique identifier for a blueprint.
    BlueprintId
);

string_id!(
    /// Unique identifier for a deployment.
    DeploymentId
);

string_id!(
    /// Unique identifier for an execution.
    ExecutionId
);

impl ExecutionId {
    /// Generate a new unique execution ID using ULID.
    ///
    /// The same value doubles as the remote task id of the execution.
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new().to_string().to_lowercase())
    }
}

/// A compiled, immutable topology plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    /// Blueprint identifier.
    pub id: BlueprintId,
    /// Parsed plan document.
    pub plan: Value,
    /// When the blueprint was published.
    pub created_at: DateTime<Utc>,
    /// Equal to `created_at`; blueprints are never updated.
    pub updated_at: DateTime<Utc>,
}

/// Declared workflow parameter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Default value. `None` means the parameter is mandatory; an explicit
    /// `null` default is `Some(Value::Null)`.
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub default: Option<Value>,
    /// Human readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ParameterSpec {
    /// A parameter that must be supplied by the caller.
    #[must_use]
    pub const fn mandatory() -> Self {
        Self {
            default: None,
            description: None,
        }
    }

    /// A parameter with a default value.
    #[must_use]
    pub fn with_default(default: impl Into<Value>) -> Self {
        Self {
            default: Some(default.into()),
            description: None,
        }
    }

    /// Check if the caller must supply this parameter.
    #[must_use]
    pub const fn is_mandatory(&self) -> bool {
        self.default.is_none()
    }
}

/// Keeps a present `null` distinct from a missing key.
fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// A workflow declared by a deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Remote task implementing the workflow.
    pub operation: String,
    /// Plugin providing the operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    /// Declared parameters.
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterSpec>,
}

/// A materialised topology instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    /// Deployment identifier.
    pub id: DeploymentId,
    /// Blueprint the deployment was created from.
    pub blueprint_id: BlueprintId,
    /// Workflows that may be executed.
    #[serde(default)]
    pub workflows: BTreeMap<String, WorkflowDefinition>,
    /// Resolved input values.
    #[serde(default)]
    pub inputs: Parameters,
    /// Output definitions, evaluated on demand.
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
    /// When the deployment was created.
    pub created_at: DateTime<Utc>,
    /// Equal to `created_at`; deployments are never updated.
    pub updated_at: DateTime<Utc>,
}

/// A relationship from one node (or instance) to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    /// Target node or node instance id.
    pub target_id: String,
    /// Relationship type.
    #[serde(rename = "type")]
    pub relationship_type: String,
    /// Type hierarchy, most generic first.
    #[serde(default)]
    pub type_hierarchy: Vec<String>,
    /// Relationship properties.
    #[serde(default)]
    pub properties: Parameters,
    /// Operations run on the source side.
    #[serde(default)]
    pub source_operations: Parameters,
    /// Operations run on the target side.
    #[serde(default)]
    pub target_operations: Parameters,
}

/// A topology node template scoped to one deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Node name, unique within the deployment.
    pub id: String,
    /// Owning deployment.
    pub deployment_id: DeploymentId,
    /// Blueprint the node was declared in.
    pub blueprint_id: BlueprintId,
    /// Node type.
    #[serde(rename = "type")]
    pub node_type: String,
    /// Type hierarchy, most generic first.
    #[serde(default)]
    pub type_hierarchy: Vec<String>,
    /// Number of instances deployed.
    pub number_of_instances: u32,
    /// Host node, if the node is contained in one.
    #[serde(default)]
    pub host_id: Option<String>,
    /// Node properties.
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
}

/// A relationship between two node instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRelationship {
    /// Target node instance.
    pub target_id: String,
    /// Target node name.
    pub target_name: String,
    /// Relationship type.
    #[serde(rename = "type")]
    pub relationship_type: String,
}

/// One runtime instance of a [`Node`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInstance {
    /// Instance identifier.
    pub id: String,
    /// Node this is an instance of.
    pub node_id: String,
    /// Owning deployment.
    pub deployment_id: DeploymentId,
    /// Host instance, if contained in one.
    #[serde(default)]
    pub host_id: Option<String>,
    /// Outgoing relationships.
    #[serde(default)]
    pub relationships: Vec<InstanceRelationship>,
    /// Lifecycle state (`uninitialized`, `started`, `deleted`, ...).
    pub state: String,
    /// Properties written by operations at runtime.
    #[serde(default)]
    pub runtime_properties: Parameters,
    /// Optimistic concurrency version.
    #[serde(default)]
    pub version: Option<u64>,
}

impl NodeInstance {
    /// Check if the instance holds no live infrastructure.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state == NODE_STATE_UNINITIALIZED || self.state == NODE_STATE_DELETED
    }
}

/// One run of a named workflow against a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// Execution identifier (also the remote task id).
    pub id: ExecutionId,
    /// Target deployment.
    pub deployment_id: DeploymentId,
    /// Blueprint of the target deployment.
    pub blueprint_id: BlueprintId,
    /// Workflow being run.
    pub workflow_id: String,
    /// Current status.
    pub status: ExecutionStatus,
    /// When the execution was created.
    pub created_at: DateTime<Utc>,
    /// Error reported by the worker; empty when none.
    #[serde(default)]
    pub error: String,
    /// User-visible parameters.
    #[serde(default)]
    pub parameters: Parameters,
}

impl Execution {
    /// Create a new execution in the pending state.
    #[must_use]
    pub fn pending(
        id: ExecutionId,
        deployment: &Deployment,
        workflow_id: impl Into<String>,
        parameters: Parameters,
    ) -> Self {
        Self {
            id,
            deployment_id: deployment.id.clone(),
            blueprint_id: deployment.blueprint_id.clone(),
            workflow_id: workflow_id.into(),
            status: ExecutionStatus::Pending,
            created_at: Utc::now(),
            error: String::new(),
            parameters,
        }
    }

    /// Check if this is one of the synthetic environment executions.
    #[must_use]
    pub fn is_system_workflow(&self) -> bool {
        self.workflow_id == CREATE_ENVIRONMENT_WORKFLOW
            || self.workflow_id == DELETE_ENVIRONMENT_WORKFLOW
    }
}
