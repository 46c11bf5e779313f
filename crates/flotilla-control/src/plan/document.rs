//! JSON plan documents.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::types::{InstanceRelationship, ParameterSpec, Parameters};

use super::{DeploymentPlan, PlanCompiler, PlanDocument, PlanError, PlanNode, PlannedInstance};

const GET_INPUT: &str = "get_input";
const SUFFIX_LEN: usize = 6;

/// Compiles blueprints stored as JSON plan documents on disk.
///
/// Locations are file paths, optionally `file://` prefixed. Relative paths
/// are resolved against the base directory when one is set.
#[derive(Debug, Clone, Default)]
pub struct DocumentPlanCompiler {
    base_dir: Option<PathBuf>,
}

impl DocumentPlanCompiler {
    /// Create a compiler resolving relative paths against the working directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative locations against `dir`.
    #[must_use]
    pub fn with_base_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(dir.into()),
        }
    }

    fn resolve(&self, location: &str) -> PathBuf {
        let path = Path::new(location.strip_prefix("file://").unwrap_or(location));
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

#[async_trait]
impl PlanCompiler for DocumentPlanCompiler {
    async fn compile(&self, dsl_location: &str) -> Result<PlanDocument, PlanError> {
        let path = self.resolve(dsl_location);
        debug!(path = %path.display(), "reading plan document");

        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| PlanError::Io {
                location: dsl_location.to_owned(),
                message: e.to_string(),
            })?;

        let plan: PlanDocument =
            serde_json::from_str(&raw).map_err(|e| PlanError::Invalid(e.to_string()))?;
        validate_topology(&plan)?;

        Ok(plan)
    }

    async fn materialize(
        &self,
        plan: &PlanDocument,
        inputs: &Parameters,
    ) -> Result<DeploymentPlan, PlanError> {
        materialize_document(plan, inputs)
    }
}

/// Materialise a plan document with concrete inputs.
///
/// Applies input defaults, substitutes `{"get_input": name}` references in
/// node properties and outputs, and expands every node into its instances.
/// A contained node gets `instances.deploy` instances per instance of its
/// host.
pub fn materialize_document(
    plan: &PlanDocument,
    supplied: &Parameters,
) -> Result<DeploymentPlan, PlanError> {
    let inputs = resolve_inputs(&plan.inputs, supplied)?;
    validate_topology(plan)?;

    let nodes = plan
        .nodes
        .iter()
        .map(|node| {
            let mut node = node.clone();
            node.properties = substitute_map(&node.properties, &inputs)?;
            Ok(node)
        })
        .collect::<Result<Vec<_>, PlanError>>()?;

    let outputs = substitute_map(&plan.outputs, &inputs)?;
    let node_instances = expand_instances(&nodes)?;

    Ok(DeploymentPlan {
        inputs,
        nodes,
        node_instances,
        workflows: plan.workflows.clone(),
        outputs,
        policy_types: plan.policy_types.clone(),
        policy_triggers: plan.policy_triggers.clone(),
        groups: plan.groups.clone(),
        deployment_plugins_to_install: plan.deployment_plugins_to_install.clone(),
        workflow_plugins_to_install: plan.workflow_plugins_to_install.clone(),
    })
}

fn resolve_inputs(
    declared: &BTreeMap<String, ParameterSpec>,
    supplied: &Parameters,
) -> Result<Parameters, PlanError> {
    let missing: Vec<&str> = declared
        .iter()
        .filter(|(name, spec)| spec.is_mandatory() && !supplied.contains_key(*name))
        .map(|(name, _)| name.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(PlanError::MissingRequiredInput(missing.join(", ")));
    }

    let unknown: Vec<&str> = supplied
        .keys()
        .filter(|name| !declared.contains_key(*name))
        .map(String::as_str)
        .collect();
    if !unknown.is_empty() {
        return Err(PlanError::UnknownInput(unknown.join(", ")));
    }

    Ok(declared
        .iter()
        .map(|(name, spec)| {
            let value = supplied
                .get(name)
                .or(spec.default.as_ref())
                .cloned()
                .unwrap_or(Value::Null);
            (name.clone(), value)
        })
        .collect())
}

fn substitute_map(values: &Parameters, inputs: &Parameters) -> Result<Parameters, PlanError> {
    values
        .iter()
        .map(|(key, value)| Ok((key.clone(), substitute(value, inputs)?)))
        .collect()
}

fn substitute(value: &Value, inputs: &Parameters) -> Result<Value, PlanError> {
    match value {
        Value::Object(map) => {
            if let (1, Some(reference)) = (map.len(), map.get(GET_INPUT)) {
                let name = reference.as_str().ok_or_else(|| {
                    PlanError::Invalid(format!("{GET_INPUT} expects an input name, got {reference}"))
                })?;
                return inputs.get(name).cloned().ok_or_else(|| {
                    PlanError::Invalid(format!("{GET_INPUT} references undeclared input {name}"))
                });
            }
            map.iter()
                .map(|(key, value)| Ok((key.clone(), substitute(value, inputs)?)))
                .collect::<Result<serde_json::Map<_, _>, PlanError>>()
                .map(Value::Object)
        }
        Value::Array(items) => items
            .iter()
            .map(|item| substitute(item, inputs))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

/// Check node ids are unique, every reference points at a declared node and
/// containment has no cycles.
fn validate_topology(plan: &PlanDocument) -> Result<(), PlanError> {
    let mut ids = HashSet::new();
    for node in &plan.nodes {
        if !ids.insert(node.id.as_str()) {
            return Err(PlanError::Invalid(format!("duplicate node {}", node.id)));
        }
    }

    for node in &plan.nodes {
        if let Some(host) = &node.host_id {
            if host == &node.id || !ids.contains(host.as_str()) {
                return Err(PlanError::Invalid(format!(
                    "node {} has invalid host {host}",
                    node.id
                )));
            }
        }
        for rel in &node.relationships {
            if !ids.contains(rel.target_id.as_str()) {
                return Err(PlanError::Invalid(format!(
                    "node {} has a relationship to unknown node {}",
                    node.id, rel.target_id
                )));
            }
        }
    }

    for (name, workflow) in &plan.workflows {
        if workflow.operation.is_empty() {
            return Err(PlanError::Invalid(format!("workflow {name} has no operation")));
        }
    }

    hosting_order(&plan.nodes).map(drop)
}

/// Order nodes so every host comes before the nodes it contains.
fn hosting_order<'a>(nodes: &'a [PlanNode]) -> Result<Vec<&'a PlanNode>, PlanError> {
    let by_id: HashMap<&str, &PlanNode> = nodes.iter().map(|n| (n.id.as_str(), n)).collect();
    let mut ordered = Vec::with_capacity(nodes.len());
    let mut placed = HashSet::new();

    for node in nodes {
        let mut chain = Vec::new();
        let mut current = Some(node);
        while let Some(n) = current {
            if placed.contains(n.id.as_str()) {
                break;
            }
            if chain.iter().any(|c: &&PlanNode| c.id == n.id) {
                return Err(PlanError::Invalid(format!(
                    "containment cycle through node {}",
                    n.id
                )));
            }
            chain.push(n);
            current = n.host_id.as_deref().and_then(|h| by_id.get(h).copied());
        }
        for n in chain.into_iter().rev() {
            placed.insert(n.id.as_str());
            ordered.push(n);
        }
    }

    Ok(ordered)
}

fn new_instance_id(node_id: &str, taken: &mut HashSet<String>) -> String {
    loop {
        let ulid = ulid::Ulid::new().to_string().to_lowercase();
        let suffix = &ulid[ulid.len() - SUFFIX_LEN..];
        let id = format!("{node_id}_{suffix}");
        if taken.insert(id.clone()) {
            return id;
        }
    }
}

fn expand_instances(nodes: &[PlanNode]) -> Result<Vec<PlannedInstance>, PlanError> {
    let mut taken = HashSet::new();
    let mut by_node: HashMap<&str, Vec<usize>> = HashMap::new();
    let mut instances: Vec<PlannedInstance> = Vec::new();

    for node in hosting_order(nodes)? {
        let hosts: Vec<Option<String>> = match &node.host_id {
            Some(host) => by_node
                .get(host.as_str())
                .map(|idx| idx.iter().map(|&i| Some(instances[i].id.clone())).collect())
                .unwrap_or_default(),
            None => vec![None],
        };

        let mut indices = Vec::new();
        for host_id in hosts {
            for _ in 0..node.instances.deploy {
                indices.push(instances.len());
                instances.push(PlannedInstance {
                    id: new_instance_id(&node.id, &mut taken),
                    node_id: node.id.clone(),
                    host_id: host_id.clone(),
                    relationships: Vec::new(),
                });
            }
        }
        by_node.insert(node.id.as_str(), indices);
    }

    let ids_of = |node_id: &str| -> Vec<String> {
        by_node
            .get(node_id)
            .map(|idx| idx.iter().map(|&i| instances[i].id.clone()).collect())
            .unwrap_or_default()
    };

    let mut relationships: Vec<Vec<InstanceRelationship>> = vec![Vec::new(); instances.len()];
    for node in nodes {
        for &i in by_node.get(node.id.as_str()).into_iter().flatten() {
            for rel in &node.relationships {
                // A relationship to the host binds to this instance's own host.
                let targets = if node.host_id.as_deref() == Some(rel.target_id.as_str()) {
                    instances[i].host_id.iter().cloned().collect()
                } else {
                    ids_of(&rel.target_id)
                };
                relationships[i].extend(targets.into_iter().map(|target_id| {
                    InstanceRelationship {
                        target_id,
                        target_name: rel.target_id.clone(),
                        relationship_type: rel.relationship_type.clone(),
                    }
                }));
            }
        }
    }

    for (instance, rels) in instances.iter_mut().zip(relationships) {
        instance.relationships = rels;
    }

    Ok(instances)
}
