//! Deployment output evaluation.

use serde_json::Value;

use crate::error::{ControlError, ControlResult};
use crate::types::{NodeInstance, Parameters};

const GET_ATTRIBUTE: &str = "get_attribute";

/// Evaluate output definitions against the deployment's node instances.
///
/// Each definition's `value` (or the definition itself when it has no
/// `value` key) is resolved recursively. `{"get_attribute": [node, attr, ...]}`
/// reads `attr` from the runtime properties of the single instance of `node`;
/// trailing path elements index into the attribute value.
pub fn evaluate_outputs(outputs: &Parameters, instances: &[NodeInstance]) -> ControlResult<Parameters> {
    outputs
        .iter()
        .map(|(name, definition)| {
            let value = definition.get("value").unwrap_or(definition);
            let evaluated = evaluate(value, instances).map_err(|reason| {
                ControlError::OutputsEvaluation(format!("output {name}: {reason}"))
            })?;
            Ok((name.clone(), evaluated))
        })
        .collect()
}

fn evaluate(value: &Value, instances: &[NodeInstance]) -> Result<Value, String> {
    match value {
        Value::Object(map) => {
            if let (1, Some(args)) = (map.len(), map.get(GET_ATTRIBUTE)) {
                return get_attribute(args, instances);
            }
            map.iter()
                .map(|(key, value)| Ok((key.clone(), evaluate(value, instances)?)))
                .collect::<Result<serde_json::Map<_, _>, String>>()
                .map(Value::Object)
        }
        Value::Array(items) => items
            .iter()
            .map(|item| evaluate(item, instances))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

fn get_attribute(args: &Value, instances: &[NodeInstance]) -> Result<Value, String> {
    let (node_id, attribute, path) = match args.as_array().map(Vec::as_slice) {
        Some([Value::String(node), Value::String(attr), path @ ..]) => (node, attr, path),
        _ => return Err(format!("{GET_ATTRIBUTE} expects [node, attribute, ...], got {args}")),
    };

    let mut matching = instances.iter().filter(|i| &i.node_id == node_id);
    let instance = match (matching.next(), matching.next()) {
        (Some(instance), None) => instance,
        (None, _) => return Err(format!("node {node_id} has no instances")),
        (Some(_), Some(_)) => {
            return Err(format!(
                "node {node_id} has more than one instance, {GET_ATTRIBUTE} is ambiguous"
            ))
        }
    };

    let mut current = instance
        .runtime_properties
        .get(attribute)
        .ok_or_else(|| format!("attribute {attribute} of node {node_id} is not set"))?;

    for segment in path {
        let next = match (current, segment) {
            (Value::Object(map), Value::String(key)) => map.get(key),
            (Value::Array(items), Value::Number(n)) => n
                .as_u64()
                .and_then(|i| usize::try_from(i).ok())
                .and_then(|i| items.get(i)),
            _ => None,
        };
        current = next.ok_or_else(|| {
            format!("attribute {attribute} of node {node_id} has no element {segment}")
        })?;
    }

    Ok(current.clone())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::DeploymentId;

    fn instance(id: &str, node: &str, props: Value) -> NodeInstance {
        NodeInstance {
            id: id.to_owned(),
            node_id: node.to_owned(),
            deployment_id: DeploymentId::new("dep"),
            host_id: None,
            relationships: vec![],
            state: "started".to_owned(),
            runtime_properties: serde_json::from_value(props).unwrap(),
            version: Some(1),
        }
    }

    fn outputs(value: Value) -> Parameters {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn literals_pass_through() {
        let defs = outputs(json!({
            "greeting": {"value": "hello", "description": "static"},
            "bare": 42
        }));
        let evaluated = evaluate_outputs(&defs, &[]).unwrap();
        assert_eq!(evaluated["greeting"], json!("hello"));
        assert_eq!(evaluated["bare"], json!(42));
    }

    #[test]
    fn attributes_resolve_recursively() {
        let defs = outputs(json!({
            "endpoint": {"value": {
                "ip": {"get_attribute": ["vm", "ip"]},
                "ports": [{"get_attribute": ["web", "ports", 0]}]
            }}
        }));
        let instances = [
            instance("vm_1", "vm", json!({"ip": "10.0.0.5"})),
            instance("web_1", "web", json!({"ports": [8080, 8443]})),
        ];

        let evaluated = evaluate_outputs(&defs, &instances).unwrap();
        assert_eq!(
            evaluated["endpoint"],
            json!({"ip": "10.0.0.5", "ports": [8080]})
        );
    }

    #[test]
    fn ambiguous_node_fails() {
        let defs = outputs(json!({"ip": {"value": {"get_attribute": ["vm", "ip"]}}}));
        let instances = [
            instance("vm_1", "vm", json!({"ip": "10.0.0.5"})),
            instance("vm_2", "vm", json!({"ip": "10.0.0.6"})),
        ];

        let err = evaluate_outputs(&defs, &instances).unwrap_err();
        assert!(matches!(err, ControlError::OutputsEvaluation(ref m) if m.contains("more than one")));
    }

    #[test]
    fn unset_attribute_fails() {
        let defs = outputs(json!({"ip": {"value": {"get_attribute": ["vm", "ip"]}}}));
        let instances = [instance("vm_1", "vm", json!({}))];

        let err = evaluate_outputs(&defs, &instances).unwrap_err();
        assert!(err.to_string().contains("not set"));
    }

    #[test]
    fn malformed_reference_fails() {
        let defs = outputs(json!({"ip": {"value": {"get_attribute": "vm"}}}));
        assert!(evaluate_outputs(&defs, &[]).is_err());
    }
}
