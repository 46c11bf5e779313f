//! Execution parameter merging and validation.
//!
//! Parameters passed to an execution request override the defaults declared
//! by the workflow. Declared parameters without a default must be supplied.
//! Undeclared ("custom") parameters are forwarded only when the caller allows
//! them.

use std::collections::BTreeMap;

use crate::types::{ParameterSpec, Parameters};

/// Prefix marking kwargs that are internal to the task system.
pub const INTERNAL_PREFIX: &str = "__";

/// Why a parameter merge was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParameterError {
    /// Mandatory parameters were not supplied.
    #[error("the following parameters must be provided: {}", .0.join(","))]
    MissingMandatoryParameters(Vec<String>),

    /// Undeclared parameters were supplied without allowing custom parameters.
    #[error(
        "the following parameters are not declared: {}; remove them or allow custom parameters",
        .0.join(",")
    )]
    CustomParametersNotAllowed(Vec<String>),
}

/// Merge declared workflow parameters with caller overrides.
///
/// Every missing mandatory parameter is reported at once. The result holds
/// every declared parameter, resolved, plus the custom parameters when
/// `allow_custom` is set.
pub fn merge(
    declared: &BTreeMap<String, ParameterSpec>,
    overrides: &Parameters,
    allow_custom: bool,
) -> Result<Parameters, ParameterError> {
    let mut merged = Parameters::new();
    let mut missing = Vec::new();

    for (name, spec) in declared {
        match (overrides.get(name), &spec.default) {
            (Some(value), _) | (None, Some(value)) => {
                merged.insert(name.clone(), value.clone());
            }
            (None, None) => missing.push(name.clone()),
        }
    }

    if !missing.is_empty() {
        return Err(ParameterError::MissingMandatoryParameters(missing));
    }

    let custom: Vec<_> = overrides
        .iter()
        .filter(|(name, _)| !declared.contains_key(*name))
        .collect();

    if !allow_custom && !custom.is_empty() {
        return Err(ParameterError::CustomParametersNotAllowed(
            custom.into_iter().map(|(name, _)| name.clone()).collect(),
        ));
    }

    merged.extend(custom.into_iter().map(|(k, v)| (k.clone(), v.clone())));
    Ok(merged)
}

/// Drop internal kwargs, keeping what is recorded as an execution's parameters.
#[must_use]
pub fn user_visible(parameters: &Parameters) -> Parameters {
    parameters
        .iter()
        .filter(|(name, _)| !name.starts_with(INTERNAL_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn declared(specs: &[(&str, Option<Value>)]) -> BTreeMap<String, ParameterSpec> {
        specs
            .iter()
            .map(|(name, default)| {
                let spec = match default {
                    Some(v) => ParameterSpec::with_default(v.clone()),
                    None => ParameterSpec::mandatory(),
                };
                ((*name).to_owned(), spec)
            })
            .collect()
    }

    fn params(value: Value) -> Parameters {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn defaults_are_applied() {
        let declared = declared(&[("a", Some(json!(1))), ("b", Some(json!("x")))]);
        let merged = merge(&declared, &Parameters::new(), false).unwrap();
        assert_eq!(merged, params(json!({"a": 1, "b": "x"})));
    }

    #[test]
    fn overrides_win_over_defaults() {
        let declared = declared(&[("a", Some(json!(1))), ("b", None)]);
        let merged = merge(&declared, &params(json!({"a": 2, "b": 3})), false).unwrap();
        assert_eq!(merged, params(json!({"a": 2, "b": 3})));
    }

    #[test]
    fn missing_mandatory_cites_only_missing() {
        let declared = declared(&[("a", None), ("b", Some(json!(1)))]);
        let err = merge(&declared, &Parameters::new(), false).unwrap_err();
        assert_eq!(
            err,
            ParameterError::MissingMandatoryParameters(vec!["a".to_owned()])
        );
    }

    #[test]
    fn all_missing_mandatory_are_reported() {
        let declared = declared(&[("z", None), ("a", None), ("m", Some(json!(0)))]);
        let err = merge(&declared, &Parameters::new(), true).unwrap_err();
        assert_eq!(
            err,
            ParameterError::MissingMandatoryParameters(vec!["a".to_owned(), "z".to_owned()])
        );
    }

    #[test]
    fn custom_parameters_rejected_unless_allowed() {
        let declared = declared(&[("a", Some(json!(1)))]);
        let overrides = params(json!({"x": 5}));

        let err = merge(&declared, &overrides, false).unwrap_err();
        assert_eq!(
            err,
            ParameterError::CustomParametersNotAllowed(vec!["x".to_owned()])
        );

        let merged = merge(&declared, &overrides, true).unwrap();
        assert_eq!(merged, params(json!({"a": 1, "x": 5})));
    }

    #[test]
    fn explicit_null_default_is_not_mandatory() {
        let declared = declared(&[("opt", Some(Value::Null))]);
        let merged = merge(&declared, &Parameters::new(), false).unwrap();
        assert_eq!(merged.get("opt"), Some(&Value::Null));
    }

    #[test]
    fn merge_is_idempotent_on_its_output() {
        let declared = declared(&[("a", None), ("b", Some(json!([1, 2]))), ("c", Some(json!(null)))]);
        let cases = [
            (params(json!({"a": "x"})), false),
            (params(json!({"a": "x", "b": {"k": 1}})), false),
            (params(json!({"a": 0, "extra": true})), true),
        ];

        for (overrides, allow_custom) in cases {
            let once = merge(&declared, &overrides, allow_custom).unwrap();
            let twice = merge(&declared, &once, allow_custom).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn user_visible_strips_internal_keys() {
        let all = params(json!({"__execution_context": {"task_id": "t"}, "port": 80}));
        assert_eq!(user_visible(&all), params(json!({"port": 80})));
    }
}
