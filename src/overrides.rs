//! Runtime overrides from the command line
//!
//! - `--param STEP.PARAM=VALUE`: replace an existing literal binding; VALUE is YAML
//! - `--input NAME=PATH`: replace the source of a declared input

use indexmap::IndexMap;
use serde_json::Value;

use crate::binding::BindingNode;
use crate::error::TraktError;
use crate::pipeline::Pipeline;

fn invalid(reason: impl Into<String>) -> TraktError {
    TraktError::InvalidOverride {
        reason: reason.into(),
    }
}

fn split_assignment<'a>(raw: &'a str, form: &str) -> Result<(&'a str, &'a str), TraktError> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| invalid(format!("'{raw}' is not of the form {form}")))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(invalid(format!("'{raw}' is not of the form {form}")));
    }
    Ok((key, value))
}

/// A parsed `STEP.PARAM=VALUE`
#[derive(Debug, Clone, PartialEq)]
pub struct ParamOverride {
    pub step_id: String,
    pub param: String,
    pub value: Value,
}

impl ParamOverride {
    pub fn parse(raw: &str) -> Result<Self, TraktError> {
        let (key, value) = split_assignment(raw, "STEP.PARAM=VALUE")?;
        // step ids may contain dots, parameter names do not
        let (step_id, param) = key
            .rsplit_once('.')
            .filter(|(s, p)| !s.is_empty() && !p.is_empty())
            .ok_or_else(|| invalid(format!("'{key}' must name STEP.PARAM")))?;
        Ok(Self {
            step_id: step_id.to_string(),
            param: param.to_string(),
            value: parse_value(value)?,
        })
    }
}

fn parse_value(raw: &str) -> Result<Value, TraktError> {
    if raw.trim().is_empty() {
        return Ok(Value::String(raw.to_string()));
    }
    serde_yaml::from_str(raw).map_err(|e| invalid(format!("cannot parse value '{raw}': {e}")))
}

/// Replace literal bindings in place
pub fn apply_params(pipeline: &mut Pipeline, params: &[ParamOverride]) -> Result<(), TraktError> {
    for param in params {
        let step = pipeline
            .step_mut(&param.step_id)
            .ok_or_else(|| invalid(format!("unknown step '{}'", param.step_id)))?;
        let binding = step.bindings.get_mut(&param.param).ok_or_else(|| {
            invalid(format!(
                "step '{}' has no binding '{}'",
                param.step_id, param.param
            ))
        })?;
        if !binding.is_literal() {
            return Err(invalid(format!(
                "step '{}' binding '{}' is an artifact reference, only literals can be overridden",
                param.step_id, param.param
            )));
        }
        tracing::debug!(step = %param.step_id, param = %param.param, value = %param.value, "param override");
        *binding = BindingNode::Literal(param.value.clone());
    }
    Ok(())
}

/// Parse `NAME=PATH` pairs
pub fn parse_input_overrides(raw: &[String]) -> Result<IndexMap<String, String>, TraktError> {
    raw.iter()
        .map(|item| {
            let (name, path) = split_assignment(item, "NAME=PATH")?;
            let path = path.trim();
            if path.is_empty() {
                return Err(invalid(format!("input override '{name}' has an empty path")));
            }
            Ok((name.to_string(), path.to_string()))
        })
        .collect()
}

/// Point declared inputs at new sources
pub fn apply_inputs(
    pipeline: &mut Pipeline,
    overrides: &IndexMap<String, String>,
) -> Result<(), TraktError> {
    for (name, source) in overrides {
        let input = pipeline
            .inputs
            .get_mut(name)
            .ok_or_else(|| invalid(format!("unknown input '{name}'")))?;
        input.uri = source.clone();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepRegistry;
    use serde_json::json;

    const YAML: &str = r#"
inputs:
  orders: orders.csv
steps:
  - id: stage.gate
    uses: quality_gate
    with:
      input: orders
      policy: {const: {mode: fail}}
      output: checked
"#;

    fn pipeline() -> Pipeline {
        Pipeline::from_yaml_str(YAML, &StepRegistry::with_builtins()).unwrap()
    }

    #[test]
    fn test_parse_param_values_as_yaml() {
        let p = ParamOverride::parse("stage.gate.policy={mode: warn}").unwrap();
        assert_eq!(p.step_id, "stage.gate");
        assert_eq!(p.param, "policy");
        assert_eq!(p.value, json!({"mode": "warn"}));
        assert_eq!(ParamOverride::parse("s.n=3").unwrap().value, json!(3));
        assert_eq!(ParamOverride::parse("s.n=").unwrap().value, json!(""));
        assert!(ParamOverride::parse("nodot=3").is_err());
        assert!(ParamOverride::parse("s.n").is_err());
    }

    #[test]
    fn test_apply_replaces_literal_only() {
        let mut pipeline = pipeline();
        let warn = ParamOverride::parse("stage.gate.policy={mode: warn}").unwrap();
        apply_params(&mut pipeline, &[warn]).unwrap();
        assert_eq!(
            pipeline.steps[0].bindings["policy"],
            BindingNode::literal(json!({"mode": "warn"}))
        );

        for bad in ["stage.gate.input=other", "missing.policy=1", "stage.gate.nope=1"] {
            let param = ParamOverride::parse(bad).unwrap();
            let err = apply_params(&mut pipeline, &[param]).unwrap_err();
            assert!(matches!(err, TraktError::InvalidOverride { .. }), "{bad}");
        }
    }

    #[test]
    fn test_input_overrides() {
        let mut pipeline = pipeline();
        let overrides = parse_input_overrides(&["orders=fixtures/*.csv".to_string()]).unwrap();
        apply_inputs(&mut pipeline, &overrides).unwrap();
        assert_eq!(pipeline.inputs["orders"].uri, "fixtures/*.csv");

        let unknown = parse_input_overrides(&["ghost=x.csv".to_string()]).unwrap();
        assert!(apply_inputs(&mut pipeline, &unknown).is_err());
        assert!(parse_input_overrides(&["orders=".to_string()]).is_err());
    }
}
