//! Binding resolution
//!
//! A step's `with:` entries are parsed into `BindingNode` trees:
//! - bare string          -> artifact reference
//! - `{const: <any>}`     -> literal (the only way to pass a literal string)
//! - number / bool / null -> literal
//! - list / mapping       -> recursive structure
//!
//! Resolution walks the tree against the run `Environment`. Output bindings
//! are parsed separately into `OutputTarget`s naming the artifacts to bind.

use indexmap::IndexMap;
use serde_json::Value;

use crate::environment::Environment;
use crate::error::TraktError;
use crate::value::{StepArgs, StepValue};

/// Key marking a literal in binding syntax
pub const CONST_KEY: &str = "const";

/// One parsed binding expression
#[derive(Debug, Clone, PartialEq)]
pub enum BindingNode {
    ArtifactRef(String),
    Literal(Value),
    Sequence(Vec<BindingNode>),
    Mapping(IndexMap<String, BindingNode>),
}

impl BindingNode {
    pub fn reference(name: impl Into<String>) -> Self {
        BindingNode::ArtifactRef(name.into())
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        BindingNode::Literal(value.into())
    }

    /// Parse binding syntax
    pub fn parse(raw: &Value) -> Self {
        match raw {
            Value::String(name) => BindingNode::ArtifactRef(name.clone()),
            Value::Null | Value::Bool(_) | Value::Number(_) => BindingNode::Literal(raw.clone()),
            Value::Array(items) => BindingNode::Sequence(items.iter().map(Self::parse).collect()),
            Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(inner) = map.get(CONST_KEY) {
                        return BindingNode::Literal(inner.clone());
                    }
                }
                BindingNode::Mapping(
                    map.iter()
                        .map(|(k, v)| (k.clone(), Self::parse(v)))
                        .collect(),
                )
            }
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, BindingNode::Literal(_))
    }

    /// Artifact names referenced anywhere in the tree, in order
    pub fn references(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            BindingNode::ArtifactRef(name) => out.push(name),
            BindingNode::Literal(_) => {}
            BindingNode::Sequence(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            BindingNode::Mapping(map) => {
                for item in map.values() {
                    item.collect_references(out);
                }
            }
        }
    }

    /// Resolve against the environment. Streams are moved out of it.
    pub fn resolve(&self, env: &mut Environment, step_id: &str) -> Result<StepValue, TraktError> {
        match self {
            BindingNode::ArtifactRef(name) => {
                env.lend(name)
                    .ok_or_else(|| TraktError::UnresolvedReference {
                        step_id: step_id.to_string(),
                        artifact: name.clone(),
                    })
            }
            BindingNode::Literal(v) => Ok(StepValue::Literal(v.clone())),
            BindingNode::Sequence(items) => items
                .iter()
                .map(|item| item.resolve(env, step_id))
                .collect::<Result<Vec<_>, _>>()
                .map(StepValue::List),
            BindingNode::Mapping(map) => map
                .iter()
                .map(|(k, v)| v.resolve(env, step_id).map(|v| (k.clone(), v)))
                .collect::<Result<IndexMap<_, _>, _>>()
                .map(StepValue::Map),
        }
    }

    /// Back to binding syntax (literal strings get wrapped in `{const: ...}`)
    pub fn to_value(&self) -> Value {
        match self {
            BindingNode::ArtifactRef(name) => Value::String(name.clone()),
            BindingNode::Literal(v) => match v {
                Value::Null | Value::Bool(_) | Value::Number(_) => v.clone(),
                _ => serde_json::json!({ CONST_KEY: v }),
            },
            BindingNode::Sequence(items) => Value::Array(items.iter().map(Self::to_value).collect()),
            BindingNode::Mapping(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_value()))
                    .collect(),
            ),
        }
    }
}

/// Resolve every call binding of a step into its argument map
pub fn resolve_args<'a, I>(
    bindings: I,
    env: &mut Environment,
    step_id: &str,
) -> Result<StepArgs, TraktError>
where
    I: IntoIterator<Item = (&'a String, &'a BindingNode)>,
{
    let mut args = StepArgs::default();
    for (name, node) in bindings {
        args.insert(name.clone(), node.resolve(env, step_id)?);
    }
    Ok(args)
}

// ============================================================================
// OUTPUT TARGETS
// ============================================================================

/// Where a step's result value under one output key gets bound
#[derive(Debug, Clone, PartialEq)]
pub enum OutputTarget {
    /// Bind the whole value to one artifact
    Single(String),
    /// Value must be a list of the same length
    Sequence(Vec<String>),
    /// Value must be a mapping; each listed key is bound
    Mapping(IndexMap<String, String>),
}

impl OutputTarget {
    /// Interpret an output binding. Only artifact names are allowed.
    pub fn from_binding(node: &BindingNode) -> Result<Self, String> {
        match node {
            BindingNode::ArtifactRef(name) => Ok(OutputTarget::Single(name.clone())),
            BindingNode::Sequence(items) => items
                .iter()
                .map(|item| match item {
                    BindingNode::ArtifactRef(name) => Ok(name.clone()),
                    _ => Err("list entries must be artifact names".to_string()),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(OutputTarget::Sequence),
            BindingNode::Mapping(map) => map
                .iter()
                .map(|(k, v)| match v {
                    BindingNode::ArtifactRef(name) => Ok((k.clone(), name.clone())),
                    _ => Err(format!("mapping entry '{k}' must be an artifact name")),
                })
                .collect::<Result<IndexMap<_, _>, _>>()
                .map(OutputTarget::Mapping),
            BindingNode::Literal(_) => Err("literals cannot be output targets".to_string()),
        }
    }

    pub fn artifact_names(&self) -> Vec<&str> {
        match self {
            OutputTarget::Single(name) => vec![name.as_str()],
            OutputTarget::Sequence(names) => names.iter().map(String::as_str).collect(),
            OutputTarget::Mapping(map) => map.values().map(String::as_str).collect(),
        }
    }

    /// Split a result value into (artifact name, value) pairs
    pub fn bind(&self, key: &str, value: StepValue) -> Result<Vec<(String, StepValue)>, TraktError> {
        match (self, value) {
            (OutputTarget::Single(name), value) => Ok(vec![(name.clone(), value)]),
            (OutputTarget::Sequence(names), StepValue::List(items)) => {
                if items.len() != names.len() {
                    return Err(TraktError::contract(format!(
                        "output '{key}' returned {} values for {} bound artifacts",
                        items.len(),
                        names.len()
                    )));
                }
                Ok(names.iter().cloned().zip(items).collect())
            }
            (OutputTarget::Mapping(targets), StepValue::Map(mut items)) => targets
                .iter()
                .map(|(nested, name)| {
                    items
                        .shift_remove(nested)
                        .map(|v| (name.clone(), v))
                        .ok_or_else(|| {
                            TraktError::contract(format!(
                                "output '{key}' result is missing key '{nested}'"
                            ))
                        })
                })
                .collect(),
            (OutputTarget::Sequence(_), other) => Err(TraktError::contract(format!(
                "output '{key}' is bound to a list but the step returned {}",
                other.type_name()
            ))),
            (OutputTarget::Mapping(_), other) => Err(TraktError::contract(format!(
                "output '{key}' is bound to a mapping but the step returned {}",
                other.type_name()
            ))),
        }
    }
}
