//! Pipeline definition and YAML loading
//!
//! Loading parses the file into serde structs, resolves every `uses:` against
//! the `StepRegistry`, and (in [`load_pipeline`]) runs the validator so a
//! returned `Pipeline` is ready to execute.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;

use crate::artifact::{ArtifactSchema, ArtifactSpec, CombineStrategy, ExecutionMode, OutputSpec, DEFAULT_KIND};
use crate::binding::{BindingNode, OutputTarget};
use crate::error::TraktError;
use crate::step::{Step, StepRegistry, DEFAULT_OUTPUT_KEYS};
use crate::validator::{ValidationReport, Validator};
use crate::value::Metadata;

/// Name used when neither the file nor its path provides one
pub const DEFAULT_PIPELINE_NAME: &str = "pipeline";

// ============================================================================
// RESOLVED PIPELINE
// ============================================================================

/// One step with its handler resolved
#[derive(Clone)]
pub struct PipelineStep {
    pub id: String,
    pub uses: String,
    /// Every `with:` entry, call arguments and output bindings alike
    pub bindings: IndexMap<String, BindingNode>,
    pub declared_inputs: Vec<String>,
    pub declared_outputs: Vec<String>,
    pub supports_batch: bool,
    pub supports_stream: bool,
    handler: Arc<dyn Step>,
}

impl PipelineStep {
    /// Capture the handler's declarations once, at load time
    pub fn new(
        id: impl Into<String>,
        uses: impl Into<String>,
        handler: Arc<dyn Step>,
        bindings: IndexMap<String, BindingNode>,
    ) -> Self {
        Self {
            id: id.into(),
            uses: uses.into(),
            declared_inputs: handler.declared_inputs(),
            declared_outputs: handler.declared_outputs(),
            supports_batch: handler.supports_batch(),
            supports_stream: handler.supports_stream(),
            bindings,
            handler,
        }
    }

    pub fn handler(&self) -> &Arc<dyn Step> {
        &self.handler
    }

    pub fn supports(&self, mode: ExecutionMode) -> bool {
        match mode {
            ExecutionMode::Batch => self.supports_batch,
            ExecutionMode::Stream => self.supports_stream,
        }
    }

    /// Keys of `with:` that are output bindings
    pub fn is_output_key(&self, key: &str) -> bool {
        if self.declared_outputs.is_empty() {
            DEFAULT_OUTPUT_KEYS.contains(&key)
        } else {
            self.declared_outputs.iter().any(|k| k == key)
        }
    }

    pub fn call_bindings(&self) -> impl Iterator<Item = (&String, &BindingNode)> {
        self.bindings.iter().filter(|(k, _)| !self.is_output_key(k))
    }

    pub fn output_bindings(&self) -> impl Iterator<Item = (&String, &BindingNode)> {
        self.bindings.iter().filter(|(k, _)| self.is_output_key(k))
    }

    /// Output key -> target, failing on malformed output bindings
    pub fn output_targets(&self) -> Result<IndexMap<String, OutputTarget>, TraktError> {
        self.output_bindings()
            .map(|(key, node)| {
                OutputTarget::from_binding(node)
                    .map(|target| (key.clone(), target))
                    .map_err(|reason| {
                        TraktError::contract(format!(
                            "step '{}' output binding '{key}': {reason}",
                            self.id
                        ))
                    })
            })
            .collect()
    }

    /// Artifact names this step binds (well-formed output bindings only)
    pub fn produced_artifacts(&self) -> Vec<String> {
        self.output_bindings()
            .filter_map(|(_, node)| OutputTarget::from_binding(node).ok())
            .flat_map(|t| {
                t.artifact_names()
                    .into_iter()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Artifact names referenced by call arguments
    pub fn consumed_artifacts(&self) -> Vec<&str> {
        self.call_bindings()
            .flat_map(|(_, node)| node.references())
            .collect()
    }
}

impl fmt::Debug for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineStep")
            .field("id", &self.id)
            .field("uses", &self.uses)
            .field("bindings", &self.bindings)
            .field("supports_batch", &self.supports_batch)
            .field("supports_stream", &self.supports_stream)
            .finish()
    }
}

/// A key in the pipeline file that is not part of the format
#[derive(Debug, Clone, PartialEq)]
pub struct UnknownField {
    pub location: String,
    pub field: String,
    /// Unknown input keys are kept as adapter metadata outside strict mode
    pub merged_into_metadata: bool,
}

/// A loaded pipeline definition
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub name: String,
    pub version: Option<String>,
    /// Mode as written; checked by the validator
    pub execution_mode: String,
    pub strict: bool,
    pub inputs: IndexMap<String, ArtifactSpec>,
    pub steps: Vec<PipelineStep>,
    pub outputs: IndexMap<String, OutputSpec>,
    pub unknown_fields: Vec<UnknownField>,
}

impl Pipeline {
    /// Parsed mode, or the offending raw value
    pub fn mode(&self) -> Result<ExecutionMode, String> {
        self.execution_mode.parse()
    }

    pub fn step(&self, id: &str) -> Option<&PipelineStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut PipelineStep> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// Run every static check
    pub fn validate(&self) -> ValidationReport {
        Validator::new().strict(self.strict).validate(self)
    }

    /// Parse YAML text and resolve step handlers (no validation)
    pub fn from_yaml_str(yaml: &str, registry: &StepRegistry) -> Result<Self, TraktError> {
        let raw: RawPipeline = serde_yaml::from_str(yaml)?;
        raw.resolve(DEFAULT_PIPELINE_NAME, registry)
    }

    /// Read and parse a pipeline file (no validation). The name defaults to
    /// the parent directory, then the file stem.
    pub fn from_file(path: &Path, registry: &StepRegistry) -> Result<Self, TraktError> {
        let text = std::fs::read_to_string(path)?;
        let raw: RawPipeline = serde_yaml::from_str(&text)?;
        raw.resolve(&default_name(path), registry)
    }
}

fn default_name(path: &Path) -> String {
    let parent = path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty());
    let stem = path.file_stem().and_then(|n| n.to_str());
    parent
        .or(stem)
        .unwrap_or(DEFAULT_PIPELINE_NAME)
        .to_string()
}

/// Load, resolve and validate a pipeline file. `strict` forces strict mode on.
pub fn load_pipeline(
    path: &Path,
    registry: &StepRegistry,
    strict: bool,
) -> Result<Pipeline, TraktError> {
    let mut pipeline = Pipeline::from_file(path, registry)?;
    pipeline.strict |= strict;
    let report = pipeline.validate();
    report.log_warnings();
    report.into_result(&pipeline.name)?;
    Ok(pipeline)
}

/// Same as [`load_pipeline`] with anyhow context, for binaries
pub fn load_pipeline_with_context(
    path: &Path,
    registry: &StepRegistry,
    strict: bool,
) -> anyhow::Result<Pipeline> {
    load_pipeline(path, registry, strict)
        .with_context(|| format!("Failed to load pipeline: {}", path.display()))
}

// ============================================================================
// RAW FILE FORMAT
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawPipeline {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version: Option<Value>,
    #[serde(default)]
    execution: Option<RawExecution>,
    #[serde(default)]
    execution_mode: Option<String>,
    #[serde(default)]
    strict: bool,
    #[serde(default)]
    inputs: IndexMap<String, Option<RawInput>>,
    #[serde(default)]
    steps: Vec<RawStep>,
    #[serde(default)]
    outputs: Option<RawOutputs>,
    #[serde(flatten)]
    extra: Metadata,
}

#[derive(Debug, Deserialize)]
struct RawExecution {
    #[serde(default)]
    mode: Option<String>,
    #[serde(flatten)]
    extra: Metadata,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawInput {
    Uri(String),
    Full(RawInputFields),
}

#[derive(Debug, Deserialize)]
struct RawInputFields {
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    uri: Option<String>,
    #[serde(default)]
    schema: Option<Value>,
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    combine_strategy: Option<String>,
    #[serde(default)]
    optional: bool,
    #[serde(default)]
    required: Option<bool>,
    #[serde(flatten)]
    extra: Metadata,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    id: String,
    uses: String,
    #[serde(default)]
    with: IndexMap<String, Value>,
    #[serde(flatten)]
    extra: Metadata,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawOutputs {
    Datasets { datasets: Vec<RawOutput> },
    Named(IndexMap<String, String>),
}

#[derive(Debug, Deserialize)]
struct RawOutput {
    name: String,
    from: String,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    uri: Option<String>,
    #[serde(default)]
    metadata: Metadata,
    #[serde(flatten)]
    extra: Metadata,
}

fn load_error(reason: impl Into<String>) -> TraktError {
    TraktError::PipelineLoad {
        reason: reason.into(),
    }
}

impl RawPipeline {
    fn resolve(self, default_name: &str, registry: &StepRegistry) -> Result<Pipeline, TraktError> {
        let mut unknown_fields = Vec::new();
        let mut note = |location: &str, extra: &Metadata, merged: bool| {
            for field in extra.keys() {
                unknown_fields.push(UnknownField {
                    location: location.to_string(),
                    field: field.clone(),
                    merged_into_metadata: merged,
                });
            }
        };
        note("pipeline", &self.extra, false);

        let section_mode = match self.execution {
            Some(section) => {
                note("execution", &section.extra, false);
                section.mode
            }
            None => None,
        };
        let execution_mode = match (section_mode, self.execution_mode) {
            (Some(a), Some(b)) if a.trim().to_ascii_lowercase() != b.trim().to_ascii_lowercase() => {
                return Err(load_error(format!(
                    "conflicting execution modes: execution.mode='{a}' vs execution_mode='{b}'"
                )))
            }
            (Some(mode), _) | (None, Some(mode)) => mode.trim().to_ascii_lowercase(),
            (None, None) => ExecutionMode::default().as_str().to_string(),
        };

        let mut inputs = IndexMap::new();
        for (name, raw) in self.inputs {
            let spec = match raw {
                None => ArtifactSpec::new(name.clone(), name.clone()),
                Some(RawInput::Uri(uri)) => ArtifactSpec::new(name.clone(), uri),
                Some(RawInput::Full(fields)) => {
                    note(&format!("input '{name}'"), &fields.extra, true);
                    fields.into_spec(&name)?
                }
            };
            inputs.insert(name, spec);
        }

        let mut steps = Vec::with_capacity(self.steps.len());
        for raw in self.steps {
            note(&format!("step '{}'", raw.id), &raw.extra, false);
            let handler = registry.get(&raw.uses).ok_or_else(|| TraktError::UnknownStep {
                step_id: raw.id.clone(),
                uses: raw.uses.clone(),
                available: registry.names(),
            })?;
            let bindings = raw
                .with
                .iter()
                .map(|(k, v)| (k.clone(), BindingNode::parse(v)))
                .collect();
            steps.push(PipelineStep::new(raw.id, raw.uses.trim(), handler, bindings));
        }

        let mut outputs = IndexMap::new();
        match self.outputs {
            None => {}
            Some(RawOutputs::Named(map)) => {
                for (name, source) in map {
                    outputs.insert(name.clone(), OutputSpec::new(name, source));
                }
            }
            Some(RawOutputs::Datasets { datasets }) => {
                for raw in datasets {
                    note(&format!("output '{}'", raw.name), &raw.extra, false);
                    let spec = OutputSpec {
                        name: raw.name.clone(),
                        source: raw.from,
                        kind: raw.kind,
                        uri: raw.uri,
                        metadata: raw.metadata,
                    };
                    if outputs.insert(raw.name.clone(), spec).is_some() {
                        return Err(load_error(format!("duplicate output name '{}'", raw.name)));
                    }
                }
            }
        }

        Ok(Pipeline {
            name: self
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| default_name.to_string()),
            version: self.version.and_then(|v| match v {
                Value::Null => None,
                Value::String(s) => Some(s),
                other => Some(other.to_string()),
            }),
            execution_mode,
            strict: self.strict,
            inputs,
            steps,
            outputs,
            unknown_fields,
        })
    }
}

impl RawInputFields {
    fn into_spec(self, name: &str) -> Result<ArtifactSpec, TraktError> {
        let mut spec = ArtifactSpec::new(name, self.uri.unwrap_or_else(|| name.to_string()));
        spec.kind = self
            .kind
            .map(|k| k.trim().to_ascii_lowercase())
            .unwrap_or_else(|| DEFAULT_KIND.to_string());
        if let Some(strategy) = self.combine_strategy {
            spec.combine_strategy = strategy
                .parse::<CombineStrategy>()
                .map_err(|e| load_error(format!("input '{name}': {e}")))?;
        }
        if let Some(schema) = self.schema {
            spec.schema = Some(
                ArtifactSchema::from_value(&schema)
                    .map_err(|e| load_error(format!("input '{name}' schema: {e}")))?,
            );
        }
        spec.optional = self.optional || self.required == Some(false);
        spec.metadata = self.metadata;
        spec.metadata.extend(self.extra);
        Ok(spec)
    }
}
