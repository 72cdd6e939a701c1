//! Builder patterns for programmatic pipeline construction
//!
//! Builds the same `Pipeline` YAML loading produces and validates it on
//! `build`.

use indexmap::IndexMap;
use serde_json::Value;

use crate::artifact::{ArtifactSpec, ExecutionMode, OutputSpec};
use crate::binding::BindingNode;
use crate::error::TraktError;
use crate::pipeline::{Pipeline, PipelineStep, DEFAULT_PIPELINE_NAME};
use crate::step::StepRegistry;

// ============================================================================
// PIPELINE BUILDER
// ============================================================================

/// Fluent builder for pipelines
pub struct PipelineBuilder<'r> {
    registry: &'r StepRegistry,
    name: String,
    version: Option<String>,
    mode: ExecutionMode,
    strict: bool,
    inputs: IndexMap<String, ArtifactSpec>,
    steps: Vec<PipelineStep>,
    outputs: IndexMap<String, OutputSpec>,
}

impl<'r> PipelineBuilder<'r> {
    /// Steps added later are resolved against `registry`
    pub fn new(registry: &'r StepRegistry) -> Self {
        Self {
            registry,
            name: DEFAULT_PIPELINE_NAME.to_string(),
            version: None,
            mode: ExecutionMode::Batch,
            strict: false,
            inputs: IndexMap::new(),
            steps: Vec::new(),
            outputs: IndexMap::new(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Declare an input
    pub fn input(mut self, spec: ArtifactSpec) -> Self {
        self.inputs.insert(spec.name.clone(), spec);
        self
    }

    /// Add a step using StepBuilder
    pub fn step<F>(mut self, id: &str, uses: &str, f: F) -> Result<Self, TraktError>
    where
        F: FnOnce(StepBuilder) -> StepBuilder,
    {
        let handler = self
            .registry
            .get(uses)
            .ok_or_else(|| TraktError::UnknownStep {
                step_id: id.to_string(),
                uses: uses.to_string(),
                available: self.registry.names(),
            })?;
        let builder = f(StepBuilder::default());
        self.steps
            .push(PipelineStep::new(id, uses.trim(), handler, builder.bindings));
        Ok(self)
    }

    /// Declare an output from an artifact
    pub fn output(mut self, spec: OutputSpec) -> Self {
        self.outputs.insert(spec.name.clone(), spec);
        self
    }

    /// Build without validating
    pub fn build_unchecked(self) -> Pipeline {
        Pipeline {
            name: self.name,
            version: self.version,
            execution_mode: self.mode.as_str().to_string(),
            strict: self.strict,
            inputs: self.inputs,
            steps: self.steps,
            outputs: self.outputs,
            unknown_fields: Vec::new(),
        }
    }

    /// Build and validate
    pub fn build(self) -> Result<Pipeline, TraktError> {
        let pipeline = self.build_unchecked();
        pipeline.validate().into_result(&pipeline.name)?;
        Ok(pipeline)
    }
}

// ============================================================================
// STEP BUILDER
// ============================================================================

/// Collects the `with:` block of one step
#[derive(Debug, Default)]
pub struct StepBuilder {
    bindings: IndexMap<String, BindingNode>,
}

impl StepBuilder {
    /// Bind an argument to an artifact
    pub fn arg(mut self, name: impl Into<String>, artifact: impl Into<String>) -> Self {
        self.bindings
            .insert(name.into(), BindingNode::reference(artifact));
        self
    }

    /// Bind an argument to a literal (strings stay strings)
    pub fn literal(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.bindings.insert(name.into(), BindingNode::literal(value));
        self
    }

    /// Bind any binding tree
    pub fn binding(mut self, name: impl Into<String>, node: BindingNode) -> Self {
        self.bindings.insert(name.into(), node);
        self
    }

    /// Bind an output key to an artifact
    pub fn output(self, key: impl Into<String>, artifact: impl Into<String>) -> Self {
        self.arg(key, artifact)
    }
}
