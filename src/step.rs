//! Step handlers and the step registry
//!
//! A step is a unit of transformation logic. The engine only sees it through
//! the `Step` trait: declared inputs/outputs, mode capabilities, and `run`.
//! Handlers are looked up by name in an explicit `StepRegistry`.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::binding::BindingNode;
use crate::context::RunContext;
use crate::error::TraktError;
use crate::policies::{Dedupe, Join, Rename};
use crate::quality_gate::QualityGate;
use crate::value::{StepArgs, StepValue};

/// Conventional output keys for steps that declare none
pub const DEFAULT_OUTPUT_KEYS: [&str; 2] = ["output", "outputs"];

pub trait Step: Send + Sync {
    /// Execute with resolved arguments. Must return a mapping (see `StepValue::mapping`);
    /// the reserved key `__metrics__` carries metrics.
    fn run(&self, ctx: &RunContext, args: StepArgs) -> Result<StepValue, TraktError>;

    /// Argument names that must be bound
    fn declared_inputs(&self) -> Vec<String> {
        Vec::new()
    }

    /// Output keys that must be bound
    fn declared_outputs(&self) -> Vec<String> {
        Vec::new()
    }

    fn supports_batch(&self) -> bool {
        true
    }

    fn supports_stream(&self) -> bool {
        false
    }

    /// Load-time check of the step's `with:` block
    fn check_bindings(&self, _bindings: &IndexMap<String, BindingNode>) -> Result<(), String> {
        Ok(())
    }
}

// ============================================================================
// CLOSURE STEPS
// ============================================================================

type StepFn = dyn Fn(&RunContext, StepArgs) -> Result<StepValue, TraktError> + Send + Sync;

/// A step backed by a closure
pub struct FnStep {
    func: Box<StepFn>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    batch: bool,
    stream: bool,
}

impl FnStep {
    /// Batch-only step with no declared inputs/outputs
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&RunContext, StepArgs) -> Result<StepValue, TraktError> + Send + Sync + 'static,
    {
        Self {
            func: Box::new(func),
            inputs: Vec::new(),
            outputs: Vec::new(),
            batch: true,
            stream: false,
        }
    }

    pub fn inputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn outputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = names.into_iter().map(Into::into).collect();
        self
    }

    /// Also usable in stream mode
    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    /// Usable in stream mode only
    pub fn stream_only(mut self) -> Self {
        self.stream = true;
        self.batch = false;
        self
    }
}

impl Step for FnStep {
    fn run(&self, ctx: &RunContext, args: StepArgs) -> Result<StepValue, TraktError> {
        (self.func)(ctx, args)
    }

    fn declared_inputs(&self) -> Vec<String> {
        self.inputs.clone()
    }

    fn declared_outputs(&self) -> Vec<String> {
        self.outputs.clone()
    }

    fn supports_batch(&self) -> bool {
        self.batch
    }

    fn supports_stream(&self) -> bool {
        self.stream
    }
}

impl fmt::Debug for FnStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStep")
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("batch", &self.batch)
            .field("stream", &self.stream)
            .finish()
    }
}

/// Forwards its `input` unchanged. Works in both modes.
#[derive(Debug, Default)]
pub struct Passthrough;

impl Step for Passthrough {
    fn run(&self, _ctx: &RunContext, mut args: StepArgs) -> Result<StepValue, TraktError> {
        let input = args.take("input")?;
        Ok(StepValue::mapping([("output", input)]))
    }

    fn declared_inputs(&self) -> Vec<String> {
        vec!["input".to_string()]
    }

    fn declared_outputs(&self) -> Vec<String> {
        vec!["output".to_string()]
    }

    fn supports_stream(&self) -> bool {
        true
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Name -> handler lookup, built explicitly by the caller
#[derive(Clone, Default)]
pub struct StepRegistry {
    steps: IndexMap<String, Arc<dyn Step>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the bundled steps
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let gate: Arc<dyn Step> = Arc::new(QualityGate);
        registry.register_shared("trakt.steps.quality_gate", Arc::clone(&gate));
        registry.register_shared("quality_gate", gate);
        let passthrough: Arc<dyn Step> = Arc::new(Passthrough);
        registry.register_shared("trakt.steps.passthrough", Arc::clone(&passthrough));
        registry.register_shared("passthrough", passthrough);
        let policies: [(&str, Arc<dyn Step>); 3] = [
            ("join", Arc::new(Join)),
            ("dedupe", Arc::new(Dedupe)),
            ("rename", Arc::new(Rename)),
        ];
        for (name, step) in policies {
            registry.register_shared(format!("trakt.steps.{name}"), Arc::clone(&step));
            registry.register_shared(name, step);
        }
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, step: impl Step + 'static) -> &mut Self {
        self.register_shared(name, Arc::new(step))
    }

    pub fn register_shared(&mut self, name: impl Into<String>, step: Arc<dyn Step>) -> &mut Self {
        self.steps.insert(name.into(), step);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Step>> {
        self.steps.get(name.trim()).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.steps.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.steps.contains_key(name.trim())
    }
}

impl fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepRegistry")
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .finish()
    }
}
