//! Pipeline runner (batch / stream execution engine)
//!
//! One `run` call:
//! 1. validates the pipeline (nothing is read on failure, no manifest)
//! 2. loads every input through the combine engine
//! 3. runs steps in declared order, binding their results to artifacts
//! 4. writes declared outputs (incrementally for streams), then drains
//!    streams no step or output read
//! 5. finalizes and writes the manifest, success or failure
//!
//! Streams are pulled lazily: a step's work on a chunk happens when a
//! downstream step or an output writer asks for the next chunk.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::adapter::AdapterRegistry;
use crate::artifact::{ArtifactSpec, ExecutionMode, OutputSpec};
use crate::binding::resolve_args;
use crate::combine;
use crate::config::RunnerConfig;
use crate::context::RunContext;
use crate::environment::Environment;
use crate::error::{ErrorKind, TraktError};
use crate::event_log::names;
use crate::manifest::{
    write_manifest, InputRecord, ManifestAssembler, OutputRecord, RowCount, RowCounter,
    RunManifest, StepRecord,
};
use crate::overrides::apply_inputs;
use crate::paths::{resolve_input_paths, resolve_output_path};
use crate::pipeline::{Pipeline, PipelineStep};
use crate::telemetry::{export_run, TelemetrySink, TracingSink};
use crate::validator::Validator;
use crate::value::{ChunkStream, Metadata, StepArgs, StepOutput, StepValue};

/// Per-run options
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Defaults to a random UUID
    pub run_id: Option<String>,
    /// Overrides the pipeline file's version
    pub pipeline_version: Option<String>,
    pub metadata: Metadata,
}

impl RunOptions {
    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn pipeline_version(mut self, version: impl Into<String>) -> Self {
        self.pipeline_version = Some(version.into());
        self
    }
}

/// A successful run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub manifest: RunManifest,
    pub manifest_path: PathBuf,
}

impl RunReport {
    /// Short JSON summary printed by the CLI
    pub fn summary(&self) -> Value {
        summary(&self.manifest, Some(&self.manifest_path))
    }
}

/// A failed run. `manifest` is `None` when validation failed before execution.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RunFailure {
    pub error: TraktError,
    pub manifest: Option<Box<RunManifest>>,
    pub manifest_path: Option<PathBuf>,
}

impl RunFailure {
    fn before_execution(error: TraktError) -> Self {
        Self {
            error,
            manifest: None,
            manifest_path: None,
        }
    }

    pub fn summary(&self) -> Option<Value> {
        self.manifest
            .as_deref()
            .map(|m| summary(m, self.manifest_path.as_ref()))
    }
}

fn summary(manifest: &RunManifest, manifest_path: Option<&PathBuf>) -> Value {
    let outputs: serde_json::Map<String, Value> = manifest
        .outputs
        .iter()
        .map(|(name, record)| (name.clone(), json!(record.path)))
        .collect();
    json!({
        "run_id": manifest.run_id,
        "status": manifest.status,
        "outputs": outputs,
        "manifest_path": manifest_path.map(|p| p.display().to_string()),
    })
}

pub struct Runner {
    config: RunnerConfig,
    adapters: AdapterRegistry,
    sink: Arc<dyn TelemetrySink>,
}

impl Runner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            adapters: AdapterRegistry::with_defaults(),
            sink: Arc::new(TracingSink),
        }
    }

    pub fn with_adapters(mut self, adapters: AdapterRegistry) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Validate and execute a pipeline, always producing a manifest once
    /// execution has started
    pub fn run(&self, pipeline: &Pipeline, options: RunOptions) -> Result<RunReport, RunFailure> {
        let mut pipeline = pipeline.clone();
        apply_inputs(&mut pipeline, &self.config.input_overrides)
            .map_err(RunFailure::before_execution)?;

        let report = Validator::new()
            .strict(pipeline.strict || self.config.strict)
            .validate(&pipeline);
        report.log_warnings();
        report
            .into_result(&pipeline.name)
            .map_err(RunFailure::before_execution)?;
        let mode = pipeline.mode().map_err(|mode| {
            RunFailure::before_execution(TraktError::PipelineLoad {
                reason: format!("invalid execution mode '{mode}'"),
            })
        })?;

        let ctx = RunContext::new(
            options
                .run_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            pipeline.name.clone(),
            options.pipeline_version.or_else(|| pipeline.version.clone()),
        )
        .with_metadata(options.metadata);

        let span = info_span!("pipeline.run", pipeline = %pipeline.name, run_id = %ctx.run_id(), mode = %mode);
        let _guard = span.enter();
        info!(steps = pipeline.steps.len(), "starting pipeline");

        let mut assembler = ManifestAssembler::new(&ctx, mode);
        ctx.emit_event(names::PIPELINE_STARTED, json!({ "execution_mode": mode }));

        let result = self.execute(&pipeline, mode, &ctx, &mut assembler);
        ctx.set_active_step(None);
        match &result {
            Ok(()) => ctx.emit_event(
                names::PIPELINE_COMPLETED,
                json!({ "steps": assembler.steps_recorded() }),
            ),
            Err(e) => {
                error!(error = %e, "pipeline failed");
                ctx.emit_event(
                    names::PIPELINE_FAILED,
                    json!({
                        "kind": e.kind(),
                        "message": e.detail_message(),
                        "step_id": e.step_id(),
                    }),
                );
            }
        }

        let manifest = assembler.finish(result.as_ref().err());
        let manifest_path = self.config.manifest_path();
        let written = write_manifest(&manifest, &manifest_path);
        export_run(self.sink.as_ref(), &manifest);

        match (result, written) {
            (Ok(()), Ok(())) => {
                info!(manifest = %manifest_path.display(), "pipeline completed");
                Ok(RunReport {
                    manifest,
                    manifest_path,
                })
            }
            (Ok(()), Err(write_error)) => Err(RunFailure {
                error: write_error,
                manifest: Some(Box::new(manifest)),
                manifest_path: None,
            }),
            (Err(error), written) => {
                let manifest_path = match written {
                    Ok(()) => Some(manifest_path),
                    Err(write_error) => {
                        warn!(error = %write_error, "failed to write manifest for failed run");
                        None
                    }
                };
                Err(RunFailure {
                    error,
                    manifest: Some(Box::new(manifest)),
                    manifest_path,
                })
            }
        }
    }

    fn execute(
        &self,
        pipeline: &Pipeline,
        mode: ExecutionMode,
        ctx: &RunContext,
        assembler: &mut ManifestAssembler,
    ) -> Result<(), TraktError> {
        let mut env = Environment::new(mode == ExecutionMode::Stream);

        for (name, spec) in &pipeline.inputs {
            self.load_input(name, spec, &mut env, ctx, assembler)?;
        }
        for step in &pipeline.steps {
            self.run_step(step, &mut env, ctx, assembler)?;
        }
        for (name, output) in &pipeline.outputs {
            self.write_output(name, output, &mut env, ctx, assembler)?;
        }
        drain_unconsumed(&mut env)
    }

    // ========================================================================
    // INPUTS
    // ========================================================================

    fn load_input(
        &self,
        name: &str,
        spec: &ArtifactSpec,
        env: &mut Environment,
        ctx: &RunContext,
        assembler: &mut ManifestAssembler,
    ) -> Result<(), TraktError> {
        let adapter = self.adapters.get(&spec.kind)?;
        let paths = resolve_input_paths(&spec.uri, &self.config.input_dir, adapter.file_extension())?;
        let record = InputRecord {
            source: spec.uri.clone(),
            files_read: paths.len(),
            kind: spec.kind.clone(),
            combine_strategy: spec.combine_strategy,
        };

        if paths.is_empty() {
            if !spec.optional {
                return Err(TraktError::NoInputFiles {
                    artifact: name.to_string(),
                    source_spec: spec.uri.clone(),
                });
            }
            debug!(input = %name, "optional input has no files");
            env.bind_absent(name)?;
            assembler.record_input(name, record);
            ctx.emit_event(
                names::INPUT_LOADED,
                json!({ "artifact": name, "files": 0, "absent": true }),
            );
            return Ok(());
        }

        let loaded = if env.is_streaming() {
            combine::load_stream(
                Arc::clone(&adapter),
                paths,
                spec,
                self.config.stream_chunk_size,
            )
            .map(StepValue::Stream)
        } else {
            combine::load_batch(adapter.as_ref(), &paths, spec).map(StepValue::from)
        };
        let value = match loaded {
            Ok(value) => value,
            Err(e) if spec.optional && e.kind() == ErrorKind::Adapter => {
                warn!(input = %name, error = %e, "optional input unreadable, treating as absent");
                let file = match &e {
                    TraktError::Adapter { path, .. } => Some(path.clone()),
                    _ => None,
                };
                ctx.emit_event(
                    names::OPTIONAL_INPUT_UNREADABLE,
                    json!({ "artifact": name, "file": file, "error": e.detail_message() }),
                );
                env.bind_absent(name)?;
                assembler.record_input(name, record);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        info!(input = %name, files = record.files_read, rows = ?value.row_count(), "input loaded");
        ctx.emit_event(
            names::INPUT_LOADED,
            json!({
                "artifact": name,
                "files": record.files_read,
                "rows": value.row_count(),
            }),
        );
        assembler.record_input(name, record);
        env.bind(name, value)
    }

    // ========================================================================
    // STEPS
    // ========================================================================

    fn run_step(
        &self,
        step: &PipelineStep,
        env: &mut Environment,
        ctx: &RunContext,
        assembler: &mut ManifestAssembler,
    ) -> Result<(), TraktError> {
        let span = info_span!("step", step_id = %step.id, uses = %step.uses);
        let _guard = span.enter();
        let in_step = |e: TraktError| e.in_step(&step.id);

        ctx.set_active_step(Some(&step.id));
        ctx.emit_event(names::STEP_STARTED, json!({ "uses": step.uses }));
        let started = Instant::now();

        let targets = step.output_targets().map_err(in_step)?;
        let args = resolve_args(step.call_bindings(), env, &step.id)?;
        let (args, rows_in) = count_stream_args(args);

        let result = step.handler().run(ctx, args).map_err(in_step)?;
        let StepOutput {
            mut values,
            metrics,
        } = StepOutput::from_value(result).map_err(in_step)?;

        let mut produced = Vec::new();
        let mut known_rows: Option<u64> = None;
        let mut counters = Vec::new();
        for (key, target) in &targets {
            let value = values.shift_remove(key).ok_or_else(|| {
                in_step(TraktError::contract(format!(
                    "step result has no value for output key '{key}'"
                )))
            })?;
            for (artifact, value) in target.bind(key, value).map_err(in_step)? {
                let value = track_streams(value, &step.id, &mut counters);
                if let Some(rows) = value.row_count() {
                    known_rows = Some(known_rows.unwrap_or(0) + rows);
                }
                env.bind(artifact.clone(), value).map_err(in_step)?;
                produced.push(artifact);
            }
        }
        for ignored in values.keys() {
            debug!(key = %ignored, "result key without output binding ignored");
        }

        let duration = started.elapsed();
        info!(outputs = ?produced, duration_ms = duration.as_secs_f64() * 1000.0, "step completed");
        ctx.emit_event(
            names::STEP_COMPLETED,
            json!({ "outputs": produced, "duration_ms": duration.as_secs_f64() * 1000.0 }),
        );
        assembler.record_step(StepRecord {
            step_id: step.id.clone(),
            inputs: step
                .consumed_artifacts()
                .into_iter()
                .map(str::to_string)
                .collect(),
            outputs: produced,
            rows_in,
            rows_out: RowCount::from_parts(known_rows, counters),
            duration,
            metrics,
        });
        ctx.set_active_step(None);
        Ok(())
    }

    // ========================================================================
    // OUTPUTS
    // ========================================================================

    fn write_output(
        &self,
        name: &str,
        output: &OutputSpec,
        env: &mut Environment,
        ctx: &RunContext,
        assembler: &mut ManifestAssembler,
    ) -> Result<(), TraktError> {
        let kind = output
            .kind
            .as_deref()
            .unwrap_or(&self.config.output_kind)
            .trim()
            .to_ascii_lowercase();
        let adapter = self.adapters.get(&kind)?;
        let path = resolve_output_path(
            output.uri.as_deref(),
            name,
            &self.config.output_dir,
            adapter.file_extension(),
        );
        let value = env.lend(&output.source).ok_or_else(|| TraktError::UnresolvedReference {
            step_id: format!("output '{name}'"),
            artifact: output.source.clone(),
        })?;

        let mut rows = 0u64;
        let written = match value {
            StepValue::Table(table) => {
                let result = adapter.write(&table, &path, &output.metadata);
                if result.is_ok() {
                    rows = table.num_rows() as u64;
                }
                result
            }
            StepValue::Stream(stream) => {
                adapter.write_stream(stream, &path, &output.metadata, &mut |n: usize| rows += n as u64)
            }
            other => Err(TraktError::contract(format!(
                "output '{name}' source '{}' is a {}, expected a table or stream",
                output.source,
                other.type_name()
            ))),
        };

        let complete = written.is_ok();
        assembler.record_output(
            name,
            OutputRecord {
                path: path.display().to_string(),
                rows,
                kind,
                source: output.source.clone(),
                complete,
            },
        );
        match written {
            Ok(()) => {
                info!(output = %name, path = %path.display(), rows, "output written");
                ctx.emit_event(
                    names::OUTPUT_WRITTEN,
                    json!({ "output": name, "path": path.display().to_string(), "rows": rows }),
                );
                Ok(())
            }
            Err(e) => {
                ctx.emit_event(
                    names::OUTPUT_FAILED,
                    json!({ "output": name, "path": path.display().to_string(), "rows_written": rows }),
                );
                Err(e)
            }
        }
    }
}

/// Count rows flowing into a step through its stream arguments
fn count_stream_args(args: StepArgs) -> (StepArgs, RowCount) {
    let known = args.row_count();
    let mut counters = Vec::new();
    let args = args
        .into_inner()
        .into_iter()
        .map(|(name, value)| {
            let value = value.map_streams(&mut |stream: ChunkStream| {
                let counter = RowCounter::new();
                counters.push(counter.clone());
                counter.wrap(stream)
            });
            (name, value)
        })
        .collect();
    (args, RowCount::from_parts(known, counters))
}

/// Attribute lazily raised errors to the producing step and count its rows
fn track_streams(value: StepValue, step_id: &str, counters: &mut Vec<RowCounter>) -> StepValue {
    value.map_streams(&mut |stream: ChunkStream| {
        let counter = RowCounter::new();
        counters.push(counter.clone());
        let step_id = step_id.to_string();
        counter
            .wrap(stream)
            .map_errors(move |e| e.in_step(&step_id))
    })
}

/// Pull every stream nothing read, one chunk at a time, so lazy step
/// logic (quality gates included) runs before the run is declared done.
fn drain_unconsumed(env: &mut Environment) -> Result<(), TraktError> {
    let pending: Vec<String> = env
        .names()
        .filter(|name| env.get(name).is_some_and(StepValue::contains_stream))
        .map(str::to_string)
        .collect();
    for name in pending {
        if let Some(value) = env.take(&name) {
            let rows = drain_value(value)?;
            debug!(artifact = %name, rows, "unconsumed stream drained");
        }
    }
    Ok(())
}

fn drain_value(value: StepValue) -> Result<u64, TraktError> {
    match value {
        StepValue::Stream(stream) => {
            let mut rows = 0;
            for chunk in stream {
                rows += chunk?.num_rows() as u64;
            }
            Ok(rows)
        }
        StepValue::List(items) => items.into_iter().map(drain_value).sum(),
        StepValue::Map(entries) => entries.into_values().map(drain_value).sum(),
        StepValue::Table(_) | StepValue::Literal(_) => Ok(0),
    }
}
