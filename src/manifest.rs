//! Run manifest: the durable record of one pipeline run
//!
//! - `ManifestAssembler`: collects input, step and output records while the
//!   engine runs; stream row counts stay live (`RowCounter`) until `finish`
//! - `RunManifest`: the finalized, serializable record
//! - `write_manifest`: pretty JSON on disk
//!
//! A manifest is produced on success and on execution failure alike.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::artifact::{CombineStrategy, ExecutionMode};
use crate::context::RunContext;
use crate::error::{ErrorKind, TraktError};
use crate::event_log::Event;
use crate::value::{ChunkStream, Metadata};

// ============================================================================
// RECORDS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineInfo {
    pub name: String,
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRecord {
    pub source: String,
    pub files_read: usize,
    pub kind: String,
    pub combine_strategy: CombineStrategy,
}

/// Per-step record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub step_id: String,
    /// Artifacts the step consumed
    #[serde(default)]
    pub inputs: Vec<String>,
    pub rows_in: Option<u64>,
    pub rows_out: Option<u64>,
    pub duration_ms: f64,
    /// Artifacts the step produced
    pub outputs: Vec<String>,
    #[serde(default)]
    pub metrics: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub path: String,
    pub rows: u64,
    pub kind: String,
    pub source: String,
    /// False when writing stopped part way
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
    pub step_id: Option<String>,
}

impl From<&TraktError> for ErrorPayload {
    fn from(error: &TraktError) -> Self {
        Self {
            kind: error.kind(),
            message: error.detail_message(),
            step_id: error.step_id().map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub status: RunStatus,
    pub pipeline: PipelineInfo,
    pub execution_mode: ExecutionMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: f64,
    pub inputs: IndexMap<String, InputRecord>,
    pub steps: Vec<ManifestEntry>,
    pub outputs: IndexMap<String, OutputRecord>,
    pub events: Vec<Event>,
    pub error: Option<ErrorPayload>,
}

impl RunManifest {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    pub fn step(&self, step_id: &str) -> Option<&ManifestEntry> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Event> {
        self.events.iter().filter(|e| e.is_warning())
    }
}

/// Write the manifest as pretty JSON, creating parent directories
pub fn write_manifest(manifest: &RunManifest, path: &Path) -> Result<(), TraktError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut text = serde_json::to_string_pretty(manifest)?;
    text.push('\n');
    std::fs::write(path, text)?;
    Ok(())
}

// ============================================================================
// ROW COUNTING
// ============================================================================

/// Shared counter fed by a stream as its chunks are pulled
#[derive(Debug, Clone, Default)]
pub struct RowCounter(Arc<AtomicU64>);

impl RowCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, rows: u64) {
        self.0.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Count every chunk that passes through
    pub fn wrap(&self, stream: ChunkStream) -> ChunkStream {
        let counter = self.clone();
        stream.map_chunks(move |chunk| {
            counter.add(chunk.num_rows() as u64);
            Ok(chunk)
        })
    }
}

/// A row count that may only be known once streams are drained
#[derive(Debug, Clone, Default)]
pub enum RowCount {
    #[default]
    Unknown,
    Known(u64),
    /// Known part plus live stream counters
    Counted(u64, Vec<RowCounter>),
}

impl RowCount {
    pub fn from_parts(known: Option<u64>, counters: Vec<RowCounter>) -> Self {
        match (known, counters.is_empty()) {
            (None, true) => RowCount::Unknown,
            (Some(n), true) => RowCount::Known(n),
            (known, false) => RowCount::Counted(known.unwrap_or(0), counters),
        }
    }

    pub fn value(&self) -> Option<u64> {
        match self {
            RowCount::Unknown => None,
            RowCount::Known(n) => Some(*n),
            RowCount::Counted(base, counters) => {
                Some(base + counters.iter().map(RowCounter::get).sum::<u64>())
            }
        }
    }
}

// ============================================================================
// ASSEMBLER
// ============================================================================

/// One executed step, as reported by the engine
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub step_id: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub rows_in: RowCount,
    pub rows_out: RowCount,
    pub duration: Duration,
    pub metrics: Metadata,
}

#[derive(Debug)]
pub struct ManifestAssembler {
    ctx: RunContext,
    execution_mode: ExecutionMode,
    clock: Instant,
    inputs: IndexMap<String, InputRecord>,
    steps: Vec<StepRecord>,
    outputs: IndexMap<String, OutputRecord>,
}

impl ManifestAssembler {
    pub fn new(ctx: &RunContext, execution_mode: ExecutionMode) -> Self {
        Self {
            ctx: ctx.clone(),
            execution_mode,
            clock: Instant::now(),
            inputs: IndexMap::new(),
            steps: Vec::new(),
            outputs: IndexMap::new(),
        }
    }

    pub fn record_input(&mut self, name: impl Into<String>, record: InputRecord) {
        self.inputs.insert(name.into(), record);
    }

    pub fn record_step(&mut self, record: StepRecord) {
        self.steps.push(record);
    }

    pub fn record_output(&mut self, name: impl Into<String>, record: OutputRecord) {
        self.outputs.insert(name.into(), record);
    }

    pub fn steps_recorded(&self) -> usize {
        self.steps.len()
    }

    /// Finalize. Metrics reported after a step returned are merged into its entry.
    pub fn finish(mut self, error: Option<&TraktError>) -> RunManifest {
        for (step_id, metrics) in self.ctx.drain_deferred_metrics() {
            match self.steps.iter_mut().find(|s| s.step_id == step_id) {
                Some(step) => step.metrics.extend(metrics),
                None => tracing::debug!(step = %step_id, "metrics for a step without manifest entry"),
            }
        }

        let steps = self
            .steps
            .into_iter()
            .map(|s| ManifestEntry {
                step_id: s.step_id,
                inputs: s.inputs,
                rows_in: s.rows_in.value(),
                rows_out: s.rows_out.value(),
                duration_ms: millis(s.duration),
                outputs: s.outputs,
                metrics: s.metrics,
            })
            .collect();

        RunManifest {
            run_id: self.ctx.run_id().to_string(),
            status: if error.is_some() {
                RunStatus::Failed
            } else {
                RunStatus::Success
            },
            pipeline: PipelineInfo {
                name: self.ctx.pipeline_name().to_string(),
                version: self.ctx.pipeline_version().map(str::to_string),
            },
            execution_mode: self.execution_mode,
            started_at: self.ctx.started_at(),
            finished_at: Utc::now(),
            duration_ms: millis(self.clock.elapsed()),
            inputs: self.inputs,
            steps,
            outputs: self.outputs,
            events: self.ctx.events().events(),
            error: error.map(ErrorPayload::from),
        }
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{Cell, Table};
    use serde_json::json;
    use tempfile::TempDir;

    fn record(step_id: &str, rows_out: RowCount) -> StepRecord {
        StepRecord {
            step_id: step_id.to_string(),
            inputs: vec!["raw".into()],
            outputs: vec![format!("{step_id}_out")],
            rows_in: RowCount::Known(3),
            rows_out,
            duration: Duration::from_millis(2),
            metrics: Metadata::new(),
        }
    }

    #[test]
    fn test_stream_counts_resolve_at_finish() {
        let ctx = RunContext::new("run-1", "demo", Some("2".into()));
        let mut assembler = ManifestAssembler::new(&ctx, ExecutionMode::Stream);
        let counter = RowCounter::new();
        assembler.record_step(record("double", RowCount::from_parts(None, vec![counter.clone()])));

        let chunk = || Table::from_rows(["n"], vec![vec![Cell::Int(1)], vec![Cell::Int(2)]]).unwrap();
        let drained = counter
            .wrap(ChunkStream::from_tables(vec![chunk(), chunk()]))
            .collect_table()
            .unwrap();
        assert_eq!(drained.num_rows(), 4);

        let manifest = assembler.finish(None);
        assert!(manifest.is_success());
        assert_eq!(manifest.step("double").unwrap().rows_out, Some(4));
        assert_eq!(manifest.pipeline.version.as_deref(), Some("2"));
    }

    #[test]
    fn test_failed_run_keeps_completed_steps_and_error() {
        let ctx = RunContext::new("run-2", "demo", None);
        let mut assembler = ManifestAssembler::new(&ctx, ExecutionMode::Batch);
        assembler.record_step(record("load", RowCount::Known(3)));
        let error = TraktError::step("boom").in_step("gate");
        let manifest = assembler.finish(Some(&error));

        assert_eq!(manifest.status, RunStatus::Failed);
        assert_eq!(manifest.steps.len(), 1);
        let payload = manifest.error.unwrap();
        assert_eq!(payload.kind, ErrorKind::Step);
        assert_eq!(payload.step_id.as_deref(), Some("gate"));
        assert_eq!(payload.message, "TRAKT-040: boom");
    }

    #[test]
    fn test_deferred_metrics_are_merged() {
        let ctx = RunContext::new("run-3", "demo", None);
        let mut assembler = ManifestAssembler::new(&ctx, ExecutionMode::Stream);
        assembler.record_step(record("gate", RowCount::Unknown));
        let mut metrics = Metadata::new();
        metrics.insert("quality_checks".into(), json!(2));
        ctx.report_metrics("gate", metrics);

        let manifest = assembler.finish(None);
        assert_eq!(manifest.steps[0].metrics["quality_checks"], json!(2));
        assert_eq!(manifest.steps[0].rows_out, None);
    }

    #[test]
    fn test_manifest_json_shape() {
        let dir = TempDir::new().unwrap();
        let ctx = RunContext::new("run-4", "demo", None);
        let mut assembler = ManifestAssembler::new(&ctx, ExecutionMode::Batch);
        assembler.record_output(
            "final",
            OutputRecord {
                path: "out/final.csv".into(),
                rows: 3,
                kind: "csv".into(),
                source: "clean".into(),
                complete: true,
            },
        );
        let manifest = assembler.finish(None);
        let path = dir.path().join("nested/manifest.json");
        write_manifest(&manifest, &path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["status"], json!("success"));
        assert_eq!(value["execution_mode"], json!("batch"));
        assert_eq!(value["outputs"]["final"]["rows"], json!(3));
        assert_eq!(value["error"], serde_json::Value::Null);

        let back: RunManifest = serde_json::from_value(value).unwrap();
        assert_eq!(back.run_id, "run-4");
    }
}
