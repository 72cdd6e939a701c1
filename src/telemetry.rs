//! Telemetry boundary
//!
//! The engine hands finished spans to a `TelemetrySink`: one root span per run
//! (`pipeline.run`) and one child span per executed step (`step.<id>`). Spans
//! are derived from the finalized manifest, so stream row counts and late
//! metrics are included. Exporters live behind the trait.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};

use crate::event_log::Event;
use crate::manifest::RunManifest;
use crate::value::Metadata;

pub const ROOT_SPAN: &str = "pipeline.run";

/// A finished span
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpanRecord {
    pub name: String,
    pub attributes: IndexMap<String, Value>,
    /// Warning-class events emitted while the span was active
    pub events: Vec<Event>,
    pub duration_ms: f64,
}

impl SpanRecord {
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }
}

pub trait TelemetrySink: Send + Sync {
    fn record_span(&self, span: SpanRecord);
}

/// Logs spans through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn record_span(&self, span: SpanRecord) {
        let attributes = Value::Object(span.attributes.into_iter().collect());
        tracing::info!(
            span = %span.name,
            duration_ms = span.duration_ms,
            warnings = span.events.len(),
            %attributes,
            "span finished"
        );
    }
}

/// Keeps spans in memory
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    spans: Arc<Mutex<Vec<SpanRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spans(&self) -> Vec<SpanRecord> {
        self.spans.lock().clone()
    }

    pub fn span(&self, name: &str) -> Option<SpanRecord> {
        self.spans.lock().iter().find(|s| s.name == name).cloned()
    }
}

impl TelemetrySink for MemorySink {
    fn record_span(&self, span: SpanRecord) {
        self.spans.lock().push(span);
    }
}

/// Numeric and boolean metrics as `metric.<name>` attributes
pub fn metric_attributes(metrics: &Metadata) -> IndexMap<String, Value> {
    metrics
        .iter()
        .filter(|(_, v)| v.is_number() || v.is_boolean())
        .map(|(k, v)| (format!("metric.{k}"), v.clone()))
        .collect()
}

/// Root span first, then one span per step in execution order
pub fn spans_from_manifest(manifest: &RunManifest) -> Vec<SpanRecord> {
    let mut step_events: IndexMap<&str, Vec<Event>> = manifest
        .steps
        .iter()
        .map(|s| (s.step_id.as_str(), Vec::new()))
        .collect();
    let mut root_events = Vec::new();
    for event in manifest.warnings() {
        match event
            .step_id
            .as_deref()
            .and_then(|id| step_events.get_mut(id))
        {
            Some(events) => events.push(event.clone()),
            None => root_events.push(event.clone()),
        }
    }

    let mut root = IndexMap::new();
    root.insert("pipeline.name".to_string(), json!(manifest.pipeline.name));
    root.insert("pipeline.version".to_string(), json!(manifest.pipeline.version));
    root.insert(
        "pipeline.execution_mode".to_string(),
        json!(manifest.execution_mode),
    );
    root.insert("run.id".to_string(), json!(manifest.run_id));
    root.insert("status".to_string(), json!(manifest.status));
    root.insert("duration.ms".to_string(), json!(manifest.duration_ms));
    if let Some(error) = &manifest.error {
        root.insert("error.type".to_string(), json!(error.kind));
        root.insert("error.message".to_string(), json!(error.message));
    }

    let mut spans = vec![SpanRecord {
        name: ROOT_SPAN.to_string(),
        attributes: root,
        events: root_events,
        duration_ms: manifest.duration_ms,
    }];

    for step in &manifest.steps {
        let mut attributes = IndexMap::new();
        attributes.insert("step.id".to_string(), json!(step.step_id));
        attributes.insert("step.inputs".to_string(), json!(step.inputs));
        attributes.insert("step.outputs".to_string(), json!(step.outputs));
        attributes.insert("rows.in".to_string(), json!(step.rows_in));
        attributes.insert("rows.out".to_string(), json!(step.rows_out));
        attributes.insert("duration.ms".to_string(), json!(step.duration_ms));
        attributes.extend(metric_attributes(&step.metrics));
        spans.push(SpanRecord {
            name: format!("step.{}", step.step_id),
            attributes,
            events: step_events.shift_remove(step.step_id.as_str()).unwrap_or_default(),
            duration_ms: step.duration_ms,
        });
    }
    spans
}

/// Push every span of a finished run to the sink
pub fn export_run(sink: &dyn TelemetrySink, manifest: &RunManifest) {
    for span in spans_from_manifest(manifest) {
        sink.record_span(span);
    }
}
