//! Run context handed to every step
//!
//! Cheap to clone (`Arc` inner). Holds run identity, free-form metadata, the
//! event log, the currently active step, and metrics reported after a step
//! returned (stream steps finish their work when their output is drained).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;

use crate::event_log::{is_warning_name, EventLog};
use crate::value::Metadata;

#[derive(Clone, Debug)]
pub struct RunContext {
    inner: Arc<ContextInner>,
}

#[derive(Debug)]
struct ContextInner {
    run_id: String,
    pipeline_name: String,
    pipeline_version: Option<String>,
    started_at: DateTime<Utc>,
    metadata: RwLock<Metadata>,
    events: EventLog,
    active_step: RwLock<Option<String>>,
    deferred_metrics: RwLock<Vec<(String, Metadata)>>,
}

impl RunContext {
    pub fn new(
        run_id: impl Into<String>,
        pipeline_name: impl Into<String>,
        pipeline_version: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                run_id: run_id.into(),
                pipeline_name: pipeline_name.into(),
                pipeline_version,
                started_at: Utc::now(),
                metadata: RwLock::new(Metadata::new()),
                events: EventLog::new(),
                active_step: RwLock::new(None),
                deferred_metrics: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn with_metadata(self, metadata: Metadata) -> Self {
        self.inner.metadata.write().extend(metadata);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn pipeline_name(&self) -> &str {
        &self.inner.pipeline_name
    }

    pub fn pipeline_version(&self) -> Option<&str> {
        self.inner.pipeline_version.as_deref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub fn metadata(&self, key: &str) -> Option<Value> {
        self.inner.metadata.read().get(key).cloned()
    }

    pub fn set_metadata(&self, key: impl Into<String>, value: Value) {
        self.inner.metadata.write().insert(key.into(), value);
    }

    pub fn events(&self) -> &EventLog {
        &self.inner.events
    }

    pub fn active_step(&self) -> Option<String> {
        self.inner.active_step.read().clone()
    }

    pub(crate) fn set_active_step(&self, step_id: Option<&str>) {
        *self.inner.active_step.write() = step_id.map(str::to_string);
    }

    /// Emit an event attributed to the active step (if any)
    pub fn emit_event(&self, name: &str, attributes: Value) {
        let step = self.active_step();
        self.emit_step_event(step.as_deref(), name, attributes);
    }

    /// Emit an event attributed to an explicit step. Used by lazily evaluated
    /// stream logic that runs after the step call returned.
    pub fn emit_step_event(&self, step_id: Option<&str>, name: &str, attributes: Value) {
        let attributes = match attributes {
            Value::Object(_) => attributes,
            Value::Null => Value::Object(Default::default()),
            other => serde_json::json!({ "value": other }),
        };
        if is_warning_name(name) {
            tracing::warn!(event = name, step = step_id.unwrap_or("-"), %attributes, "run event");
        } else {
            tracing::debug!(event = name, step = step_id.unwrap_or("-"), %attributes, "run event");
        }
        self.inner.events.emit(name, step_id, attributes);
    }

    /// Attach metrics to a step after it returned
    pub fn report_metrics(&self, step_id: &str, metrics: Metadata) {
        self.inner
            .deferred_metrics
            .write()
            .push((step_id.to_string(), metrics));
    }

    pub(crate) fn drain_deferred_metrics(&self) -> Vec<(String, Metadata)> {
        std::mem::take(&mut *self.inner.deferred_metrics.write())
    }
}
