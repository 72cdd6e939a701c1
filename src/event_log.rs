//! Run event log
//!
//! - Event: envelope with id + timestamp + name + optional step + attributes
//! - EventLog: thread-safe, append-only log shared through `RunContext`
//!
//! Engine lifecycle events use the names in [`names`]; steps may emit any
//! other name. Names starting with `warning.` (or mentioning coercions /
//! missing columns) are warning-class and get attached to telemetry spans.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Engine lifecycle event names
pub mod names {
    pub const PIPELINE_STARTED: &str = "pipeline.started";
    pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
    pub const PIPELINE_FAILED: &str = "pipeline.failed";
    pub const INPUT_LOADED: &str = "input.loaded";
    pub const STEP_STARTED: &str = "step.started";
    pub const STEP_COMPLETED: &str = "step.completed";
    pub const OUTPUT_WRITTEN: &str = "output.written";
    pub const OUTPUT_FAILED: &str = "output.failed";
    pub const QUALITY_GATE_WARNING: &str = "warning.quality_gate";
    pub const OPTIONAL_INPUT_UNREADABLE: &str = "warning.optional_input_unreadable";
    pub const JOIN_UNMATCHED_WARNING: &str = "warning.join_unmatched";
    pub const RENAME_OPTIONAL_MISSING: &str = "warning.rename_optional_missing";
}

/// Single event in the run log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Monotonic sequence ID (for ordering)
    pub id: u64,
    /// Time since run start (ms)
    pub timestamp_ms: u64,
    pub name: String,
    /// Step that was active when the event was emitted
    pub step_id: Option<String>,
    pub attributes: Value,
}

impl Event {
    pub fn is_warning(&self) -> bool {
        is_warning_name(&self.name)
    }
}

pub fn is_warning_name(name: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    lowered.starts_with("warning.") || lowered.contains("coercion") || lowered.contains("missing_column")
}

/// Thread-safe, append-only event log
#[derive(Clone)]
pub struct EventLog {
    events: Arc<RwLock<Vec<Event>>>,
    start_time: Instant,
    next_id: Arc<AtomicU64>,
}

impl EventLog {
    /// Create a new event log (call at run start)
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            start_time: Instant::now(),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Append an event, returns its ID
    pub fn emit(&self, name: &str, step_id: Option<&str>, attributes: Value) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let event = Event {
            id,
            timestamp_ms: self.start_time.elapsed().as_millis() as u64,
            name: name.to_string(),
            step_id: step_id.map(str::to_string),
            attributes,
        };

        self.events.write().push(event);
        id
    }

    /// Get all events (cloned)
    pub fn events(&self) -> Vec<Event> {
        self.events.read().clone()
    }

    /// Events emitted while a given step was active
    pub fn filter_step(&self, step_id: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.step_id.as_deref() == Some(step_id))
            .collect()
    }

    pub fn filter_name(&self, name: &str) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.name == name)
            .collect()
    }

    pub fn warnings(&self) -> Vec<Event> {
        self.events().into_iter().filter(Event::is_warning).collect()
    }

    /// Serialize to JSON for persistence/debugging
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self.events()).unwrap_or(Value::Null)
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn eventlog_emit_returns_monotonic_ids() {
        let log = EventLog::new();
        let id1 = log.emit(names::PIPELINE_STARTED, None, json!({}));
        let id2 = log.emit(names::STEP_STARTED, Some("clean"), json!({}));
        assert_eq!((id1, id2), (0, 1));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn eventlog_filter_step_returns_only_matching() {
        let log = EventLog::new();
        log.emit(names::STEP_STARTED, Some("alpha"), json!({}));
        log.emit(names::STEP_STARTED, Some("beta"), json!({}));
        log.emit(names::STEP_COMPLETED, Some("alpha"), json!({"rows_out": 3}));

        let alpha = log.filter_step("alpha");
        assert_eq!(alpha.len(), 2);
        assert_eq!(alpha[1].attributes["rows_out"], 3);
        assert_eq!(log.filter_name(names::STEP_STARTED).len(), 2);
    }

    #[test]
    fn eventlog_warning_classification() {
        assert!(is_warning_name("warning.quality_gate"));
        assert!(is_warning_name("schema.dtype_coercion"));
        assert!(is_warning_name("input.missing_column"));
        assert!(!is_warning_name("step.completed"));

        let log = EventLog::new();
        log.emit(names::QUALITY_GATE_WARNING, Some("gate"), json!({}));
        log.emit(names::STEP_COMPLETED, Some("gate"), json!({}));
        assert_eq!(log.warnings().len(), 1);
    }

    #[test]
    fn eventlog_to_json() {
        let log = EventLog::new();
        log.emit("custom.thing", Some("s1"), json!({"k": "v"}));
        let json = log.to_json();
        assert_eq!(json[0]["name"], "custom.thing");
        assert_eq!(json[0]["step_id"], "s1");
        assert_eq!(json[0]["attributes"]["k"], "v");
    }

    #[test]
    fn eventlog_is_clone_and_shared() {
        let log = EventLog::new();
        let cloned = log.clone();
        log.emit(names::PIPELINE_STARTED, None, json!({}));
        assert_eq!(cloned.len(), 1);
    }

    #[test]
    fn eventlog_thread_safe_concurrent_emits() {
        use std::thread;

        let log = EventLog::new();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let log = log.clone();
                thread::spawn(move || {
                    for _ in 0..10 {
                        log.emit("custom.tick", None, json!({ "thread": i }));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let events = log.events();
        assert_eq!(events.len(), 80);
        let mut ids: Vec<u64> = events.iter().map(|e| e.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 80);
    }
}
