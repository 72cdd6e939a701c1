//! Trakt - declarative data pipeline engine (batch and stream)

pub mod adapter;
pub mod artifact;
pub mod binding;
pub mod builders;
pub mod combine;
pub mod config;
pub mod context;
pub mod environment;
pub mod error;
pub mod event_log;
pub mod manifest;
pub mod overrides;
pub mod paths;
pub mod pipeline;
pub mod policies;
pub mod quality_gate;
pub mod runner;
pub mod step;
pub mod table;
pub mod telemetry;
pub mod validator;
pub mod value;

pub use adapter::{Adapter, AdapterRegistry, CsvAdapter};
pub use artifact::{ArtifactSchema, ArtifactSpec, CombineStrategy, ExecutionMode, OutputSpec};
pub use binding::BindingNode;
pub use builders::{PipelineBuilder, StepBuilder};
pub use config::RunnerConfig;
pub use context::RunContext;
pub use error::{DefinitionIssue, ErrorKind, FixSuggestion, TraktError};
pub use event_log::{Event, EventLog};
pub use manifest::{RunManifest, RunStatus};
pub use pipeline::{load_pipeline, Pipeline};
pub use policies::{
    apply_dedupe_policy, apply_join_policy, apply_rename_policy, DedupePolicy, JoinPolicy,
    RenamePolicy,
};
pub use quality_gate::{QualityGate, QualityGatePolicy};
pub use runner::{RunFailure, RunOptions, RunReport, Runner};
pub use step::{FnStep, Step, StepRegistry};
pub use table::{Cell, DataType, Table};
pub use telemetry::{MemorySink, SpanRecord, TelemetrySink, TracingSink};
pub use value::{ChunkStream, StepArgs, StepValue};
