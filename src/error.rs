//! Error types with fix suggestions
//!
//! - `TraktError`: every failure the engine can raise, with a stable code
//! - `ErrorKind`: the coarse taxonomy recorded in run manifests
//! - `DefinitionIssue`: one static validation finding (collected, never raised alone)

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

/// Coarse error classification, serialized into the manifest error payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Definition,
    UnresolvedReference,
    SchemaMismatch,
    ContractViolation,
    QualityViolation,
    Adapter,
    Step,
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Definition => "definition",
            ErrorKind::UnresolvedReference => "unresolved_reference",
            ErrorKind::SchemaMismatch => "schema_mismatch",
            ErrorKind::ContractViolation => "contract_violation",
            ErrorKind::QualityViolation => "quality_violation",
            ErrorKind::Adapter => "adapter",
            ErrorKind::Step => "step",
            ErrorKind::Io => "io",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum TraktError {
    // ─────────────────────────────────────────────────────────────
    // Pipeline definition errors (TRAKT-001 to TRAKT-009)
    // ─────────────────────────────────────────────────────────────
    #[error("TRAKT-001: YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("TRAKT-002: Invalid pipeline file: {reason}")]
    PipelineLoad { reason: String },

    #[error("TRAKT-003: Step '{step_id}' uses unknown step '{uses}'")]
    UnknownStep {
        step_id: String,
        uses: String,
        available: Vec<String>,
    },

    #[error("TRAKT-004: Pipeline '{pipeline}' is invalid:\n{}", format_issues(.issues))]
    InvalidPipeline {
        pipeline: String,
        issues: Vec<DefinitionIssue>,
    },

    #[error("TRAKT-005: Invalid override: {reason}")]
    InvalidOverride { reason: String },

    #[error("TRAKT-006: Invalid configuration: {reason}")]
    Config { reason: String },

    // ─────────────────────────────────────────────────────────────
    // Binding and contract errors (TRAKT-010 to TRAKT-019)
    // ─────────────────────────────────────────────────────────────
    #[error("TRAKT-010: Step '{step_id}' references unknown artifact '{artifact}'")]
    UnresolvedReference { step_id: String, artifact: String },

    #[error("TRAKT-011: Contract violation: {details}")]
    ContractViolation { details: String },

    #[error("TRAKT-012: Artifact '{artifact}' is already bound in the run environment")]
    ArtifactCollision { artifact: String },

    #[error("TRAKT-013: Missing call argument '{name}'")]
    MissingArgument { name: String },

    // ─────────────────────────────────────────────────────────────
    // Data errors (TRAKT-020 to TRAKT-029)
    // ─────────────────────────────────────────────────────────────
    #[error("TRAKT-020: Schema mismatch for '{artifact}' in {file}: {details}")]
    SchemaMismatch {
        artifact: String,
        file: String,
        details: String,
    },

    #[error("TRAKT-021: Quality gate '{gate}' failed: {message}")]
    QualityViolation {
        gate: String,
        message: String,
        details: serde_json::Value,
    },

    #[error("TRAKT-022: {policy} policy failed: {message}")]
    Policy {
        policy: &'static str,
        message: String,
    },

    // ─────────────────────────────────────────────────────────────
    // Adapter / IO errors (TRAKT-030 to TRAKT-039)
    // ─────────────────────────────────────────────────────────────
    #[error("TRAKT-030: No adapter registered for kind '{kind}'")]
    UnknownAdapter { kind: String, available: Vec<String> },

    #[error("TRAKT-031: No files found for input '{artifact}' (source: {source_spec})")]
    NoInputFiles {
        artifact: String,
        source_spec: String,
    },

    #[error("TRAKT-032: Adapter error on {path}: {reason}")]
    Adapter { path: String, reason: String },

    #[error("TRAKT-033: IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TRAKT-034: JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Step errors (TRAKT-040 to TRAKT-049)
    // ─────────────────────────────────────────────────────────────
    #[error("TRAKT-040: {message}")]
    StepFailed { message: String },

    #[error("Step '{step_id}' failed: {source}")]
    InStep {
        step_id: String,
        #[source]
        source: Box<TraktError>,
    },
}

fn format_issues(issues: &[DefinitionIssue]) -> String {
    issues
        .iter()
        .map(|issue| format!("  - {issue}"))
        .collect::<Vec<_>>()
        .join("\n")
}

impl TraktError {
    /// Shorthand for step logic failures
    pub fn step(message: impl Into<String>) -> Self {
        TraktError::StepFailed {
            message: message.into(),
        }
    }

    pub fn contract(details: impl Into<String>) -> Self {
        TraktError::ContractViolation {
            details: details.into(),
        }
    }

    pub fn policy(policy: &'static str, message: impl Into<String>) -> Self {
        TraktError::Policy {
            policy,
            message: message.into(),
        }
    }

    pub fn adapter(path: impl std::fmt::Display, reason: impl std::fmt::Display) -> Self {
        TraktError::Adapter {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Attribute this error to a step. The innermost step wins.
    pub fn in_step(self, step_id: &str) -> Self {
        match self {
            TraktError::InStep { .. } => self,
            other => TraktError::InStep {
                step_id: step_id.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// The step this error is attributed to, if any
    pub fn step_id(&self) -> Option<&str> {
        match self {
            TraktError::InStep { step_id, .. } => Some(step_id),
            TraktError::UnresolvedReference { step_id, .. } => Some(step_id),
            _ => None,
        }
    }

    /// The error without step attribution
    pub fn root(&self) -> &TraktError {
        match self {
            TraktError::InStep { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TraktError::YamlParse(_)
            | TraktError::PipelineLoad { .. }
            | TraktError::UnknownStep { .. }
            | TraktError::InvalidPipeline { .. }
            | TraktError::InvalidOverride { .. }
            | TraktError::Config { .. } => ErrorKind::Definition,
            TraktError::UnresolvedReference { .. } => ErrorKind::UnresolvedReference,
            TraktError::ContractViolation { .. }
            | TraktError::ArtifactCollision { .. }
            | TraktError::MissingArgument { .. } => ErrorKind::ContractViolation,
            TraktError::SchemaMismatch { .. } => ErrorKind::SchemaMismatch,
            TraktError::QualityViolation { .. } => ErrorKind::QualityViolation,
            TraktError::UnknownAdapter { .. }
            | TraktError::NoInputFiles { .. }
            | TraktError::Adapter { .. } => ErrorKind::Adapter,
            TraktError::Io(_) => ErrorKind::Io,
            TraktError::Json(_) => ErrorKind::Io,
            TraktError::StepFailed { .. } | TraktError::Policy { .. } => ErrorKind::Step,
            TraktError::InStep { source, .. } => source.kind(),
        }
    }

    /// Message without the step prefix, as recorded in the manifest
    pub fn detail_message(&self) -> String {
        self.root().to_string()
    }
}

impl FixSuggestion for TraktError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            TraktError::YamlParse(_) => Some("Check YAML syntax: indentation and quoting"),
            TraktError::PipelineLoad { .. } => {
                Some("Check the pipeline keys: name, execution, inputs, steps, outputs")
            }
            TraktError::UnknownStep { .. } => {
                Some("Register the step in the StepRegistry or fix the 'uses' name")
            }
            TraktError::InvalidPipeline { .. } => {
                Some("Fix every listed issue; run `trakt validate` to re-check")
            }
            TraktError::InvalidOverride { .. } => {
                Some("Use STEP.PARAM=VALUE on an existing {const: ...} binding")
            }
            TraktError::Config { .. } => Some("Check trakt.toml and TRAKT_* environment variables"),
            TraktError::UnresolvedReference { .. } => {
                Some("Declare the artifact as an input or produce it in an earlier step")
            }
            TraktError::ContractViolation { .. } => {
                Some("Return a mapping whose keys match the step's output bindings")
            }
            TraktError::ArtifactCollision { .. } => {
                Some("Give every produced artifact a unique name")
            }
            TraktError::MissingArgument { .. } => Some("Bind the argument under the step's with: block"),
            TraktError::SchemaMismatch { .. } => Some(
                "Align the input files' columns or use combine_strategy: union_by_name",
            ),
            TraktError::QualityViolation { .. } => {
                Some("Fix the data or switch the gate to mode: warn")
            }
            TraktError::Policy { .. } => Some("Check the policy keys against the input columns"),
            TraktError::UnknownAdapter { .. } => Some("Use a registered input kind such as 'csv'"),
            TraktError::NoInputFiles { .. } => {
                Some("Check the input uri, --input-dir, or mark the input optional: true")
            }
            TraktError::Adapter { .. } => Some("Check file format and adapter options"),
            TraktError::Io(_) => Some("Check file path and permissions"),
            TraktError::Json(_) => None,
            TraktError::StepFailed { .. } => None,
            TraktError::InStep { source, .. } => source.fix_suggestion(),
        }
    }
}

// ============================================================================
// DEFINITION ISSUES
// ============================================================================

/// Severity of a validation issue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// A single static validation finding
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DefinitionIssue {
    #[error("Invalid execution mode '{mode}' (expected 'batch' or 'stream')")]
    InvalidExecutionMode { mode: String },

    #[error("Invalid identifier '{name}' for {what}")]
    InvalidIdentifier { what: &'static str, name: String },

    #[error("Duplicate step id '{step_id}'")]
    DuplicateStepId { step_id: String },

    #[error("Step '{step_id}' ({uses}) does not support {mode} execution")]
    StepModeIncompatible {
        step_id: String,
        uses: String,
        mode: String,
    },

    #[error(
        "Input '{artifact}' uses combine_strategy='{strategy}' but stream mode requires combine_strategy='concat'"
    )]
    StreamCombineIncompatible { artifact: String, strategy: String },

    #[error("Step '{step_id}' references unknown artifact '{artifact}'")]
    UnresolvedReference { step_id: String, artifact: String },

    #[error("Step '{step_id}' is missing a binding for declared {role} '{name}'")]
    MissingBinding {
        step_id: String,
        role: &'static str,
        name: String,
    },

    #[error("Step '{step_id}' binds output key '{key}' as a call argument")]
    OutputBindingAsArgument { step_id: String, key: String },

    #[error("Step '{step_id}' output binding '{key}' must name artifacts: {reason}")]
    InvalidOutputBinding {
        step_id: String,
        key: String,
        reason: String,
    },

    #[error("Step '{step_id}' output '{artifact}' is already defined by {owner}")]
    OutputCollision {
        step_id: String,
        artifact: String,
        owner: String,
    },

    #[error("Output '{output}' references unknown artifact '{source_artifact}'")]
    UnknownOutputSource {
        output: String,
        source_artifact: String,
    },

    #[error("Required input '{artifact}' is never used")]
    UnusedInput { artifact: String },

    #[error("Stream artifact '{artifact}' is consumed {count} times (streams are single-pass)")]
    StreamFanOut { artifact: String, count: usize },

    #[error("Step '{step_id}' has invalid configuration: {reason}")]
    InvalidStepConfig { step_id: String, reason: String },

    #[error("Unknown field '{field}' in {location}")]
    UnknownField {
        location: String,
        field: String,
        severity: Severity,
    },
}

impl DefinitionIssue {
    pub fn severity(&self) -> Severity {
        match self {
            DefinitionIssue::UnknownField { severity, .. } => *severity,
            _ => Severity::Error,
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity() == Severity::Error
    }
}
