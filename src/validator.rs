//! Static pipeline validation
//!
//! Walks the whole definition once and collects every issue instead of
//! stopping at the first one. Runs before any input is opened.
//!
//! Checks:
//! - execution mode and per-step mode support
//! - identifiers and duplicate step ids
//! - declared input/output bindings, output-key misuse, output binding shape
//! - references resolve to an input or an earlier step's output
//! - output collisions and unknown pipeline output sources
//! - unused required inputs
//! - stream-only rules (concat inputs, single consumer per artifact)
//! - unknown fields (warnings, errors in strict mode)

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::artifact::{CombineStrategy, ExecutionMode};
use crate::binding::OutputTarget;
use crate::error::{DefinitionIssue, Severity, TraktError};
use crate::pipeline::Pipeline;

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.\-]*$").expect("valid identifier regex"));

pub fn is_valid_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

/// Issues found by one validation pass
#[derive(Debug, Default, Clone)]
pub struct ValidationReport {
    pub issues: Vec<DefinitionIssue>,
}

impl ValidationReport {
    pub fn push(&mut self, issue: DefinitionIssue) {
        self.issues.push(issue);
    }

    pub fn errors(&self) -> impl Iterator<Item = &DefinitionIssue> {
        self.issues.iter().filter(|i| i.is_error())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &DefinitionIssue> {
        self.issues.iter().filter(|i| !i.is_error())
    }

    pub fn is_ok(&self) -> bool {
        self.errors().next().is_none()
    }

    pub fn log_warnings(&self) {
        for warning in self.warnings() {
            tracing::warn!("{warning}");
        }
    }

    /// All error-severity issues as one definition error
    pub fn into_result(self, pipeline: &str) -> Result<(), TraktError> {
        let errors: Vec<DefinitionIssue> =
            self.issues.into_iter().filter(|i| i.is_error()).collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(TraktError::InvalidPipeline {
                pipeline: pipeline.to_string(),
                issues: errors,
            })
        }
    }
}

/// Pipeline validator
#[derive(Debug, Default)]
pub struct Validator {
    strict: bool,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn validate(&self, pipeline: &Pipeline) -> ValidationReport {
        let mut report = ValidationReport::default();

        let mode = match pipeline.mode() {
            Ok(mode) => Some(mode),
            Err(raw) => {
                report.push(DefinitionIssue::InvalidExecutionMode { mode: raw });
                None
            }
        };

        self.check_identifiers(pipeline, &mut report);
        self.check_steps(pipeline, mode, &mut report);
        self.check_outputs(pipeline, &mut report);
        self.check_unused_inputs(pipeline, &mut report);
        if mode == Some(ExecutionMode::Stream) {
            self.check_stream_rules(pipeline, &mut report);
        }
        self.check_unknown_fields(pipeline, &mut report);

        report
    }

    fn check_identifiers(&self, pipeline: &Pipeline, report: &mut ValidationReport) {
        for name in pipeline.inputs.keys() {
            if !is_valid_identifier(name) {
                report.push(DefinitionIssue::InvalidIdentifier {
                    what: "input",
                    name: name.clone(),
                });
            }
        }
        let mut seen = HashSet::new();
        for step in &pipeline.steps {
            if !is_valid_identifier(&step.id) {
                report.push(DefinitionIssue::InvalidIdentifier {
                    what: "step id",
                    name: step.id.clone(),
                });
            }
            if !seen.insert(step.id.as_str()) {
                report.push(DefinitionIssue::DuplicateStepId {
                    step_id: step.id.clone(),
                });
            }
        }
        for name in pipeline.outputs.keys() {
            if !is_valid_identifier(name) {
                report.push(DefinitionIssue::InvalidIdentifier {
                    what: "output",
                    name: name.clone(),
                });
            }
        }
    }

    fn check_steps(
        &self,
        pipeline: &Pipeline,
        mode: Option<ExecutionMode>,
        report: &mut ValidationReport,
    ) {
        // artifact name -> owner description, in definition order
        let mut defined: IndexMap<String, String> = pipeline
            .inputs
            .keys()
            .map(|name| (name.clone(), "pipeline input".to_string()))
            .collect();

        for step in &pipeline.steps {
            if let Some(mode) = mode {
                if !step.supports(mode) {
                    report.push(DefinitionIssue::StepModeIncompatible {
                        step_id: step.id.clone(),
                        uses: step.uses.clone(),
                        mode: mode.to_string(),
                    });
                }
            }

            for name in &step.declared_inputs {
                if step.is_output_key(name) {
                    report.push(DefinitionIssue::OutputBindingAsArgument {
                        step_id: step.id.clone(),
                        key: name.clone(),
                    });
                } else if !step.bindings.contains_key(name) {
                    report.push(DefinitionIssue::MissingBinding {
                        step_id: step.id.clone(),
                        role: "input",
                        name: name.clone(),
                    });
                }
            }
            for name in &step.declared_outputs {
                if !step.bindings.contains_key(name) {
                    report.push(DefinitionIssue::MissingBinding {
                        step_id: step.id.clone(),
                        role: "output",
                        name: name.clone(),
                    });
                }
            }

            for artifact in step.consumed_artifacts() {
                if !defined.contains_key(artifact) {
                    report.push(DefinitionIssue::UnresolvedReference {
                        step_id: step.id.clone(),
                        artifact: artifact.to_string(),
                    });
                }
            }

            if let Err(reason) = step.handler().check_bindings(&step.bindings) {
                report.push(DefinitionIssue::InvalidStepConfig {
                    step_id: step.id.clone(),
                    reason,
                });
            }

            for (key, node) in step.output_bindings() {
                let target = match OutputTarget::from_binding(node) {
                    Ok(target) => target,
                    Err(reason) => {
                        report.push(DefinitionIssue::InvalidOutputBinding {
                            step_id: step.id.clone(),
                            key: key.clone(),
                            reason,
                        });
                        continue;
                    }
                };
                for artifact in target.artifact_names() {
                    if !is_valid_identifier(artifact) {
                        report.push(DefinitionIssue::InvalidIdentifier {
                            what: "artifact",
                            name: artifact.to_string(),
                        });
                    }
                    if let Some(owner) = defined.get(artifact) {
                        report.push(DefinitionIssue::OutputCollision {
                            step_id: step.id.clone(),
                            artifact: artifact.to_string(),
                            owner: owner.clone(),
                        });
                    } else {
                        defined.insert(artifact.to_string(), format!("step '{}'", step.id));
                    }
                }
            }
        }
    }

    fn check_outputs(&self, pipeline: &Pipeline, report: &mut ValidationReport) {
        let mut defined: HashSet<&str> = pipeline.inputs.keys().map(String::as_str).collect();
        let produced: Vec<String> = pipeline
            .steps
            .iter()
            .flat_map(|s| s.produced_artifacts())
            .collect();
        defined.extend(produced.iter().map(String::as_str));

        for output in pipeline.outputs.values() {
            if !defined.contains(output.source.as_str()) {
                report.push(DefinitionIssue::UnknownOutputSource {
                    output: output.name.clone(),
                    source_artifact: output.source.clone(),
                });
            }
        }
    }

    fn check_unused_inputs(&self, pipeline: &Pipeline, report: &mut ValidationReport) {
        let mut used: HashSet<&str> = pipeline
            .steps
            .iter()
            .flat_map(|s| s.consumed_artifacts())
            .collect();
        used.extend(pipeline.outputs.values().map(|o| o.source.as_str()));

        for (name, spec) in &pipeline.inputs {
            if !spec.optional && !used.contains(name.as_str()) {
                report.push(DefinitionIssue::UnusedInput {
                    artifact: name.clone(),
                });
            }
        }
    }

    fn check_stream_rules(&self, pipeline: &Pipeline, report: &mut ValidationReport) {
        for (name, spec) in &pipeline.inputs {
            if spec.combine_strategy != CombineStrategy::Concat {
                report.push(DefinitionIssue::StreamCombineIncompatible {
                    artifact: name.clone(),
                    strategy: spec.combine_strategy.to_string(),
                });
            }
        }

        let mut consumers: HashMap<&str, usize> = HashMap::new();
        for step in &pipeline.steps {
            for artifact in step.consumed_artifacts() {
                *consumers.entry(artifact).or_default() += 1;
            }
        }
        for output in pipeline.outputs.values() {
            *consumers.entry(output.source.as_str()).or_default() += 1;
        }
        let mut fanned: Vec<(&str, usize)> = consumers
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .collect();
        fanned.sort_unstable();
        for (artifact, count) in fanned {
            report.push(DefinitionIssue::StreamFanOut {
                artifact: artifact.to_string(),
                count,
            });
        }
    }

    fn check_unknown_fields(&self, pipeline: &Pipeline, report: &mut ValidationReport) {
        for field in &pipeline.unknown_fields {
            let severity = if self.strict {
                Severity::Error
            } else if field.merged_into_metadata {
                continue;
            } else {
                Severity::Warning
            };
            report.push(DefinitionIssue::UnknownField {
                location: field.location.clone(),
                field: field.field.clone(),
                severity,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{FnStep, StepRegistry};
    use crate::value::StepValue;

    fn registry() -> StepRegistry {
        let mut registry = StepRegistry::with_builtins();
        registry.register(
            "merge",
            FnStep::new(|_, _| Ok(StepValue::Map(IndexMap::new())))
                .inputs(["left", "right"])
                .outputs(["output"]),
        );
        registry.register(
            "batch_only",
            FnStep::new(|_, _| Ok(StepValue::Map(IndexMap::new()))),
        );
        registry.register(
            "misdeclared",
            FnStep::new(|_, _| Ok(StepValue::Map(IndexMap::new())))
                .inputs(["output"])
                .outputs(["output"]),
        );
        registry
    }

    fn validate(yaml: &str) -> ValidationReport {
        Pipeline::from_yaml_str(yaml, &registry()).unwrap().validate()
    }

    fn errors(yaml: &str) -> Vec<DefinitionIssue> {
        validate(yaml).errors().cloned().collect()
    }

    #[test]
    fn test_valid_pipeline_passes() {
        let report = validate(
            r#"
inputs: {a: a.csv, b: b.csv}
steps:
  - id: m
    uses: merge
    with: {left: a, right: b, output: merged}
outputs: {final: merged}
"#,
        );
        assert!(report.is_ok(), "{:?}", report.issues);
    }

    #[test]
    fn test_all_issues_collected_in_one_pass() {
        let issues = errors(
            r#"
execution_mode: turbo
inputs: {a: a.csv, unused: u.csv}
steps:
  - id: m
    uses: merge
    with: {left: a, right: later, output: merged}
  - id: p
    uses: passthrough
    with: {input: merged, output: a}
outputs: {final: nowhere}
"#,
        );
        assert!(issues.contains(&DefinitionIssue::InvalidExecutionMode {
            mode: "turbo".into()
        }));
        assert!(issues.contains(&DefinitionIssue::UnresolvedReference {
            step_id: "m".into(),
            artifact: "later".into()
        }));
        assert!(issues.contains(&DefinitionIssue::OutputCollision {
            step_id: "p".into(),
            artifact: "a".into(),
            owner: "pipeline input".into()
        }));
        assert!(issues.contains(&DefinitionIssue::UnknownOutputSource {
            output: "final".into(),
            source_artifact: "nowhere".into()
        }));
        assert!(issues.contains(&DefinitionIssue::UnusedInput {
            artifact: "unused".into()
        }));
    }

    #[test]
    fn test_later_step_output_is_unresolved() {
        let issues = errors(
            r#"
inputs: {a: a.csv}
steps:
  - id: first
    uses: passthrough
    with: {input: second_out, output: first_out}
  - id: second
    uses: passthrough
    with: {input: a, output: second_out}
outputs: {final: first_out}
"#,
        );
        assert!(issues.contains(&DefinitionIssue::UnresolvedReference {
            step_id: "first".into(),
            artifact: "second_out".into()
        }));
    }

    #[test]
    fn test_missing_declared_bindings() {
        let issues = errors(
            r#"
inputs: {a: a.csv}
steps:
  - id: m
    uses: merge
    with: {left: a}
"#,
        );
        assert!(issues.contains(&DefinitionIssue::MissingBinding {
            step_id: "m".into(),
            role: "input",
            name: "right".into()
        }));
        assert!(issues.contains(&DefinitionIssue::MissingBinding {
            step_id: "m".into(),
            role: "output",
            name: "output".into()
        }));
    }

    #[test]
    fn test_output_binding_as_argument_rejected() {
        let issues = errors(
            r#"
inputs: {a: a.csv}
steps:
  - id: bad
    uses: misdeclared
    with: {output: a}
"#,
        );
        assert!(issues.contains(&DefinitionIssue::OutputBindingAsArgument {
            step_id: "bad".into(),
            key: "output".into()
        }));
    }

    #[test]
    fn test_literal_output_binding_rejected() {
        let issues = errors(
            r#"
inputs: {a: a.csv}
steps:
  - id: p
    uses: passthrough
    with: {input: a, output: {const: out}}
"#,
        );
        assert!(issues
            .iter()
            .any(|i| matches!(i, DefinitionIssue::InvalidOutputBinding { key, .. } if key == "output")));
    }

    #[test]
    fn test_stream_rules() {
        let issues = errors(
            r#"
execution: {mode: stream}
inputs:
  a: {uri: a.csv, combine_strategy: union_by_name}
steps:
  - id: m
    uses: batch_only
    with: {x: a, output: out}
  - id: p
    uses: passthrough
    with: {input: out, output: final_out}
outputs: {final: final_out, copy: final_out}
"#,
        );
        assert!(issues.contains(&DefinitionIssue::StreamCombineIncompatible {
            artifact: "a".into(),
            strategy: "union_by_name".into()
        }));
        assert!(issues.contains(&DefinitionIssue::StepModeIncompatible {
            step_id: "m".into(),
            uses: "batch_only".into(),
            mode: "stream".into()
        }));
        assert!(issues.contains(&DefinitionIssue::StreamFanOut {
            artifact: "final_out".into(),
            count: 2
        }));
        let message = DefinitionIssue::StreamCombineIncompatible {
            artifact: "a".into(),
            strategy: "union_by_name".into(),
        }
        .to_string();
        assert!(message.contains("combine_strategy='concat'"));
    }

    #[test]
    fn test_identifiers_and_duplicates() {
        let issues = errors(
            r#"
inputs: {"bad name": a.csv}
steps:
  - id: p
    uses: passthrough
    with: {input: "bad name", output: x}
  - id: p
    uses: passthrough
    with: {input: x, output: y}
outputs: {final: y}
"#,
        );
        assert!(issues.contains(&DefinitionIssue::DuplicateStepId {
            step_id: "p".into()
        }));
        assert!(issues
            .iter()
            .any(|i| matches!(i, DefinitionIssue::InvalidIdentifier { name, .. } if name == "bad name")));
    }

    #[test]
    fn test_unknown_fields_warn_unless_strict() {
        let yaml = r#"
owner: me
inputs: {a: {uri: a.csv, sep: ";"}}
outputs: {final: a}
"#;
        let pipeline = Pipeline::from_yaml_str(yaml, &registry()).unwrap();
        let lenient = Validator::new().validate(&pipeline);
        assert!(lenient.is_ok());
        assert_eq!(lenient.warnings().count(), 1);

        let strict = Validator::new().strict(true).validate(&pipeline);
        assert_eq!(strict.errors().count(), 2);
        assert!(strict.into_result("demo").is_err());
    }
}
