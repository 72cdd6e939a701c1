//! End-to-end pipeline tests
//!
//! Every test writes real CSV files into a temp directory, loads a YAML
//! pipeline, runs it, and inspects output files plus the run manifest.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::TempDir;

use trakt::error::{DefinitionIssue, ErrorKind, TraktError};
use trakt::event_log::names;
use trakt::manifest::RunStatus;
use trakt::telemetry::{MemorySink, ROOT_SPAN};
use trakt::{
    Cell, FnStep, Pipeline, RunOptions, Runner, RunnerConfig, StepRegistry, StepValue, Table,
};

// ============================================================================
// TEST HELPERS
// ============================================================================

fn write(dir: &Path, name: &str, content: &str) {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

fn double_amount(table: &mut Table) -> Result<(), TraktError> {
    table.map_column("amount", |cell| match cell {
        Cell::Int(v) => Cell::Int(v * 2),
        Cell::Float(v) => Cell::Float(v * 2.0),
        other => other.clone(),
    })
}

fn registry() -> StepRegistry {
    let mut registry = StepRegistry::with_builtins();
    registry.register(
        "double",
        FnStep::new(|_, mut args| {
            let doubled = match args.take("input")? {
                StepValue::Table(table) => {
                    let mut table = (*table).clone();
                    double_amount(&mut table)?;
                    StepValue::from(table)
                }
                StepValue::Stream(stream) => StepValue::Stream(stream.map_chunks(|mut chunk: Table| {
                    double_amount(&mut chunk)?;
                    Ok(chunk)
                })),
                other => {
                    return Err(TraktError::contract(format!(
                        "double expects a dataset, got {}",
                        other.type_name()
                    )))
                }
            };
            Ok(StepValue::mapping([("output", doubled)]))
        })
        .inputs(["input"])
        .outputs(["output"])
        .streaming(),
    );
    registry.register(
        "batch_copy",
        FnStep::new(|_, mut args| Ok(StepValue::mapping([("output", args.take("input")?)])))
            .inputs(["input"])
            .outputs(["output"]),
    );
    registry.register(
        "by_region",
        FnStep::new(|_, mut args| {
            let table = args.table("input")?;
            let split = |region: &str| -> Result<StepValue, TraktError> {
                let mut part = (*table).clone();
                let idx = part.column_index("region").unwrap_or(0);
                part.filter_rows(|row| row[idx].as_str() == Some(region));
                Ok(part.into())
            };
            Ok(StepValue::mapping([(
                "outputs",
                StepValue::mapping([("eu", split("eu")?), ("us", split("us")?)]),
            )]))
        })
        .inputs(["input"]),
    );
    registry.register(
        "not_a_mapping",
        FnStep::new(|_, mut args| args.take("input")).inputs(["input"]),
    );
    registry
}

fn runner(dir: &Path) -> Runner {
    Runner::new(RunnerConfig {
        input_dir: dir.to_path_buf(),
        output_dir: dir.join("out"),
        ..Default::default()
    })
}

fn load(yaml: &str) -> Pipeline {
    Pipeline::from_yaml_str(yaml, &registry()).unwrap()
}

fn read(path: impl AsRef<Path>) -> String {
    fs::read_to_string(path).unwrap()
}

// ============================================================================
// COMBINE
// ============================================================================

#[test]
fn test_concat_stacks_files_in_path_order() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "orders/b.csv", "id,amount\n3,30\n");
    write(dir.path(), "orders/a.csv", "id,amount\n1,10\n2,20\n");
    let pipeline = load("inputs:\n  orders: orders/*.csv\noutputs:\n  final: orders\n");

    let report = runner(dir.path()).run(&pipeline, RunOptions::default()).unwrap();

    assert_eq!(read(dir.path().join("out/final.csv")), "id,amount\n1,10\n2,20\n3,30\n");
    assert_eq!(report.manifest.inputs["orders"].files_read, 2);
    assert_eq!(report.manifest.outputs["final"].rows, 3);
}

#[test]
fn test_concat_column_mismatch_names_file_and_writes_nothing() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "orders/a.csv", "id,amount\n1,10\n");
    write(dir.path(), "orders/b.csv", "id,total\n2,20\n");
    let pipeline = load("inputs:\n  orders: orders/*.csv\noutputs:\n  final: orders\n");

    let failure = runner(dir.path()).run(&pipeline, RunOptions::default()).unwrap_err();

    match &failure.error {
        TraktError::SchemaMismatch { file, .. } => assert!(file.ends_with("b.csv")),
        other => panic!("unexpected error {other}"),
    }
    let manifest = failure.manifest.unwrap();
    assert_eq!(manifest.error.unwrap().kind, ErrorKind::SchemaMismatch);
    assert!(manifest.outputs.is_empty());
    assert!(!dir.path().join("out/final.csv").exists());
}

#[test]
fn test_union_by_name_fills_missing_columns() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "parts/1.csv", "id,amount\n1,10\n");
    write(dir.path(), "parts/2.csv", "id,country\n2,FR\n");
    let pipeline = load(
        "inputs:\n  parts: {uri: parts, combine_strategy: union_by_name}\noutputs:\n  final: parts\n",
    );

    runner(dir.path()).run(&pipeline, RunOptions::default()).unwrap();

    assert_eq!(
        read(dir.path().join("out/final.csv")),
        "id,amount,country\n1,10,\n2,,FR\n"
    );
}

#[test]
fn test_validate_schema_rejects_dtype_drift() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "parts/1.csv", "id,amount\n1,10\n");
    write(dir.path(), "parts/2.csv", "id,amount\n2,lots\n");
    let pipeline = load(
        "inputs:\n  parts: {uri: parts/*.csv, combine_strategy: validate_schema}\noutputs:\n  final: parts\n",
    );

    let failure = runner(dir.path()).run(&pipeline, RunOptions::default()).unwrap_err();
    assert_eq!(failure.error.kind(), ErrorKind::SchemaMismatch);
    assert!(failure.error.to_string().contains("amount"));
}

// ============================================================================
// VALIDATION
// ============================================================================

#[test]
fn test_output_key_bound_as_argument_is_rejected_before_running() {
    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let mut registry = registry();
    registry.register(
        "confused",
        FnStep::new(move |_, _| {
            flag.store(true, Ordering::SeqCst);
            Ok(StepValue::mapping::<_, String>([]))
        })
        .inputs(["input", "result"])
        .outputs(["result"]),
    );
    let dir = TempDir::new().unwrap();
    write(dir.path(), "orders.csv", "id\n1\n");
    let pipeline = Pipeline::from_yaml_str(
        "inputs:\n  orders: orders.csv\nsteps:\n  - id: c\n    uses: confused\n    with: {input: orders, result: out}\n",
        &registry,
    )
    .unwrap();

    let failure = runner(dir.path()).run(&pipeline, RunOptions::default()).unwrap_err();

    match failure.error {
        TraktError::InvalidPipeline { issues, .. } => assert!(issues.contains(
            &DefinitionIssue::OutputBindingAsArgument {
                step_id: "c".into(),
                key: "result".into(),
            }
        )),
        other => panic!("unexpected error {other}"),
    }
    assert!(!ran.load(Ordering::SeqCst));
    assert!(failure.manifest.is_none());
}

#[test]
fn test_stream_pipeline_with_batch_only_step_fails_before_reading() {
    let dir = TempDir::new().unwrap();
    // unreadable as CSV: any read attempt would surface an adapter error instead
    write(dir.path(), "orders.csv", "id,amount\n1,10,extra,\"\n");
    let pipeline = load(
        "execution: {mode: stream}\ninputs:\n  orders: orders.csv\nsteps:\n  - id: copy\n    uses: batch_copy\n    with: {input: orders, output: copied}\noutputs:\n  final: copied\n",
    );

    let failure = runner(dir.path()).run(&pipeline, RunOptions::default()).unwrap_err();

    match failure.error {
        TraktError::InvalidPipeline { issues, .. } => assert!(issues
            .iter()
            .any(|i| matches!(i, DefinitionIssue::StepModeIncompatible { step_id, .. } if step_id == "copy"))),
        other => panic!("unexpected error {other}"),
    }
    assert!(!dir.path().join("out").exists());
}

// ============================================================================
// EXECUTION
// ============================================================================

#[test]
fn test_mapping_output_binding_splits_result() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "sales.csv", "id,region\n1,eu\n2,us\n3,eu\n");
    let pipeline = load(
        "inputs:\n  sales: sales.csv\nsteps:\n  - id: split\n    uses: by_region\n    with:\n      input: sales\n      outputs: {eu: sales_eu, us: sales_us}\noutputs:\n  eu: sales_eu\n  us: sales_us\n",
    );

    let report = runner(dir.path()).run(&pipeline, RunOptions::default()).unwrap();

    assert_eq!(report.manifest.step("split").unwrap().outputs, vec!["sales_eu", "sales_us"]);
    assert_eq!(report.manifest.outputs["eu"].rows, 2);
    assert_eq!(read(dir.path().join("out/us.csv")), "id,region\n2,us\n");
}

#[test]
fn test_non_mapping_result_is_contract_violation() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "orders.csv", "id\n1\n");
    let pipeline = load(
        "inputs:\n  orders: orders.csv\nsteps:\n  - id: bad\n    uses: not_a_mapping\n    with: {input: orders, output: x}\n",
    );

    let failure = runner(dir.path()).run(&pipeline, RunOptions::default()).unwrap_err();
    let error = failure.manifest.unwrap().error.unwrap();
    assert_eq!(error.kind, ErrorKind::ContractViolation);
    assert_eq!(error.step_id.as_deref(), Some("bad"));
}

#[test]
fn test_stream_and_batch_produce_identical_output() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "orders/part1.csv", "id,amount\n1,10\n2,30\n3,5\n");
    write(dir.path(), "orders/part2.csv", "id,amount\n4,7\n5,1\n");
    let yaml = |mode: &str| {
        format!(
            "execution: {{mode: {mode}}}\ninputs:\n  orders: orders/*.csv\nsteps:\n  - id: double\n    uses: double\n    with: {{input: orders, output: doubled}}\noutputs:\n  final: doubled\n"
        )
    };

    let batch_dir = dir.path().join("batch");
    let batch = Runner::new(RunnerConfig {
        input_dir: dir.path().to_path_buf(),
        output_dir: batch_dir.clone(),
        ..Default::default()
    });
    batch.run(&load(&yaml("batch")), RunOptions::default()).unwrap();

    let stream_dir = dir.path().join("stream");
    let stream = Runner::new(RunnerConfig {
        input_dir: dir.path().to_path_buf(),
        output_dir: stream_dir.clone(),
        stream_chunk_size: 1,
        ..Default::default()
    });
    let report = stream.run(&load(&yaml("stream")), RunOptions::default()).unwrap();

    let expected = "id,amount\n1,20\n2,60\n3,10\n4,14\n5,2\n";
    assert_eq!(read(batch_dir.join("final.csv")), expected);
    assert_eq!(read(stream_dir.join("final.csv")), expected);
    let entry = report.manifest.step("double").unwrap();
    assert_eq!(entry.rows_in, Some(5));
    assert_eq!(entry.rows_out, Some(5));
}

#[test]
fn test_runs_are_idempotent_apart_from_identity_and_timing() {
    fn normalized(value: Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .filter(|(k, _)| {
                        !matches!(
                            k.as_str(),
                            "run_id" | "started_at" | "finished_at" | "duration_ms" | "timestamp_ms"
                        )
                    })
                    .map(|(k, v)| (k, normalized(v)))
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.into_iter().map(normalized).collect()),
            other => other,
        }
    }

    let dir = TempDir::new().unwrap();
    write(dir.path(), "orders.csv", "id,amount\n1,10\n2,\n");
    let pipeline = load(
        "inputs:\n  orders: orders.csv\nsteps:\n  - id: gate\n    uses: quality_gate\n    with:\n      input: orders\n      policy: {const: {mode: warn, max_null_ratio: {amount: 0.1}}}\n      output: checked\noutputs:\n  final: checked\n",
    );
    let runner = runner(dir.path());

    let mut outputs = Vec::new();
    let mut manifests = Vec::new();
    for _ in 0..2 {
        let report = runner.run(&pipeline, RunOptions::default()).unwrap();
        outputs.push(fs::read(dir.path().join("out/final.csv")).unwrap());
        manifests.push(normalized(serde_json::to_value(&report.manifest).unwrap()));
    }

    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(manifests[0], manifests[1]);
}

// ============================================================================
// QUALITY GATE
// ============================================================================

const ORDERS: &str = "id,amount\n1,10\n1,\n2,\n3,5\n";

fn gate_pipeline(policy: &str) -> Pipeline {
    load(&format!(
        "inputs:\n  orders: orders.csv\nsteps:\n  - id: gate\n    uses: quality_gate\n    with:\n      input: orders\n      policy: {{const: {policy}}}\n      output: checked\n  - id: after\n    uses: double\n    with: {{input: checked, output: doubled}}\noutputs:\n  final: doubled\n"
    ))
}

#[test]
fn test_gate_fail_mode_stops_the_run_at_the_gate() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "orders.csv", ORDERS);

    let failure = runner(dir.path())
        .run(&gate_pipeline("{required_columns: [id, country]}"), RunOptions::default())
        .unwrap_err();

    let manifest = failure.manifest.unwrap();
    assert_eq!(manifest.status, RunStatus::Failed);
    let error = manifest.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::QualityViolation);
    assert_eq!(error.step_id.as_deref(), Some("gate"));
    assert!(manifest.steps.is_empty());
    assert!(manifest.step("after").is_none());
    assert!(!dir.path().join("out/final.csv").exists());
}

#[test]
fn test_gate_warn_event_carries_fail_mode_payload() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "orders.csv", ORDERS);

    let failure = runner(dir.path())
        .run(&gate_pipeline("{mode: fail, required_columns: [country]}"), RunOptions::default())
        .unwrap_err();
    let fail_details = match failure.error.root() {
        TraktError::QualityViolation { details, .. } => details.clone(),
        other => panic!("unexpected error {other}"),
    };

    let report = runner(dir.path())
        .run(&gate_pipeline("{mode: warn, required_columns: [country]}"), RunOptions::default())
        .unwrap();
    assert_eq!(report.manifest.status, RunStatus::Success);
    let warnings: Vec<_> = report
        .manifest
        .events
        .iter()
        .filter(|e| e.name == names::QUALITY_GATE_WARNING)
        .collect();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].attributes, fail_details);
    assert_eq!(warnings[0].step_id.as_deref(), Some("gate"));
}

#[test]
fn test_gate_warn_mode_collects_every_violation() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "orders.csv", ORDERS);
    let sink = MemorySink::new();
    let runner = runner(dir.path()).with_sink(Arc::new(sink.clone()));

    let report = runner
        .run(
            &gate_pipeline(
                "{mode: warn, required_columns: [id, country], unique_keys: [id], max_null_ratio: {amount: 0.2}}",
            ),
            RunOptions::default(),
        )
        .unwrap();

    let gate = report.manifest.step("gate").unwrap();
    assert_eq!(gate.metrics["quality_checks"], json!(3));
    assert_eq!(gate.metrics["quality_violations"], json!(3));
    assert_eq!(gate.metrics["quality_warnings"], json!(3));
    assert_eq!(report.manifest.outputs["final"].rows, 4);

    let step_span = sink.span("step.gate").unwrap();
    assert_eq!(step_span.events.len(), 3);
    assert_eq!(step_span.attribute("metric.quality_warnings"), Some(&json!(3)));
    assert_eq!(sink.span(ROOT_SPAN).unwrap().attribute("status"), Some(&json!("success")));
}

#[test]
fn test_stream_gate_row_limit_leaves_partial_output() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "orders.csv", ORDERS);
    let pipeline = load(
        "execution: {mode: stream}\ninputs:\n  orders: orders.csv\nsteps:\n  - id: gate\n    uses: quality_gate\n    with:\n      input: orders\n      policy: {const: {row_count: {max: 2}}}\n      output: checked\noutputs:\n  final: checked\n",
    );
    let runner = Runner::new(RunnerConfig {
        input_dir: dir.path().to_path_buf(),
        output_dir: dir.path().join("out"),
        stream_chunk_size: 1,
        ..Default::default()
    });

    let failure = runner.run(&pipeline, RunOptions::default()).unwrap_err();

    let manifest = failure.manifest.unwrap();
    let error = manifest.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::QualityViolation);
    assert_eq!(error.step_id.as_deref(), Some("gate"));
    let output = &manifest.outputs["final"];
    assert!(!output.complete);
    assert_eq!(output.rows, 2);
    assert_eq!(manifest.step("gate").unwrap().metrics["quality_violations"], json!(1));
}

#[test]
fn test_stream_gate_metrics_arrive_after_drain() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "orders.csv", ORDERS);
    let pipeline = load(
        "execution: {mode: stream}\ninputs:\n  orders: orders.csv\nsteps:\n  - id: gate\n    uses: quality_gate\n    with:\n      input: orders\n      policy: {const: {mode: warn, unique_keys: [id], row_count: {min: 10}}}\n      output: checked\noutputs:\n  final: checked\n",
    );

    let report = runner(dir.path()).run(&pipeline, RunOptions::default()).unwrap();

    let gate = report.manifest.step("gate").unwrap();
    assert_eq!(gate.metrics["quality_warnings"], json!(2));
    assert_eq!(gate.rows_out, Some(4));
    let gates: Vec<&str> = report
        .manifest
        .warnings()
        .map(|e| e.attributes["gate"].as_str().unwrap())
        .collect();
    assert_eq!(gates, vec!["row_count", "unique_keys"]);
}

#[test]
fn test_unread_gate_output_fails_in_both_modes() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "orders.csv", ORDERS);
    let yaml = |mode: &str| {
        format!(
            "execution: {{mode: {mode}}}\ninputs:\n  orders: orders.csv\nsteps:\n  - id: gate\n    uses: quality_gate\n    with:\n      input: orders\n      policy: {{const: {{required_columns: [country]}}}}\n      output: checked\n"
        )
    };

    for mode in ["batch", "stream"] {
        let failure = runner(dir.path())
            .run(&load(&yaml(mode)), RunOptions::default())
            .unwrap_err();
        let manifest = failure.manifest.unwrap();
        assert_eq!(manifest.status, RunStatus::Failed, "{mode}");
        let error = manifest.error.as_ref().unwrap();
        assert_eq!(error.kind, ErrorKind::QualityViolation, "{mode}");
        assert_eq!(error.step_id.as_deref(), Some("gate"), "{mode}");
    }
}

#[test]
fn test_policy_steps_chain_in_a_pipeline() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "orders.csv", "id,amount\n1,10\n1,20\n2,30\n");
    write(dir.path(), "countries.csv", "id,country\n1,US\n");
    let pipeline = load(
        "inputs:\n  orders: orders.csv\n  countries: countries.csv\nsteps:\n  - id: dedupe\n    uses: dedupe\n    with:\n      input: orders\n      policy: {const: {keys: [id], winner: first}}\n      output: unique\n  - id: join\n    uses: trakt.steps.join\n    with:\n      left: unique\n      right: countries\n      policy: {const: {keys: [id], unmatched: warn}}\n      output: joined\n  - id: rename\n    uses: rename\n    with:\n      input: joined\n      policy: {const: {mapping: {amount: total}, required: [amount]}}\n      output: renamed\noutputs:\n  final: renamed\n",
    );

    let report = runner(dir.path()).run(&pipeline, RunOptions::default()).unwrap();

    assert_eq!(
        read(dir.path().join("out/final.csv")),
        "id,total,country\n1,10,US\n2,30,\n"
    );
    let warnings: Vec<_> = report.manifest.warnings().collect();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].name, names::JOIN_UNMATCHED_WARNING);
    assert_eq!(warnings[0].step_id.as_deref(), Some("join"));
}

#[test]
fn test_policy_step_rejects_bad_policy_before_running() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "orders.csv", "id,amount\n1,10\n");
    let pipeline = load(
        "inputs:\n  orders: orders.csv\nsteps:\n  - id: dedupe\n    uses: dedupe\n    with:\n      input: orders\n      policy: {const: {keys: [id], winner: max}}\n      output: unique\noutputs:\n  final: unique\n",
    );

    let failure = runner(dir.path()).run(&pipeline, RunOptions::default()).unwrap_err();

    match failure.error {
        TraktError::InvalidPipeline { issues, .. } => assert!(issues
            .iter()
            .any(|i| matches!(i, DefinitionIssue::InvalidStepConfig { step_id, .. } if step_id == "dedupe"))),
        other => panic!("unexpected error {other}"),
    }
}
