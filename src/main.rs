//! Trakt CLI - declarative data pipeline runner

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;

use trakt::error::{FixSuggestion, TraktError};
use trakt::overrides::{apply_params, parse_input_overrides, ParamOverride};
use trakt::pipeline::Pipeline;
use trakt::runner::{RunOptions, Runner};
use trakt::{RunnerConfig, StepRegistry};

#[derive(Parser)]
#[command(name = "trakt")]
#[command(about = "Trakt - declarative data pipelines, batch or streaming")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline and write its outputs and manifest
    Run(RunArgs),

    /// Load and validate a pipeline file without running it
    Validate {
        /// Path to pipeline.yaml
        file: PathBuf,

        /// Treat unknown fields as errors
        #[arg(long)]
        strict: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Path to a pipeline file
    #[arg(long, conflicts_with = "pipeline", required_unless_present = "pipeline")]
    pipeline_file: Option<PathBuf>,

    /// Pipeline name, resolved to pipelines/NAME/pipeline.yaml
    #[arg(long)]
    pipeline: Option<String>,

    /// Root for relative input uris
    #[arg(long)]
    input_dir: Option<PathBuf>,

    /// Root for relative output uris
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Override an input source (repeatable)
    #[arg(long = "input", value_name = "NAME=PATH")]
    inputs: Vec<String>,

    /// Override a literal step parameter, VALUE parsed as YAML (repeatable)
    #[arg(long = "param", value_name = "STEP.PARAM=VALUE")]
    params: Vec<String>,

    #[arg(long)]
    run_id: Option<String>,

    #[arg(long)]
    pipeline_version: Option<String>,

    /// Defaults to <output_dir>/manifest.json
    #[arg(long)]
    manifest_path: Option<PathBuf>,

    /// Rows per chunk in stream mode
    #[arg(long)]
    stream_chunk_size: Option<usize>,

    /// TOML config file (default: ./trakt.toml if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Treat unknown fields as errors
    #[arg(long)]
    strict: bool,
}

fn main() {
    // Load .env file (ignore if not present)
    let _ = dotenvy::dotenv();

    // Logs go to stderr, stdout carries the run summary
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(args) => run_pipeline(args),
        Commands::Validate { file, strict } => validate_pipeline(&file, strict),
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        let suggestion = e
            .chain()
            .find_map(|cause| cause.downcast_ref::<TraktError>())
            .and_then(|err| err.fix_suggestion());
        if let Some(suggestion) = suggestion {
            eprintln!("  {} {}", "Fix:".yellow(), suggestion);
        }
        std::process::exit(1);
    }
}

fn pipeline_path(args: &RunArgs) -> anyhow::Result<PathBuf> {
    match (&args.pipeline_file, &args.pipeline) {
        (Some(file), _) => Ok(file.clone()),
        (None, Some(name)) => Ok(PathBuf::from("pipelines").join(name).join("pipeline.yaml")),
        (None, None) => anyhow::bail!("either --pipeline-file or --pipeline is required"),
    }
}

fn load_config(args: &RunArgs) -> anyhow::Result<RunnerConfig> {
    let cwd = std::env::current_dir()?;
    let mut config = RunnerConfig::load(args.config.as_deref(), &cwd)
        .context("Failed to load runner configuration")?
        .with_env()
        .context("Invalid TRAKT_* environment variable")?;

    // CLI flags win over file and environment
    if let Some(dir) = &args.input_dir {
        config.input_dir = dir.clone();
    }
    if let Some(dir) = &args.output_dir {
        config.output_dir = dir.clone();
    }
    if let Some(path) = &args.manifest_path {
        config.manifest_path = Some(path.clone());
    }
    if let Some(size) = args.stream_chunk_size {
        config.stream_chunk_size = size;
    }
    config.strict |= args.strict;
    config
        .input_overrides
        .extend(parse_input_overrides(&args.inputs)?);
    config.check()?;
    Ok(config)
}

fn run_pipeline(args: RunArgs) -> anyhow::Result<()> {
    let config = load_config(&args)?;
    let path = pipeline_path(&args)?;

    let registry = StepRegistry::with_builtins();
    let mut pipeline = Pipeline::from_file(&path, &registry)
        .with_context(|| format!("Failed to load pipeline: {}", path.display()))?;
    let params = args
        .params
        .iter()
        .map(|raw| ParamOverride::parse(raw))
        .collect::<Result<Vec<_>, _>>()?;
    apply_params(&mut pipeline, &params)?;

    let options = RunOptions {
        run_id: args.run_id,
        pipeline_version: args.pipeline_version,
        ..Default::default()
    };

    match Runner::new(config).run(&pipeline, options) {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report.summary())?);
            Ok(())
        }
        Err(failure) => {
            if let Some(summary) = failure.summary() {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
            Err(failure.error.into())
        }
    }
}

fn validate_pipeline(file: &Path, strict: bool) -> anyhow::Result<()> {
    let registry = StepRegistry::with_builtins();
    let mut pipeline = Pipeline::from_file(file, &registry)
        .with_context(|| format!("Failed to load pipeline: {}", file.display()))?;
    pipeline.strict |= strict;

    let report = pipeline.validate();
    for warning in report.warnings() {
        println!("{} {}", "warning:".yellow(), warning);
    }
    report.into_result(&pipeline.name)?;

    println!("{} Pipeline '{}' is valid", "✓".green(), pipeline.name);
    println!("  Mode: {}", pipeline.execution_mode);
    println!("  Inputs: {}", pipeline.inputs.len());
    println!("  Steps: {}", pipeline.steps.len());
    println!("  Outputs: {}", pipeline.outputs.len());
    Ok(())
}
