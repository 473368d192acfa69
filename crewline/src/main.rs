//! `crewline`: run multi-role pipelines defined in TOML.
//!
//! Each task's output becomes context for the next one; the final document
//! is written under `--out-dir` and the last task's output is printed.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crewline::core::prompt::Inputs;
use crewline::error::{BackendError, BackendErrorKind, RunError};
use crewline::io::backend::{Backend, GenerateRequest, HttpBackend};
use crewline::io::config::{CONFIG_FILE, EngineConfig, load_config, write_config};
use crewline::io::pipeline::{
    PIPELINE_FILE, Pipeline, SAMPLE_PIPELINE, load_pipeline, parse_input_pairs,
};
use crewline::io::sink::FileSink;
use crewline::{CrewError, Engine, RunEvent, RunOptions, exit_codes, logging};
use tracing::warn;

#[derive(Parser)]
#[command(
    name = "crewline",
    version,
    about = "Sequential multi-role pipelines over a generation backend"
)]
struct Cli {
    /// Log run and task lifecycle to stderr (`RUST_LOG` overrides).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write `crewline.toml` and a sample `pipeline.toml` if missing.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },
    /// Load and plan a pipeline without calling the backend.
    Validate {
        #[arg(short, long, default_value = PIPELINE_FILE)]
        pipeline: PathBuf,
        /// Override a pipeline input.
        #[arg(short, long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
    },
    /// Execute a pipeline and write its results.
    Run {
        #[arg(short, long, default_value = PIPELINE_FILE)]
        pipeline: PathBuf,
        #[arg(short, long, default_value = CONFIG_FILE)]
        config: PathBuf,
        /// Override a pipeline input.
        #[arg(short, long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
        /// Directory that receives `<run_id>/result.md` and friends.
        #[arg(short, long, default_value = "results")]
        out_dir: PathBuf,
    },
    /// Invoke one tool from a pipeline and print its output.
    Tool {
        #[arg(short, long, default_value = PIPELINE_FILE)]
        pipeline: PathBuf,
        name: String,
        input: String,
    },
}

fn main() {
    // Before logging, so `RUST_LOG` may come from .env.
    let dotenv = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init(cli.verbose);
    if let Err(err) = dotenv {
        if !err.not_found() {
            warn!(error = %err, "failed to load .env");
        }
    }

    if let Err(err) = run(cli) {
        eprintln!("{err:#}");
        std::process::exit(exit_code_for(&err));
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Init { force } => cmd_init(force),
        Command::Validate { pipeline, inputs } => cmd_validate(&pipeline, &inputs),
        Command::Run {
            pipeline,
            config,
            inputs,
            out_dir,
        } => cmd_run(&pipeline, &config, &inputs, &out_dir),
        Command::Tool {
            pipeline,
            name,
            input,
        } => cmd_tool(&pipeline, &name, &input),
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(crew) = err.downcast_ref::<CrewError>() {
        return crew.exit_code();
    }
    if err.chain().any(|cause| cause.is::<RunError>()) {
        return exit_codes::ABORTED;
    }
    exit_codes::INVALID
}

fn cmd_init(force: bool) -> Result<()> {
    let config_path = Path::new(CONFIG_FILE);
    if force || !config_path.exists() {
        write_config(config_path, &EngineConfig::default())?;
        println!("wrote {CONFIG_FILE}");
    }
    let pipeline_path = Path::new(PIPELINE_FILE);
    if force || !pipeline_path.exists() {
        fs::write(pipeline_path, SAMPLE_PIPELINE)
            .with_context(|| format!("write {PIPELINE_FILE}"))?;
        println!("wrote {PIPELINE_FILE}");
    }
    Ok(())
}

/// Stand-in backend for commands that only plan.
struct PlanOnly;

impl Backend for PlanOnly {
    fn generate(&self, _request: &GenerateRequest) -> Result<String, BackendError> {
        Err(BackendError::new(
            BackendErrorKind::InvalidRequest,
            "validation never calls the backend",
        ))
    }
}

fn cmd_validate(path: &Path, overrides: &[String]) -> Result<()> {
    let pipeline = load_pipeline(path)?;
    let inputs = resolve_inputs(&pipeline, overrides)?;
    let engine = Engine::new(
        EngineConfig::default(),
        Arc::new(pipeline.registry),
        PlanOnly,
    )?;
    let plan = engine
        .plan(&pipeline.tasks, &inputs)
        .map_err(CrewError::from)?;

    for (index, task) in plan.tasks().iter().enumerate() {
        let role = task.role();
        let tools: Vec<&str> = role.tools().iter().map(String::as_str).collect();
        if tools.is_empty() {
            println!("{}. {} ({})", index + 1, task.id(), role.name());
        } else {
            println!(
                "{}. {} ({}) tools: {}",
                index + 1,
                task.id(),
                role.name(),
                tools.join(", ")
            );
        }
    }
    Ok(())
}

fn cmd_run(path: &Path, config_path: &Path, overrides: &[String], out_dir: &Path) -> Result<()> {
    let pipeline = load_pipeline(path)?;
    let inputs = resolve_inputs(&pipeline, overrides)?;

    let mut config = load_config(config_path)?;
    config.apply_env_overrides(|key| std::env::var(key).ok());
    config.validate().map_err(CrewError::from)?;
    let backend = HttpBackend::from_config(&config).map_err(CrewError::from)?;

    let engine = Engine::new(config, Arc::new(pipeline.registry), backend)
        .map_err(CrewError::from)?;
    let plan = engine
        .plan(&pipeline.tasks, &inputs)
        .map_err(CrewError::from)?;

    let mut sink = FileSink::new(out_dir);
    let total = plan.len();
    let mut progress = |event: &RunEvent| print_progress(event, total);
    let result = engine.execute(
        &plan,
        RunOptions {
            cancel: None,
            sink: Some(&mut sink),
            observer: Some(&mut progress),
        },
    );

    match result {
        Ok(result) => {
            eprintln!("results: {}", out_dir.join(&result.run_id).display());
            println!("{}", result.final_output.trim_end());
            Ok(())
        }
        Err(err) => {
            eprintln!("partial results: {}", out_dir.join(&err.run_id).display());
            Err(CrewError::from(err).into())
        }
    }
}

fn print_progress(event: &RunEvent, total: usize) {
    match event {
        RunEvent::TaskStarted {
            index,
            task_id,
            role,
        } => eprintln!("[{}/{total}] {task_id} ({role})", index + 1),
        RunEvent::ToolCalled { tool, round, .. } => eprintln!("      tool {tool} (round {round})"),
        RunEvent::BackendRetry {
            attempt,
            kind,
            delay,
            ..
        } => eprintln!("      attempt {attempt} failed ({kind}), retrying in {delay:?}"),
        RunEvent::TaskFailed { task_id, error } => eprintln!("      {task_id} failed: {error}"),
        RunEvent::RunStarted { .. }
        | RunEvent::TaskSucceeded { .. }
        | RunEvent::RunFinished { .. } => {}
    }
}

fn cmd_tool(path: &Path, name: &str, input: &str) -> Result<()> {
    let pipeline = load_pipeline(path)?;
    let output = pipeline
        .registry
        .invoke_with_timeout(name, input, EngineConfig::default().call_timeout())?;
    println!("{}", output.trim_end());
    Ok(())
}

fn resolve_inputs(pipeline: &Pipeline, overrides: &[String]) -> Result<Inputs> {
    let overrides = parse_input_pairs(overrides)?;
    Ok(pipeline.inputs_with(&overrides))
}
