//! `stagehand` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate` — check a workflow definition file.
//! - `plan`     — print the staged execution plan.
//! - `run`      — execute the workflow with the built-in collaborators.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use agents::{EchoCollaborator, FailingCollaborator};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use engine::{Engine, EngineError, EventName, ExecutorConfig, WorkflowDefinition};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "stagehand",
    about = "Dependency-aware workflow orchestration engine",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow JSON file.
        path: PathBuf,
    },
    /// Print the stages, parallelism and critical path of a workflow.
    Plan {
        path: PathBuf,
    },
    /// Run a workflow and print the result of every node as JSON.
    Run {
        path: PathBuf,
        /// JSON value handed to every collaborator as the run context.
        #[arg(long, default_value = "{}")]
        context: String,
        /// Cap on concurrently running collaborator calls.
        #[arg(long, env = "STAGEHAND_MAX_CONCURRENCY")]
        max_concurrency: Option<usize>,
        /// Treat every collaborator crash as fatal.
        #[arg(long, env = "STAGEHAND_NO_RECOVERY")]
        no_recovery: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { path } => {
            let definition = read_definition(&path)?;
            let engine = builtin_engine(ExecutorConfig::default());
            let workflow_id = engine.load_definition(&definition).context("validation failed")?;
            let plan = engine.create_execution_plan(workflow_id)?;
            println!(
                "Workflow is valid: {} nodes in {} stages.",
                definition.nodes.len(),
                plan.len()
            );
        }
        Command::Plan { path } => {
            let definition = read_definition(&path)?;
            let engine = builtin_engine(ExecutorConfig::default());
            let workflow_id = engine.load_definition(&definition).context("validation failed")?;
            let plan = engine.create_execution_plan(workflow_id)?;
            println!("{}", serde_json::to_string_pretty(&*plan)?);
        }
        Command::Run {
            path,
            context,
            max_concurrency,
            no_recovery,
        } => {
            let definition = read_definition(&path)?;
            let input: Value =
                serde_json::from_str(&context).context("--context is not valid JSON")?;
            let config = ExecutorConfig {
                max_concurrency,
                recover_from_faults: !no_recovery,
                ..ExecutorConfig::default()
            };

            let engine = Arc::new(builtin_engine(config));
            let workflow_id = engine.load_definition(&definition).context("validation failed")?;
            subscribe_progress(&engine);

            let interrupt = Arc::clone(&engine);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, stopping at the next stage boundary");
                    if let Err(e) = interrupt.cancel(workflow_id) {
                        warn!(error = %e, "could not cancel workflow");
                    }
                }
            });

            info!(workflow_id = %workflow_id, path = %path.display(), "running workflow");
            match engine.execute(workflow_id, input).await {
                Ok(results) => {
                    println!("{}", serde_json::to_string_pretty(&results)?);
                    let status = engine.status(workflow_id)?;
                    info!(status = %status, "run finished");
                    if status != engine::WorkflowStatus::Completed {
                        bail!("workflow finished with status {status}");
                    }
                }
                Err(e @ (EngineError::ExecutorFault { .. } | EngineError::Cancelled { .. })) => {
                    if let Some(partial) = e.partial_results() {
                        println!("{}", serde_json::to_string_pretty(partial)?);
                    }
                    return Err(e).context("workflow did not finish");
                }
                Err(e) => return Err(e).context("workflow could not start"),
            }
        }
    }

    Ok(())
}

fn read_definition(path: &Path) -> Result<WorkflowDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    WorkflowDefinition::from_json(&content)
        .with_context(|| format!("invalid workflow JSON in {}", path.display()))
}

/// Engine with the collaborators every definition may refer to:
/// `echo` reflects its input, `fail` always reports a failure.
fn builtin_engine(config: ExecutorConfig) -> Engine {
    Engine::new(config)
        .with_collaborator("echo", EchoCollaborator::new())
        .with_collaborator("fail", FailingCollaborator::new("configured to fail"))
}

fn subscribe_progress(engine: &Engine) {
    engine.subscribe(EventName::StageStarted, |e| {
        info!(stage = %e.payload["stage"], nodes = %e.payload["nodes"], "stage started");
    });
    engine.subscribe(EventName::NodeCompleted, |e| {
        let status = e.payload["status"].as_str().unwrap_or("unknown");
        if status == "success" {
            info!(
                node_id = %e.payload["node_id"],
                duration_ms = %e.payload["duration_ms"],
                "node succeeded"
            );
        } else {
            warn!(
                node_id = %e.payload["node_id"],
                status,
                error = %e.payload["error"],
                "node did not succeed"
            );
        }
    });
    engine.subscribe(EventName::Recovered, |e| {
        warn!(
            node_id = %e.payload["node_id"],
            resume_stage = %e.payload["resume_stage"],
            "recovered from checkpoint"
        );
    });
}
