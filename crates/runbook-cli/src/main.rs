//! Dry-run a workflow definition from the command line.
//!
//! Loads a workflow from a YAML or JSON file and executes it against
//! simulated browser automation, so definitions can be validated before
//! they run against anything real. API calls and tools run for real.

use anyhow::{Context, Result};
use clap::Parser;
use runbook::bounds::{NoopActuator, ReqwestHttpClient, TracingNotificationSink};
use runbook::tools::ToolRegistry;
use runbook::workflow::{ExecutionContext, ExecutorHandles, StepExecutor, StepStatus, Workflow};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "runbook", version, about = "Dry-run a workflow definition")]
struct Cli {
    /// Path to the workflow file (.yaml, .yml or .json)
    workflow: PathBuf,

    /// Seed a run variable, repeatable: --var key=value
    #[arg(long = "var", value_name = "KEY=VALUE")]
    vars: Vec<String>,

    /// User id recorded on the execution
    #[arg(long, default_value = "cli")]
    user: String,

    /// Print the full execution record as JSON instead of a summary
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let raw = std::fs::read_to_string(&cli.workflow)
        .with_context(|| format!("cannot read {}", cli.workflow.display()))?;
    let workflow: Workflow = match cli.workflow.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&raw).context("invalid workflow JSON")?,
        _ => serde_yaml::from_str(&raw).context("invalid workflow YAML")?,
    };

    let mut ctx = ExecutionContext::new(cli.user.clone());
    for pair in &cli.vars {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("--var '{pair}' is not KEY=VALUE"))?;
        // Values parse as JSON when they can, otherwise stay strings.
        let value = serde_json::from_str::<Value>(value)
            .unwrap_or_else(|_| Value::String(value.to_string()));
        ctx.variables.insert(key.to_string(), value);
    }

    info!(
        workflow = %workflow.name,
        steps = workflow.steps.len(),
        variables = ctx.variables.len(),
        "starting dry run"
    );

    let executor = StepExecutor::new(ExecutorHandles {
        actuator: Arc::new(NoopActuator::new()),
        http: Arc::new(ReqwestHttpClient::new()),
        notifier: Arc::new(TracingNotificationSink),
        registry: Arc::new(ToolRegistry::with_builtins()),
    });

    let execution = executor.test_execute(&workflow, &mut ctx).await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&execution)?);
    } else {
        println!("workflow: {}", workflow.name);
        println!("status:   {:?}", execution.status);
        for result in &execution.step_results {
            let marker = match result.status {
                StepStatus::Success => "ok",
                StepStatus::Failed => "FAILED",
                StepStatus::Skipped => "skipped",
            };
            print!(
                "  step {:>2}: {:<7} {}ms",
                result.step_index, marker, result.duration_ms
            );
            match &result.error {
                Some(error) => println!("  {error}"),
                None => println!(),
            }
        }
        if let Some(error) = &execution.error {
            println!("error:    {error}");
        }
    }

    if execution.status == runbook::workflow::ExecutionStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}
