//! CLI driver for running and inspecting Metalus applications.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use metalus_model::{parse_application, Application};
use metalus_pipeline::{
    build_plan, load_application_source, register_builtin_steps, ExecutionPlan, PlanOptions,
    ProviderRegistry, StepRegistry,
};
use metalus_types::{ExecutionStatus, Value};

#[derive(Parser)]
#[command(name = "metalus", version, about = "Pipeline execution driver for Metalus applications")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(clap::Args)]
struct SourceArgs {
    /// Inline application JSON
    #[arg(long)]
    application_json: Option<String>,

    /// Path to an application JSON file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Additional driver parameters as key=value (values parsed as JSON
    /// when possible)
    #[arg(short, long = "param")]
    params: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an application's execution plan
    Run {
        #[command(flatten)]
        source: SourceArgs,

        /// Maximum concurrently running executions
        #[arg(long)]
        max_workers: Option<usize>,
    },

    /// Parse and validate an application, building its plan
    Validate {
        #[command(flatten)]
        source: SourceArgs,
    },

    /// Show information about an application
    Info {
        #[command(flatten)]
        source: SourceArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run {
            source,
            max_workers,
        } => cmd_run(&source, max_workers).await,
        Commands::Validate { source } => cmd_validate(&source),
        Commands::Info { source } => cmd_info(&source),
    }
}

/// Assemble the driver parameter map from CLI arguments. The reserved keys
/// land here and are stripped from globals during plan building.
fn driver_params(source: &SourceArgs) -> anyhow::Result<HashMap<String, Value>> {
    let mut params = HashMap::new();
    if let Some(json) = &source.application_json {
        params.insert("applicationJson".to_string(), Value::String(json.clone()));
    }
    if let Some(path) = &source.config {
        params.insert(
            "applicationConfigPath".to_string(),
            Value::String(path.to_string_lossy().into_owned()),
        );
    }
    for raw in &source.params {
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("--param '{raw}' is not of the form key=value"))?;
        params.insert(key.to_string(), parse_param_value(value));
    }
    Ok(params)
}

/// JSON-typed when it parses, plain string otherwise.
fn parse_param_value(raw: &str) -> Value {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(json) => Value::from_json(json),
        Err(_) => Value::String(raw.to_string()),
    }
}

fn load_application(source: &SourceArgs) -> anyhow::Result<(Application, HashMap<String, Value>)> {
    let params = driver_params(source)?;
    let json = load_application_source(&params)?;
    let application = parse_application(&json)?;
    Ok((application, params))
}

fn build(
    application: &Application,
    params: HashMap<String, Value>,
    max_workers: Option<usize>,
) -> anyhow::Result<ExecutionPlan> {
    let mut registry = StepRegistry::new();
    register_builtin_steps(&mut registry);

    let mut options = PlanOptions {
        driver_params: params,
        ..PlanOptions::default()
    };
    if let Some(workers) = max_workers {
        options.max_workers = workers;
    }

    Ok(build_plan(
        application,
        Arc::new(registry),
        &ProviderRegistry::new(),
        &options,
    )?)
}

async fn cmd_run(source: &SourceArgs, max_workers: Option<usize>) -> anyhow::Result<()> {
    let (application, params) = load_application(source)?;
    let plan = build(&application, params, max_workers)?;

    let result = plan.run().await?;

    println!("Plan finished: {:?}", result.status);
    for id in plan.topological_order() {
        let Some(execution) = result.execution(id) else {
            continue;
        };
        match (&execution.last_step, &execution.message) {
            (Some(step), Some(message)) => {
                println!("  {} -> {:?} (step '{}': {})", id, execution.status, step, message)
            }
            _ => println!("  {} -> {:?}", id, execution.status),
        }
    }

    if result.status != ExecutionStatus::Complete {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_validate(source: &SourceArgs) -> anyhow::Result<()> {
    let (application, params) = load_application(source)?;
    build(&application, params, None)?;
    println!("Application is valid");
    Ok(())
}

fn cmd_info(source: &SourceArgs) -> anyhow::Result<()> {
    let (application, _) = load_application(source)?;

    println!("Executions: {}", application.executions.len());
    for execution in &application.executions {
        let pipelines = match (&execution.pipeline_ids, &execution.pipelines) {
            (Some(refs), _) if !refs.is_empty() => refs.join(", "),
            (_, Some(inline)) => inline
                .iter()
                .map(|p| p.id.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            _ => String::new(),
        };
        if execution.parents.is_empty() {
            println!("  {} [{}]", execution.id, pipelines);
        } else {
            println!(
                "  {} [{}] parents: {}",
                execution.id,
                pipelines,
                execution.parents.join(", ")
            );
        }
    }

    if let Some(library) = &application.pipelines {
        println!("\nPipeline library:");
        for pipeline in library {
            println!(
                "  {} ({} steps){}",
                pipeline.id,
                pipeline.steps.len(),
                pipeline
                    .name
                    .as_deref()
                    .map(|n| format!(" — {n}"))
                    .unwrap_or_default()
            );
        }
    }

    Ok(())
}
