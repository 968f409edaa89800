// Copyright (c) 2025 AgentFlow Runtime Team
// SPDX-License-Identifier: Apache-2.0

//! AgentFlow CLI.
//!
//! Submits compiled programs, runs workers, inspects and cancels
//! runners, and publishes sources. Compilation itself happens upstream;
//! the `--program` inputs here are compiled JSON ASTs.

mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use agentflow_core::Program;
use agentflow_runtime::{
    drain_task_list, publish, submit, ExecutionEngine, HandlerRegistry, TaskPoller,
};
use agentflow_state::{MemoryStore, PostgresStore, SourceText, Store};

use config::Config;

#[derive(Parser)]
#[command(name = "afl")]
#[command(version, about = "AgentFlow workflow runtime", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the config file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a compiled program for execution
    Submit {
        /// Path to the compiled program JSON
        #[arg(long, value_name = "FILE")]
        program: PathBuf,

        /// Qualified workflow name to execute
        #[arg(long, value_name = "NAME")]
        workflow: String,

        /// Input parameters as a JSON object
        #[arg(long, default_value = "{}", value_name = "JSON")]
        inputs: String,

        /// Task list to queue the execution on
        #[arg(long)]
        task_list: Option<String>,
    },

    /// Run a worker process polling for tasks
    Worker,

    /// Submit and execute in-process until the runner is terminal
    Run {
        /// Path to the compiled program JSON
        #[arg(long, value_name = "FILE")]
        program: PathBuf,

        /// Qualified workflow name to execute
        #[arg(long, value_name = "NAME")]
        workflow: String,

        /// Input parameters as a JSON object
        #[arg(long, default_value = "{}", value_name = "JSON")]
        inputs: String,
    },

    /// Show a runner's state
    Status {
        /// Runner ID
        #[arg(value_name = "RUNNER_ID")]
        runner_id: Uuid,
    },

    /// Cancel a runner and its queued tasks
    Cancel {
        /// Runner ID
        #[arg(value_name = "RUNNER_ID")]
        runner_id: Uuid,
    },

    /// Publish a namespace source under a version
    Publish {
        /// Namespace name
        #[arg(long)]
        namespace: String,

        /// Version to publish under
        #[arg(long)]
        version: String,

        /// Source file to publish
        #[arg(long, value_name = "FILE")]
        file: PathBuf,

        /// Replace existing content under the same (namespace, version)
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("agentflow={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {e:#}", "Error:".red().bold());
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Submit {
            program,
            workflow,
            inputs,
            task_list,
        } => submit_command(&config, &program, &workflow, &inputs, task_list).await,
        Commands::Worker => worker_command(&config).await,
        Commands::Run {
            program,
            workflow,
            inputs,
        } => run_command(&config, &program, &workflow, &inputs).await,
        Commands::Status { runner_id } => status_command(&config, runner_id).await,
        Commands::Cancel { runner_id } => cancel_command(&config, runner_id).await,
        Commands::Publish {
            namespace,
            version,
            file,
            force,
        } => publish_command(&config, &namespace, &version, &file, force).await,
    };

    if let Err(e) = result {
        error!("{e:#}");
        eprintln!("{} {e:#}", "Error:".red().bold());
        std::process::exit(1);
    }
}

/// Open the configured store. Commands that span processes need a
/// database; the memory store only makes sense for `run`.
async fn open_store(config: &Config, allow_memory: bool) -> Result<Arc<dyn Store>> {
    match &config.database_url {
        Some(url) => {
            let store = PostgresStore::new(url, None)
                .await
                .context("Failed to connect to the database")?;
            Ok(Arc::new(store))
        }
        None if allow_memory => Ok(Arc::new(MemoryStore::new())),
        None => bail!(
            "No database_url configured; this command needs a shared store (see --config)"
        ),
    }
}

fn load_program(path: &PathBuf) -> Result<(Program, String)> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read program file: {}", path.display()))?;
    let program = Program::from_json(&content)
        .with_context(|| format!("Failed to parse compiled program: {}", path.display()))?;
    Ok((program, content))
}

fn parse_inputs(inputs: &str) -> Result<serde_json::Map<String, serde_json::Value>> {
    let value: serde_json::Value =
        serde_json::from_str(inputs).context("Invalid --inputs JSON")?;
    match value {
        serde_json::Value::Object(map) => Ok(map),
        _ => bail!("--inputs must be a JSON object"),
    }
}

async fn submit_command(
    config: &Config,
    program_path: &PathBuf,
    workflow: &str,
    inputs: &str,
    task_list: Option<String>,
) -> Result<()> {
    let store = open_store(config, false).await?;
    let (program, content) = load_program(program_path)?;
    let inputs = parse_inputs(inputs)?;
    let task_list = task_list.unwrap_or_else(|| config.task_list.clone());

    let sources = vec![SourceText {
        name: program_path.display().to_string(),
        content,
    }];

    let submission = submit(&store, &program, workflow, inputs, &task_list, sources).await?;

    println!("{} '{workflow}'", "Submitted workflow".green().bold());
    println!("  Runner ID: {}", submission.runner_id);
    println!("  Flow ID:   {}", submission.flow_id);
    println!("  Task list: {task_list}");
    Ok(())
}

async fn worker_command(config: &Config) -> Result<()> {
    let store = open_store(config, false).await?;
    let engine = Arc::new(ExecutionEngine::new(store.clone()).with_task_list(&config.task_list));
    let registry = Arc::new(HandlerRegistry::new());
    let lease = Duration::from_secs(config.lease_seconds);

    info!(
        task_list = %config.task_list,
        pollers = config.pollers,
        lease_seconds = config.lease_seconds,
        "Starting worker"
    );
    println!(
        "{} task_list={} pollers={}",
        "Worker started".green().bold(),
        config.task_list,
        config.pollers
    );

    let mut handles = Vec::new();
    for i in 0..config.pollers.max(1) {
        let poller = TaskPoller::new(
            store.clone(),
            engine.clone(),
            registry.clone(),
            config.task_list.clone(),
        )
        .with_lease(lease)
        .with_poller_id(format!("afl-worker-{i}-{}", Uuid::new_v4()));
        handles.push(tokio::spawn(async move { poller.run().await }));
    }

    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

async fn run_command(
    config: &Config,
    program_path: &PathBuf,
    workflow: &str,
    inputs: &str,
) -> Result<()> {
    let store = open_store(config, true).await?;
    let (program, content) = load_program(program_path)?;
    let inputs = parse_inputs(inputs)?;

    let sources = vec![SourceText {
        name: program_path.display().to_string(),
        content,
    }];
    let submission = submit(
        &store,
        &program,
        workflow,
        inputs,
        &config.task_list,
        sources,
    )
    .await?;

    let engine = Arc::new(ExecutionEngine::new(store.clone()).with_task_list(&config.task_list));
    let registry = Arc::new(HandlerRegistry::new());
    let poller = TaskPoller::new(store.clone(), engine, registry, config.task_list.clone())
        .with_lease(Duration::from_secs(config.lease_seconds));

    drain_task_list(&poller, 5).await?;
    let runner = store
        .get_runner(submission.runner_id)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?
        .context("runner vanished")?;
    if runner.is_terminal() {
        print_runner(&runner);
        return Ok(());
    }
    // Parked on external work with no handler in this process.
    bail!(
        "Runner {} is waiting on external event handlers; run it under a worker with handlers registered",
        runner.runner_id
    )
}

async fn status_command(config: &Config, runner_id: Uuid) -> Result<()> {
    let store = open_store(config, false).await?;
    let runner = store
        .get_runner(runner_id)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?
        .with_context(|| format!("Runner not found: {runner_id}"))?;
    print_runner(&runner);

    let steps = store
        .get_steps_by_runner(runner_id)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    println!("  Steps: {}", steps.len());
    for step in steps {
        println!(
            "    {} {} [{}] {}",
            step.step_id,
            step.statement_id,
            step.object_type,
            step.state
        );
    }
    Ok(())
}

async fn cancel_command(config: &Config, runner_id: Uuid) -> Result<()> {
    let store = open_store(config, false).await?;
    let engine = ExecutionEngine::new(store);
    let runner = engine.cancel(runner_id).await?;
    println!("{} {}", "Cancelled runner".yellow().bold(), runner.runner_id);
    Ok(())
}

async fn publish_command(
    config: &Config,
    namespace: &str,
    version: &str,
    file: &PathBuf,
    force: bool,
) -> Result<()> {
    let store = open_store(config, false).await?;
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read source file: {}", file.display()))?;

    let record = publish(&store, namespace, version, &content, force).await?;
    println!(
        "{} {}@{} ({} bytes)",
        "Published".green().bold(),
        record.namespace_name,
        record.version,
        record.content.len()
    );
    Ok(())
}

fn print_runner(runner: &agentflow_state::RunnerRecord) {
    let state = runner.state.to_string();
    let colored_state = match runner.state {
        agentflow_state::RunnerState::Succeeded => state.green().bold(),
        agentflow_state::RunnerState::Failed => state.red().bold(),
        agentflow_state::RunnerState::Cancelled => state.yellow().bold(),
        _ => state.cyan().bold(),
    };

    println!("Runner {}", runner.runner_id);
    println!("  Workflow: {}", runner.workflow_name);
    println!("  State:    {colored_state}");
    if !runner.outputs.is_empty() {
        println!(
            "  Outputs:  {}",
            serde_json::to_string(&runner.outputs).unwrap_or_default()
        );
    }
    if let Some(error) = &runner.error {
        println!("  Error:    {error}");
    }
}
