//! `dagflow` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate`: check a DAG definition and print its template graph.
//! - `run`: execute a DAG definition and print the runtime graph. Every
//!   action echoes its input, so a run exercises fan-out, joins and payload
//!   flow without side effects.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

use actions::mock::MockExecutor;
use actions::ActionSpec;
use engine::{DagSpec, Scheduler, SchedulerConfig};
use store::models::State;
use store::Store;

#[derive(Parser)]
#[command(name = "dagflow", about = "Versioned workflow graphs with fan-out", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a DAG definition and print its template graph.
    Validate {
        /// Path to the DAG definition JSON file.
        path: PathBuf,
        /// JSON array of the action definitions the DAG refers to.
        #[arg(long)]
        actions: Option<PathBuf>,
    },
    /// Run a DAG definition and print the runtime graph.
    Run {
        /// Path to the DAG definition JSON file.
        path: PathBuf,
        /// JSON array of the action definitions the DAG refers to.
        #[arg(long)]
        actions: Option<PathBuf>,
        /// Trigger payload as inline JSON.
        #[arg(long, default_value = "{}")]
        input: String,
        /// TOML file with a `[scheduler]` table.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// Contents of `--config`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Config {
    scheduler: SchedulerConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Validate { path, actions } => {
            let spec: DagSpec = read_json(&path)?;
            let scheduler = scheduler(actions.as_deref(), SchedulerConfig::default())?;
            let dag = scheduler.define_dag(&spec)?;
            info!(dag = %dag.name, version = dag.version, "definition is valid");
            println!("{}", serde_json::to_string_pretty(&scheduler.assemble_dag(dag.id)?)?);
        }
        Command::Run { path, actions, input, config } => {
            let spec: DagSpec = read_json(&path)?;
            let config = load_config(config.as_deref())?;
            let input: Value = serde_json::from_str(&input).context("--input is not valid JSON")?;

            let scheduler = scheduler(actions.as_deref(), config.scheduler)?;
            let dag = scheduler.define_dag(&spec)?;
            let root = scheduler.instantiate(dag.id, input)?;
            let done = scheduler.run(root.id).await?;

            println!("{}", serde_json::to_string_pretty(&scheduler.assemble_task(done.id)?)?);
            if done.state != State::Success {
                bail!("task-{} finished {}: {}", done.id, done.state, done.error.unwrap_or_default());
            }
        }
    }
    Ok(())
}

fn scheduler(actions: Option<&Path>, config: SchedulerConfig) -> Result<Scheduler> {
    let scheduler = Scheduler::new(Store::open(), Arc::new(MockExecutor::echo()), config);
    if let Some(path) = actions {
        let specs: Vec<ActionSpec> = read_json(path)?;
        let rows = scheduler.register_actions(specs)?;
        info!(count = rows.len(), "actions registered");
    }
    Ok(scheduler)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid JSON in {}", path.display()))
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("invalid config in {}", path.display()))
}
