//! `soar-engine` CLI entry-point.
//!
//! Available sub-commands:
//! - `serve`    start the API server.
//! - `migrate`  run pending database migrations.
//! - `validate` check a workflow JSON file and print its reachable nodes.
//! - `deliver`  post a saved action result to a backend, with retries.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use db::PgStore;
use engine::dispatch::QueueDispatcher;
use engine::{find_child_nodes, resolve_start, validate_workflow, ActionResult, EngineConfig, Workflow, WorkflowExecutor};
use queue::{Delivery, HttpBackend, HttpTokenRefresher, RetryConfig, RetryDispatcher};

#[derive(Parser)]
#[command(name = "soar-engine", about = "SOAR workflow execution engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the REST API server.
    Serve {
        #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
        bind: String,
        #[command(flatten)]
        db: DbArgs,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Run pending database migrations.
    Migrate {
        #[command(flatten)]
        db: DbArgs,
    },
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow JSON file.
        path: PathBuf,
        /// Start node to resolve instead of the workflow's own.
        #[arg(long)]
        start: Option<String>,
    },
    /// Deliver an action result JSON file to the backend.
    Deliver {
        path: PathBuf,
        #[arg(long, env = "BACKEND_URL", default_value = "http://localhost:8080")]
        backend_url: String,
        #[arg(long, default_value_t = 5)]
        attempts: u32,
        /// Seconds between attempts.
        #[arg(long, default_value_t = 5)]
        interval: u64,
        /// Check the execution is still running before each retry.
        #[arg(long)]
        clustered: bool,
    },
}

#[derive(Args)]
struct DbArgs {
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,
    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 10)]
    max_connections: u32,
}

#[derive(Args)]
struct EngineArgs {
    #[arg(long, env = "BACKEND_URL", default_value = "http://localhost:8080")]
    backend_url: String,
    #[arg(long, env = "ENCRYPTION_KEY", default_value = "", hide_env_values = true)]
    encryption_key: String,
    #[arg(long, env = "MAX_EXECUTION_DEPTH", default_value_t = 10)]
    max_execution_depth: u32,
}

impl EngineArgs {
    fn into_config(self) -> EngineConfig {
        EngineConfig {
            backend_url: self.backend_url,
            encryption_key: self.encryption_key,
            max_execution_depth: self.max_execution_depth,
            ..EngineConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Command::Serve { bind, db, engine } => serve(&bind, db, engine.into_config()).await,
        Command::Migrate { db } => {
            let store = PgStore::connect(&db.database_url, 2).await?;
            store.migrate().await?;
            info!("Migrations applied successfully");
            Ok(())
        }
        Command::Validate { path, start } => validate(&path, start.as_deref()),
        Command::Deliver { path, backend_url, attempts, interval, clustered } => {
            let config = RetryConfig { max_attempts: attempts, interval: Duration::from_secs(interval), clustered };
            deliver(&path, &backend_url, config).await
        }
    }
}

async fn serve(bind: &str, db: DbArgs, config: EngineConfig) -> Result<()> {
    if config.encryption_key.is_empty() {
        tracing::warn!("ENCRYPTION_KEY is empty; encrypted credentials will not decrypt");
    }
    let store = Arc::new(PgStore::connect(&db.database_url, db.max_connections).await?);
    store.migrate().await?;

    let dispatcher = Arc::new(QueueDispatcher::new(store.clone()));
    let executor = WorkflowExecutor::with_parts(
        store,
        Arc::new(config),
        dispatcher,
        Arc::new(engine::notify::LogNotifier),
        Arc::new(HttpTokenRefresher::new()),
    );

    info!("Starting API server on {bind}");
    api::serve(bind, api::AppState::new(Arc::new(executor))).await?;
    Ok(())
}

fn validate(path: &Path, start: Option<&str>) -> Result<()> {
    let content = std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    let workflow: Workflow = serde_json::from_str(&content).context("invalid workflow JSON")?;

    let problems = validate_workflow(&workflow);
    for problem in &problems {
        eprintln!("error: {problem}");
    }
    let start = resolve_start(&workflow, start)?;
    let reachable = find_child_nodes(&workflow, &start);

    println!("start: {start}");
    println!("reachable: {reachable:?}");
    if !problems.is_empty() {
        bail!("{} broken branch(es)", problems.len());
    }
    Ok(())
}

async fn deliver(path: &Path, backend_url: &str, config: RetryConfig) -> Result<()> {
    let content = std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    let result: ActionResult = serde_json::from_str(&content).context("invalid action result JSON")?;

    let dispatcher = RetryDispatcher::new(Arc::new(HttpBackend::new(backend_url)), config);
    match dispatcher.deliver(&result).await? {
        Delivery::Delivered { attempts } => println!("delivered after {attempts} attempt(s)"),
        Delivery::Abandoned => println!("execution no longer running; result dropped"),
    }
    Ok(())
}
