//! collector-worker — runs the collection scheduler against the task store.
//!
//! Uses PostgreSQL stores when `PG_USERNAME` is configured, in-memory stores
//! otherwise. `--tasks` seeds tasks from a YAML or JSON list; `--once`
//! runs a single scheduler tick and waits for the runs it started.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use harvest_collector::catalog;
use harvest_collector::store::{self, ExecutionStore, TaskStore};
use harvest_collector::{CollectionScheduler, CollectionService, CreateTask, ExecutionCoordinator};
use harvest_core::Config;

/// How long in-flight runs get to wind down after Ctrl+C.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

// ── CLI ─────────────────────────────────────────────────────────────

/// Collection worker — schedules tasks and supervises the transfer engine.
#[derive(Parser, Debug)]
#[command(name = "collector-worker", version, about)]
struct Cli {
    /// YAML or JSON file with a list of tasks to create at startup.
    #[arg(long, env = "COLLECT_TASKS_FILE")]
    tasks: Option<PathBuf>,

    /// Scheduler poll interval in seconds (overrides COLLECT_POLL_INTERVAL_SECS).
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Run one scheduler tick, wait for the runs it started, and exit.
    #[arg(long)]
    once: bool,
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    harvest_core::config::load_dotenv();
    let config = Config::from_env();
    config.validate()?;
    config.collector.ensure_dirs()?;
    config.log_summary();
    debug!(config = %config.redacted_summary(), "effective configuration");

    let (tasks, executions) = open_stores(&config).await?;
    let catalog = catalog::from_config(&config.catalog)?;
    info!(catalog = catalog.name(), "dataset catalog ready");

    let coordinator = ExecutionCoordinator::new(
        tasks.clone(),
        executions.clone(),
        catalog,
        &config.collector,
    );
    let service = CollectionService::new(tasks.clone(), executions.clone(), coordinator.clone());

    if let Some(path) = &cli.tasks {
        seed_tasks(&service, path).await?;
    }

    let interval = cli
        .poll_interval
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.collector.poll_interval());
    let scheduler = Arc::new(CollectionScheduler::new(
        tasks,
        executions,
        coordinator.clone(),
        interval,
    ));

    if cli.once {
        let report = scheduler.tick(Utc::now()).await;
        info!(
            triggered = report.triggered.len(),
            skipped_running = report.skipped_running,
            not_due = report.not_due,
            errors = report.errors,
            "single tick complete, waiting for runs"
        );
        coordinator.wait_all().await;
        info!("collector-worker exited cleanly");
        return Ok(());
    }

    let shutdown = Arc::new(Notify::new());
    let scheduler_handle = {
        let scheduler = Arc::clone(&scheduler);
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move { scheduler.run(shutdown).await })
    };

    info!("collector-worker running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl+C")?;
    info!("shutdown requested");

    shutdown.notify_one();
    let _ = scheduler_handle.await;

    let stopped = coordinator.stop_all().await;
    if stopped > 0 {
        info!(stopped, "stopped in-flight executions");
    }
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, coordinator.wait_all()).await.is_err() {
        warn!("in-flight runs did not finish before shutdown timeout");
    }

    info!("collector-worker exited cleanly");
    Ok(())
}

async fn open_stores(
    config: &Config,
) -> anyhow::Result<(Arc<dyn TaskStore>, Arc<dyn ExecutionStore>)> {
    if config.postgres.is_configured() {
        let pool = store::postgres::connect(&config.postgres)
            .await
            .context("failed to open PostgreSQL stores")?;
        let tasks: Arc<dyn TaskStore> = Arc::new(store::PgTaskStore::new(pool.clone()));
        let executions: Arc<dyn ExecutionStore> = Arc::new(store::PgExecutionStore::new(pool));
        return Ok((tasks, executions));
    }

    warn!("PG_USERNAME not configured, using in-memory stores (state is lost on exit)");
    let tasks: Arc<dyn TaskStore> = Arc::new(store::MemoryTaskStore::new());
    let executions: Arc<dyn ExecutionStore> = Arc::new(store::MemoryExecutionStore::new());
    Ok((tasks, executions))
}

async fn seed_tasks(service: &CollectionService, path: &Path) -> anyhow::Result<()> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read task file {}", path.display()))?;
    // YAML is a superset of JSON, so one parser covers both.
    let requests: Vec<CreateTask> = serde_yaml::from_str(&text)
        .with_context(|| format!("failed to parse task file {}", path.display()))?;

    let total = requests.len();
    let mut created = 0;
    for req in requests {
        let name = req.name.clone();
        match service.create_task(req).await {
            Ok(task) => {
                created += 1;
                debug!(task_id = %task.id, name = %task.name, "seeded task");
            }
            Err(e) => warn!(name = %name, error = %e, "failed to seed task"),
        }
    }
    info!(created, total, path = %path.display(), "task file loaded");
    Ok(())
}
