//! Orchestrates single runs: record, build, launch, reconcile.
//!
//! [`ExecutionCoordinator::start`] persists a `RUNNING` execution and returns
//! its id right away; the actual work happens on the [`WorkerPool`]. Every
//! run ends in exactly one [`ExecutionStore::finish`] call that applies, so a
//! run that was stopped while the engine was still going keeps its
//! `STOPPED` record when the engine later exits.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use harvest_core::CollectorConfig;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::adapter::TaskConfig;
use crate::catalog::DatasetCatalog;
use crate::error::CollectionError;
use crate::jobspec::JobSpecBuilder;
use crate::model::{CollectionTask, ExecutionOutcome, ExecutionStatus, TaskExecution, TaskStatus};
use crate::pool::WorkerPool;
use crate::stats;
use crate::store::{ExecutionStore, TaskStore};
use crate::supervisor::{CancelHandle, ProcessExit, ProcessSupervisor, RunEnd};

/// Bookkeeping for a dispatched run that has not reconciled yet.
struct InFlight {
    task_id: String,
    cancel: CancelHandle,
    handle: Option<JoinHandle<()>>,
}

struct Inner {
    tasks: Arc<dyn TaskStore>,
    executions: Arc<dyn ExecutionStore>,
    builder: JobSpecBuilder,
    supervisor: ProcessSupervisor,
    catalog: Arc<dyn DatasetCatalog>,
    pool: WorkerPool,
    default_timeout: Duration,
    in_flight: Mutex<HashMap<String, InFlight>>,
}

/// Cheap to clone; clones share stores, pool and the in-flight registry.
#[derive(Clone)]
pub struct ExecutionCoordinator {
    inner: Arc<Inner>,
}

impl ExecutionCoordinator {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        executions: Arc<dyn ExecutionStore>,
        catalog: Arc<dyn DatasetCatalog>,
        config: &CollectorConfig,
    ) -> Self {
        Self::from_parts(
            tasks,
            executions,
            catalog,
            JobSpecBuilder::new(config),
            ProcessSupervisor::new(config),
            WorkerPool::new(config.max_concurrent),
            config.default_timeout(),
        )
    }

    pub fn from_parts(
        tasks: Arc<dyn TaskStore>,
        executions: Arc<dyn ExecutionStore>,
        catalog: Arc<dyn DatasetCatalog>,
        builder: JobSpecBuilder,
        supervisor: ProcessSupervisor,
        pool: WorkerPool,
        default_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                tasks,
                executions,
                builder,
                supervisor,
                catalog,
                pool,
                default_timeout,
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn builder(&self) -> &JobSpecBuilder {
        &self.inner.builder
    }

    /// Execution log location for an execution id.
    pub fn log_path(&self, execution_id: &str) -> PathBuf {
        self.inner.supervisor.log_path(execution_id)
    }

    // ── Starting ─────────────────────────────────────────────────────

    /// Record a new `RUNNING` execution for `task` and dispatch it.
    ///
    /// The task is reloaded from the store, so the run uses its current
    /// definition; unknown tasks are refused before anything is recorded.
    /// Does not check for an execution already running for the task; that
    /// guard belongs to the scheduler. Draft tasks are refused.
    pub async fn start(&self, task: &CollectionTask) -> Result<String, CollectionError> {
        let stored = self
            .inner
            .tasks
            .get(&task.id)
            .await?
            .ok_or_else(|| CollectionError::TaskNotFound(task.id.clone()))?;
        let task = &stored;
        if task.is_draft() {
            return Err(CollectionError::Validation(format!(
                "task {} is a draft and cannot run",
                task.id
            )));
        }

        let execution = TaskExecution::start(task, Utc::now());
        let execution_id = execution.id.clone();
        self.inner.executions.insert(&execution).await?;

        if let Err(e) = self.mark_task_started(&task.id, &execution_id).await {
            let outcome = ExecutionOutcome::failed(Utc::now(), e.to_string());
            let _ = self.inner.executions.finish(&execution_id, &outcome).await;
            return Err(e);
        }

        let cancel = CancelHandle::new();
        self.registry().insert(
            execution_id.clone(),
            InFlight {
                task_id: task.id.clone(),
                cancel: cancel.clone(),
                handle: None,
            },
        );

        let this = self.clone();
        let run_task = task.clone();
        let run_id = execution_id.clone();
        let handle = self.inner.pool.spawn(async move {
            this.run(run_task, run_id, cancel).await;
        });
        if let Some(entry) = self.registry().get_mut(&execution_id) {
            entry.handle = Some(handle);
        }

        info!(
            task_id = %task.id,
            execution_id = %execution_id,
            "execution started"
        );
        Ok(execution_id)
    }

    async fn mark_task_started(&self, task_id: &str, execution_id: &str) -> Result<(), CollectionError> {
        self.inner.tasks.set_last_execution(task_id, execution_id).await?;
        self.inner.tasks.set_status(task_id, TaskStatus::Running).await?;
        Ok(())
    }

    // ── Running ──────────────────────────────────────────────────────

    async fn run(self, task: CollectionTask, execution_id: String, cancel: CancelHandle) {
        if cancel.is_cancelled() {
            debug!(execution_id = %execution_id, "execution stopped before it was launched");
            self.forget(&execution_id);
            return;
        }

        let outcome = self.execute(&task, &execution_id, &cancel).await;
        self.complete(&task, &execution_id, outcome).await;
        self.forget(&execution_id);
    }

    async fn execute(
        &self,
        task: &CollectionTask,
        execution_id: &str,
        cancel: &CancelHandle,
    ) -> ExecutionOutcome {
        let timeout = task.effective_timeout(self.inner.default_timeout);
        let (exit, completed_at) = match self.launch(task, execution_id, timeout, cancel).await {
            Ok(end) => (end.exit, end.ended_at),
            Err(e) => return ExecutionOutcome::failed(Utc::now(), e.to_string()),
        };
        let output_dir = match self.inner.builder.output_dir(&task.id) {
            Ok(dir) => dir,
            Err(e) => return ExecutionOutcome::failed(completed_at, e.to_string()),
        };

        let log_path = self.inner.supervisor.log_path(execution_id);
        let run_stats = stats::collect(log_path.clone(), output_dir).await;
        let result = json!({
            "exitCode": exit.code(),
            "exit": exit.to_string(),
            "logPath": log_path.to_string_lossy(),
        });

        let outcome = match exit {
            ProcessExit::Code(0) => ExecutionOutcome::success(completed_at, run_stats),
            ProcessExit::Code(exit_code) => ExecutionOutcome::failed(
                completed_at,
                CollectionError::ProcessFailure { exit_code }.to_string(),
            )
            .with_stats(run_stats),
            ProcessExit::Signal(signal) => ExecutionOutcome::failed(
                completed_at,
                CollectionError::ProcessKilled { signal }.to_string(),
            )
            .with_stats(run_stats),
            ProcessExit::TimedOut => ExecutionOutcome::failed(
                completed_at,
                CollectionError::ProcessTimeout { timeout_secs: timeout.as_secs() }.to_string(),
            )
            .with_stats(run_stats),
            ProcessExit::Cancelled => {
                ExecutionOutcome::stopped(completed_at, "execution cancelled").with_stats(run_stats)
            }
        };
        outcome.with_result(result)
    }

    async fn launch(
        &self,
        task: &CollectionTask,
        execution_id: &str,
        timeout: Duration,
        cancel: &CancelHandle,
    ) -> Result<RunEnd, CollectionError> {
        let spec = self.inner.builder.build(task).await?;
        self.inner
            .supervisor
            .run(&spec, execution_id, timeout, cancel)
            .await
    }

    /// Apply the outcome if the execution is still `RUNNING`, then mirror it
    /// onto the task and notify the catalog on success.
    async fn complete(&self, task: &CollectionTask, execution_id: &str, outcome: ExecutionOutcome) {
        let execution = match self.inner.executions.finish(execution_id, &outcome).await {
            Ok(Some(execution)) => execution,
            Ok(None) => {
                debug!(
                    execution_id = %execution_id,
                    status = %outcome.status,
                    "execution already finished, outcome discarded"
                );
                return;
            }
            Err(e) => {
                error!(execution_id = %execution_id, error = %e, "failed to record execution outcome");
                return;
            }
        };

        match execution.status {
            ExecutionStatus::Success => info!(
                task_id = %task.id,
                execution_id = %execution_id,
                records = execution.records_total,
                duration_secs = execution.duration_seconds.unwrap_or(0),
                "execution succeeded"
            ),
            _ => error!(
                task_id = %task.id,
                execution_id = %execution_id,
                status = %execution.status,
                error = %execution.error_message.as_deref().unwrap_or(""),
                "execution did not succeed"
            ),
        }

        self.mirror_status(&task.id, &execution).await;

        if execution.status == ExecutionStatus::Success {
            if let Some(dataset_id) = task.dataset_id.clone() {
                self.notify_catalog(dataset_id, task.id.clone());
            }
        }
    }

    /// Copy a terminal execution status onto its task, unless a newer
    /// execution has been started for the task since or the task has been
    /// turned into a draft while the run was going.
    async fn mirror_status(&self, task_id: &str, execution: &TaskExecution) {
        let status = match execution.status {
            ExecutionStatus::Success => TaskStatus::Success,
            ExecutionStatus::Failed => TaskStatus::Failed,
            ExecutionStatus::Stopped => TaskStatus::Stopped,
            ExecutionStatus::Running => return,
        };

        match self.inner.tasks.get(task_id).await {
            Ok(Some(task)) if task.is_draft() || !TaskConfig::is_complete(&task.config) => debug!(
                task_id = %task_id,
                execution_id = %execution.id,
                "task became a draft, status not mirrored"
            ),
            Ok(Some(task)) if task.last_execution_id.as_deref() == Some(execution.id.as_str()) => {
                if let Err(e) = self.inner.tasks.set_status(task_id, status).await {
                    warn!(task_id = %task_id, error = %e, "failed to update task status");
                }
            }
            Ok(Some(_)) => debug!(
                task_id = %task_id,
                execution_id = %execution.id,
                "newer execution owns the task status"
            ),
            Ok(None) => debug!(task_id = %task_id, "task gone, status not mirrored"),
            Err(e) => warn!(task_id = %task_id, error = %e, "failed to load task"),
        }
    }

    fn notify_catalog(&self, dataset_id: String, task_id: String) {
        let catalog = Arc::clone(&self.inner.catalog);
        tokio::spawn(async move {
            if let Err(e) = catalog.scan_data_source(&dataset_id, &task_id).await {
                let err = CollectionError::CatalogNotification(e.to_string());
                warn!(
                    dataset_id = %dataset_id,
                    task_id = %task_id,
                    catalog = catalog.name(),
                    error = %err,
                    "dataset scan request failed"
                );
            }
        });
    }

    // ── Stopping ─────────────────────────────────────────────────────

    /// Force a `RUNNING` execution to `STOPPED` and kill its process.
    ///
    /// Returns `Ok(false)` without changing anything when the execution has
    /// already ended, so repeated calls are harmless.
    pub async fn stop(&self, execution_id: &str) -> Result<bool, CollectionError> {
        let execution = self
            .inner
            .executions
            .get(execution_id)
            .await?
            .ok_or_else(|| CollectionError::ExecutionNotFound(execution_id.to_string()))?;
        if !execution.is_running() {
            return Ok(false);
        }

        let outcome = ExecutionOutcome::stopped(Utc::now(), "stopped by request");
        let stopped = match self.inner.executions.finish(execution_id, &outcome).await? {
            Some(stopped) => stopped,
            None => return Ok(false),
        };

        if let Some(cancel) = self.cancel_handle(execution_id) {
            cancel.cancel();
        }
        self.mirror_status(&stopped.task_id, &stopped).await;

        info!(
            task_id = %stopped.task_id,
            execution_id = %execution_id,
            "execution stopped"
        );
        Ok(true)
    }

    /// Stop every dispatched run. Returns how many were stopped.
    pub async fn stop_all(&self) -> usize {
        let ids: Vec<String> = self.registry().keys().cloned().collect();
        let mut stopped = 0;
        for id in ids {
            match self.stop(&id).await {
                Ok(true) => stopped += 1,
                Ok(false) => {}
                Err(e) => warn!(execution_id = %id, error = %e, "failed to stop execution"),
            }
        }
        stopped
    }

    // ── In-flight registry ───────────────────────────────────────────

    /// Whether a run for this task has been dispatched and not yet reconciled.
    pub fn is_task_in_flight(&self, task_id: &str) -> bool {
        self.registry().values().any(|f| f.task_id == task_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.registry().len()
    }

    /// Dispatched, unreconciled execution ids of a task.
    pub fn in_flight_for_task(&self, task_id: &str) -> Vec<String> {
        self.registry()
            .iter()
            .filter(|(_, f)| f.task_id == task_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Wait until the run for `execution_id` has reconciled.
    pub async fn wait(&self, execution_id: &str) {
        loop {
            let (present, handle) = self.take_handle(execution_id);
            if !present {
                return;
            }
            match handle {
                Some(handle) => {
                    let _ = handle.await;
                }
                None => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
    }

    /// Wait until every dispatched run has reconciled.
    pub async fn wait_all(&self) {
        loop {
            let (remaining, handles) = self.take_all_handles();
            if remaining == 0 {
                return;
            }
            if handles.is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
                continue;
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
        // Entries are plain data; a panic elsewhere cannot leave them torn.
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cancel_handle(&self, execution_id: &str) -> Option<CancelHandle> {
        self.registry().get(execution_id).map(|f| f.cancel.clone())
    }

    fn take_handle(&self, execution_id: &str) -> (bool, Option<JoinHandle<()>>) {
        match self.registry().get_mut(execution_id) {
            Some(entry) => (true, entry.handle.take()),
            None => (false, None),
        }
    }

    fn take_all_handles(&self) -> (usize, Vec<JoinHandle<()>>) {
        let mut registry = self.registry();
        let handles = registry.values_mut().filter_map(|f| f.handle.take()).collect();
        (registry.len(), handles)
    }

    fn forget(&self, execution_id: &str) {
        self.registry().remove(execution_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::LoggingCatalog;
    use crate::model::SyncMode;
    use crate::store::{MemoryExecutionStore, MemoryTaskStore};

    fn coordinator(root: &std::path::Path) -> (ExecutionCoordinator, Arc<MemoryTaskStore>, Arc<MemoryExecutionStore>) {
        let tasks = Arc::new(MemoryTaskStore::new());
        let executions = Arc::new(MemoryExecutionStore::new());
        let config = CollectorConfig {
            runtime: "sh".to_string(),
            runtime_args: vec!["-c".to_string(), "exit 0".to_string()],
            job_dir: root.join("jobs"),
            log_dir: root.join("logs"),
            dataset_root: root.join("dataset"),
            mirror_output: false,
            ..CollectorConfig::default()
        };
        let coordinator = ExecutionCoordinator::new(
            tasks.clone(),
            executions.clone(),
            Arc::new(LoggingCatalog),
            &config,
        );
        (coordinator, tasks, executions)
    }

    fn task(id: &str, status: TaskStatus, config: serde_json::Value) -> CollectionTask {
        CollectionTask {
            id: id.to_string(),
            name: format!("task {id}"),
            description: None,
            config,
            status,
            sync_mode: SyncMode::Once,
            schedule_expression: None,
            retry_count: 0,
            timeout_seconds: None,
            max_records: None,
            dataset_id: None,
            last_execution_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn draft_tasks_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, tasks, executions) = coordinator(dir.path());
        let draft = task("d1", TaskStatus::Draft, serde_json::json!({}));
        tasks.insert(&draft).await.unwrap();

        let err = coordinator.start(&draft).await.unwrap_err();
        assert!(matches!(err, CollectionError::Validation(_)));
        assert!(executions.latest_for_task("d1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bad_config_fails_without_launching() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, tasks, executions) = coordinator(dir.path());
        let broken = task("b1", TaskStatus::Ready, serde_json::json!({"source": {"type": "ftp"}}));
        tasks.insert(&broken).await.unwrap();

        let id = coordinator.start(&broken).await.unwrap();
        coordinator.wait(&id).await;

        let execution = executions.get(&id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.error_message.unwrap().contains("configuration error"));
        assert!(!coordinator.log_path(&id).exists());
        assert_eq!(tasks.get("b1").await.unwrap().unwrap().status, TaskStatus::Failed);
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn start_for_unknown_task_records_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _tasks, executions) = coordinator(dir.path());
        let ghost = task(
            "ghost",
            TaskStatus::Ready,
            serde_json::json!({"source": {"type": "local", "path": "/tmp/in"}}),
        );

        let err = coordinator.start(&ghost).await.unwrap_err();
        assert!(matches!(err, CollectionError::TaskNotFound(_)));
        assert!(executions.latest_for_task("ghost").await.unwrap().is_none());
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn stored_draft_status_wins_over_stale_copy() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, tasks, executions) = coordinator(dir.path());
        let stale = task("s1", TaskStatus::Ready, serde_json::json!({"source": {"type": "local", "path": "/in"}}));
        let mut draft = stale.clone();
        draft.status = TaskStatus::Draft;
        draft.config = serde_json::json!({});
        tasks.insert(&draft).await.unwrap();

        let err = coordinator.start(&stale).await.unwrap_err();
        assert!(matches!(err, CollectionError::Validation(_)));
        assert!(executions.latest_for_task("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stop_unknown_execution_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _, _) = coordinator(dir.path());
        let err = coordinator.stop("nope").await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn queued_run_is_running_and_can_be_stopped_before_launch() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let tasks = Arc::new(MemoryTaskStore::new());
        let executions = Arc::new(MemoryExecutionStore::new());
        let config = CollectorConfig {
            runtime: "sh".to_string(),
            runtime_args: vec!["-c".to_string(), "sleep 30".to_string()],
            job_dir: root.join("jobs"),
            log_dir: root.join("logs"),
            dataset_root: root.join("dataset"),
            mirror_output: false,
            ..CollectorConfig::default()
        };
        let coordinator = ExecutionCoordinator::from_parts(
            tasks.clone(),
            executions.clone(),
            Arc::new(LoggingCatalog),
            JobSpecBuilder::new(&config),
            ProcessSupervisor::new(&config).with_kill_grace(Duration::from_millis(200)),
            WorkerPool::new(1),
            Duration::from_secs(60),
        );

        let source = serde_json::json!({"source": {"type": "local", "path": "/tmp/in"}});
        let first = task("q1", TaskStatus::Ready, source.clone());
        let second = task("q2", TaskStatus::Ready, source);
        tasks.insert(&first).await.unwrap();
        tasks.insert(&second).await.unwrap();

        let running = coordinator.start(&first).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let queued = coordinator.start(&second).await.unwrap();

        let record = executions.get(&queued).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Running);
        assert_eq!(coordinator.in_flight_count(), 2);

        assert!(coordinator.stop(&queued).await.unwrap());
        assert!(coordinator.stop(&running).await.unwrap());
        tokio::time::timeout(Duration::from_secs(10), coordinator.wait_all())
            .await
            .unwrap();

        assert_eq!(coordinator.in_flight_count(), 0);
        assert!(!coordinator.log_path(&queued).exists());
        for id in [&running, &queued] {
            let execution = executions.get(id).await.unwrap().unwrap();
            assert_eq!(execution.status, ExecutionStatus::Stopped);
        }
        assert_eq!(tasks.get("q2").await.unwrap().unwrap().status, TaskStatus::Stopped);
    }
}
