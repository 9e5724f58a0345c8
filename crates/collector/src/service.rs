//! Task management operations consumed by the API layer.
//!
//! [`CollectionService`] validates requests, persists tasks, and forwards
//! run control to the [`ExecutionCoordinator`]. `ONCE` tasks are started
//! here, right after they are persisted; `SCHEDULED` tasks are left to the
//! scheduler.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::adapter::TaskConfig;
use crate::coordinator::ExecutionCoordinator;
use crate::error::CollectionError;
use crate::model::{validate_task_id, CollectionTask, SyncMode, TaskExecution, TaskStatus};
use crate::scheduler::cron::parse_schedule;
use crate::store::{ExecutionStore, Page, TaskQuery, TaskStore};

/// How long `delete_task` waits for a stopped run to let go of its files.
const DELETE_DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

// ── Request types ────────────────────────────────────────────────────

/// Request body for creating a collection task.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTask {
    /// Explicit id; generated when omitted.
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub config: serde_json::Value,
    /// Defaults to `ONCE`.
    #[serde(default)]
    pub sync_mode: Option<SyncMode>,
    #[serde(default)]
    pub schedule_expression: Option<String>,
    #[serde(default)]
    pub retry_count: Option<u32>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub max_records: Option<u64>,
    #[serde(default)]
    pub dataset_id: Option<String>,
}

/// Request body for updating a collection task (all fields optional).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateTask {
    pub name: Option<String>,
    pub description: Option<String>,
    pub config: Option<serde_json::Value>,
    pub sync_mode: Option<SyncMode>,
    pub schedule_expression: Option<String>,
    pub retry_count: Option<u32>,
    pub timeout_seconds: Option<u64>,
    pub max_records: Option<u64>,
    pub dataset_id: Option<String>,
}

// ── Service ──────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct CollectionService {
    tasks: Arc<dyn TaskStore>,
    executions: Arc<dyn ExecutionStore>,
    coordinator: ExecutionCoordinator,
}

impl CollectionService {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        executions: Arc<dyn ExecutionStore>,
        coordinator: ExecutionCoordinator,
    ) -> Self {
        Self {
            tasks,
            executions,
            coordinator,
        }
    }

    pub fn coordinator(&self) -> &ExecutionCoordinator {
        &self.coordinator
    }

    /// Create a task. A `ONCE` task with a usable config starts immediately.
    pub async fn create_task(&self, req: CreateTask) -> Result<CollectionTask, CollectionError> {
        let id = match req.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        };
        validate_task_id(&id)?;
        if self.tasks.get(&id).await?.is_some() {
            return Err(CollectionError::Validation(format!("task {} already exists", id)));
        }

        let now = Utc::now();
        let mut task = CollectionTask {
            id,
            name: req.name,
            description: req.description,
            config: req.config,
            status: TaskStatus::Ready,
            sync_mode: req.sync_mode.unwrap_or(SyncMode::Once),
            schedule_expression: req.schedule_expression,
            retry_count: req.retry_count.unwrap_or(0),
            timeout_seconds: req.timeout_seconds,
            max_records: req.max_records,
            dataset_id: req.dataset_id,
            last_execution_id: None,
            created_at: now,
            updated_at: now,
        };
        normalize(&mut task)?;
        task.status = if TaskConfig::is_complete(&task.config) {
            TaskStatus::Ready
        } else {
            TaskStatus::Draft
        };

        self.tasks.insert(&task).await?;
        info!(
            task_id = %task.id,
            name = %task.name,
            sync_mode = task.sync_mode.as_str(),
            status = %task.status,
            "collection task created"
        );

        if task.sync_mode == SyncMode::Once && !task.is_draft() {
            self.start_once(&task).await;
        }
        self.get_task(&task.id).await
    }

    /// Apply a partial update. A `ONCE` task is started again unless a run
    /// for it is still in progress.
    pub async fn update_task(&self, id: &str, req: UpdateTask) -> Result<CollectionTask, CollectionError> {
        let mut task = self.get_task(id).await?;

        if let Some(name) = req.name {
            task.name = name;
        }
        if let Some(description) = req.description {
            task.description = Some(description);
        }
        if let Some(config) = req.config {
            task.config = config;
        }
        if let Some(mode) = req.sync_mode {
            task.sync_mode = mode;
        }
        if let Some(expr) = req.schedule_expression {
            task.schedule_expression = Some(expr);
        }
        if let Some(retry) = req.retry_count {
            task.retry_count = retry;
        }
        if let Some(timeout) = req.timeout_seconds {
            task.timeout_seconds = Some(timeout);
        }
        if let Some(max) = req.max_records {
            task.max_records = Some(max);
        }
        if let Some(dataset) = req.dataset_id {
            task.dataset_id = Some(dataset);
        }
        normalize(&mut task)?;

        if !TaskConfig::is_complete(&task.config) {
            task.status = TaskStatus::Draft;
        } else if task.is_draft() {
            task.status = TaskStatus::Ready;
        }
        task.updated_at = Utc::now();

        self.tasks.update(&task).await?;
        info!(task_id = %task.id, status = %task.status, "collection task updated");

        if task.sync_mode == SyncMode::Once && !task.is_draft() {
            if self.has_running_execution(&task.id).await? {
                info!(task_id = %task.id, "run in progress, not starting another");
            } else {
                self.start_once(&task).await;
            }
        }
        self.get_task(&task.id).await
    }

    /// Stop any running execution, then remove the task and its files.
    /// Execution history is kept.
    pub async fn delete_task(&self, id: &str) -> Result<(), CollectionError> {
        let task = self.get_task(id).await?;

        if let Some(latest) = self.executions.latest_for_task(id).await? {
            if latest.is_running() {
                self.coordinator.stop(&latest.id).await?;
            }
        }
        let in_flight = self.coordinator.in_flight_for_task(id);
        for execution_id in &in_flight {
            self.coordinator.stop(execution_id).await?;
        }
        for execution_id in &in_flight {
            if tokio::time::timeout(DELETE_DRAIN_TIMEOUT, self.coordinator.wait(execution_id))
                .await
                .is_err()
            {
                warn!(task_id = %id, execution_id = %execution_id, "stopped run still draining");
            }
        }

        self.tasks.delete(id).await?;
        let builder = self.coordinator.builder();
        if let Err(e) = builder.remove(id).await {
            warn!(task_id = %id, error = %e, "failed to remove job spec");
        }
        if let Err(e) = builder.remove_output(id).await {
            warn!(task_id = %id, error = %e, "failed to remove task output");
        }

        info!(task_id = %id, name = %task.name, "collection task deleted");
        Ok(())
    }

    pub async fn get_task(&self, id: &str) -> Result<CollectionTask, CollectionError> {
        self.tasks
            .get(id)
            .await?
            .ok_or_else(|| CollectionError::TaskNotFound(id.to_string()))
    }

    pub async fn list_tasks(&self, query: &TaskQuery) -> Result<Page<CollectionTask>, CollectionError> {
        Ok(self.tasks.list(query).await?)
    }

    /// Start a run right now, regardless of schedule or running executions.
    pub async fn execute_task(&self, id: &str) -> Result<String, CollectionError> {
        let task = self.get_task(id).await?;
        self.coordinator.start(&task).await
    }

    /// Stop the task's latest execution if it is running.
    pub async fn stop_task(&self, id: &str) -> Result<bool, CollectionError> {
        self.get_task(id).await?;
        match self.executions.latest_for_task(id).await? {
            Some(latest) if latest.is_running() => self.coordinator.stop(&latest.id).await,
            _ => Ok(false),
        }
    }

    pub async fn list_executions(
        &self,
        task_id: &str,
        page: u32,
        size: u32,
    ) -> Result<Page<TaskExecution>, CollectionError> {
        Ok(self.executions.list_for_task(task_id, page, size).await?)
    }

    pub async fn get_execution(&self, id: &str) -> Result<TaskExecution, CollectionError> {
        self.executions
            .get(id)
            .await?
            .ok_or_else(|| CollectionError::ExecutionNotFound(id.to_string()))
    }

    pub async fn stop_execution(&self, id: &str) -> Result<bool, CollectionError> {
        self.coordinator.stop(id).await
    }

    async fn has_running_execution(&self, task_id: &str) -> Result<bool, CollectionError> {
        if self.coordinator.is_task_in_flight(task_id) {
            return Ok(true);
        }
        Ok(self
            .executions
            .latest_for_task(task_id)
            .await?
            .map_or(false, |e| e.is_running()))
    }

    async fn start_once(&self, task: &CollectionTask) {
        if let Err(e) = self.coordinator.start(task).await {
            warn!(task_id = %task.id, error = %e, "failed to start one-shot task");
        }
    }
}

/// Trim and check user-supplied fields; enforce the schedule rules per sync mode.
fn normalize(task: &mut CollectionTask) -> Result<(), CollectionError> {
    task.name = task.name.trim().to_string();
    if task.name.is_empty() {
        return Err(CollectionError::Validation("task name must not be blank".to_string()));
    }

    match task.sync_mode {
        SyncMode::Once => task.schedule_expression = None,
        SyncMode::Scheduled => {
            let expr = task.schedule().map(str::to_string).ok_or_else(|| {
                CollectionError::Validation(
                    "scheduleExpression is required for SCHEDULED tasks".to_string(),
                )
            })?;
            parse_schedule(&expr)?;
            task.schedule_expression = Some(expr);
        }
    }
    Ok(())
}
