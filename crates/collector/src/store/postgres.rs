//! PostgreSQL stores for `collection_tasks` and `task_executions`.
//!
//! Both stores are cheap to clone: they hold only the shared [`PgPool`].
//! Enum columns are stored as their upper-case names, counters as BIGINT.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::PostgresConfig;
use sqlx::PgPool;
use tracing::info;

use super::{normalize_page, ExecutionStore, Page, StoreError, TaskQuery, TaskStore};
use crate::model::{CollectionTask, ExecutionOutcome, TaskExecution, TaskStatus};

/// Connect and apply the embedded migrations.
pub async fn connect(config: &PostgresConfig) -> Result<PgPool, StoreError> {
    let pool = PgPool::connect(&config.database_url()).await?;
    info!("PostgreSQL connected: {}", config.host);
    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .map_err(sqlx::Error::from)?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn to_u64(v: i64) -> u64 {
    v.max(0) as u64
}

/// `ILIKE` pattern matching `needle` anywhere, with its own wildcards escaped.
fn contains_pattern(needle: &str) -> String {
    let mut pattern = String::with_capacity(needle.len() + 2);
    pattern.push('%');
    for c in needle.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

// ── Row mapping ──────────────────────────────────────────────────────

const TASK_COLUMNS: &str = "id, name, description, config, status, sync_mode, schedule_expression, \
     retry_count, timeout_seconds, max_records, dataset_id, last_execution_id, created_at, updated_at";

const EXECUTION_COLUMNS: &str = "id, task_id, task_name, status, progress, records_total, \
     records_processed, records_success, records_failed, data_size_bytes, started_at, \
     completed_at, duration_seconds, error_message, result";

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    name: String,
    description: Option<String>,
    config: serde_json::Value,
    status: String,
    sync_mode: String,
    schedule_expression: Option<String>,
    retry_count: i32,
    timeout_seconds: Option<i64>,
    max_records: Option<i64>,
    dataset_id: Option<String>,
    last_execution_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for CollectionTask {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(CollectionTask {
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            sync_mode: row.sync_mode.parse().map_err(StoreError::Corrupt)?,
            id: row.id,
            name: row.name,
            description: row.description,
            config: row.config,
            schedule_expression: row.schedule_expression,
            retry_count: row.retry_count.max(0) as u32,
            timeout_seconds: row.timeout_seconds.map(to_u64),
            max_records: row.max_records.map(to_u64),
            dataset_id: row.dataset_id,
            last_execution_id: row.last_execution_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: String,
    task_id: String,
    task_name: String,
    status: String,
    progress: f64,
    records_total: i64,
    records_processed: i64,
    records_success: i64,
    records_failed: i64,
    data_size_bytes: i64,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    duration_seconds: Option<i64>,
    error_message: Option<String>,
    result: Option<serde_json::Value>,
}

impl TryFrom<ExecutionRow> for TaskExecution {
    type Error = StoreError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        Ok(TaskExecution {
            status: row.status.parse().map_err(StoreError::Corrupt)?,
            id: row.id,
            task_id: row.task_id,
            task_name: row.task_name,
            progress: row.progress,
            records_total: to_u64(row.records_total),
            records_processed: to_u64(row.records_processed),
            records_success: to_u64(row.records_success),
            records_failed: to_u64(row.records_failed),
            data_size_bytes: to_u64(row.data_size_bytes),
            started_at: row.started_at,
            completed_at: row.completed_at,
            duration_seconds: row.duration_seconds,
            error_message: row.error_message,
            result: row.result,
        })
    }
}

// ── Tasks ────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn insert(&self, task: &CollectionTask) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO collection_tasks (id, name, description, config, status, sync_mode,
                 schedule_expression, retry_count, timeout_seconds, max_records, dataset_id,
                 last_execution_id, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(&task.id)
        .bind(&task.name)
        .bind(&task.description)
        .bind(&task.config)
        .bind(task.status.as_str())
        .bind(task.sync_mode.as_str())
        .bind(&task.schedule_expression)
        .bind(i32::try_from(task.retry_count).unwrap_or(i32::MAX))
        .bind(task.timeout_seconds.map(to_i64))
        .bind(task.max_records.map(to_i64))
        .bind(&task.dataset_id)
        .bind(&task.last_execution_id)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, task: &CollectionTask) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE collection_tasks SET
                 name = $2, description = $3, config = $4, status = $5, sync_mode = $6,
                 schedule_expression = $7, retry_count = $8, timeout_seconds = $9,
                 max_records = $10, dataset_id = $11, last_execution_id = $12, updated_at = $13
             WHERE id = $1",
        )
        .bind(&task.id)
        .bind(&task.name)
        .bind(&task.description)
        .bind(&task.config)
        .bind(task.status.as_str())
        .bind(task.sync_mode.as_str())
        .bind(&task.schedule_expression)
        .bind(i32::try_from(task.retry_count).unwrap_or(i32::MAX))
        .bind(task.timeout_seconds.map(to_i64))
        .bind(task.max_records.map(to_i64))
        .bind(&task.dataset_id)
        .bind(&task.last_execution_id)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(task.id.clone()));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM collection_tasks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, id: &str) -> Result<Option<CollectionTask>, StoreError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM collection_tasks WHERE id = $1");
        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(CollectionTask::try_from).transpose()
    }

    async fn list(&self, query: &TaskQuery) -> Result<Page<CollectionTask>, StoreError> {
        let (page, size, offset) = normalize_page(query.page, query.size);
        let status = query.status.map(|s| s.as_str());
        let pattern = query.name_filter().map(contains_pattern);

        let (total,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM collection_tasks
             WHERE ($1::text IS NULL OR status = $1)
               AND ($2::text IS NULL OR name ILIKE $2)",
        )
        .bind(status)
        .bind(&pattern)
        .fetch_one(&self.pool)
        .await?;

        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM collection_tasks
             WHERE ($1::text IS NULL OR status = $1)
               AND ($2::text IS NULL OR name ILIKE $2)
             ORDER BY created_at DESC, id DESC
             LIMIT $3 OFFSET $4"
        );
        let rows = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(status)
            .bind(&pattern)
            .bind(size as i64)
            .bind(to_i64(offset))
            .fetch_all(&self.pool)
            .await?;

        let items = rows
            .into_iter()
            .map(CollectionTask::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page { items, total: to_u64(total), page, size })
    }

    async fn list_scheduled(&self) -> Result<Vec<CollectionTask>, StoreError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM collection_tasks
             WHERE schedule_expression IS NOT NULL AND btrim(schedule_expression) <> ''
             ORDER BY created_at"
        );
        let rows = sqlx::query_as::<_, TaskRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(CollectionTask::try_from).collect()
    }

    async fn set_status(&self, id: &str, status: TaskStatus) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE collection_tasks SET status = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn set_last_execution(&self, id: &str, execution_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE collection_tasks SET last_execution_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(execution_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(id.to_string()));
        }
        Ok(())
    }
}

// ── Executions ───────────────────────────────────────────────────────

#[derive(Clone)]
pub struct PgExecutionStore {
    pool: PgPool,
}

impl PgExecutionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExecutionStore for PgExecutionStore {
    async fn insert(&self, execution: &TaskExecution) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO task_executions (id, task_id, task_name, status, progress,
                 records_total, records_processed, records_success, records_failed,
                 data_size_bytes, started_at, completed_at, duration_seconds, error_message, result)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(&execution.id)
        .bind(&execution.task_id)
        .bind(&execution.task_name)
        .bind(execution.status.as_str())
        .bind(execution.progress)
        .bind(to_i64(execution.records_total))
        .bind(to_i64(execution.records_processed))
        .bind(to_i64(execution.records_success))
        .bind(to_i64(execution.records_failed))
        .bind(to_i64(execution.data_size_bytes))
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(execution.duration_seconds)
        .bind(&execution.error_message)
        .bind(&execution.result)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<TaskExecution>, StoreError> {
        let sql = format!("SELECT {EXECUTION_COLUMNS} FROM task_executions WHERE id = $1");
        let row = sqlx::query_as::<_, ExecutionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TaskExecution::try_from).transpose()
    }

    async fn latest_for_task(&self, task_id: &str) -> Result<Option<TaskExecution>, StoreError> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM task_executions
             WHERE task_id = $1
             ORDER BY started_at DESC, seq DESC
             LIMIT 1"
        );
        let row = sqlx::query_as::<_, ExecutionRow>(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TaskExecution::try_from).transpose()
    }

    async fn list_for_task(
        &self,
        task_id: &str,
        page: u32,
        size: u32,
    ) -> Result<Page<TaskExecution>, StoreError> {
        let (page, size, offset) = normalize_page(page, size);

        let (total,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM task_executions WHERE task_id = $1")
                .bind(task_id)
                .fetch_one(&self.pool)
                .await?;

        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM task_executions
             WHERE task_id = $1
             ORDER BY started_at DESC, seq DESC
             LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query_as::<_, ExecutionRow>(&sql)
            .bind(task_id)
            .bind(size as i64)
            .bind(to_i64(offset))
            .fetch_all(&self.pool)
            .await?;

        let items = rows
            .into_iter()
            .map(TaskExecution::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page { items, total: to_u64(total), page, size })
    }

    async fn finish(
        &self,
        id: &str,
        outcome: &ExecutionOutcome,
    ) -> Result<Option<TaskExecution>, StoreError> {
        let sql = format!(
            "UPDATE task_executions SET
                 status = $2, completed_at = $3,
                 duration_seconds = GREATEST(FLOOR(EXTRACT(EPOCH FROM ($3 - started_at)))::BIGINT, 0),
                 progress = $4, records_total = $5, records_processed = $6,
                 records_success = $7, records_failed = $8, data_size_bytes = $9,
                 error_message = $10, result = $11
             WHERE id = $1 AND status = 'RUNNING'
             RETURNING {EXECUTION_COLUMNS}"
        );
        let row = sqlx::query_as::<_, ExecutionRow>(&sql)
            .bind(id)
            .bind(outcome.status.as_str())
            .bind(outcome.completed_at)
            .bind(outcome.progress.clamp(0.0, 1.0))
            .bind(to_i64(outcome.stats.records_total))
            .bind(to_i64(outcome.stats.records_processed))
            .bind(to_i64(outcome.stats.records_success))
            .bind(to_i64(outcome.stats.records_failed))
            .bind(to_i64(outcome.stats.data_size_bytes))
            .bind(&outcome.error_message)
            .bind(&outcome.result)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(TaskExecution::try_from(row)?)),
            None => {
                let exists: Option<(String,)> =
                    sqlx::query_as("SELECT id FROM task_executions WHERE id = $1")
                        .bind(id)
                        .fetch_optional(&self.pool)
                        .await?;
                match exists {
                    Some(_) => Ok(None),
                    None => Err(StoreError::ExecutionNotFound(id.to_string())),
                }
            }
        }
    }
}
