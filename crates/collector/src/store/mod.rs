//! Persistence contracts for tasks and executions.
//!
//! Two implementations ship with the crate: [`memory`] (insertion-ordered
//! maps, used by tests and by the worker without PostgreSQL) and
//! [`postgres`] (sqlx against the `collection_tasks` / `task_executions`
//! tables).

pub mod error;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::{CollectionTask, ExecutionOutcome, TaskExecution, TaskStatus};

pub use error::StoreError;
pub use memory::{MemoryExecutionStore, MemoryTaskStore};
pub use postgres::{PgExecutionStore, PgTaskStore};

pub const DEFAULT_PAGE_SIZE: u32 = 20;
const MAX_PAGE_SIZE: u32 = 500;

// ── Queries ──────────────────────────────────────────────────────────

/// Filter and paging for [`TaskStore::list`]. Pages are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskQuery {
    pub status: Option<TaskStatus>,
    /// Case-insensitive substring of the task name.
    pub name: Option<String>,
    pub page: u32,
    pub size: u32,
}

impl Default for TaskQuery {
    fn default() -> Self {
        Self {
            status: None,
            name: None,
            page: 1,
            size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl TaskQuery {
    /// Name filter, trimmed, `None` when blank.
    pub fn name_filter(&self) -> Option<&str> {
        self.name.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

/// Clamp a 1-based page request and return `(page, size, offset)`.
pub fn normalize_page(page: u32, size: u32) -> (u32, u32, u64) {
    let page = page.max(1);
    let size = if size == 0 { DEFAULT_PAGE_SIZE } else { size.min(MAX_PAGE_SIZE) };
    let offset = (page as u64 - 1) * size as u64;
    (page, size, offset)
}

/// One page of results plus the unpaged total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub size: u32,
}

// ── Contracts ────────────────────────────────────────────────────────

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: &CollectionTask) -> Result<(), StoreError>;

    /// Replace a stored task. `TaskNotFound` when the id is unknown.
    async fn update(&self, task: &CollectionTask) -> Result<(), StoreError>;

    /// Returns `false` when nothing was deleted.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<CollectionTask>, StoreError>;

    /// Filtered page, newest first.
    async fn list(&self, query: &TaskQuery) -> Result<Page<CollectionTask>, StoreError>;

    /// Every task with a non-blank schedule expression.
    async fn list_scheduled(&self) -> Result<Vec<CollectionTask>, StoreError>;

    async fn set_status(&self, id: &str, status: TaskStatus) -> Result<(), StoreError>;

    async fn set_last_execution(&self, id: &str, execution_id: &str) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn insert(&self, execution: &TaskExecution) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<TaskExecution>, StoreError>;

    /// Most recent execution of a task by `started_at`; among equal start
    /// times the one inserted last wins.
    async fn latest_for_task(&self, task_id: &str) -> Result<Option<TaskExecution>, StoreError>;

    /// Executions of a task, newest first.
    async fn list_for_task(
        &self,
        task_id: &str,
        page: u32,
        size: u32,
    ) -> Result<Page<TaskExecution>, StoreError>;

    /// Move a `RUNNING` execution to a terminal state.
    ///
    /// Returns the updated record when the transition applied, `None` when
    /// the execution had already left `RUNNING`, and `ExecutionNotFound`
    /// when the id is unknown. This is the only way an execution leaves
    /// `RUNNING`.
    async fn finish(
        &self,
        id: &str,
        outcome: &ExecutionOutcome,
    ) -> Result<Option<TaskExecution>, StoreError>;
}
