//! In-memory stores backed by insertion-ordered maps.

use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;

use super::{normalize_page, ExecutionStore, Page, StoreError, TaskQuery, TaskStore};
use crate::model::{CollectionTask, ExecutionOutcome, TaskExecution, TaskStatus};

fn poisoned<E>(_: E) -> StoreError {
    StoreError::LockPoisoned("memory store".to_string())
}

fn paginate<T: Clone>(items: Vec<T>, page: u32, size: u32) -> Page<T> {
    let (page, size, offset) = normalize_page(page, size);
    let total = items.len() as u64;
    let items = items
        .into_iter()
        .skip(offset as usize)
        .take(size as usize)
        .collect();
    Page { items, total, page, size }
}

// ── Tasks ────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<IndexMap<String, CollectionTask>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert(&self, task: &CollectionTask) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn update(&self, task: &CollectionTask) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        match tasks.get_mut(&task.id) {
            Some(slot) => {
                *slot = task.clone();
                Ok(())
            }
            None => Err(StoreError::TaskNotFound(task.id.clone())),
        }
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        Ok(tasks.shift_remove(id).is_some())
    }

    async fn get(&self, id: &str) -> Result<Option<CollectionTask>, StoreError> {
        let tasks = self.tasks.read().map_err(poisoned)?;
        Ok(tasks.get(id).cloned())
    }

    async fn list(&self, query: &TaskQuery) -> Result<Page<CollectionTask>, StoreError> {
        let tasks = self.tasks.read().map_err(poisoned)?;
        let needle = query.name_filter().map(str::to_lowercase);

        let mut matched: Vec<CollectionTask> = tasks
            .values()
            .rev()
            .filter(|t| query.status.map_or(true, |s| t.status == s))
            .filter(|t| {
                needle
                    .as_deref()
                    .map_or(true, |n| t.name.to_lowercase().contains(n))
            })
            .cloned()
            .collect();
        // Stable: equal timestamps keep the newest insertion first.
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(paginate(matched, query.page, query.size))
    }

    async fn list_scheduled(&self) -> Result<Vec<CollectionTask>, StoreError> {
        let tasks = self.tasks.read().map_err(poisoned)?;
        Ok(tasks.values().filter(|t| t.schedule().is_some()).cloned().collect())
    }

    async fn set_status(&self, id: &str, status: TaskStatus) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::TaskNotFound(id.to_string()))?;
        task.status = status;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn set_last_execution(&self, id: &str, execution_id: &str) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::TaskNotFound(id.to_string()))?;
        task.last_execution_id = Some(execution_id.to_string());
        task.updated_at = Utc::now();
        Ok(())
    }
}

// ── Executions ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryExecutionStore {
    executions: RwLock<IndexMap<String, TaskExecution>>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn insert(&self, execution: &TaskExecution) -> Result<(), StoreError> {
        let mut executions = self.executions.write().map_err(poisoned)?;
        executions.insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<TaskExecution>, StoreError> {
        let executions = self.executions.read().map_err(poisoned)?;
        Ok(executions.get(id).cloned())
    }

    async fn latest_for_task(&self, task_id: &str) -> Result<Option<TaskExecution>, StoreError> {
        let executions = self.executions.read().map_err(poisoned)?;
        // max_by_key keeps the last maximum, i.e. the latest insertion on ties.
        Ok(executions
            .values()
            .filter(|e| e.task_id == task_id)
            .max_by_key(|e| e.started_at)
            .cloned())
    }

    async fn list_for_task(
        &self,
        task_id: &str,
        page: u32,
        size: u32,
    ) -> Result<Page<TaskExecution>, StoreError> {
        let executions = self.executions.read().map_err(poisoned)?;
        let mut matched: Vec<TaskExecution> = executions
            .values()
            .rev()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(paginate(matched, page, size))
    }

    async fn finish(
        &self,
        id: &str,
        outcome: &ExecutionOutcome,
    ) -> Result<Option<TaskExecution>, StoreError> {
        let mut executions = self.executions.write().map_err(poisoned)?;
        let execution = executions
            .get_mut(id)
            .ok_or_else(|| StoreError::ExecutionNotFound(id.to_string()))?;
        if execution.finish(outcome) {
            Ok(Some(execution.clone()))
        } else {
            Ok(None)
        }
    }
}
