//! Persisted records: collection tasks and their executions.

pub mod execution;
pub mod task;

pub use execution::{ExecutionOutcome, ExecutionStatus, RunStats, TaskExecution};
pub use task::{validate_task_id, CollectionTask, SyncMode, TaskStatus, DEFAULT_TIMEOUT_SECS};
