use thiserror::Error;

/// Errors from task and execution store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A persisted value could not be mapped back onto the model.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
}
