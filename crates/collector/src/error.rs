//! Error taxonomy for the collection engine.

use thiserror::Error;

use crate::store::StoreError;

/// Errors raised while managing, scheduling or running collection tasks.
///
/// Errors inside a run never reach a caller: the coordinator records their
/// message on the execution and marks it `FAILED`.
#[derive(Debug, Error)]
pub enum CollectionError {
    /// Malformed or missing task configuration. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transfer engine timed out after {timeout_secs}s and was killed")]
    ProcessTimeout { timeout_secs: u64 },

    #[error("transfer engine exited with code {exit_code}")]
    ProcessFailure { exit_code: i32 },

    #[error("transfer engine was killed by signal {signal}")]
    ProcessKilled { signal: i32 },

    #[error("failed to launch transfer engine '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Bad cron expression or a failed lookup during a scheduler scan.
    #[error("scheduling error: {0}")]
    Scheduling(String),

    #[error("catalog notification failed: {0}")]
    CatalogNotification(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CollectionError {
    /// Map to an HTTP status code for API responses.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::Configuration(_) | Self::Scheduling(_) => 400,
            Self::TaskNotFound(_) | Self::ExecutionNotFound(_) => 404,
            Self::Store(StoreError::TaskNotFound(_)) | Self::Store(StoreError::ExecutionNotFound(_)) => 404,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(CollectionError::Validation("x".into()).status_code(), 400);
        assert_eq!(CollectionError::Configuration("x".into()).status_code(), 400);
        assert_eq!(CollectionError::TaskNotFound("t1".into()).status_code(), 404);
        assert_eq!(
            CollectionError::Store(StoreError::ExecutionNotFound("e1".into())).status_code(),
            404
        );
        assert_eq!(CollectionError::ProcessFailure { exit_code: 1 }.status_code(), 500);
    }

    #[test]
    fn messages_carry_context() {
        let err = CollectionError::ProcessFailure { exit_code: 3 };
        assert_eq!(err.to_string(), "transfer engine exited with code 3");

        let err = CollectionError::ProcessTimeout { timeout_secs: 5 };
        assert!(err.to_string().contains("5s"));

        let err = CollectionError::Launch {
            program: "python3".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
        };
        assert!(err.to_string().contains("python3"));
        assert!(err.to_string().contains("no such file"));
    }
}
