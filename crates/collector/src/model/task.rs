//! Collection task definition and its lifecycle status.

use std::fmt;
use std::path::{Component, Path};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::adapter::TaskConfig;
use crate::error::CollectionError;

/// Default wall-clock limit for one run when the task carries none.
pub const DEFAULT_TIMEOUT_SECS: u64 = 3600;

/// Lifecycle status of a [`CollectionTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Incomplete definition (blank config). Never executed or scheduled.
    Draft,
    Ready,
    Running,
    Success,
    Failed,
    Stopped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DRAFT" => Ok(Self::Draft),
            "READY" => Ok(Self::Ready),
            "RUNNING" => Ok(Self::Running),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            "STOPPED" => Ok(Self::Stopped),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

/// How a task is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncMode {
    /// Run once, right after the task is created or updated.
    Once,
    /// Run whenever the cron expression fires.
    Scheduled,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Once => "ONCE",
            Self::Scheduled => "SCHEDULED",
        }
    }
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ONCE" => Ok(Self::Once),
            "SCHEDULED" => Ok(Self::Scheduled),
            other => Err(format!("unknown sync mode '{}'", other)),
        }
    }
}

/// A user-defined collection job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionTask {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    /// Source/target parameters, parsed on demand into [`TaskConfig`].
    pub config: serde_json::Value,
    pub status: TaskStatus,
    pub sync_mode: SyncMode,
    /// Cron expression; required when `sync_mode` is `SCHEDULED`.
    pub schedule_expression: Option<String>,
    pub retry_count: u32,
    pub timeout_seconds: Option<u64>,
    pub max_records: Option<u64>,
    /// Dataset notified with a file scan after a successful run.
    pub dataset_id: Option<String>,
    /// Non-owning pointer to the most recently started execution.
    pub last_execution_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CollectionTask {
    /// The schedule expression, if it is set and not blank.
    pub fn schedule(&self) -> Option<&str> {
        self.schedule_expression
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Wall-clock limit for one run of this task.
    pub fn effective_timeout(&self, default: Duration) -> Duration {
        match self.timeout_seconds {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => default,
        }
    }

    /// Parse the stored configuration into its typed form.
    pub fn parsed_config(&self) -> Result<TaskConfig, CollectionError> {
        TaskConfig::from_value(&self.config)
    }

    pub fn is_draft(&self) -> bool {
        self.status == TaskStatus::Draft
    }
}

/// Reject ids that cannot name a per-task file: the id must be exactly one
/// plain path component with no separators or control characters.
pub fn validate_task_id(id: &str) -> Result<(), CollectionError> {
    let invalid = |why: &str| CollectionError::Validation(format!("invalid task id {:?}: {}", id, why));

    if id.trim().is_empty() {
        return Err(invalid("blank"));
    }
    if id.contains(['/', '\\']) {
        return Err(invalid("contains a path separator"));
    }
    if id.chars().any(char::is_control) {
        return Err(invalid("contains a control character"));
    }
    let mut components = Path::new(id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) if part == id => Ok(()),
        _ => Err(invalid("not a plain name")),
    }
}
