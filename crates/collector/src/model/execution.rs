//! One run attempt of a collection task.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::CollectionTask;

/// Status of a [`TaskExecution`]. Only `RUNNING` is non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Success,
    Failed,
    Stopped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RUNNING" => Ok(Self::Running),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            "STOPPED" => Ok(Self::Stopped),
            other => Err(format!("unknown execution status '{}'", other)),
        }
    }
}

/// Record counters and output volume of a run. Best-effort.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    pub records_total: u64,
    pub records_processed: u64,
    pub records_success: u64,
    pub records_failed: u64,
    pub data_size_bytes: u64,
}

/// Terminal state applied to a running execution, exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub completed_at: DateTime<Utc>,
    pub progress: f64,
    pub stats: RunStats,
    pub error_message: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl ExecutionOutcome {
    pub fn success(completed_at: DateTime<Utc>, stats: RunStats) -> Self {
        Self {
            status: ExecutionStatus::Success,
            completed_at,
            progress: 1.0,
            stats,
            error_message: None,
            result: None,
        }
    }

    pub fn failed(completed_at: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            completed_at,
            progress: 0.0,
            stats: RunStats::default(),
            error_message: Some(message.into()),
            result: None,
        }
    }

    pub fn stopped(completed_at: DateTime<Utc>, message: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Stopped,
            completed_at,
            progress: 0.0,
            stats: RunStats::default(),
            error_message: Some(message.into()),
            result: None,
        }
    }

    pub fn with_stats(mut self, stats: RunStats) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }
}

/// One attempt to run a [`CollectionTask`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecution {
    pub id: String,
    pub task_id: String,
    /// Task name at the time the run started.
    pub task_name: String,
    pub status: ExecutionStatus,
    /// 0.0 to 1.0.
    pub progress: f64,
    pub records_total: u64,
    pub records_processed: u64,
    pub records_success: u64,
    pub records_failed: u64,
    pub data_size_bytes: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// `completed_at - started_at`, set when the run ends.
    pub duration_seconds: Option<i64>,
    pub error_message: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl TaskExecution {
    /// A fresh `RUNNING` execution for `task`, started at `now`.
    pub fn start(task: &CollectionTask, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            task_name: task.name.clone(),
            status: ExecutionStatus::Running,
            progress: 0.0,
            records_total: 0,
            records_processed: 0,
            records_success: 0,
            records_failed: 0,
            data_size_bytes: 0,
            started_at: now,
            completed_at: None,
            duration_seconds: None,
            error_message: None,
            result: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ExecutionStatus::Running
    }

    /// Apply a terminal outcome. Returns `false` (and changes nothing) when
    /// the execution has already left `RUNNING`.
    pub fn finish(&mut self, outcome: &ExecutionOutcome) -> bool {
        if !self.is_running() {
            return false;
        }
        self.status = outcome.status;
        self.completed_at = Some(outcome.completed_at);
        self.duration_seconds = Some(
            outcome
                .completed_at
                .signed_duration_since(self.started_at)
                .num_seconds()
                .max(0),
        );
        self.progress = outcome.progress.clamp(0.0, 1.0);
        self.records_total = outcome.stats.records_total;
        self.records_processed = outcome.stats.records_processed;
        self.records_success = outcome.stats.records_success;
        self.records_failed = outcome.stats.records_failed;
        self.data_size_bytes = outcome.stats.data_size_bytes;
        self.error_message = outcome.error_message.clone();
        self.result = outcome.result.clone();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SyncMode, TaskStatus};

    fn make_task() -> CollectionTask {
        CollectionTask {
            id: "task-1".to_string(),
            name: "nas import".to_string(),
            description: None,
            config: serde_json::json!({}),
            status: TaskStatus::Ready,
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

    #[test]
    fn start_snapshots_task() {
        let now = Utc::now();
        let exec = TaskExecution::start(&make_task(), now);
        assert_eq!(exec.task_id, "task-1");
        assert_eq!(exec.task_name, "nas import");
        assert_eq!(exec.status, ExecutionStatus::Running);
        assert_eq!(exec.started_at, now);
        assert!(exec.completed_at.is_none());
        assert!(Uuid::parse_str(&exec.id).is_ok());
    }

    #[test]
    fn finish_computes_duration() {
        let started = Utc::now() - chrono::Duration::seconds(42);
        let mut exec = TaskExecution::start(&make_task(), started);
        let completed = started + chrono::Duration::seconds(42);
        let stats = RunStats {
            records_total: 10,
            records_processed: 10,
            records_success: 9,
            records_failed: 1,
            data_size_bytes: 1024,
        };

        assert!(exec.finish(&ExecutionOutcome::success(completed, stats)));
        assert_eq!(exec.status, ExecutionStatus::Success);
        assert_eq!(exec.completed_at, Some(completed));
        assert_eq!(exec.duration_seconds, Some(42));
        assert_eq!(exec.progress, 1.0);
        assert_eq!(exec.records_failed, 1);
        assert_eq!(exec.data_size_bytes, 1024);
    }

    #[test]
    fn finish_applies_only_once() {
        let started = Utc::now();
        let mut exec = TaskExecution::start(&make_task(), started);
        let first = started + chrono::Duration::seconds(1);
        assert!(exec.finish(&ExecutionOutcome::stopped(first, "stopped by request")));

        let later = started + chrono::Duration::seconds(30);
        assert!(!exec.finish(&ExecutionOutcome::failed(later, "exit 137")));
        assert_eq!(exec.status, ExecutionStatus::Stopped);
        assert_eq!(exec.completed_at, Some(first));
        assert_eq!(exec.error_message.as_deref(), Some("stopped by request"));
    }

    #[test]
    fn terminal_statuses() {
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Success.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Stopped.is_terminal());
        assert_eq!("stopped".parse::<ExecutionStatus>().unwrap(), ExecutionStatus::Stopped);
    }
}
