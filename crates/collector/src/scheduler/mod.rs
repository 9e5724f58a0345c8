//! Fixed-interval scheduler for `SCHEDULED` collection tasks.
//!
//! Each tick lists tasks with a schedule expression and, per task:
//! 1. skips it when its latest execution is still `RUNNING` (or a run was
//!    dispatched and has not reconciled yet)
//! 2. parses the cron expression
//! 3. computes the first fire time after the anchor (latest start, or one
//!    year ago for a task that never ran)
//! 4. starts a run when that fire time is not after now
//!
//! Per-task failures are logged and counted; they never abort the scan.

pub mod cron;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::adapter::TaskConfig;
use crate::coordinator::ExecutionCoordinator;
use crate::error::CollectionError;
use crate::model::{CollectionTask, SyncMode};
use crate::store::{ExecutionStore, TaskStore};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// `(task_id, execution_id)` for every run started.
    pub triggered: Vec<(String, String)>,
    pub skipped_running: usize,
    pub skipped_draft: usize,
    pub not_due: usize,
    pub errors: usize,
}

enum Decision {
    Triggered(String),
    Running,
    NotDue,
}

pub struct CollectionScheduler {
    tasks: Arc<dyn TaskStore>,
    executions: Arc<dyn ExecutionStore>,
    coordinator: ExecutionCoordinator,
    interval: Duration,
}

impl CollectionScheduler {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        executions: Arc<dyn ExecutionStore>,
        coordinator: ExecutionCoordinator,
        interval: Duration,
    ) -> Self {
        Self {
            tasks,
            executions,
            coordinator,
            interval: interval.max(Duration::from_millis(100)),
        }
    }

    /// Evaluate every scheduled task once against `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        let tasks = match self.tasks.list_scheduled().await {
            Ok(tasks) => tasks,
            Err(e) => {
                let err = CollectionError::Scheduling(format!("failed to list scheduled tasks: {}", e));
                warn!(error = %err, "scheduler: scan skipped");
                report.errors += 1;
                return report;
            }
        };

        for task in tasks {
            if task.sync_mode != SyncMode::Scheduled {
                continue;
            }
            if task.is_draft() || !TaskConfig::is_complete(&task.config) {
                report.skipped_draft += 1;
                continue;
            }

            match self.evaluate(&task, now).await {
                Ok(Decision::Triggered(execution_id)) => {
                    report.triggered.push((task.id.clone(), execution_id));
                }
                Ok(Decision::Running) => report.skipped_running += 1,
                Ok(Decision::NotDue) => report.not_due += 1,
                Err(e) => {
                    warn!(
                        task_id = %task.id,
                        task_name = %task.name,
                        error = %e,
                        "scheduler: task skipped this cycle"
                    );
                    report.errors += 1;
                }
            }
        }

        debug!(
            triggered = report.triggered.len(),
            skipped_running = report.skipped_running,
            not_due = report.not_due,
            errors = report.errors,
            "scheduler tick done"
        );
        report
    }

    async fn evaluate(&self, task: &CollectionTask, now: DateTime<Utc>) -> Result<Decision, CollectionError> {
        if self.coordinator.is_task_in_flight(&task.id) {
            return Ok(Decision::Running);
        }

        let latest = self
            .executions
            .latest_for_task(&task.id)
            .await
            .map_err(|e| CollectionError::Scheduling(format!("latest execution lookup failed: {}", e)))?;
        if latest.as_ref().map_or(false, |e| e.is_running()) {
            return Ok(Decision::Running);
        }

        let expr = task.schedule().unwrap_or_default();
        let schedule = cron::parse_schedule(expr)?;
        let base = cron::anchor(latest.map(|e| e.started_at), now);

        if !cron::is_due(&schedule, base, now) {
            debug!(
                task_id = %task.id,
                next = ?cron::next_fire(&schedule, now),
                "scheduler: not due"
            );
            return Ok(Decision::NotDue);
        }

        let execution_id = self.coordinator.start(task).await?;
        info!(
            task_id = %task.id,
            execution_id = %execution_id,
            cron = %expr,
            "scheduler: triggered run"
        );
        Ok(Decision::Triggered(execution_id))
    }

    /// Tick on a fixed interval until `shutdown` is notified.
    pub async fn run(&self, shutdown: Arc<Notify>) {
        info!(
            "collection scheduler started (poll interval: {}s)",
            self.interval.as_secs_f64()
        );

        let stop = shutdown.notified();
        tokio::pin!(stop);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = ticker.tick() => {
                    self.tick(Utc::now()).await;
                }
            }
        }

        info!("collection scheduler stopped");
    }
}
