//! Tests for the scheduler module.

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use harvest_core::CollectorConfig;
    use serde_json::json;
    use tokio::sync::Notify;

    use crate::catalog::LoggingCatalog;
    use crate::coordinator::ExecutionCoordinator;
    use crate::error::CollectionError;
    use crate::model::{CollectionTask, ExecutionOutcome, SyncMode, TaskExecution, TaskStatus};
    use crate::scheduler::cron::{anchor, is_due, normalize_cron, parse_schedule};
    use crate::scheduler::CollectionScheduler;
    use crate::store::{ExecutionStore, MemoryExecutionStore, MemoryTaskStore, TaskStore};

    struct Fixture {
        tasks: Arc<MemoryTaskStore>,
        executions: Arc<MemoryExecutionStore>,
        coordinator: ExecutionCoordinator,
        scheduler: CollectionScheduler,
    }

    fn fixture(root: &Path) -> Fixture {
        fixture_with_engine(root, "true", &[])
    }

    fn fixture_with_engine(root: &Path, runtime: &str, args: &[&str]) -> Fixture {
        let tasks = Arc::new(MemoryTaskStore::new());
        let executions = Arc::new(MemoryExecutionStore::new());
        let config = CollectorConfig {
            runtime: runtime.to_string(),
            runtime_args: args.iter().map(|a| a.to_string()).collect(),
            job_dir: root.join("jobs"),
            log_dir: root.join("logs"),
            dataset_root: root.join("dataset"),
            mirror_output: false,
            ..CollectorConfig::default()
        };
        let coordinator = ExecutionCoordinator::new(
            tasks.clone(),
            executions.clone(),
            Arc::new(LoggingCatalog),
            &config,
        );
        let scheduler = CollectionScheduler::new(
            tasks.clone(),
            executions.clone(),
            coordinator.clone(),
            Duration::from_millis(100),
        );
        Fixture { tasks, executions, coordinator, scheduler }
    }

    fn scheduled_task(id: &str, cron: &str) -> CollectionTask {
        CollectionTask {
            id: id.to_string(),
            name: format!("Task {}", id),
            description: None,
            config: json!({"source": {"type": "local", "path": "/tmp/in"}}),
            status: TaskStatus::Ready,
            sync_mode: SyncMode::Scheduled,
            schedule_expression: Some(cron.to_string()),
            retry_count: 0,
            timeout_seconds: None,
            max_records: None,
            dataset_id: None,
            last_execution_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    // -- cron helpers ------------------------------------------------------

    #[test]
    fn normalize_cron_5_to_6_fields() {
        assert_eq!(normalize_cron("*/15 * * * *"), "0 */15 * * * *");
        assert_eq!(normalize_cron("  30 2 1 * *  "), "0 30 2 1 * *");
    }

    #[test]
    fn normalize_cron_replaces_question_mark() {
        assert_eq!(normalize_cron("0 0 * * * ?"), "0 0 * * * *");
        assert_eq!(normalize_cron("0 0 12 ? * MON"), "0 0 12 * * MON");
    }

    #[test]
    fn parse_schedule_rejects_garbage() {
        assert!(matches!(parse_schedule("every hour"), Err(CollectionError::Scheduling(_))));
        assert!(matches!(parse_schedule("* *"), Err(CollectionError::Scheduling(_))));
        assert!(matches!(parse_schedule("0 0 99 * * *"), Err(CollectionError::Scheduling(_))));
        assert!(parse_schedule("0 0 * * * ?").is_ok());
        assert!(parse_schedule("*/5 * * * *").is_ok());
    }

    #[test]
    fn anchor_defaults_to_one_year_back() {
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        assert_eq!(anchor(None, now), Utc.with_ymd_and_hms(2023, 6, 15, 12, 0, 0).unwrap());

        let started = Utc.with_ymd_and_hms(2024, 6, 15, 11, 0, 0).unwrap();
        assert_eq!(anchor(Some(started), now), started);
    }

    #[test]
    fn hourly_task_without_history_is_due() {
        let schedule = parse_schedule("0 0 * * * ?").unwrap();
        let now = Utc::now();
        assert!(is_due(&schedule, anchor(None, now), now));
    }

    #[test]
    fn due_only_once_fire_time_passed() {
        let schedule = parse_schedule("0 0 * * * ?").unwrap();
        let last = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();

        let before = Utc.with_ymd_and_hms(2024, 1, 1, 10, 59, 59).unwrap();
        assert!(!is_due(&schedule, last, before));

        let at = Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap();
        assert!(is_due(&schedule, last, at));
    }

    // -- tick --------------------------------------------------------------

    #[tokio::test]
    async fn first_tick_triggers_task_without_history() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path());
        f.tasks.insert(&scheduled_task("t1", "0 0 * * * ?")).await.unwrap();

        let report = f.scheduler.tick(Utc::now()).await;
        assert_eq!(report.triggered.len(), 1);
        assert_eq!(report.triggered[0].0, "t1");

        f.coordinator.wait_all().await;
        let latest = f.executions.latest_for_task("t1").await.unwrap().unwrap();
        assert_eq!(latest.id, report.triggered[0].1);
        assert!(!latest.is_running());
    }

    #[tokio::test]
    async fn running_latest_execution_is_never_restarted() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path());
        let task = scheduled_task("t1", "* * * * * *");
        f.tasks.insert(&task).await.unwrap();
        let running = TaskExecution::start(&task, Utc::now() - chrono::Duration::hours(3));
        f.executions.insert(&running).await.unwrap();

        for _ in 0..3 {
            let report = f.scheduler.tick(Utc::now()).await;
            assert!(report.triggered.is_empty());
            assert_eq!(report.skipped_running, 1);
        }
        let page = f.executions.list_for_task("t1", 1, 10).await.unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn recent_run_is_not_due_again() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path());
        let task = scheduled_task("t1", "0 0 0 1 1 ?");
        f.tasks.insert(&task).await.unwrap();

        let now = Utc::now();
        let done = TaskExecution::start(&task, now);
        f.executions.insert(&done).await.unwrap();
        f.executions
            .finish(&done.id, &ExecutionOutcome::failed(now, "exit 1"))
            .await
            .unwrap();

        let report = f.scheduler.tick(now).await;
        assert!(report.triggered.is_empty());
        assert_eq!(report.not_due, 1);
    }

    #[tokio::test]
    async fn bad_cron_does_not_stop_the_scan() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path());
        f.tasks.insert(&scheduled_task("bad", "not a cron")).await.unwrap();
        f.tasks.insert(&scheduled_task("good", "0 0 * * * ?")).await.unwrap();

        let report = f.scheduler.tick(Utc::now()).await;
        assert_eq!(report.errors, 1);
        assert_eq!(report.triggered.len(), 1);
        assert_eq!(report.triggered[0].0, "good");

        let bad = f.tasks.get("bad").await.unwrap().unwrap();
        assert_eq!(bad.status, TaskStatus::Ready);
        f.coordinator.wait_all().await;
    }

    #[tokio::test]
    async fn drafts_and_once_tasks_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path());
        let mut draft = scheduled_task("draft", "0 0 * * * ?");
        draft.status = TaskStatus::Draft;
        f.tasks.insert(&draft).await.unwrap();
        let mut once = scheduled_task("once", "0 0 * * * ?");
        once.sync_mode = SyncMode::Once;
        f.tasks.insert(&once).await.unwrap();

        let report = f.scheduler.tick(Utc::now()).await;
        assert!(report.triggered.is_empty());
        assert_eq!(report.skipped_draft, 1);
        assert!(f.executions.latest_for_task("once").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn slow_run_blocks_next_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture_with_engine(dir.path(), "sh", &["-c", "sleep 5", "engine"]);
        f.tasks.insert(&scheduled_task("t1", "* * * * * *")).await.unwrap();

        let first = f.scheduler.tick(Utc::now()).await;
        assert_eq!(first.triggered.len(), 1);
        assert!(f.coordinator.is_task_in_flight("t1"));

        let later = Utc::now() + chrono::Duration::seconds(3);
        let second = f.scheduler.tick(later).await;
        assert!(second.triggered.is_empty());
        assert_eq!(second.skipped_running, 1);

        assert_eq!(f.coordinator.stop_all().await, 1);
        f.coordinator.wait_all().await;
        let latest = f.executions.latest_for_task("t1").await.unwrap().unwrap();
        assert_eq!(latest.status, crate::model::ExecutionStatus::Stopped);
    }

    #[tokio::test]
    async fn run_exits_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let f = fixture(dir.path());
        let shutdown = Arc::new(Notify::new());

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            trigger.notify_waiters();
        });

        tokio::time::timeout(Duration::from_secs(5), f.scheduler.run(shutdown))
            .await
            .expect("scheduler should stop after shutdown");
    }
}
