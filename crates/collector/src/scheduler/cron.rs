//! Cron normalization and due-checks.

use std::str::FromStr;

use chrono::{DateTime, Duration, Months, Utc};
use cron::Schedule;

use crate::error::CollectionError;

/// Bring a user expression into the 6/7-field form the `cron` crate parses.
///
/// 5-field expressions get a leading `0` seconds field. Quartz `?` (no
/// specific value) becomes `*`.
pub fn normalize_cron(expr: &str) -> String {
    let fields: Vec<String> = expr
        .split_whitespace()
        .map(|f| if f == "?" { "*".to_string() } else { f.to_string() })
        .collect();
    if fields.len() == 5 {
        format!("0 {}", fields.join(" "))
    } else {
        fields.join(" ")
    }
}

pub fn parse_schedule(expr: &str) -> Result<Schedule, CollectionError> {
    let normalized = normalize_cron(expr);
    let count = normalized.split_whitespace().count();
    if !(6..=7).contains(&count) {
        return Err(CollectionError::Scheduling(format!(
            "cron expression '{}' has {} fields, expected 5 to 7",
            expr.trim(),
            expr.split_whitespace().count()
        )));
    }
    Schedule::from_str(&normalized).map_err(|e| {
        CollectionError::Scheduling(format!("invalid cron expression '{}': {}", expr.trim(), e))
    })
}

/// Base time for the due-check: the latest run's start, or one year before
/// `now` for a task that has never run, so any schedule fires on the first
/// scan after creation.
pub fn anchor(latest_started: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    latest_started.unwrap_or_else(|| {
        now.checked_sub_months(Months::new(12))
            .unwrap_or_else(|| now - Duration::days(365))
    })
}

/// Due when the first fire time after `base` is not after `now`.
pub fn is_due(schedule: &Schedule, base: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    match schedule.after(&base).next() {
        Some(next) => next <= now,
        None => false,
    }
}

/// Next fire time after `now`, for display.
pub fn next_fire(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&now).next()
}
