use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u16(profile: &str, key: &str, default: u16) -> u16 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_bool(profile: &str, key: &str, default: bool) -> bool {
    match profiled_env_opt(profile, key).map(|v| v.to_ascii_lowercase()) {
        Some(v) if v == "true" || v == "1" || v == "yes" => true,
        Some(v) if v == "false" || v == "0" || v == "no" => false,
        _ => default,
    }
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub collector: CollectorConfig,
    pub catalog: CatalogConfig,
    pub postgres: PostgresConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `HARVEST_PROFILE` env var. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("HARVEST_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            collector: CollectorConfig::from_env_profiled(p),
            catalog: CatalogConfig::from_env_profiled(p),
            postgres: PostgresConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Reject settings the collector cannot start with.
    pub fn validate(&self) -> Result<(), HarvestError> {
        if self.collector.runtime.trim().is_empty() {
            return Err(HarvestError::Config("COLLECT_RUNTIME must not be empty".to_string()));
        }
        if let Some(url) = &self.catalog.base_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(HarvestError::Config(format!(
                    "CATALOG_URL must be an http(s) URL, got '{}'",
                    url
                )));
            }
        }
        Ok(())
    }

    /// Return a redacted view safe for API responses (no secrets).
    pub fn redacted_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "collector": {
                "poll_interval_secs": self.collector.poll_interval_secs,
                "runtime": self.collector.runtime,
                "job_dir": self.collector.job_dir,
                "log_dir": self.collector.log_dir,
                "dataset_root": self.collector.dataset_root,
                "default_timeout_secs": self.collector.default_timeout_secs,
                "default_channel": self.collector.default_channel,
                "max_concurrent": self.collector.max_concurrent,
                "kill_grace_secs": self.collector.kill_grace_secs,
            },
            "catalog": {
                "base_url": self.catalog.base_url,
                "configured": self.catalog.is_configured(),
            },
            "postgres": {
                "host": self.postgres.host,
                "port": self.postgres.port,
                "database": self.postgres.database,
                "configured": self.postgres.is_configured(),
            },
        })
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        let c = &self.collector;
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  collector:   poll={}s, runtime={} {}, workers={}",
            c.poll_interval_secs,
            c.runtime,
            c.runtime_args.join(" "),
            c.max_concurrent
        );
        tracing::info!(
            "  paths:       jobs={}, logs={}, datasets={}",
            c.job_dir.display(),
            c.log_dir.display(),
            c.dataset_root.display()
        );
        tracing::info!(
            "  defaults:    timeout={}s, kill-grace={}s, channel={}",
            c.default_timeout_secs,
            c.kill_grace_secs,
            c.default_channel
        );
        tracing::info!("  catalog:     url={}", self.catalog.base_url.as_deref().unwrap_or("(none)"));
        tracing::info!(
            "  postgres:    host={}, db={}, configured={}",
            self.postgres.host,
            self.postgres.database,
            self.postgres.is_configured()
        );
    }
}

// ── Collector ─────────────────────────────────────────────────

/// Settings for the collection scheduler and the external transfer engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Scheduler poll interval.
    pub poll_interval_secs: u64,
    /// External runtime executable (e.g. `python3`).
    pub runtime: String,
    /// Arguments placed before the job-spec path (e.g. the engine launcher script).
    pub runtime_args: Vec<String>,
    /// Where job-spec files are written, one per task.
    pub job_dir: PathBuf,
    /// Where per-execution logs are written.
    pub log_dir: PathBuf,
    /// Root of the per-task output directories.
    pub dataset_root: PathBuf,
    pub default_timeout_secs: u64,
    pub default_channel: u32,
    /// Size of the worker pool running external processes.
    pub max_concurrent: usize,
    /// Mirror child output to this process's stdout/stderr.
    pub mirror_output: bool,
    /// Time between SIGTERM and SIGKILL when a run is torn down. A timed-out
    /// run ends no later than its timeout plus this grace.
    pub kill_grace_secs: u64,
}

impl CollectorConfig {
    fn from_env_profiled(p: &str) -> Self {
        let runtime_args = profiled_env_or(p, "COLLECT_RUNTIME_ARGS", "/opt/datax/bin/datax.py")
            .split_whitespace()
            .map(String::from)
            .collect();
        Self {
            poll_interval_secs: profiled_env_u64(p, "COLLECT_POLL_INTERVAL_SECS", 10).max(1),
            runtime: profiled_env_or(p, "COLLECT_RUNTIME", "python3"),
            runtime_args,
            job_dir: PathBuf::from(profiled_env_or(p, "COLLECT_JOB_DIR", "data/collection/jobs")),
            log_dir: PathBuf::from(profiled_env_or(p, "COLLECT_LOG_DIR", "data/collection/logs")),
            dataset_root: PathBuf::from(profiled_env_or(p, "COLLECT_DATASET_ROOT", "data/dataset")),
            default_timeout_secs: profiled_env_u64(p, "COLLECT_DEFAULT_TIMEOUT_SECS", 3600),
            default_channel: profiled_env_u32(p, "COLLECT_DEFAULT_CHANNEL", 2).max(1),
            max_concurrent: profiled_env_u32(p, "COLLECT_MAX_CONCURRENT", 4).max(1) as usize,
            mirror_output: profiled_env_bool(p, "COLLECT_MIRROR_OUTPUT", true),
            kill_grace_secs: profiled_env_u64(p, "COLLECT_KILL_GRACE_SECS", 2),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    /// Create the job, log and dataset directories if missing.
    pub fn ensure_dirs(&self) -> Result<(), HarvestError> {
        for dir in [&self.job_dir, &self.log_dir, &self.dataset_root] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            runtime: "python3".to_string(),
            runtime_args: vec!["/opt/datax/bin/datax.py".to_string()],
            job_dir: PathBuf::from("data/collection/jobs"),
            log_dir: PathBuf::from("data/collection/logs"),
            dataset_root: PathBuf::from("data/dataset"),
            default_timeout_secs: 3600,
            default_channel: 2,
            max_concurrent: 4,
            mirror_output: true,
            kill_grace_secs: 2,
        }
    }
}

// ── Dataset catalog ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Base URL of the dataset catalog service. `None` = log-only notifications.
    pub base_url: Option<String>,
    pub timeout_secs: u64,
}

impl CatalogConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            base_url: profiled_env_opt(p, "CATALOG_URL")
                .map(|u| u.trim_end_matches('/').to_string()),
            timeout_secs: profiled_env_u64(p, "CATALOG_TIMEOUT_SECS", 10),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.base_url.is_some()
    }
}

// ── PostgreSQL ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl_mode: String,
    pub max_connections: u32,
}

impl PostgresConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_or(p, "PG_HOST", "localhost"),
            port: profiled_env_u16(p, "PG_PORT", 5432),
            database: profiled_env_or(p, "PG_DATABASE", "harvest"),
            username: profiled_env_opt(p, "PG_USERNAME"),
            password: profiled_env_opt(p, "PG_PASSWORD"),
            ssl_mode: profiled_env_or(p, "PG_SSL_MODE", "prefer"),
            max_connections: profiled_env_u32(p, "PG_MAX_CONNECTIONS", 10),
        }
    }

    pub fn database_url(&self) -> String {
        let user = self.username.as_deref().unwrap_or("postgres");
        let pass = self.password.as_deref().unwrap_or("");
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            user, pass, self.host, self.port, self.database, self.ssl_mode
        )
    }

    pub fn is_configured(&self) -> bool {
        self.username.is_some()
    }
}
