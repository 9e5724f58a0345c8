//! Job specification files consumed by the transfer engine.
//!
//! A spec wraps one reader and one writer, each a name plus a parameter map,
//! together with the engine's channel setting:
//!
//! ```json
//! {"job": {"content": [{"reader": {...}, "writer": {...}}],
//!          "setting": {"speed": {"channel": 2}}}}
//! ```

use std::path::{Path, PathBuf};

use harvest_core::CollectorConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::adapter::{Endpoint, TaskConfig};
use crate::error::CollectionError;
use crate::model::{validate_task_id, CollectionTask};

// ── Document shape ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub job: Job,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub content: Vec<JobContent>,
    pub setting: JobSetting,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobContent {
    pub reader: Plugin,
    pub writer: Plugin,
}

/// A reader or writer: adapter name plus its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plugin {
    pub name: String,
    pub parameter: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSetting {
    pub speed: Speed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Speed {
    pub channel: u32,
}

// ── Builder ──────────────────────────────────────────────────────────

/// Turns a task's configuration into a spec file at a per-task path.
#[derive(Debug, Clone)]
pub struct JobSpecBuilder {
    job_dir: PathBuf,
    dataset_root: PathBuf,
    default_channel: u32,
}

impl JobSpecBuilder {
    pub fn new(config: &CollectorConfig) -> Self {
        Self {
            job_dir: config.job_dir.clone(),
            dataset_root: config.dataset_root.clone(),
            default_channel: config.default_channel.max(1),
        }
    }

    /// Spec file for a task: `<job-dir>/<taskId>.json`.
    pub fn spec_path(&self, task_id: &str) -> Result<PathBuf, CollectionError> {
        validate_task_id(task_id)?;
        child_of(&self.job_dir, &format!("{}.json", task_id))
    }

    /// Managed output directory of a task: `<dataset-root>/<taskId>`.
    pub fn output_dir(&self, task_id: &str) -> Result<PathBuf, CollectionError> {
        validate_task_id(task_id)?;
        child_of(&self.dataset_root, task_id)
    }

    /// Translate the task into a spec without touching the filesystem.
    pub fn render(&self, task: &CollectionTask) -> Result<JobSpec, CollectionError> {
        let config = task.parsed_config()?;
        let reader = Plugin {
            name: config.source.reader_name().to_string(),
            parameter: config.source.parameter_map(),
        };
        let writer = match &config.target {
            Some(target) => Plugin {
                name: target.writer_name().to_string(),
                parameter: target.parameter_map(),
            },
            None => self.dataset_writer(&config, task)?,
        };

        Ok(JobSpec {
            job: Job {
                content: vec![JobContent { reader, writer }],
                setting: JobSetting {
                    speed: Speed {
                        channel: config.channel.filter(|c| *c > 0).unwrap_or(self.default_channel),
                    },
                },
            },
        })
    }

    /// Render and write the spec, replacing any earlier file for the task.
    pub async fn build(&self, task: &CollectionTask) -> Result<PathBuf, CollectionError> {
        let spec = self.render(task)?;
        let body = serde_json::to_vec_pretty(&spec)
            .map_err(|e| CollectionError::Configuration(format!("cannot serialize job spec: {}", e)))?;

        tokio::fs::create_dir_all(&self.job_dir).await?;
        let path = self.spec_path(&task.id)?;
        tokio::fs::write(&path, body).await?;
        debug!(task_id = %task.id, path = %path.display(), "job spec written");
        Ok(path)
    }

    /// Remove a task's spec file; a missing file is not an error.
    pub async fn remove(&self, task_id: &str) -> Result<(), CollectionError> {
        remove_if_exists(&self.spec_path(task_id)?, false).await
    }

    /// Remove a task's output directory; a missing directory is not an error.
    pub async fn remove_output(&self, task_id: &str) -> Result<(), CollectionError> {
        remove_if_exists(&self.output_dir(task_id)?, true).await
    }

    /// Sink used when the task has no explicit target.
    fn dataset_writer(&self, config: &TaskConfig, task: &CollectionTask) -> Result<Plugin, CollectionError> {
        let dest = self.output_dir(&task.id)?.to_string_lossy().into_owned();
        let mut parameter = Map::new();
        match &config.source {
            Endpoint::Nas(_) | Endpoint::Obs(_) => {
                parameter.insert("destPath".to_string(), Value::String(dest));
                Ok(Plugin {
                    name: config.source.writer_name().to_string(),
                    parameter,
                })
            }
            _ => {
                parameter.insert("path".to_string(), Value::String(dest));
                parameter.insert("fileName".to_string(), Value::String(task.id.clone()));
                parameter.insert("writeMode".to_string(), Value::String("truncate".to_string()));
                Ok(Plugin {
                    name: "txtfilewriter".to_string(),
                    parameter,
                })
            }
        }
    }
}

/// `root.join(name)`, refused unless it is a direct child of `root`.
fn child_of(root: &Path, name: &str) -> Result<PathBuf, CollectionError> {
    let path = root.join(name);
    if path.parent() != Some(root) {
        return Err(CollectionError::Validation(format!(
            "{:?} escapes {}",
            name,
            root.display()
        )));
    }
    Ok(path)
}

async fn remove_if_exists(path: &Path, dir: bool) -> Result<(), CollectionError> {
    let result = if dir {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
