//! Typed source/target configuration of a collection task.
//!
//! A task's `config` column holds a JSON document of the form
//!
//! ```json
//! {
//!   "source": { "type": "nas", "ip": "10.0.0.5", "path": "/export/raw" },
//!   "target": { "type": "obs", "endpoint": "...", "bucket": "...", ... },
//!   "channel": 4
//! }
//! ```
//!
//! `target` is optional; without it the transfer lands in the task's managed
//! dataset directory. Adapter names are derived from the endpoint kind.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CollectionError;

/// Parsed form of [`CollectionTask::config`](crate::model::CollectionTask::config).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    pub source: Endpoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Endpoint>,
    /// Transfer engine concurrency; falls back to the configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<u32>,
}

impl TaskConfig {
    /// Parse a stored configuration value.
    ///
    /// Null, blank strings and empty objects are rejected as blank. A string
    /// value is treated as serialized JSON.
    pub fn from_value(value: &Value) -> Result<Self, CollectionError> {
        let parsed;
        let value = match value {
            Value::Null => return Err(blank()),
            Value::String(s) if s.trim().is_empty() => return Err(blank()),
            Value::String(s) => {
                parsed = serde_json::from_str::<Value>(s).map_err(|e| {
                    CollectionError::Configuration(format!("config is not valid JSON: {}", e))
                })?;
                &parsed
            }
            other => other,
        };

        match value {
            Value::Object(map) if map.is_empty() => return Err(blank()),
            Value::Object(_) => {}
            _ => {
                return Err(CollectionError::Configuration(
                    "config must be a JSON object".to_string(),
                ))
            }
        }

        serde_json::from_value(value.clone())
            .map_err(|e| CollectionError::Configuration(format!("invalid task config: {}", e)))
    }

    /// True when `value` is something [`TaskConfig::from_value`] accepts.
    pub fn is_complete(value: &Value) -> bool {
        Self::from_value(value).is_ok()
    }
}

fn blank() -> CollectionError {
    CollectionError::Configuration("task config is blank".to_string())
}

/// One side of a transfer. Closed set of adapter kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Endpoint {
    /// NFS/NAS share.
    Nas(NasParams),
    /// S3-compatible object storage.
    Obs(ObsParams),
    Mysql(DatabaseParams),
    Postgresql(DatabaseParams),
    Oracle(DatabaseParams),
    /// Plain text files on the collector host.
    Local(LocalParams),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NasParams {
    pub ip: String,
    pub path: String,
    /// Restrict the transfer to these file names; empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObsParams {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prefix: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseParams {
    pub jdbc_url: String,
    pub username: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_sql: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub column: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalParams {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Endpoint {
    /// Short kind label, as written in the `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Nas(_) => "nas",
            Self::Obs(_) => "obs",
            Self::Mysql(_) => "mysql",
            Self::Postgresql(_) => "postgresql",
            Self::Oracle(_) => "oracle",
            Self::Local(_) => "local",
        }
    }

    pub fn reader_name(&self) -> &'static str {
        match self {
            Self::Nas(_) => "nfsreader",
            Self::Obs(_) => "obsreader",
            Self::Mysql(_) => "mysqlreader",
            Self::Postgresql(_) => "postgresqlreader",
            Self::Oracle(_) => "oraclereader",
            Self::Local(_) => "txtfilereader",
        }
    }

    pub fn writer_name(&self) -> &'static str {
        match self {
            Self::Nas(_) => "nfswriter",
            Self::Obs(_) => "obswriter",
            Self::Mysql(_) => "mysqlwriter",
            Self::Postgresql(_) => "postgresqlwriter",
            Self::Oracle(_) => "oraclewriter",
            Self::Local(_) => "txtfilewriter",
        }
    }

    /// Whether the adapter copies files as-is rather than streaming records.
    pub fn is_file_transfer(&self) -> bool {
        matches!(self, Self::Nas(_) | Self::Obs(_))
    }

    /// Adapter parameter map handed to the transfer engine: the typed fields
    /// in camelCase plus every pass-through key, without the `type` tag.
    pub fn parameter_map(&self) -> Map<String, Value> {
        let value = match self {
            Self::Nas(p) => serde_json::to_value(p),
            Self::Obs(p) => serde_json::to_value(p),
            Self::Mysql(p) | Self::Postgresql(p) | Self::Oracle(p) => serde_json::to_value(p),
            Self::Local(p) => serde_json::to_value(p),
        };
        match value {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}
