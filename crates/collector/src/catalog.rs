//! Dataset catalog collaborator, notified after successful runs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use harvest_core::CatalogConfig;
use reqwest::Url;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Errors from catalog notification delivery.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("catalog returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid catalog URL: {0}")]
    InvalidUrl(String),
}

/// The catalog service that owns datasets and their file listings.
#[async_trait]
pub trait DatasetCatalog: Send + Sync {
    /// Ask the catalog to rescan the files a task produced for a dataset.
    async fn scan_data_source(&self, dataset_id: &str, task_id: &str) -> Result<(), CatalogError>;

    fn name(&self) -> &str;
}

/// Build the configured catalog: HTTP when a base URL is set, otherwise log-only.
pub fn from_config(config: &CatalogConfig) -> Result<Arc<dyn DatasetCatalog>, CatalogError> {
    match config.base_url.as_deref() {
        Some(base) if !base.is_empty() => Ok(Arc::new(HttpDatasetCatalog::new(
            base,
            Duration::from_secs(config.timeout_secs.max(1)),
        )?)),
        _ => Ok(Arc::new(LoggingCatalog)),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ScanRequest<'a> {
    task_id: &'a str,
}

/// Calls `POST {base}/datasets/{datasetId}/scan`.
#[derive(Debug, Clone)]
pub struct HttpDatasetCatalog {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpDatasetCatalog {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, CatalogError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| CatalogError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(CatalogError::InvalidUrl(format!("{} cannot be a base URL", base_url)));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { base_url, client })
    }

    /// `{base}/datasets/{datasetId}/scan`, with the id percent-encoded as a
    /// single path segment.
    pub fn scan_url(&self, dataset_id: &str) -> Result<Url, CatalogError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| CatalogError::InvalidUrl(format!("{} cannot be a base URL", self.base_url)))?
            .pop_if_empty()
            .extend(["datasets", dataset_id, "scan"]);
        Ok(url)
    }
}

#[async_trait]
impl DatasetCatalog for HttpDatasetCatalog {
    async fn scan_data_source(&self, dataset_id: &str, task_id: &str) -> Result<(), CatalogError> {
        let url = self.scan_url(dataset_id)?;
        let response = self
            .client
            .post(url.clone())
            .json(&ScanRequest { task_id })
            .send()
            .await?;
        let status = response.status();

        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            warn!(url = %url, %status, body = %body, "catalog returned non-2xx status");
            return Err(CatalogError::Status {
                status: status.as_u16(),
                body,
            });
        }

        debug!(url = %url, %status, "catalog scan requested");
        Ok(())
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Stand-in used when no catalog URL is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingCatalog;

#[async_trait]
impl DatasetCatalog for LoggingCatalog {
    async fn scan_data_source(&self, dataset_id: &str, task_id: &str) -> Result<(), CatalogError> {
        info!(dataset_id = %dataset_id, task_id = %task_id, "catalog not configured, skipping file scan");
        Ok(())
    }

    fn name(&self) -> &str {
        "logging"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_url_trims_trailing_slash() {
        let catalog = HttpDatasetCatalog::new("http://catalog:8080/api/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            catalog.scan_url("ds-1").unwrap().as_str(),
            "http://catalog:8080/api/datasets/ds-1/scan"
        );

        let root = HttpDatasetCatalog::new("http://catalog:8080", Duration::from_secs(1)).unwrap();
        assert_eq!(root.scan_url("ds-1").unwrap().as_str(), "http://catalog:8080/datasets/ds-1/scan");
    }

    #[test]
    fn dataset_id_is_one_encoded_segment() {
        let catalog = HttpDatasetCatalog::new("http://catalog:8080/api", Duration::from_secs(1)).unwrap();
        let url = catalog.scan_url("../admin/ds 1?x=y#z").unwrap();
        assert_eq!(url.path_segments().unwrap().count(), 4);
        assert!(url.query().is_none());
        assert!(url.fragment().is_none());
        assert!(url.as_str().starts_with("http://catalog:8080/api/datasets/"));
        assert!(url.as_str().ends_with("/scan"));
        assert!(url.as_str().contains("%2F"));
    }

    #[test]
    fn malformed_base_url_is_rejected() {
        let err = HttpDatasetCatalog::new("catalog:8080", Duration::from_secs(1));
        assert!(matches!(err, Err(CatalogError::InvalidUrl(_))));
    }

    #[test]
    fn from_config_picks_implementation() {
        let unset = CatalogConfig { base_url: None, timeout_secs: 10 };
        assert_eq!(from_config(&unset).unwrap().name(), "logging");

        let set = CatalogConfig {
            base_url: Some("http://catalog:8080".to_string()),
            timeout_secs: 10,
        };
        assert_eq!(from_config(&set).unwrap().name(), "http");
    }

    #[tokio::test]
    async fn logging_catalog_always_succeeds() {
        LoggingCatalog.scan_data_source("ds", "t").await.unwrap();
    }

    #[test]
    fn status_error_message() {
        let err = CatalogError::Status { status: 503, body: "busy".into() };
        assert_eq!(err.to_string(), "catalog returned 503: busy");
    }
}
