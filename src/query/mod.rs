//! Catalog query seam and the raw-record cache.
//!
//! A [`CatalogQuery`] turns a [`CollectionKey`] into raw UMM-JSON granule
//! records. [`CmrQuery`] talks to the CMR search API; [`RecordsFileQuery`]
//! replays records saved by an earlier query so a snapshot can be rebuilt
//! without touching the network.

mod cmr;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::catalog::CollectionKey;
use crate::store::{StoreError, write_atomic};

pub use cmr::{CMR_GRANULES_URL, CmrQuery, MAX_PAGE_SIZE};

/// Suffix of raw-record cache files.
pub const RECORDS_SUFFIX: &str = "_granules.json";

/// Errors from querying the catalog or reading its cache.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The HTTP client could not be constructed.
    #[error("failed to build catalog HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    /// The request never produced a response.
    #[error("catalog request to {url} failed: {source}")]
    Request {
        /// Requested URL.
        url: String,
        /// Underlying error.
        #[source]
        source: reqwest::Error,
    },

    /// The catalog answered with a non-success status.
    #[error("catalog returned HTTP {status} for {url}: {body}")]
    HttpStatus {
        /// Requested URL.
        url: String,
        /// HTTP status code.
        status: u16,
        /// Start of the response body.
        body: String,
    },

    /// The response body is not the expected shape.
    #[error("unexpected catalog response from {url}: {reason}")]
    InvalidResponse {
        /// Requested URL.
        url: String,
        /// What was wrong.
        reason: String,
    },

    /// The records cache could not be read or written.
    #[error("records cache {path}: {reason}")]
    Cache {
        /// Cache file.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },
}

impl QueryError {
    fn cache(path: &Path, reason: impl ToString) -> Self {
        Self::Cache {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

impl From<StoreError> for QueryError {
    fn from(error: StoreError) -> Self {
        match &error {
            StoreError::Io { path, .. } => Self::cache(path, &error),
            _ => Self::Cache {
                path: PathBuf::new(),
                reason: error.to_string(),
            },
        }
    }
}

/// Source of raw granule records for a collection.
#[async_trait]
pub trait CatalogQuery: Send + Sync {
    /// Returns every granule record matching `key`, honoring its limit.
    async fn query(&self, key: &CollectionKey) -> Result<Vec<Value>, QueryError>;
}

/// Replays records from a cache file written by [`save_records`].
#[derive(Debug, Clone)]
pub struct RecordsFileQuery {
    path: PathBuf,
}

impl RecordsFileQuery {
    /// Creates a query reading `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CatalogQuery for RecordsFileQuery {
    async fn query(&self, key: &CollectionKey) -> Result<Vec<Value>, QueryError> {
        let mut records = load_records(&self.path)?;
        if let Some(limit) = key.limit {
            records.truncate(limit);
        }
        info!(path = %self.path.display(), records = records.len(), "loaded cached granule records");
        Ok(records)
    }
}

/// Name of the raw-record cache file for `key`.
#[must_use]
pub fn records_file_name(key: &CollectionKey) -> String {
    format!("{}{RECORDS_SUFFIX}", key.file_stem())
}

/// Writes `records` to `path` atomically as a JSON array.
///
/// # Errors
///
/// [`QueryError::Cache`] when serialization or the write fails.
pub fn save_records(records: &[Value], path: &Path) -> Result<(), QueryError> {
    let bytes = serde_json::to_vec(records).map_err(|e| QueryError::cache(path, e))?;
    write_atomic(path, &bytes)?;
    debug!(path = %path.display(), records = records.len(), "granule records cached");
    Ok(())
}

/// Reads a JSON array of records from `path`.
///
/// # Errors
///
/// [`QueryError::Cache`] when the file is missing, unreadable or not an
/// array.
pub fn load_records(path: &Path) -> Result<Vec<Value>, QueryError> {
    let content = std::fs::read(path).map_err(|e| QueryError::cache(path, e))?;
    match serde_json::from_slice::<Value>(&content).map_err(|e| QueryError::cache(path, e))? {
        Value::Array(records) => Ok(records),
        _ => Err(QueryError::cache(path, "expected a JSON array of granule records")),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_records_file_name_uses_key_stem() {
        let key = CollectionKey::new("GEDI02_B", "002");
        assert_eq!(records_file_name(&key), "GEDI02_B_v002_granules.json");
    }

    #[test]
    fn test_save_then_load_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache").join("x_granules.json");
        let records = vec![json!({ "umm": { "GranuleUR": "G1" } })];

        save_records(&records, &path).unwrap();
        assert_eq!(load_records(&path).unwrap(), records);
    }

    #[test]
    fn test_load_records_rejects_non_array() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x_granules.json");
        std::fs::write(&path, br#"{"items": []}"#).unwrap();
        assert!(matches!(load_records(&path), Err(QueryError::Cache { .. })));
        assert!(load_records(&dir.path().join("missing.json")).is_err());
    }

    #[tokio::test]
    async fn test_records_file_query_honors_limit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x_granules.json");
        let records: Vec<Value> = (0..5).map(|i| json!({ "umm": { "GranuleUR": format!("G{i}") } })).collect();
        save_records(&records, &path).unwrap();

        let key = CollectionKey::new("X", "1").with_limit(Some(2));
        let result = RecordsFileQuery::new(&path).query(&key).await.unwrap();
        assert_eq!(result.len(), 2);
    }
}
