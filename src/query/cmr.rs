//! CMR granule search client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument};
use url::Url;

use super::{CatalogQuery, QueryError};
use crate::catalog::CollectionKey;
use crate::download::USER_AGENT;

/// Production UMM-JSON granule search endpoint.
pub const CMR_GRANULES_URL: &str = "https://cmr.earthdata.nasa.gov/search/granules.umm_json";

/// Largest page CMR serves.
pub const MAX_PAGE_SIZE: usize = 2000;

/// Paging cursor header, echoed back on the next request.
const SEARCH_AFTER_HEADER: &str = "CMR-Search-After";

const QUERY_TIMEOUT_SECS: u64 = 120;
const MAX_ERROR_BODY_CHARS: usize = 300;

#[derive(Debug, Deserialize)]
struct UmmPage {
    #[serde(default)]
    hits: Option<u64>,
    #[serde(default)]
    items: Vec<Value>,
}

/// Queries the CMR granule search API, following `CMR-Search-After` pages.
#[derive(Debug, Clone)]
pub struct CmrQuery {
    client: Client,
    endpoint: String,
    page_size: usize,
}

impl CmrQuery {
    /// Creates a client for the production endpoint.
    ///
    /// # Errors
    ///
    /// [`QueryError::Client`] when the HTTP client cannot be built.
    pub fn new() -> Result<Self, QueryError> {
        Self::with_endpoint(CMR_GRANULES_URL)
    }

    /// Creates a client for a custom endpoint (used with wiremock in tests).
    ///
    /// # Errors
    ///
    /// [`QueryError::Client`] when the HTTP client cannot be built.
    pub fn with_endpoint(endpoint: impl Into<String>) -> Result<Self, QueryError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(QUERY_TIMEOUT_SECS))
            .gzip(true)
            .build()
            .map_err(QueryError::Client)?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            page_size: MAX_PAGE_SIZE,
        })
    }

    /// Sets the page size, clamped to `1..=MAX_PAGE_SIZE`.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    fn page_url(&self, key: &CollectionKey, page_size: usize) -> Result<Url, QueryError> {
        let mut params = vec![
            ("short_name", key.shortname.clone()),
            ("version", key.version.clone()),
            ("page_size", page_size.to_string()),
        ];
        if let Some(temporal) = key.temporal {
            params.push(("temporal", temporal.to_cmr_param()));
        }
        Url::parse_with_params(&self.endpoint, &params).map_err(|e| QueryError::InvalidResponse {
            url: self.endpoint.clone(),
            reason: format!("invalid endpoint: {e}"),
        })
    }
}

#[async_trait]
impl CatalogQuery for CmrQuery {
    #[instrument(skip(self), fields(collection = %key))]
    async fn query(&self, key: &CollectionKey) -> Result<Vec<Value>, QueryError> {
        let page_size = key.limit.map_or(self.page_size, |l| l.clamp(1, self.page_size));
        let url = self.page_url(key, page_size)?;
        let mut records: Vec<Value> = Vec::new();
        let mut search_after: Option<String> = None;

        loop {
            let mut request = self.client.get(url.clone());
            if let Some(cursor) = &search_after {
                request = request.header(SEARCH_AFTER_HEADER, cursor);
            }
            let response = request.send().await.map_err(|source| QueryError::Request {
                url: url.to_string(),
                source,
            })?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(QueryError::HttpStatus {
                    url: url.to_string(),
                    status: status.as_u16(),
                    body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
                });
            }

            let next_cursor = response
                .headers()
                .get(SEARCH_AFTER_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let page: UmmPage = response.json().await.map_err(|e| QueryError::InvalidResponse {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

            let received = page.items.len();
            records.extend(page.items);
            debug!(received, total = records.len(), hits = ?page.hits, "catalog page");

            if let Some(limit) = key.limit
                && records.len() >= limit
            {
                records.truncate(limit);
                break;
            }
            if received < page_size || page.hits.is_some_and(|h| records.len() as u64 >= h) {
                break;
            }
            match next_cursor {
                Some(cursor) => search_after = Some(cursor),
                None => break,
            }
        }

        info!(records = records.len(), "catalog query complete");
        Ok(records)
    }
}
