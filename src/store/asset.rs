//! Asset types and status definitions.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::DownloadLink;
use crate::download::FetchErrorKind;

/// Lifecycle state of an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetStatus {
    /// Waiting to be fetched.
    Pending,
    /// Admitted to the worker pool by the current (or a crashed) run.
    InProgress,
    /// Every link is on disk. Terminal.
    Done,
    /// The last attempt failed; eligible for an explicit retry.
    Failed,
}

impl AssetStatus {
    /// Returns the stable string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for AssetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AssetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid asset status: {s}")),
        }
    }
}

/// Last recorded failure of an asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetError {
    /// Classified failure kind.
    pub kind: FetchErrorKind,
    /// Human-readable detail (URL, status, path).
    pub message: String,
}

impl AssetError {
    /// Creates an asset error.
    #[must_use]
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for AssetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// One downloadable granule and its progress.
///
/// Fields are read through accessors; every state change goes through
/// [`PayloadSnapshot`](super::PayloadSnapshot) so transitions stay legal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    id: String,
    links: Vec<DownloadLink>,
    status: AssetStatus,
    attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_error: Option<AssetError>,
    bytes_downloaded: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    completed_at: Option<DateTime<Utc>>,
    /// Link-level completion: URL to bytes on disk.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    fetched_links: BTreeMap<String, u64>,
}

impl Asset {
    /// Creates a pending asset.
    #[must_use]
    pub fn new(id: impl Into<String>, links: Vec<DownloadLink>) -> Self {
        Self {
            id: id.into(),
            links,
            status: AssetStatus::Pending,
            attempts: 0,
            last_error: None,
            bytes_downloaded: 0,
            completed_at: None,
            fetched_links: BTreeMap::new(),
        }
    }

    /// Catalog identifier, unique within a snapshot.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// All links, in catalog order.
    #[must_use]
    pub fn links(&self) -> &[DownloadLink] {
        &self.links
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> AssetStatus {
        self.status
    }

    /// Number of fetch attempts issued for this asset across all runs.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Last failure, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<&AssetError> {
        self.last_error.as_ref()
    }

    /// Bytes on disk for this asset.
    #[must_use]
    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded
    }

    /// When the asset reached `Done`.
    #[must_use]
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Links already on disk, keyed by URL.
    #[must_use]
    pub fn fetched_links(&self) -> &BTreeMap<String, u64> {
        &self.fetched_links
    }

    /// Links still to fetch, in catalog order.
    pub fn missing_links(&self) -> impl Iterator<Item = &DownloadLink> {
        self.links
            .iter()
            .filter(|link| !self.fetched_links.contains_key(link.url()))
    }

    /// Returns true when the URL is one of this asset's links.
    #[must_use]
    pub fn has_link(&self, url: &str) -> bool {
        self.links.iter().any(|link| link.url() == url)
    }

    fn fetched_bytes(&self) -> u64 {
        self.fetched_links.values().sum()
    }

    pub(super) fn set_in_progress(&mut self) {
        self.status = AssetStatus::InProgress;
        self.attempts = self.attempts.saturating_add(1);
    }

    pub(super) fn set_link_fetched(&mut self, url: &str, bytes: u64) {
        self.fetched_links.insert(url.to_string(), bytes);
        self.bytes_downloaded = self.fetched_bytes();
    }

    pub(super) fn set_done(&mut self, bytes: u64, at: DateTime<Utc>) {
        self.status = AssetStatus::Done;
        self.bytes_downloaded = bytes;
        self.completed_at = Some(at);
        self.last_error = None;
    }

    pub(super) fn set_failed(&mut self, error: AssetError) {
        self.status = AssetStatus::Failed;
        self.bytes_downloaded = self.fetched_bytes();
        self.last_error = Some(error);
    }

    pub(super) fn set_pending(&mut self) {
        self.status = AssetStatus::Pending;
    }

    pub(super) fn reopen(&mut self, missing_urls: &[String]) {
        for url in missing_urls {
            self.fetched_links.remove(url);
        }
        self.status = AssetStatus::Pending;
        self.completed_at = None;
        self.last_error = None;
        self.bytes_downloaded = self.fetched_bytes();
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Asset {{ id: {}, links: {}, status: {} }}",
            self.id,
            self.links.len(),
            self.status
        )
    }
}
