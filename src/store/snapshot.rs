//! The payload snapshot: the persistent work queue of one collection.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Asset, AssetError, AssetStatus, StoreError};
use crate::catalog::CollectionKey;

/// Current on-disk schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Asset counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    /// Pending assets.
    pub pending: usize,
    /// In-progress assets.
    pub in_progress: usize,
    /// Done assets.
    pub done: usize,
    /// Failed assets.
    pub failed: usize,
}

impl StatusCounts {
    /// Total number of assets.
    #[must_use]
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.done + self.failed
    }
}

/// Ordered collection of assets plus the identity of the query that
/// produced them.
///
/// Assets keep catalog insertion order. Status changes go through the
/// `mark_*` methods, which only allow
/// `Pending -> InProgress -> {Done | Failed}` and `Failed -> Pending` via
/// [`reset_failed`](Self::reset_failed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadSnapshot {
    schema_version: u32,
    created_at: DateTime<Utc>,
    source_query_fingerprint: String,
    collection: CollectionKey,
    assets: Vec<Asset>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl PartialEq for PayloadSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.schema_version == other.schema_version
            && self.created_at == other.created_at
            && self.source_query_fingerprint == other.source_query_fingerprint
            && self.collection == other.collection
            && self.assets == other.assets
    }
}

impl Eq for PayloadSnapshot {}

impl PayloadSnapshot {
    /// Creates an empty snapshot for `collection`.
    #[must_use]
    pub fn new(collection: CollectionKey, created_at: DateTime<Utc>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            created_at,
            source_query_fingerprint: collection.fingerprint(),
            collection,
            assets: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Appends an asset. Returns `false` and leaves the snapshot unchanged
    /// when the id is already present.
    pub fn push(&mut self, asset: Asset) -> bool {
        if self.index.contains_key(asset.id()) {
            return false;
        }
        self.index.insert(asset.id().to_string(), self.assets.len());
        self.assets.push(asset);
        true
    }

    /// On-disk schema version.
    #[must_use]
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// When the snapshot was built.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Fingerprint of the collection key that produced the snapshot.
    #[must_use]
    pub fn source_query_fingerprint(&self) -> &str {
        &self.source_query_fingerprint
    }

    /// The collection the snapshot was built from.
    #[must_use]
    pub fn collection(&self) -> &CollectionKey {
        &self.collection
    }

    /// All assets in insertion order.
    #[must_use]
    pub fn assets(&self) -> &[Asset] {
        &self.assets
    }

    /// Looks up an asset.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Asset> {
        self.index.get(id).map(|&i| &self.assets[i])
    }

    /// Number of assets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.assets.len()
    }

    /// Whether the snapshot has no assets.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    /// Pending assets in insertion order. Each call starts over.
    pub fn pending(&self) -> impl Iterator<Item = &Asset> {
        self.assets
            .iter()
            .filter(|asset| asset.status() == AssetStatus::Pending)
    }

    /// Asset counts by status.
    #[must_use]
    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for asset in &self.assets {
            match asset.status() {
                AssetStatus::Pending => counts.pending += 1,
                AssetStatus::InProgress => counts.in_progress += 1,
                AssetStatus::Done => counts.done += 1,
                AssetStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Sum of `bytes_downloaded` over all assets.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.assets.iter().map(Asset::bytes_downloaded).sum()
    }

    /// Moves a pending asset to `InProgress` and counts the attempt.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownAsset`] or [`StoreError::InvalidTransition`]
    /// when the asset is not pending.
    pub fn mark_in_progress(&mut self, id: &str) -> Result<(), StoreError> {
        let asset = self.asset_in(id, AssetStatus::Pending, AssetStatus::InProgress)?;
        asset.set_in_progress();
        debug!(asset_id = %id, attempts = asset.attempts(), "asset in progress");
        Ok(())
    }

    /// Records one link of an in-progress asset as on disk.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownAsset`], [`StoreError::UnknownLink`], or
    /// [`StoreError::InvalidTransition`] when the asset is not in progress.
    pub fn record_link(&mut self, id: &str, url: &str, bytes: u64) -> Result<(), StoreError> {
        let asset = self.asset_in(id, AssetStatus::InProgress, AssetStatus::InProgress)?;
        if !asset.has_link(url) {
            return Err(StoreError::UnknownLink {
                id: id.to_string(),
                url: url.to_string(),
            });
        }
        asset.set_link_fetched(url, bytes);
        Ok(())
    }

    /// Completes an in-progress asset whose links are all on disk.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownAsset`], [`StoreError::InvalidTransition`], or
    /// [`StoreError::IncompleteLinks`] when some link was never recorded.
    pub fn mark_done(&mut self, id: &str, bytes: u64) -> Result<(), StoreError> {
        let asset = self.asset_in(id, AssetStatus::InProgress, AssetStatus::Done)?;
        let missing = asset.missing_links().count();
        if missing > 0 {
            return Err(StoreError::IncompleteLinks {
                id: id.to_string(),
                missing,
            });
        }
        asset.set_done(bytes, Utc::now());
        Ok(())
    }

    /// Fails an in-progress asset.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownAsset`] or [`StoreError::InvalidTransition`].
    pub fn mark_failed(&mut self, id: &str, error: AssetError) -> Result<(), StoreError> {
        let asset = self.asset_in(id, AssetStatus::InProgress, AssetStatus::Failed)?;
        asset.set_failed(error);
        Ok(())
    }

    /// Moves every failed asset back to pending. Attempts and the last
    /// error are kept. Returns how many assets moved.
    pub fn reset_failed(&mut self) -> usize {
        self.reset_status(AssetStatus::Failed)
    }

    /// Moves assets left in progress by an interrupted run back to pending.
    pub(crate) fn reset_in_progress(&mut self) -> usize {
        self.reset_status(AssetStatus::InProgress)
    }

    /// Reopens a done asset whose files went missing, forgetting the given
    /// links so the next run fetches them again.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownAsset`] or [`StoreError::InvalidTransition`]
    /// when the asset is not done.
    pub fn reopen(&mut self, id: &str, missing_urls: &[String]) -> Result<(), StoreError> {
        let asset = self.asset_in(id, AssetStatus::Done, AssetStatus::Pending)?;
        asset.reopen(missing_urls);
        Ok(())
    }

    /// Rebuilds the id index after deserialization.
    pub(crate) fn rebuild_index(&mut self) -> Result<(), String> {
        self.index.clear();
        for (i, asset) in self.assets.iter().enumerate() {
            if self.index.insert(asset.id().to_string(), i).is_some() {
                return Err(format!("duplicate asset id '{}'", asset.id()));
            }
        }
        Ok(())
    }

    /// Structural checks applied on load.
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.schema_version != SCHEMA_VERSION {
            return Err(format!(
                "schema_version {} is not supported (expected {SCHEMA_VERSION})",
                self.schema_version
            ));
        }
        for asset in &self.assets {
            if asset.links().is_empty() && asset.status() != AssetStatus::Done {
                return Err(format!("asset '{}' has no links", asset.id()));
            }
            if asset.status() == AssetStatus::Done && asset.missing_links().next().is_some() {
                return Err(format!(
                    "asset '{}' is done but not every link was fetched",
                    asset.id()
                ));
            }
        }
        Ok(())
    }

    fn reset_status(&mut self, from: AssetStatus) -> usize {
        let mut moved = 0;
        for asset in &mut self.assets {
            if asset.status() == from {
                asset.set_pending();
                moved += 1;
            }
        }
        moved
    }

    fn asset_in(
        &mut self,
        id: &str,
        expected: AssetStatus,
        to: AssetStatus,
    ) -> Result<&mut Asset, StoreError> {
        let &i = self
            .index
            .get(id)
            .ok_or_else(|| StoreError::unknown_asset(id))?;
        let asset = &mut self.assets[i];
        if asset.status() != expected {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: asset.status(),
                to,
            });
        }
        Ok(asset)
    }
}
