//! Failure record: the failed assets of a snapshot, keyed by id.
//!
//! Rewritten atomically at every checkpoint so operators can inspect
//! failures without parsing the whole snapshot.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{AssetStatus, PayloadSnapshot, StoreError, write_atomic};
use crate::download::FetchErrorKind;

/// Why one asset is currently failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEntry {
    /// Failure kind of the last attempt.
    pub kind: FetchErrorKind,
    /// Detail of the last attempt.
    pub message: String,
    /// Attempts issued so far.
    pub attempts: u32,
}

/// Failed assets keyed by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailureRecord {
    entries: BTreeMap<String, FailureEntry>,
}

impl FailureRecord {
    /// Collects every failed asset of `snapshot`.
    #[must_use]
    pub fn from_snapshot(snapshot: &PayloadSnapshot) -> Self {
        let entries = snapshot
            .assets()
            .iter()
            .filter(|asset| asset.status() == AssetStatus::Failed)
            .filter_map(|asset| {
                asset.last_error().map(|error| {
                    (
                        asset.id().to_string(),
                        FailureEntry {
                            kind: error.kind,
                            message: error.message.clone(),
                            attempts: asset.attempts(),
                        },
                    )
                })
            })
            .collect();
        Self { entries }
    }

    /// Reads a failure record; a missing file is an empty record.
    ///
    /// # Errors
    ///
    /// [`StoreError::Io`] on read failure, [`StoreError::CorruptState`] on
    /// malformed JSON.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::corrupt(path, e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    /// Atomically replaces the file at `path`.
    ///
    /// # Errors
    ///
    /// [`StoreError::Serialize`] or [`StoreError::Io`].
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(self).map_err(|source| StoreError::Serialize {
            path: path.to_path_buf(),
            source,
        })?;
        write_atomic(path, &bytes)
    }

    /// Looks up one asset.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&FailureEntry> {
        self.entries.get(id)
    }

    /// Iterates entries ordered by id.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FailureEntry)> {
        self.entries.iter()
    }

    /// Number of failed assets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no asset is failed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
