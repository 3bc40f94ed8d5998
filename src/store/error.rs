//! Error types for the payload store.

use std::path::PathBuf;

use thiserror::Error;

use super::AssetStatus;

/// Errors from loading, saving, or mutating a payload snapshot.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No snapshot exists at the path.
    #[error("payload snapshot not found: {path}")]
    NotFound {
        /// The missing file.
        path: PathBuf,
    },

    /// The snapshot exists but cannot be trusted.
    #[error("corrupt payload snapshot {path}: {reason}")]
    CorruptState {
        /// The offending file.
        path: PathBuf,
        /// What failed validation.
        reason: String,
    },

    /// Filesystem error while reading or writing state.
    #[error("IO error on {path}: {source}")]
    Io {
        /// The file involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Serialization failure while saving.
    #[error("failed to serialize {path}: {source}")]
    Serialize {
        /// Target file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// The asset id is not in the snapshot.
    #[error("unknown asset: {id}")]
    UnknownAsset {
        /// The id looked up.
        id: String,
    },

    /// The URL is not one of the asset's links.
    #[error("asset {id} has no link {url}")]
    UnknownLink {
        /// The asset.
        id: String,
        /// The URL recorded.
        url: String,
    },

    /// The requested status change is not allowed.
    #[error("invalid transition for asset {id}: {from} -> {to}")]
    InvalidTransition {
        /// The asset.
        id: String,
        /// Current status.
        from: AssetStatus,
        /// Requested status.
        to: AssetStatus,
    },

    /// An asset cannot be marked done while links are missing.
    #[error("asset {id} still has {missing} link(s) to fetch")]
    IncompleteLinks {
        /// The asset.
        id: String,
        /// Number of links not on disk.
        missing: usize,
    },
}

impl StoreError {
    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a corrupt-state error.
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::CorruptState {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates an unknown-asset error.
    pub fn unknown_asset(id: &str) -> Self {
        Self::UnknownAsset { id: id.to_string() }
    }
}
