//! Persistent payload snapshots.
//!
//! # Overview
//!
//! A [`PayloadSnapshot`] is the whole resumable state of one collection:
//! every asset with its status, attempt count and per-link progress. It is
//! stored as one JSON document and always replaced atomically (temp file,
//! fsync, rename), so a crash at any instant leaves either the previous or
//! the new version on disk and never a mix.
//!
//! Side files live next to the snapshot and share its stem (see
//! [`StatePaths`]): the progress ledger and the failure record.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use granule_core::store;
//!
//! # fn example() -> Result<(), granule_core::store::StoreError> {
//! let path = Path::new("./cache/GEDI02_B_v002_20240101_120000_000_payload.json");
//! let mut snapshot = store::load(path)?;
//! let reset = snapshot.reset_failed();
//! store::save(&snapshot, path)?;
//! println!("{reset} failed assets queued again");
//! # Ok(())
//! # }
//! ```

mod asset;
mod error;
mod failures;
mod snapshot;

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::catalog::CollectionKey;

pub use asset::{Asset, AssetError, AssetStatus};
pub use error::StoreError;
pub use failures::{FailureEntry, FailureRecord};
pub use snapshot::{PayloadSnapshot, SCHEMA_VERSION, StatusCounts};

/// Suffix of payload snapshot files.
pub const PAYLOAD_SUFFIX: &str = "_payload.json";

const LEDGER_SUFFIX: &str = "_ledger.jsonl";
const FAILURES_SUFFIX: &str = "_failures.json";

/// Files making up the state of one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    /// The snapshot itself.
    pub payload: PathBuf,
    /// Append-only progress ledger.
    pub ledger: PathBuf,
    /// Failure record.
    pub failures: PathBuf,
}

impl StatePaths {
    /// Derives the side-file paths from a snapshot path.
    #[must_use]
    pub fn for_payload(payload: &Path) -> Self {
        let name = payload
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem = name
            .strip_suffix(PAYLOAD_SUFFIX)
            .or_else(|| name.strip_suffix(".json"))
            .unwrap_or(&name)
            .to_string();
        Self {
            payload: payload.to_path_buf(),
            ledger: payload.with_file_name(format!("{stem}{LEDGER_SUFFIX}")),
            failures: payload.with_file_name(format!("{stem}{FAILURES_SUFFIX}")),
        }
    }
}

/// File name of a snapshot: `{shortname}_v{version}_{YYYYmmdd_HHMMSS_mmm}_payload.json`.
#[must_use]
pub fn snapshot_file_name(key: &CollectionKey, created_at: DateTime<Utc>) -> String {
    format!(
        "{}_{}{PAYLOAD_SUFFIX}",
        key.file_stem(),
        created_at.format("%Y%m%d_%H%M%S_%3f")
    )
}

/// Path in `cache_dir` for a new snapshot that replaces no existing file.
///
/// On a name clash the stamp moves forward one millisecond at a time, so
/// file names keep sorting in creation order.
#[must_use]
pub fn new_snapshot_path(cache_dir: &Path, key: &CollectionKey, created_at: DateTime<Utc>) -> PathBuf {
    let mut stamp = created_at;
    loop {
        let path = cache_dir.join(snapshot_file_name(key, stamp));
        if !path.exists() {
            return path;
        }
        stamp += chrono::Duration::milliseconds(1);
    }
}

/// Loads and validates a snapshot.
///
/// Assets left `InProgress` by an interrupted run are moved back to
/// `Pending`: a crash mid-attempt means the attempt never finished.
///
/// # Errors
///
/// - [`StoreError::NotFound`] when the file does not exist
/// - [`StoreError::CorruptState`] for malformed JSON, an unsupported
///   schema version, or inconsistent asset state
/// - [`StoreError::Io`] for other read failures
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load(path: &Path) -> Result<PayloadSnapshot, StoreError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::NotFound {
                path: path.to_path_buf(),
            });
        }
        Err(e) => return Err(StoreError::io(path, e)),
    };

    let mut snapshot: PayloadSnapshot = serde_json::from_slice(&bytes).map_err(|e| {
        #[derive(Deserialize)]
        struct VersionProbe {
            schema_version: u32,
        }
        match serde_json::from_slice::<VersionProbe>(&bytes) {
            Ok(probe) if probe.schema_version != SCHEMA_VERSION => StoreError::corrupt(
                path,
                format!(
                    "schema_version {} is not supported (expected {SCHEMA_VERSION})",
                    probe.schema_version
                ),
            ),
            _ => StoreError::corrupt(path, e.to_string()),
        }
    })?;

    snapshot
        .rebuild_index()
        .and_then(|()| snapshot.validate())
        .map_err(|reason| StoreError::corrupt(path, reason))?;

    let reset = snapshot.reset_in_progress();
    if reset > 0 {
        info!(reset, "reset interrupted in-progress assets to pending");
    }
    debug!(assets = snapshot.len(), "snapshot loaded");
    Ok(snapshot)
}

/// Atomically writes `snapshot` to `path`.
///
/// # Errors
///
/// [`StoreError::Serialize`] or [`StoreError::Io`]. On error the previous
/// file at `path` is untouched.
#[instrument(skip_all, fields(path = %path.display(), assets = snapshot.len()))]
pub fn save(snapshot: &PayloadSnapshot, path: &Path) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(snapshot).map_err(|source| StoreError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, &bytes)?;
    debug!(bytes = bytes.len(), "snapshot saved");
    Ok(())
}

/// Newest snapshot in `cache_dir` built from `key`.
///
/// Candidates are matched by file-name prefix and then by stored
/// fingerprint, so a snapshot built with a different temporal filter or
/// limit is never picked up. Unreadable candidates are skipped.
///
/// # Errors
///
/// [`StoreError::Io`] when the directory exists but cannot be listed.
pub fn find_latest(cache_dir: &Path, key: &CollectionKey) -> Result<Option<PathBuf>, StoreError> {
    #[derive(Deserialize)]
    struct FingerprintProbe {
        source_query_fingerprint: String,
    }

    let entries = match std::fs::read_dir(cache_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(cache_dir, e)),
    };

    let prefix = format!("{}_", key.file_stem());
    let mut candidates: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(PAYLOAD_SUFFIX))
        })
        .collect();
    candidates.sort();

    let fingerprint = key.fingerprint();
    for path in candidates.into_iter().rev() {
        let probe = std::fs::read(&path)
            .map_err(|e| e.to_string())
            .and_then(|bytes| {
                serde_json::from_slice::<FingerprintProbe>(&bytes).map_err(|e| e.to_string())
            });
        match probe {
            Ok(probe) if probe.source_query_fingerprint == fingerprint => {
                debug!(path = %path.display(), "found matching snapshot");
                return Ok(Some(path));
            }
            Ok(_) => debug!(path = %path.display(), "snapshot fingerprint differs, skipping"),
            Err(error) => warn!(path = %path.display(), error = %error, "skipping unreadable snapshot"),
        }
    }
    Ok(None)
}

/// Writes `bytes` to `path` through a synced temp file and a rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;

    let mut tmp_name = path.file_name().map(std::ffi::OsStr::to_os_string).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let write = || -> std::io::Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()
    };
    if let Err(e) = write() {
        let _ = std::fs::remove_file(&tmp);
        return Err(StoreError::io(&tmp, e));
    }
    std::fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))?;

    // Persist the rename itself; not every platform can open a directory.
    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}
