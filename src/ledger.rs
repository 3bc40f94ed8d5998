//! Append-only progress ledger.
//!
//! One JSON object per line, one line per asset attempt. Entries are never
//! rewritten. A process killed mid-append can leave a torn final line; the
//! reader skips it and [`Ledger::open`] cuts it off before appending again.

use std::collections::{BTreeMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::download::{AssetOutcome, FetchErrorKind};

/// Errors from reading or appending the ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Filesystem error.
    #[error("ledger IO error on {path}: {source}")]
    Io {
        /// The ledger file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// An entry could not be serialized.
    #[error("failed to serialize ledger entry: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A line other than the last one is not a valid entry.
    #[error("corrupt ledger {path} at line {line}: {reason}")]
    Corrupt {
        /// The ledger file.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
        /// Parse error.
        reason: String,
    },
}

impl LedgerError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Result of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Every link of the asset is on disk.
    Success,
    /// The attempt stopped on an error.
    Failure,
}

/// One asset attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// The asset attempted.
    pub asset_id: String,
    /// How the attempt ended.
    pub outcome: Outcome,
    /// Start of the attempt.
    pub started_at: DateTime<Utc>,
    /// End of the attempt.
    pub finished_at: DateTime<Utc>,
    /// Bytes written during the attempt.
    pub bytes: u64,
    /// Failure kind, for failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FetchErrorKind>,
    /// Failure detail, for failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Links written during the attempt.
    pub links_fetched: usize,
}

impl LedgerEntry {
    /// Builds the entry recording `outcome`.
    #[must_use]
    pub fn from_outcome(outcome: &AssetOutcome) -> Self {
        Self {
            asset_id: outcome.asset_id.clone(),
            outcome: if outcome.is_success() {
                Outcome::Success
            } else {
                Outcome::Failure
            },
            started_at: outcome.started_at,
            finished_at: outcome.finished_at,
            bytes: outcome.bytes(),
            error_kind: outcome.error_kind(),
            message: outcome.error.as_ref().map(ToString::to_string),
            links_fetched: outcome.fetched.len(),
        }
    }
}

/// Open ledger file in append mode.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    file: File,
}

impl Ledger {
    /// Opens (creating if needed) the ledger at `path`.
    ///
    /// A torn final line left by a crash is truncated away first.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Io`] when the file cannot be opened or repaired.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| LedgerError::io(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .map_err(|e| LedgerError::io(path, e))?;
        truncate_torn_tail(&mut file).map_err(|e| LedgerError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Appends one entry and flushes it.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Serialize`] or [`LedgerError::Io`].
    pub fn append(&mut self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.file
            .write_all(&line)
            .and_then(|()| self.file.flush())
            .map_err(|e| LedgerError::io(&self.path, e))
    }

    /// Path of the ledger file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Cuts the file back to its last newline.
fn truncate_torn_tail(file: &mut File) -> std::io::Result<()> {
    const CHUNK: u64 = 8192;

    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }

    let mut end = len;
    let mut buf = vec![0u8; usize::try_from(CHUNK).unwrap_or(8192)];
    while end > 0 {
        let start = end.saturating_sub(CHUNK);
        let size = usize::try_from(end - start).unwrap_or(0);
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut buf[..size])?;
        if let Some(pos) = buf[..size].iter().rposition(|&b| b == b'\n') {
            let keep = start + pos as u64 + 1;
            if keep < len {
                warn!(kept = keep, dropped = len - keep, "truncating torn ledger tail");
                file.set_len(keep)?;
            }
            return Ok(());
        }
        end = start;
    }

    warn!(dropped = len, "ledger holds only a torn line, truncating");
    file.set_len(0)
}

/// Reads every entry of the ledger at `path`. A missing file is empty.
///
/// # Errors
///
/// [`LedgerError::Corrupt`] for an unparseable line that is not the last
/// one, [`LedgerError::Io`] on read failure.
pub fn read_entries(path: &Path) -> Result<Vec<LedgerEntry>, LedgerError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(LedgerError::io(path, e)),
    };

    let lines: Vec<&str> = content.lines().collect();
    let last = lines.len();
    let mut entries = Vec::with_capacity(last);
    for (idx, line) in lines.iter().enumerate() {
        let line_number = idx + 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LedgerEntry>(line) {
            Ok(entry) => entries.push(entry),
            Err(e) if line_number == last && !content.ends_with('\n') => {
                warn!(line = line_number, error = %e, "skipping torn final ledger line");
            }
            Err(e) => {
                return Err(LedgerError::Corrupt {
                    path: path.to_path_buf(),
                    line: line_number,
                    reason: e.to_string(),
                });
            }
        }
    }
    debug!(entries = entries.len(), "ledger read");
    Ok(entries)
}

/// Aggregate view of a ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSummary {
    /// Attempts recorded.
    pub attempts: usize,
    /// Distinct assets attempted.
    pub distinct_assets: usize,
    /// Successful attempts.
    pub successes: usize,
    /// Failed attempts.
    pub failures: usize,
    /// Failed attempts by kind.
    pub kinds: BTreeMap<FetchErrorKind, usize>,
    /// Bytes written across all attempts.
    pub bytes: u64,
}

impl LedgerSummary {
    /// Aggregates `entries`.
    #[must_use]
    pub fn from_entries(entries: &[LedgerEntry]) -> Self {
        let mut summary = Self::default();
        let mut assets = HashSet::new();
        for entry in entries {
            summary.attempts += 1;
            summary.bytes += entry.bytes;
            assets.insert(entry.asset_id.as_str());
            match entry.outcome {
                Outcome::Success => summary.successes += 1,
                Outcome::Failure => {
                    summary.failures += 1;
                    if let Some(kind) = entry.error_kind {
                        *summary.kinds.entry(kind).or_insert(0) += 1;
                    }
                }
            }
        }
        summary.distinct_assets = assets.len();
        summary
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn entry(id: &str, kind: Option<FetchErrorKind>) -> LedgerEntry {
        let now = Utc::now();
        LedgerEntry {
            asset_id: id.to_string(),
            outcome: if kind.is_some() {
                Outcome::Failure
            } else {
                Outcome::Success
            },
            started_at: now,
            finished_at: now,
            bytes: 5,
            error_kind: kind,
            message: kind.map(|k| format!("{k} failure")),
            links_fetched: 1,
        }
    }

    #[test]
    fn test_append_then_read_preserves_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x_ledger.jsonl");
        let mut ledger = Ledger::open(&path).unwrap();
        ledger.append(&entry("A", None)).unwrap();
        ledger.append(&entry("B", Some(FetchErrorKind::Network))).unwrap();
        drop(ledger);

        let mut ledger = Ledger::open(&path).unwrap();
        ledger.append(&entry("B", None)).unwrap();

        let entries = read_entries(&path).unwrap();
        let ids: Vec<_> = entries.iter().map(|e| e.asset_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "B"]);
        assert_eq!(entries[1].error_kind, Some(FetchErrorKind::Network));
    }

    #[test]
    fn test_read_entries_skips_torn_final_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x_ledger.jsonl");
        let mut ledger = Ledger::open(&path).unwrap();
        ledger.append(&entry("A", None)).unwrap();
        drop(ledger);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"asset_id\":\"B\",\"outc").unwrap();

        let entries = read_entries(&path).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_open_truncates_torn_tail_before_appending() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x_ledger.jsonl");
        let mut ledger = Ledger::open(&path).unwrap();
        ledger.append(&entry("A", None)).unwrap();
        drop(ledger);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"asset_id\":\"B\",\"outc").unwrap();
        drop(file);

        let mut ledger = Ledger::open(&path).unwrap();
        ledger.append(&entry("C", None)).unwrap();

        let entries = read_entries(&path).unwrap();
        let ids: Vec<_> = entries.iter().map(|e| e.asset_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "C"]);
    }

    #[test]
    fn test_read_entries_rejects_corrupt_interior_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x_ledger.jsonl");
        let good = serde_json::to_string(&entry("A", None)).unwrap();
        std::fs::write(&path, format!("{good}\nnot json\n{good}\n")).unwrap();

        assert!(matches!(
            read_entries(&path),
            Err(LedgerError::Corrupt { line: 2, .. })
        ));
    }

    #[test]
    fn test_read_entries_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(read_entries(&dir.path().join("none.jsonl")).unwrap().is_empty());
    }

    #[test]
    fn test_summary_counts_attempts_and_kinds() {
        let entries = vec![
            entry("A", Some(FetchErrorKind::Timeout)),
            entry("A", None),
            entry("B", Some(FetchErrorKind::Network)),
            entry("C", Some(FetchErrorKind::Network)),
        ];
        let summary = LedgerSummary::from_entries(&entries);
        assert_eq!(summary.attempts, 4);
        assert_eq!(summary.distinct_assets, 3);
        assert_eq!(summary.successes, 1);
        assert_eq!(summary.failures, 3);
        assert_eq!(summary.kinds.get(&FetchErrorKind::Network), Some(&2));
        assert_eq!(summary.bytes, 20);
    }
}
