//! Run, stats and verification reports.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;

use crate::catalog::CollectionKey;
use crate::download::{FetchErrorKind, RunSummary};
use crate::ledger::LedgerSummary;
use crate::store::{AssetStatus, PayloadSnapshot, StatusCounts};

/// Outcome of one download run over a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadReport {
    /// Payload snapshot the run worked on.
    pub payload: PathBuf,
    /// Collection of the payload.
    pub collection: CollectionKey,
    /// Failed assets moved back to pending before the run.
    pub reset_from_failed: usize,
    /// Assets whose attempt succeeded this run.
    pub succeeded: usize,
    /// Assets whose attempt failed this run.
    pub failed: usize,
    /// Pending assets never started because the run stopped early.
    pub not_started: usize,
    /// Bytes written this run.
    pub bytes_this_run: u64,
    /// Status counts after the run.
    pub counts: StatusCounts,
    /// Bytes on disk across the whole payload.
    pub total_bytes: u64,
    /// Authentication failure that stopped the run.
    pub auth_failure: Option<String>,
    /// Whether the run stopped on interrupt.
    pub interrupted: bool,
    /// Snapshot saves performed.
    pub checkpoints: usize,
}

impl DownloadReport {
    pub(super) fn from_run(
        payload: PathBuf,
        snapshot: &PayloadSnapshot,
        summary: RunSummary,
        checkpoints: usize,
    ) -> Self {
        Self {
            payload,
            collection: snapshot.collection().clone(),
            reset_from_failed: 0,
            succeeded: summary.succeeded,
            failed: summary.failed,
            not_started: summary.not_started,
            bytes_this_run: summary.bytes_total,
            counts: snapshot.counts(),
            total_bytes: snapshot.total_bytes(),
            auth_failure: summary.auth_failure,
            interrupted: summary.interrupted,
            checkpoints,
        }
    }

    /// Report for a payload with nothing pending.
    pub(super) fn idle(payload: PathBuf, snapshot: &PayloadSnapshot) -> Self {
        Self::from_run(payload, snapshot, RunSummary::default(), 0)
    }

    /// Assets attempted this run.
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.succeeded + self.failed
    }

    /// Whether the payload holds failed assets after the run.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.counts.failed > 0
    }
}

/// Read-only view of a payload and its ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsReport {
    /// Payload snapshot inspected.
    pub payload: PathBuf,
    /// Collection of the payload.
    pub collection: CollectionKey,
    /// Assets by status.
    pub counts: StatusCounts,
    /// Summed `bytes_downloaded`.
    pub bytes_downloaded: u64,
    /// Failed assets by last error kind.
    pub failure_kinds: BTreeMap<FetchErrorKind, usize>,
    /// Attempt counters summed over assets.
    pub asset_attempts: u64,
    /// Attempt history from the ledger.
    pub ledger: LedgerSummary,
}

impl StatsReport {
    pub(super) fn new(payload: PathBuf, snapshot: &PayloadSnapshot, ledger: LedgerSummary) -> Self {
        let mut failure_kinds = BTreeMap::new();
        for asset in snapshot.assets() {
            if asset.status() == AssetStatus::Failed
                && let Some(error) = asset.last_error()
            {
                *failure_kinds.entry(error.kind).or_insert(0) += 1;
            }
        }
        Self {
            payload,
            collection: snapshot.collection().clone(),
            counts: snapshot.counts(),
            bytes_downloaded: snapshot.total_bytes(),
            failure_kinds,
            asset_attempts: snapshot.assets().iter().map(|a| u64::from(a.attempts())).sum(),
            ledger,
        }
    }

    /// Whether any failed asset last failed on authentication.
    #[must_use]
    pub fn has_auth_failures(&self) -> bool {
        self.failure_kinds.contains_key(&FetchErrorKind::Auth)
    }
}

/// Result of re-checking completed assets against the disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    /// Payload snapshot verified.
    pub payload: PathBuf,
    /// Done assets checked.
    pub checked: usize,
    /// Done assets whose files are all present with the recorded size.
    pub intact: usize,
    /// Done assets moved back to pending.
    pub reset: usize,
    /// Links found missing or with the wrong size.
    pub links_missing: usize,
}
