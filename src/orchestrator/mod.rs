//! Top-level control of a collection download.
//!
//! # Overview
//!
//! The [`Orchestrator`] ties the pieces together:
//!
//! 1. Resolve a payload snapshot for a [`CollectionKey`], reusing the newest
//!    matching snapshot in the cache directory unless a refresh is asked for.
//! 2. Authenticate once and build a [`Fetcher`] from the credentials.
//! 3. Run every pending asset through the [`WorkerPool`]; a single handler
//!    on the coordinating task applies outcomes, appends the ledger and
//!    checkpoints every `checkpoint_every` completions.
//! 4. Checkpoint once more however the run ends.
//!
//! `stats` is read-only; `retry` moves failed assets back to pending before
//! running; `verify` re-checks completed assets against the disk.

mod handler;
mod report;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::auth::{AuthError, Authenticator, Credentials};
use crate::catalog::{self, CatalogError, CollectionKey};
use crate::download::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
use crate::download::filename::filename_for_url;
use crate::download::{
    DEFAULT_CONCURRENCY, Fetcher, HttpFetcher, PoolError, RetryPolicy, WorkerPool, asset_dir,
};
use crate::ledger::{self, Ledger, LedgerError, LedgerSummary};
use crate::query::{self, CatalogQuery, QueryError};
use crate::store::{self, AssetStatus, FailureRecord, StatePaths, StoreError};

use handler::OutcomeHandler;
pub use report::{DownloadReport, StatsReport, VerifyReport};

/// Default number of completed assets between checkpoints.
pub const DEFAULT_CHECKPOINT_EVERY: usize = 10;

/// Errors that end an orchestrator operation.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Credentials could not be obtained.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Query records could not be turned into a snapshot.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Snapshot or failure record error.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Catalog query failed.
    #[error(transparent)]
    Query(#[from] QueryError),

    /// Ledger error.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Invalid pool settings.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The fetcher could not be built from the credentials.
    #[error("failed to build HTTP fetcher: {0}")]
    FetcherSetup(#[source] reqwest::Error),

    /// Settings rejected before running.
    #[error("invalid settings: {reason}")]
    InvalidSettings {
        /// What was wrong.
        reason: String,
    },
}

/// Builds the fetcher used for a run once credentials are known.
pub trait FetcherFactory: Send + Sync {
    /// Returns a fetcher that attaches `credentials` to its requests.
    ///
    /// # Errors
    ///
    /// Returns the HTTP client construction error.
    fn build(&self, credentials: Credentials) -> Result<Arc<dyn Fetcher>, reqwest::Error>;
}

impl<F> FetcherFactory for F
where
    F: Fn(Credentials) -> Result<Arc<dyn Fetcher>, reqwest::Error> + Send + Sync,
{
    fn build(&self, credentials: Credentials) -> Result<Arc<dyn Fetcher>, reqwest::Error> {
        self(credentials)
    }
}

/// Builds [`HttpFetcher`]s with fixed timeouts and retry policy.
#[derive(Debug, Clone)]
pub struct HttpFetcherFactory {
    connect_timeout_secs: u64,
    read_timeout_secs: u64,
    retry_policy: RetryPolicy,
}

impl HttpFetcherFactory {
    /// Creates a factory.
    #[must_use]
    pub fn new(connect_timeout_secs: u64, read_timeout_secs: u64, retry_policy: RetryPolicy) -> Self {
        Self {
            connect_timeout_secs,
            read_timeout_secs,
            retry_policy,
        }
    }
}

impl Default for HttpFetcherFactory {
    fn default() -> Self {
        Self::new(CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS, RetryPolicy::default())
    }
}

impl FetcherFactory for HttpFetcherFactory {
    fn build(&self, credentials: Credentials) -> Result<Arc<dyn Fetcher>, reqwest::Error> {
        let fetcher = HttpFetcher::with_timeouts(self.connect_timeout_secs, self.read_timeout_secs)?
            .with_credentials(Some(credentials))
            .with_retry_policy(self.retry_policy.clone());
        Ok(Arc::new(fetcher))
    }
}

/// Run settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Root of downloaded files; each asset gets a subdirectory.
    pub download_dir: PathBuf,
    /// Directory holding snapshots, ledgers, failure records and record caches.
    pub cache_dir: PathBuf,
    /// Assets in flight at once.
    pub concurrency: usize,
    /// Completed assets between checkpoints.
    pub checkpoint_every: usize,
    /// Query again even when a matching snapshot exists.
    pub refresh: bool,
    /// Draw a progress bar on stderr.
    pub show_progress: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("./data"),
            cache_dir: PathBuf::from("./cache"),
            concurrency: DEFAULT_CONCURRENCY,
            checkpoint_every: DEFAULT_CHECKPOINT_EVERY,
            refresh: false,
            show_progress: false,
        }
    }
}

/// Drives payload snapshots to completion.
pub struct Orchestrator {
    settings: Settings,
    pool: WorkerPool,
    fetchers: Box<dyn FetcherFactory>,
    authenticator: Box<dyn Authenticator>,
    interrupted: Arc<AtomicBool>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Pool`] for a concurrency outside `1..=100`,
    /// [`OrchestratorError::InvalidSettings`] for `checkpoint_every == 0`.
    pub fn new(
        settings: Settings,
        fetchers: impl FetcherFactory + 'static,
        authenticator: impl Authenticator + 'static,
    ) -> Result<Self, OrchestratorError> {
        let pool = WorkerPool::new(settings.concurrency)?;
        if settings.checkpoint_every == 0 {
            return Err(OrchestratorError::InvalidSettings {
                reason: "checkpoint_every must be at least 1".to_string(),
            });
        }
        Ok(Self {
            settings,
            pool,
            fetchers: Box::new(fetchers),
            authenticator: Box::new(authenticator),
            interrupted: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Shares an externally owned interrupt flag (set from a signal handler).
    #[must_use]
    pub fn with_interrupt_flag(mut self, interrupted: Arc<AtomicBool>) -> Self {
        self.interrupted = interrupted;
        self
    }

    /// The flag that stops admission when set.
    #[must_use]
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    /// Active settings.
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Finds or creates the payload snapshot for `key`.
    ///
    /// The newest snapshot in the cache directory whose fingerprint matches
    /// is reused unless `refresh` is set. Otherwise `query` runs, its raw
    /// records are cached, and a new timestamped snapshot is saved.
    ///
    /// # Errors
    ///
    /// Query, catalog or store errors.
    #[instrument(skip(self, query), fields(collection = %key))]
    pub async fn resolve_snapshot(
        &self,
        key: &CollectionKey,
        query: &dyn CatalogQuery,
    ) -> Result<PathBuf, OrchestratorError> {
        if !self.settings.refresh
            && let Some(path) = store::find_latest(&self.settings.cache_dir, key)?
        {
            info!(path = %path.display(), "resuming existing payload");
            return Ok(path);
        }

        let records = query.query(key).await?;
        let records_path = self.settings.cache_dir.join(query::records_file_name(key));
        query::save_records(&records, &records_path)?;

        let snapshot = catalog::build(key, &records)?;
        let path = store::new_snapshot_path(&self.settings.cache_dir, key, snapshot.created_at());
        store::save(&snapshot, &path)?;
        info!(path = %path.display(), assets = snapshot.len(), "payload created");
        Ok(path)
    }

    /// Resolves the snapshot for `key` and downloads it.
    ///
    /// # Errors
    ///
    /// See [`resolve_snapshot`](Self::resolve_snapshot) and
    /// [`download_payload`](Self::download_payload).
    pub async fn download(
        &self,
        key: &CollectionKey,
        query: &dyn CatalogQuery,
    ) -> Result<DownloadReport, OrchestratorError> {
        let path = self.resolve_snapshot(key, query).await?;
        self.download_payload(&path).await
    }

    /// Downloads every pending asset of the snapshot at `path`.
    ///
    /// Returns without authenticating or writing anything when no asset is
    /// pending. Per-asset failures and authentication failures seen during
    /// the run are reported, not returned as errors; the state is always
    /// checkpointed before returning.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Auth`] when no credentials can be obtained, store
    /// and ledger errors otherwise.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn download_payload(&self, path: &Path) -> Result<DownloadReport, OrchestratorError> {
        let mut snapshot = store::load(path)?;
        let work: Vec<_> = snapshot.pending().cloned().collect();
        if work.is_empty() {
            info!(assets = snapshot.len(), "nothing pending");
            return Ok(DownloadReport::idle(path.to_path_buf(), &snapshot));
        }

        let credentials = self.authenticator.authenticate().await?;
        let fetcher = self
            .fetchers
            .build(credentials)
            .map_err(OrchestratorError::FetcherSetup)?;

        let paths = StatePaths::for_payload(path);
        let ledger = Ledger::open(&paths.ledger)?;
        let progress = self.progress_bar(work.len());
        info!(
            pending = work.len(),
            concurrency = self.pool.concurrency(),
            collection = %snapshot.collection(),
            "starting download run"
        );

        let mut handler = OutcomeHandler::new(
            &mut snapshot,
            &paths,
            ledger,
            progress,
            self.settings.checkpoint_every,
        );
        let summary = self
            .pool
            .run(
                work,
                fetcher,
                &self.settings.download_dir,
                &self.interrupted,
                &mut handler,
            )
            .await;
        let (checkpoints, result) = handler.finish();
        result?;

        let report = DownloadReport::from_run(path.to_path_buf(), &snapshot, summary, checkpoints);
        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            pending = report.counts.pending,
            bytes = report.bytes_this_run,
            "download run finished"
        );
        if let Some(reason) = &report.auth_failure {
            warn!(reason = %reason, "run stopped on authentication failure");
        }
        Ok(report)
    }

    /// Moves failed assets back to pending and downloads again.
    ///
    /// # Errors
    ///
    /// Same as [`download_payload`](Self::download_payload).
    pub async fn retry(&self, path: &Path) -> Result<DownloadReport, OrchestratorError> {
        let mut snapshot = store::load(path)?;
        let reset = snapshot.reset_failed();
        info!(reset, "failed assets moved back to pending");
        if reset > 0 {
            store::save(&snapshot, path)?;
        }

        let mut report = self.download_payload(path).await?;
        report.reset_from_failed = reset;
        Ok(report)
    }

    /// Summarizes a payload and its ledger without modifying either.
    ///
    /// # Errors
    ///
    /// Store or ledger read errors.
    pub fn stats(&self, path: &Path) -> Result<StatsReport, OrchestratorError> {
        payload_stats(path)
    }

    /// Re-checks every done asset against the download directory.
    ///
    /// A link whose file is missing, or whose size differs from the recorded
    /// or expected size, is forgotten and its asset moved back to pending.
    /// The snapshot and failure record are saved afterwards.
    ///
    /// # Errors
    ///
    /// Store errors.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn verify(&self, path: &Path) -> Result<VerifyReport, OrchestratorError> {
        let mut snapshot = store::load(path)?;
        let mut report = VerifyReport {
            payload: path.to_path_buf(),
            ..VerifyReport::default()
        };

        let mut reopen = Vec::new();
        for asset in snapshot.assets().iter().filter(|a| a.status() == AssetStatus::Done) {
            report.checked += 1;
            let dir = asset_dir(&self.settings.download_dir, asset.id());
            let missing: Vec<String> = asset
                .links()
                .iter()
                .filter(|link| {
                    let recorded = asset.fetched_links().get(link.url()).copied();
                    let on_disk = std::fs::metadata(dir.join(filename_for_url(link.url())))
                        .ok()
                        .filter(std::fs::Metadata::is_file)
                        .map(|m| m.len());
                    let expected_ok = link.expected_size_bytes().is_none_or(|e| Some(e) == on_disk);
                    on_disk.is_none() || on_disk != recorded || !expected_ok
                })
                .map(|link| link.url().to_string())
                .collect();

            if missing.is_empty() {
                report.intact += 1;
            } else {
                warn!(asset_id = %asset.id(), missing = missing.len(), "asset files missing, reopening");
                report.links_missing += missing.len();
                reopen.push((asset.id().to_string(), missing));
            }
        }

        for (id, missing) in &reopen {
            snapshot.reopen(id, missing)?;
        }
        report.reset = reopen.len();

        store::save(&snapshot, path)?;
        FailureRecord::from_snapshot(&snapshot).save(&StatePaths::for_payload(path).failures)?;
        info!(
            checked = report.checked,
            intact = report.intact,
            reset = report.reset,
            "verification finished"
        );
        Ok(report)
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.settings.show_progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(len as u64);
        bar.set_style(
            ProgressStyle::with_template("{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} assets")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        bar
    }
}

/// Stats for a payload, usable without building an orchestrator.
///
/// # Errors
///
/// Store or ledger read errors.
pub fn payload_stats(path: &Path) -> Result<StatsReport, OrchestratorError> {
    let snapshot = store::load(path)?;
    let entries = ledger::read_entries(&StatePaths::for_payload(path).ledger)?;
    Ok(StatsReport::new(
        path.to_path_buf(),
        &snapshot,
        LedgerSummary::from_entries(&entries),
    ))
}
