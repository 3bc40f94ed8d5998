//! Bounded worker pool that drives assets through a [`Fetcher`].
//!
//! # Overview
//!
//! The pool keeps at most `concurrency` assets in flight in a tokio
//! [`JoinSet`]. It admits the next asset only when a slot frees up, so the
//! admission order is the work order and no asset is started twice.
//!
//! All bookkeeping happens on the task calling [`WorkerPool::run`]: workers
//! get an owned [`Asset`] and return an owned [`AssetOutcome`], and the
//! [`PoolObserver`] sees admissions and outcomes one at a time in
//! completion order.
//!
//! # Stopping early
//!
//! Admission stops when the interrupt flag is set, when an outcome fails
//! on authentication, or when the observer asks to stop. In-flight work is
//! always drained before `run` returns.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use thiserror::Error;
use tokio::task::{self, JoinSet};
use tracing::{debug, error, info, instrument, warn};

use super::constants::{MAX_CONCURRENCY, MIN_CONCURRENCY};
use super::fetcher::{AssetOutcome, Fetcher, fetch_asset};
use super::FetchError;
use crate::store::Asset;

/// Errors constructing a pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Concurrency outside the accepted range.
    #[error(
        "invalid concurrency value {value}: must be between {MIN_CONCURRENCY} and {MAX_CONCURRENCY}"
    )]
    InvalidConcurrency {
        /// The rejected value.
        value: usize,
    },
}

/// Receives pool events on the coordinating task.
pub trait PoolObserver {
    /// Called before an asset is handed to a worker. Returning
    /// `Break` skips the asset and stops admission.
    fn on_admit(&mut self, asset_id: &str) -> ControlFlow<()>;

    /// Called exactly once per admitted asset. Returning `Break` stops
    /// admission; in-flight work still drains.
    fn on_outcome(&mut self, outcome: AssetOutcome) -> ControlFlow<()>;
}

/// Totals for one pool run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Assets whose attempt succeeded.
    pub succeeded: usize,
    /// Assets whose attempt failed.
    pub failed: usize,
    /// Bytes written across all attempts.
    pub bytes_total: u64,
    /// Work items never admitted because the run stopped early.
    pub not_started: usize,
    /// Message of the authentication failure that stopped the run.
    pub auth_failure: Option<String>,
    /// Whether the run stopped on the interrupt flag.
    pub interrupted: bool,
}

impl RunSummary {
    /// Assets admitted to the pool.
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// Bounded-concurrency asset runner.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    concurrency: usize,
}

impl WorkerPool {
    /// Creates a pool running at most `concurrency` assets at once.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConcurrency`] outside `1..=100`.
    pub fn new(concurrency: usize) -> Result<Self, PoolError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&concurrency) {
            return Err(PoolError::InvalidConcurrency { value: concurrency });
        }
        Ok(Self { concurrency })
    }

    /// Configured concurrency.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Runs every work item through `fetcher` unless stopped early.
    #[instrument(skip_all, fields(concurrency = self.concurrency, work = work.len()))]
    pub async fn run<O>(
        &self,
        work: Vec<Asset>,
        fetcher: Arc<dyn Fetcher>,
        download_dir: &Path,
        interrupted: &AtomicBool,
        observer: &mut O,
    ) -> RunSummary
    where
        O: PoolObserver + ?Sized,
    {
        let mut queue = work.into_iter();
        let mut in_flight: JoinSet<AssetOutcome> = JoinSet::new();
        let mut tasks: HashMap<task::Id, (String, DateTime<Utc>)> = HashMap::new();
        let mut summary = RunSummary::default();
        let mut admitting = true;

        loop {
            while admitting && in_flight.len() < self.concurrency {
                if interrupted.load(Ordering::SeqCst) {
                    info!(in_flight = in_flight.len(), "interrupt received, draining in-flight work");
                    summary.interrupted = true;
                    admitting = false;
                    break;
                }
                let Some(asset) = queue.next() else {
                    admitting = false;
                    break;
                };
                if observer.on_admit(asset.id()).is_break() {
                    warn!(asset_id = %asset.id(), "observer refused admission, stopping");
                    summary.not_started += 1;
                    admitting = false;
                    break;
                }

                debug!(asset_id = %asset.id(), "admitting asset");
                let fetcher = Arc::clone(&fetcher);
                let task_dir = download_dir.to_path_buf();
                let asset_id = asset.id().to_string();
                let handle = in_flight.spawn(async move {
                    let started_at = Utc::now();
                    match AssertUnwindSafe(fetch_asset(fetcher.as_ref(), &asset, &task_dir))
                        .catch_unwind()
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(_) => worker_failure(asset.id(), &task_dir, "worker panicked", started_at),
                    }
                });
                tasks.insert(handle.id(), (asset_id, Utc::now()));
            }

            let Some(joined) = in_flight.join_next_with_id().await else {
                break;
            };
            let outcome = match joined {
                Ok((id, outcome)) => {
                    tasks.remove(&id);
                    outcome
                }
                Err(join_error) => {
                    let Some((asset_id, started_at)) = tasks.remove(&join_error.id()) else {
                        error!(error = %join_error, "unknown worker task failed to join");
                        continue;
                    };
                    error!(asset_id = %asset_id, error = %join_error, "worker task failed to join");
                    worker_failure(
                        &asset_id,
                        download_dir,
                        &format!("worker task failed: {join_error}"),
                        started_at,
                    )
                }
            };

            summary.bytes_total += outcome.bytes();
            if outcome.is_success() {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
            if outcome.is_auth_failure() && summary.auth_failure.is_none() {
                let message = outcome
                    .error
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default();
                warn!(asset_id = %outcome.asset_id, "authentication failure, stopping admission");
                summary.auth_failure = Some(message);
                admitting = false;
            }
            if observer.on_outcome(outcome).is_break() {
                warn!("observer requested stop, draining in-flight work");
                admitting = false;
            }
        }

        summary.not_started += queue.count();
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            not_started = summary.not_started,
            bytes = summary.bytes_total,
            interrupted = summary.interrupted,
            "pool run finished"
        );
        summary
    }
}

/// Failed outcome for an asset whose worker never returned one.
fn worker_failure(
    asset_id: &str,
    download_dir: &Path,
    reason: &str,
    started_at: DateTime<Utc>,
) -> AssetOutcome {
    AssetOutcome {
        asset_id: asset_id.to_string(),
        fetched: Vec::new(),
        error: Some(FetchError::io(download_dir, std::io::Error::other(reason.to_string()))),
        started_at,
        finished_at: Utc::now(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::catalog::{DownloadLink, LinkRole};
    use crate::download::FetchResult;

    /// Sleeps per fetch and records the peak number of concurrent fetches.
    #[derive(Default)]
    struct GaugeFetcher {
        current: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Fetcher for GaugeFetcher {
        async fn fetch(
            &self,
            link: &DownloadLink,
            dest_dir: &Path,
        ) -> Result<FetchResult, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);

            if link.url().contains("auth") {
                return Err(FetchError::auth_required(link.url(), 401, "h"));
            }
            Ok(FetchResult {
                path: dest_dir.join("f"),
                bytes: 1,
                duration_ms: 20,
            })
        }
    }

    #[derive(Default)]
    struct Recorder {
        admitted: Vec<String>,
        outcomes: Vec<String>,
        stop_after: Option<usize>,
    }

    impl PoolObserver for Recorder {
        fn on_admit(&mut self, asset_id: &str) -> ControlFlow<()> {
            self.admitted.push(asset_id.to_string());
            ControlFlow::Continue(())
        }

        fn on_outcome(&mut self, outcome: AssetOutcome) -> ControlFlow<()> {
            self.outcomes.push(outcome.asset_id);
            match self.stop_after {
                Some(limit) if self.outcomes.len() >= limit => ControlFlow::Break(()),
                _ => ControlFlow::Continue(()),
            }
        }
    }

    fn work(count: usize, url: &str) -> Vec<Asset> {
        (0..count)
            .map(|i| {
                Asset::new(
                    format!("G{i}"),
                    vec![DownloadLink::new(format!("{url}/{i}"), LinkRole::PrimaryData)],
                )
            })
            .collect()
    }

    fn dir() -> PathBuf {
        PathBuf::from("/tmp/granule-pool-test")
    }

    #[test]
    fn test_worker_pool_rejects_out_of_range_concurrency() {
        assert!(matches!(
            WorkerPool::new(0),
            Err(PoolError::InvalidConcurrency { value: 0 })
        ));
        assert!(WorkerPool::new(101).is_err());
        assert_eq!(WorkerPool::new(100).unwrap().concurrency(), 100);
    }

    #[tokio::test]
    async fn test_run_respects_concurrency_bound_and_covers_all_work() {
        let fetcher = Arc::new(GaugeFetcher::default());
        let pool = WorkerPool::new(3).unwrap();
        let mut recorder = Recorder::default();

        let summary = pool
            .run(
                work(12, "https://h/ok"),
                fetcher.clone(),
                &dir(),
                &AtomicBool::new(false),
                &mut recorder,
            )
            .await;

        assert_eq!(summary.succeeded, 12);
        assert_eq!(summary.not_started, 0);
        assert_eq!(summary.bytes_total, 12);
        assert!(fetcher.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 12);

        let mut outcomes = recorder.outcomes.clone();
        outcomes.sort();
        outcomes.dedup();
        assert_eq!(outcomes.len(), 12, "every asset reported exactly once");
        assert_eq!(recorder.admitted.len(), 12);
    }

    #[tokio::test]
    async fn test_run_stops_admitting_after_auth_failure() {
        let fetcher = Arc::new(GaugeFetcher::default());
        let pool = WorkerPool::new(1).unwrap();
        let mut recorder = Recorder::default();

        let summary = pool
            .run(
                work(5, "https://h/auth"),
                fetcher,
                &dir(),
                &AtomicBool::new(false),
                &mut recorder,
            )
            .await;

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.not_started, 4);
        assert!(summary.auth_failure.is_some());
        assert_eq!(recorder.outcomes, vec!["G0".to_string()]);
    }

    #[tokio::test]
    async fn test_run_with_interrupt_set_admits_nothing() {
        let fetcher = Arc::new(GaugeFetcher::default());
        let pool = WorkerPool::new(4).unwrap();
        let mut recorder = Recorder::default();

        let summary = pool
            .run(
                work(3, "https://h/ok"),
                fetcher.clone(),
                &dir(),
                &AtomicBool::new(true),
                &mut recorder,
            )
            .await;

        assert!(summary.interrupted);
        assert_eq!(summary.not_started, 3);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_drains_when_observer_breaks() {
        let fetcher = Arc::new(GaugeFetcher::default());
        let pool = WorkerPool::new(2).unwrap();
        let mut recorder = Recorder {
            stop_after: Some(1),
            ..Recorder::default()
        };

        let summary = pool
            .run(
                work(6, "https://h/ok"),
                fetcher,
                &dir(),
                &AtomicBool::new(false),
                &mut recorder,
            )
            .await;

        assert_eq!(summary.attempted(), recorder.admitted.len());
        assert_eq!(recorder.outcomes.len(), recorder.admitted.len());
        assert_eq!(summary.attempted() + summary.not_started, 6);
        assert!(summary.attempted() <= 3);
    }

    /// Panics on every fetch.
    struct PanickingFetcher;

    #[async_trait]
    impl Fetcher for PanickingFetcher {
        async fn fetch(
            &self,
            _link: &DownloadLink,
            _dest_dir: &Path,
        ) -> Result<FetchResult, FetchError> {
            panic!("fetcher exploded");
        }
    }

    #[tokio::test]
    async fn test_run_reports_failed_outcome_for_broken_worker() {
        let pool = WorkerPool::new(2).unwrap();
        let mut recorder = Recorder::default();

        let summary = pool
            .run(
                work(3, "https://h/ok"),
                Arc::new(PanickingFetcher),
                &dir(),
                &AtomicBool::new(false),
                &mut recorder,
            )
            .await;

        assert_eq!(summary.failed, 3);
        let mut outcomes = recorder.outcomes.clone();
        outcomes.sort();
        assert_eq!(outcomes, vec!["G0", "G1", "G2"]);
    }

    #[test]
    fn test_worker_failure_is_io_failure_for_asset() {
        let outcome = worker_failure("G7", &dir(), "worker task failed: cancelled", Utc::now());
        assert_eq!(outcome.asset_id, "G7");
        assert_eq!(outcome.error_kind(), Some(crate::download::FetchErrorKind::Io));
        assert!(outcome.error.unwrap().to_string().contains("cancelled"));
    }
}
