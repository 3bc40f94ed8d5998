//! End-to-end orchestrator tests with an in-process fetcher.
//!
//! The fetcher writes real files so verification and resume behave as they
//! would against a server, without any network.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use granule_core::auth::{Credentials, StaticAuthenticator};
use granule_core::catalog::{self, CollectionKey, DownloadLink};
use granule_core::download::filename::filename_for_url;
use granule_core::download::{FetchError, FetchErrorKind, FetchResult, Fetcher, asset_dir};
use granule_core::ledger::read_entries;
use granule_core::query::{CatalogQuery, QueryError};
use granule_core::store::{self, AssetStatus, FailureRecord, StatePaths};
use granule_core::{Orchestrator, OrchestratorError, Settings};
use serde_json::{Value, json};
use tempfile::TempDir;

#[derive(Clone, Copy)]
enum Failure {
    Network,
    Auth,
}

/// Writes each URL's bytes to disk unless told to fail it.
#[derive(Default)]
struct MockFetcher {
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, Failure>>,
    delay: Option<Duration>,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl MockFetcher {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    fn fail(&self, url: &str, failure: Failure) {
        self.failures.lock().unwrap().insert(url.to_string(), failure);
    }

    fn heal(&self, url: &str) {
        self.failures.lock().unwrap().remove(url);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, link: &DownloadLink, dest_dir: &Path) -> Result<FetchResult, FetchError> {
        let url = link.url().to_string();
        self.calls.lock().unwrap().push(url.clone());

        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.current.fetch_sub(1, Ordering::SeqCst);

        let failure = self.failures.lock().unwrap().get(&url).copied();
        match failure {
            Some(Failure::Network) => return Err(FetchError::http_status(&url, 503)),
            Some(Failure::Auth) => return Err(FetchError::auth_required(&url, 401, "data.test")),
            None => {}
        }

        std::fs::create_dir_all(dest_dir).unwrap();
        let path = dest_dir.join(filename_for_url(&url));
        std::fs::write(&path, url.as_bytes()).unwrap();
        Ok(FetchResult {
            path,
            bytes: url.len() as u64,
            duration_ms: 1,
        })
    }
}

struct Harness {
    _dir: TempDir,
    settings: Settings,
    fetcher: Arc<MockFetcher>,
}

impl Harness {
    fn new(fetcher: MockFetcher) -> Self {
        let dir = TempDir::new().unwrap();
        let settings = Settings {
            download_dir: dir.path().join("data"),
            cache_dir: dir.path().join("cache"),
            concurrency: 2,
            checkpoint_every: 10,
            refresh: false,
            show_progress: false,
        };
        Self {
            _dir: dir,
            settings,
            fetcher: Arc::new(fetcher),
        }
    }

    fn orchestrator(&self) -> Orchestrator {
        self.orchestrator_with(self.settings.clone())
    }

    fn orchestrator_with(&self, settings: Settings) -> Orchestrator {
        let fetcher = Arc::clone(&self.fetcher);
        Orchestrator::new(
            settings,
            move |_credentials: Credentials| Ok::<_, reqwest::Error>(Arc::clone(&fetcher) as Arc<dyn Fetcher>),
            StaticAuthenticator::new(Credentials::bearer("test-token")),
        )
        .unwrap()
    }

    /// Orchestrator whose authenticator always fails.
    fn unauthenticated(&self) -> Orchestrator {
        let fetcher = Arc::clone(&self.fetcher);
        Orchestrator::new(
            self.settings.clone(),
            move |_credentials: Credentials| Ok::<_, reqwest::Error>(Arc::clone(&fetcher) as Arc<dyn Fetcher>),
            StaticAuthenticator::none(),
        )
        .unwrap()
    }

    /// Saves a payload built from `assets` (id, urls) and returns its path.
    fn payload(&self, assets: &[(&str, &[&str])]) -> PathBuf {
        let key = CollectionKey::new("TEST", "001");
        let snapshot = catalog::build(&key, &records(assets)).unwrap();
        let path = self
            .settings
            .cache_dir
            .join(store::snapshot_file_name(&key, snapshot.created_at()));
        store::save(&snapshot, &path).unwrap();
        path
    }
}

fn records(assets: &[(&str, &[&str])]) -> Vec<Value> {
    assets
        .iter()
        .map(|(id, urls)| {
            let related: Vec<Value> = urls
                .iter()
                .map(|url| json!({ "URL": url, "Type": "GET DATA" }))
                .collect();
            json!({ "umm": { "GranuleUR": id, "RelatedUrls": related } })
        })
        .collect()
}

const URL_A: &str = "https://data.test/a/a.h5";
const URL_B1: &str = "https://data.test/b/b.h5";
const URL_B2: &str = "https://data.test/b/b.xml";

#[tokio::test]
async fn test_failed_first_link_then_retry_fetches_only_that_link() {
    let harness = Harness::new(MockFetcher::default());
    harness.fetcher.fail(URL_B1, Failure::Network);
    let path = harness.payload(&[("A", &[URL_A]), ("B", &[URL_B1, URL_B2])]);
    let orchestrator = harness.orchestrator();

    let report = orchestrator.download_payload(&path).await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    assert!(report.has_failures());
    assert_eq!(harness.fetcher.calls().len(), 3);

    let snapshot = store::load(&path).unwrap();
    assert_eq!(snapshot.get("A").unwrap().status(), AssetStatus::Done);
    let b = snapshot.get("B").unwrap();
    assert_eq!(b.status(), AssetStatus::Failed);
    assert_eq!(b.last_error().unwrap().kind, FetchErrorKind::Network);
    assert!(!b.fetched_links().contains_key(URL_B1));
    assert!(b.fetched_links().contains_key(URL_B2));

    let stats = orchestrator.stats(&path).unwrap();
    assert_eq!(stats.counts.done, 1);
    assert_eq!(stats.counts.failed, 1);
    assert_eq!(stats.ledger.successes, 1);
    assert_eq!(stats.ledger.failures, 1);
    assert_eq!(stats.failure_kinds.get(&FetchErrorKind::Network), Some(&1));
    assert_eq!(stats.ledger.attempts, 2);

    let failures = FailureRecord::load(&StatePaths::for_payload(&path).failures).unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures.get("B").unwrap().kind, FetchErrorKind::Network);

    harness.fetcher.heal(URL_B1);
    harness.fetcher.clear_calls();
    let report = orchestrator.retry(&path).await.unwrap();
    assert_eq!(report.reset_from_failed, 1);
    assert_eq!(report.succeeded, 1);
    assert_eq!(harness.fetcher.calls(), vec![URL_B1.to_string()]);

    let snapshot = store::load(&path).unwrap();
    let b = snapshot.get("B").unwrap();
    assert_eq!(b.status(), AssetStatus::Done);
    assert_eq!(b.attempts(), 2);
    assert!(b.last_error().is_none());
    assert!(FailureRecord::load(&StatePaths::for_payload(&path).failures).unwrap().is_empty());
}

#[tokio::test]
async fn test_retry_of_three_link_asset_fetches_only_failed_middle_link() {
    const FIRST: &str = "https://data.test/m/m.h5";
    const MIDDLE: &str = "https://data.test/m/m.xml";
    const LAST: &str = "https://data.test/m/m.png";
    let harness = Harness::new(MockFetcher::default());
    harness.fetcher.fail(MIDDLE, Failure::Network);
    let path = harness.payload(&[("M", &[FIRST, MIDDLE, LAST])]);
    let orchestrator = harness.orchestrator();

    let report = orchestrator.download_payload(&path).await.unwrap();
    assert_eq!(report.failed, 1);
    let snapshot = store::load(&path).unwrap();
    let m = snapshot.get("M").unwrap();
    assert_eq!(m.fetched_links().len(), 2);
    assert_eq!(m.missing_links().map(|l| l.url()).collect::<Vec<_>>(), vec![MIDDLE]);

    harness.fetcher.heal(MIDDLE);
    harness.fetcher.clear_calls();
    let report = orchestrator.retry(&path).await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(harness.fetcher.calls(), vec![MIDDLE.to_string()]);
    assert_eq!(store::load(&path).unwrap().get("M").unwrap().status(), AssetStatus::Done);
}

#[tokio::test]
async fn test_second_download_of_finished_payload_is_a_no_op() {
    let harness = Harness::new(MockFetcher::default());
    let path = harness.payload(&[("A", &[URL_A]), ("B", &[URL_B1])]);
    harness.orchestrator().download_payload(&path).await.unwrap();

    let before = std::fs::read(&path).unwrap();
    let ledger_before = read_entries(&StatePaths::for_payload(&path).ledger).unwrap();
    harness.fetcher.clear_calls();

    // Authentication would fail, so a clean result proves it was skipped.
    let report = harness.unauthenticated().download_payload(&path).await.unwrap();

    assert_eq!(report.attempted(), 0);
    assert!(harness.fetcher.calls().is_empty());
    assert_eq!(std::fs::read(&path).unwrap(), before);
    assert_eq!(
        read_entries(&StatePaths::for_payload(&path).ledger).unwrap(),
        ledger_before
    );
}

#[tokio::test]
async fn test_resume_after_crash_refetches_in_progress_asset_only() {
    let harness = Harness::new(MockFetcher::default());
    let path = harness.payload(&[("A", &[URL_A]), ("B", &[URL_B1])]);
    harness.orchestrator().download_payload(&path).await.unwrap();

    // Simulate a crash: B reopened, admitted, persisted mid-flight.
    let mut snapshot = store::load(&path).unwrap();
    snapshot.reopen("B", &[URL_B1.to_string()]).unwrap();
    snapshot.mark_in_progress("B").unwrap();
    store::save(&snapshot, &path).unwrap();
    harness.fetcher.clear_calls();

    let report = harness.orchestrator().download_payload(&path).await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(harness.fetcher.calls(), vec![URL_B1.to_string()]);

    let snapshot = store::load(&path).unwrap();
    assert_eq!(snapshot.get("A").unwrap().attempts(), 1);
    assert_eq!(snapshot.get("B").unwrap().attempts(), 3);
    assert_eq!(snapshot.counts().done, 2);
}

#[tokio::test]
async fn test_concurrency_never_exceeds_limit() {
    let harness = Harness::new(MockFetcher::with_delay(Duration::from_millis(15)));
    let urls: Vec<String> = (0..20).map(|i| format!("https://data.test/g{i}.h5")).collect();
    let ids: Vec<String> = (0..20).map(|i| format!("G{i}")).collect();
    let assets: Vec<(&str, Vec<&str>)> = ids
        .iter()
        .zip(&urls)
        .map(|(id, url)| (id.as_str(), vec![url.as_str()]))
        .collect();
    let assets: Vec<(&str, &[&str])> = assets.iter().map(|(id, urls)| (*id, urls.as_slice())).collect();
    let path = harness.payload(&assets);

    let settings = Settings {
        concurrency: 3,
        ..harness.settings.clone()
    };
    let report = harness.orchestrator_with(settings).download_payload(&path).await.unwrap();

    assert_eq!(report.succeeded, 20);
    assert!(harness.fetcher.peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(harness.fetcher.calls().len(), 20);
}

#[tokio::test]
async fn test_auth_failure_stops_admission_and_persists_state() {
    let harness = Harness::new(MockFetcher::default());
    harness.fetcher.fail(URL_A, Failure::Auth);
    let path = harness.payload(&[
        ("A", &[URL_A]),
        ("B", &[URL_B1]),
        ("C", &["https://data.test/c.h5"]),
    ]);
    let settings = Settings {
        concurrency: 1,
        ..harness.settings.clone()
    };

    let report = harness.orchestrator_with(settings).download_payload(&path).await.unwrap();
    assert!(report.auth_failure.is_some());
    assert_eq!(report.failed, 1);
    assert_eq!(report.not_started, 2);

    let snapshot = store::load(&path).unwrap();
    assert_eq!(snapshot.get("A").unwrap().status(), AssetStatus::Failed);
    assert_eq!(snapshot.counts().pending, 2);
}

#[tokio::test]
async fn test_interrupt_before_start_saves_and_reports() {
    let harness = Harness::new(MockFetcher::default());
    let path = harness.payload(&[("A", &[URL_A]), ("B", &[URL_B1])]);
    let interrupted = Arc::new(AtomicBool::new(true));
    let orchestrator = harness.orchestrator().with_interrupt_flag(Arc::clone(&interrupted));

    let report = orchestrator.download_payload(&path).await.unwrap();
    assert!(report.interrupted);
    assert_eq!(report.not_started, 2);
    assert!(harness.fetcher.calls().is_empty());
    assert_eq!(store::load(&path).unwrap().counts().pending, 2);
}

#[tokio::test]
async fn test_authenticator_error_is_fatal_before_any_fetch() {
    let harness = Harness::new(MockFetcher::default());
    let path = harness.payload(&[("A", &[URL_A])]);

    let result = harness.unauthenticated().download_payload(&path).await;
    assert!(matches!(result, Err(OrchestratorError::Auth(_))));
    assert!(harness.fetcher.calls().is_empty());
    assert!(!StatePaths::for_payload(&path).ledger.exists());
}

#[tokio::test]
async fn test_checkpoints_every_n_outcomes_and_at_end() {
    let harness = Harness::new(MockFetcher::default());
    let urls: Vec<String> = (0..5).map(|i| format!("https://data.test/c{i}.h5")).collect();
    let ids: Vec<String> = (0..5).map(|i| format!("C{i}")).collect();
    let owned: Vec<(&str, Vec<&str>)> = ids
        .iter()
        .zip(&urls)
        .map(|(id, url)| (id.as_str(), vec![url.as_str()]))
        .collect();
    let assets: Vec<(&str, &[&str])> = owned.iter().map(|(id, urls)| (*id, urls.as_slice())).collect();
    let path = harness.payload(&assets);
    let settings = Settings {
        checkpoint_every: 2,
        concurrency: 1,
        ..harness.settings.clone()
    };

    let report = harness.orchestrator_with(settings).download_payload(&path).await.unwrap();
    assert_eq!(report.checkpoints, 3);
    assert_eq!(store::load(&path).unwrap().counts().done, 5);
}

#[tokio::test]
async fn test_verify_reopens_assets_with_missing_files() {
    let harness = Harness::new(MockFetcher::default());
    let path = harness.payload(&[("A", &[URL_A]), ("B", &[URL_B1, URL_B2])]);
    let orchestrator = harness.orchestrator();
    orchestrator.download_payload(&path).await.unwrap();

    let b_dir = asset_dir(&harness.settings.download_dir, "B");
    std::fs::remove_file(b_dir.join(filename_for_url(URL_B2))).unwrap();

    let report = orchestrator.verify(&path).unwrap();
    assert_eq!(report.checked, 2);
    assert_eq!(report.intact, 1);
    assert_eq!(report.reset, 1);
    assert_eq!(report.links_missing, 1);

    let snapshot = store::load(&path).unwrap();
    let b = snapshot.get("B").unwrap();
    assert_eq!(b.status(), AssetStatus::Pending);
    assert!(b.fetched_links().contains_key(URL_B1));
    assert!(!b.fetched_links().contains_key(URL_B2));

    harness.fetcher.clear_calls();
    orchestrator.download_payload(&path).await.unwrap();
    assert_eq!(harness.fetcher.calls(), vec![URL_B2.to_string()]);
}

#[tokio::test]
async fn test_stats_does_not_modify_payload() {
    let harness = Harness::new(MockFetcher::default());
    let path = harness.payload(&[("A", &[URL_A])]);
    let before = std::fs::read(&path).unwrap();

    let stats = harness.orchestrator().stats(&path).unwrap();
    assert_eq!(stats.counts.pending, 1);
    assert_eq!(stats.ledger.attempts, 0);
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

/// Serves fixed records and counts queries.
struct CountingQuery {
    records: Vec<Value>,
    calls: AtomicUsize,
}

#[async_trait]
impl CatalogQuery for CountingQuery {
    async fn query(&self, _key: &CollectionKey) -> Result<Vec<Value>, QueryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.records.clone())
    }
}

#[tokio::test]
async fn test_download_reuses_matching_snapshot_unless_refreshed() {
    let harness = Harness::new(MockFetcher::default());
    let query = CountingQuery {
        records: records(&[("A", &[URL_A])]),
        calls: AtomicUsize::new(0),
    };
    let key = CollectionKey::new("TEST", "001").with_limit(Some(10));

    let first = harness.orchestrator().download(&key, &query).await.unwrap();
    assert_eq!(first.succeeded, 1);
    let second = harness.orchestrator().download(&key, &query).await.unwrap();
    assert_eq!(second.attempted(), 0);
    assert_eq!(second.payload, first.payload);
    assert_eq!(query.calls.load(Ordering::SeqCst), 1);
    assert!(
        harness
            .settings
            .cache_dir
            .join("TEST_v001_granules.json")
            .exists()
    );

    let refreshed = Settings {
        refresh: true,
        ..harness.settings.clone()
    };
    harness.orchestrator_with(refreshed).download(&key, &query).await.unwrap();
    assert_eq!(query.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_refresh_keeps_older_snapshot() {
    let harness = Harness::new(MockFetcher::default());
    let query = CountingQuery {
        records: records(&[("A", &[URL_A])]),
        calls: AtomicUsize::new(0),
    };
    let key = CollectionKey::new("TEST", "001");
    let refreshed = Settings {
        refresh: true,
        ..harness.settings.clone()
    };

    let first = harness.orchestrator_with(refreshed.clone()).download(&key, &query).await.unwrap();
    let second = harness.orchestrator_with(refreshed).download(&key, &query).await.unwrap();

    assert_ne!(first.payload, second.payload);
    assert_eq!(store::load(&first.payload).unwrap().get("A").unwrap().status(), AssetStatus::Done);
    let payloads = std::fs::read_dir(&harness.settings.cache_dir)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().ends_with(store::PAYLOAD_SUFFIX))
        .count();
    assert_eq!(payloads, 2);
}
