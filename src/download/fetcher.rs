//! The fetch seam and the per-asset fetch sequence.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use super::filename::asset_dir_name;
use super::{FetchError, FetchErrorKind};
use crate::catalog::DownloadLink;
use crate::store::Asset;

/// A link successfully written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult {
    /// Final path of the file.
    pub path: PathBuf,
    /// Bytes written.
    pub bytes: u64,
    /// Wall time of the fetch including transport retries.
    pub duration_ms: u64,
}

/// Fetches one link into a directory.
///
/// Implementations must be deterministic about the destination path so a
/// retried fetch overwrites the previous attempt, and must never leave a
/// partial file under the final name.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Downloads `link` into `dest_dir`.
    ///
    /// # Errors
    ///
    /// Returns a [`FetchError`] classified by [`FetchError::kind`].
    async fn fetch(&self, link: &DownloadLink, dest_dir: &Path) -> Result<FetchResult, FetchError>;
}

/// One link fetched during an asset attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkFetch {
    /// The link URL.
    pub url: String,
    /// Bytes on disk.
    pub bytes: u64,
}

/// Result of one attempt at an asset, owned and handed back to the
/// coordinating task.
#[derive(Debug)]
pub struct AssetOutcome {
    /// The asset attempted.
    pub asset_id: String,
    /// Links written during this attempt, in order.
    pub fetched: Vec<LinkFetch>,
    /// First failure of the attempt, or the authentication failure that
    /// stopped it.
    pub error: Option<FetchError>,
    /// When the attempt began.
    pub started_at: DateTime<Utc>,
    /// When the attempt ended.
    pub finished_at: DateTime<Utc>,
}

impl AssetOutcome {
    /// Whether every missing link was fetched.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Bytes written during this attempt.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.fetched.iter().map(|link| link.bytes).sum()
    }

    /// Classification of the failure, if any.
    #[must_use]
    pub fn error_kind(&self) -> Option<FetchErrorKind> {
        self.error.as_ref().map(FetchError::kind)
    }

    /// Whether the attempt failed on authentication.
    #[must_use]
    pub fn is_auth_failure(&self) -> bool {
        self.error_kind().is_some_and(|kind| kind.is_fatal())
    }

    /// Attempt duration in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> u64 {
        u64::try_from((self.finished_at - self.started_at).num_milliseconds()).unwrap_or(0)
    }
}

/// Directory holding the files of `asset_id`.
#[must_use]
pub fn asset_dir(download_dir: &Path, asset_id: &str) -> PathBuf {
    download_dir.join(asset_dir_name(asset_id))
}

/// Fetches the links of `asset` that are not yet on disk, in order.
///
/// Every missing link is tried even after one fails, so the next attempt
/// only has to fetch the links that failed. The outcome carries the first
/// error, unless an authentication failure occurs: that one replaces it
/// and stops the asset at once.
#[instrument(skip(fetcher, asset, download_dir), fields(asset_id = %asset.id()))]
pub async fn fetch_asset(fetcher: &dyn Fetcher, asset: &Asset, download_dir: &Path) -> AssetOutcome {
    let started_at = Utc::now();
    let dest_dir = asset_dir(download_dir, asset.id());
    let mut fetched = Vec::new();
    let mut error = None;

    for link in asset.missing_links() {
        match fetcher.fetch(link, &dest_dir).await {
            Ok(result) => {
                debug!(
                    url = %link.url(),
                    path = %result.path.display(),
                    bytes = result.bytes,
                    duration_ms = result.duration_ms,
                    "link fetched"
                );
                fetched.push(LinkFetch {
                    url: link.url().to_string(),
                    bytes: result.bytes,
                });
            }
            Err(e) => {
                warn!(url = %link.url(), kind = %e.kind(), error = %e, "link failed");
                if e.kind().is_fatal() {
                    error = Some(e);
                    break;
                }
                error.get_or_insert(e);
            }
        }
    }

    AssetOutcome {
        asset_id: asset.id().to_string(),
        fetched,
        error,
        started_at,
        finished_at: Utc::now(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::catalog::LinkRole;

    /// Fails every URL containing `fail` (network) or `auth`, records call order.
    struct ScriptedFetcher {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(
            &self,
            link: &DownloadLink,
            dest_dir: &Path,
        ) -> Result<FetchResult, FetchError> {
            self.calls.lock().unwrap().push(link.url().to_string());
            if link.url().contains("fail") {
                return Err(FetchError::http_status(link.url(), 503));
            }
            if link.url().contains("auth") {
                return Err(FetchError::auth_required(link.url(), 401, "h"));
            }
            Ok(FetchResult {
                path: dest_dir.join("x"),
                bytes: 7,
                duration_ms: 1,
            })
        }
    }

    fn asset(urls: &[&str]) -> Asset {
        Asset::new(
            "G/1",
            urls.iter()
                .map(|url| DownloadLink::new(*url, LinkRole::PrimaryData))
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_fetch_asset_tries_links_after_a_failure() {
        let fetcher = ScriptedFetcher {
            calls: Mutex::new(Vec::new()),
        };
        let asset = asset(&["https://h/fail2", "https://h/url3"]);

        let outcome = fetch_asset(&fetcher, &asset, Path::new("/tmp/data")).await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.error_kind(), Some(FetchErrorKind::Network));
        assert_eq!(outcome.fetched.len(), 1);
        assert_eq!(outcome.fetched[0].url, "https://h/url3");
        assert_eq!(
            *fetcher.calls.lock().unwrap(),
            vec!["https://h/fail2".to_string(), "https://h/url3".to_string()]
        );
    }

    #[tokio::test]
    async fn test_fetch_asset_keeps_first_error() {
        let fetcher = ScriptedFetcher {
            calls: Mutex::new(Vec::new()),
        };
        let asset = asset(&["https://h/a", "https://h/fail1", "https://h/c", "https://h/fail2"]);

        let outcome = fetch_asset(&fetcher, &asset, Path::new("/tmp/data")).await;

        let urls: Vec<_> = outcome.fetched.iter().map(|f| f.url.as_str()).collect();
        assert_eq!(urls, vec!["https://h/a", "https://h/c"]);
        let message = outcome.error.as_ref().unwrap().to_string();
        assert!(message.contains("https://h/fail1"), "{message}");
    }

    #[tokio::test]
    async fn test_fetch_asset_stops_on_auth_failure() {
        let fetcher = ScriptedFetcher {
            calls: Mutex::new(Vec::new()),
        };
        let asset = asset(&["https://h/fail", "https://h/auth", "https://h/b"]);

        let outcome = fetch_asset(&fetcher, &asset, Path::new("/tmp/data")).await;

        assert!(outcome.is_auth_failure());
        assert!(outcome.fetched.is_empty());
        assert_eq!(
            *fetcher.calls.lock().unwrap(),
            vec!["https://h/fail".to_string(), "https://h/auth".to_string()]
        );
    }

    #[tokio::test]
    async fn test_fetch_asset_success_sums_bytes() {
        let fetcher = ScriptedFetcher {
            calls: Mutex::new(Vec::new()),
        };
        let outcome = fetch_asset(
            &fetcher,
            &asset(&["https://h/a", "https://h/b"]),
            Path::new("/tmp/data"),
        )
        .await;

        assert!(outcome.is_success());
        assert!(!outcome.is_auth_failure());
        assert_eq!(outcome.bytes(), 14);
    }

    #[test]
    fn test_asset_dir_sanitizes_identifier() {
        assert_eq!(
            asset_dir(Path::new("/data"), "G/1"),
            PathBuf::from("/data/G_1")
        );
    }
}
