//! HTTP implementation of [`Fetcher`] built on reqwest.
//!
//! Bodies are streamed into `<name>.part` next to the final path, checked
//! against the advertised size, and renamed into place. Redirects are
//! followed by hand so basic credentials reach the identity provider and
//! nowhere else; the cookie store keeps the session it hands back.

use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION, RETRY_AFTER};
use reqwest::{Client, redirect};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::constants::{CONNECT_TIMEOUT_SECS, MAX_REDIRECTS, READ_TIMEOUT_SECS};
use super::filename::{filename_for_url, part_path};
use super::retry::{RetryDecision, RetryPolicy, classify_error, parse_retry_after};
use super::{FetchError, FetchResult, Fetcher};
use crate::auth::Credentials;
use crate::catalog::DownloadLink;

/// User-Agent sent with every request.
pub const USER_AGENT: &str = concat!("granule-downloader/", env!("CARGO_PKG_VERSION"));

/// URL fragments that identify a login page.
const LOGIN_PATTERNS: &[&str] = &[
    "/login",
    "/signin",
    "/sign-in",
    "/oauth",
    "/sso",
    "urs.earthdata.nasa.gov",
];

/// Streaming HTTP fetcher with transport retries.
///
/// Created once per run and shared by all workers; reqwest pools
/// connections internally.
///
/// # Example
///
/// ```no_run
/// use granule_core::catalog::{DownloadLink, LinkRole};
/// use granule_core::download::{Fetcher, HttpFetcher};
/// use std::path::Path;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let fetcher = HttpFetcher::new()?;
/// let link = DownloadLink::new("https://example.com/granule.h5", LinkRole::PrimaryData);
/// let result = fetcher.fetch(&link, Path::new("./data/G1")).await?;
/// println!("{} bytes at {}", result.bytes, result.path.display());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    credentials: Option<Credentials>,
    retry_policy: RetryPolicy,
}

impl HttpFetcher {
    /// Creates a fetcher with default timeouts and retry policy.
    ///
    /// # Errors
    ///
    /// Returns the reqwest builder error when the TLS backend cannot be
    /// initialized.
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_timeouts(CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)
    }

    /// Creates a fetcher with explicit timeouts in seconds.
    ///
    /// `read_timeout_secs` bounds how long a response may stall between two
    /// reads; the transfer as a whole has no deadline.
    ///
    /// # Errors
    ///
    /// Returns the reqwest builder error when the TLS backend cannot be
    /// initialized.
    pub fn with_timeouts(
        connect_timeout_secs: u64,
        read_timeout_secs: u64,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .read_timeout(Duration::from_secs(read_timeout_secs))
            .redirect(redirect::Policy::none())
            .cookie_store(true)
            .gzip(true)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            client,
            credentials: None,
            retry_policy: RetryPolicy::default(),
        })
    }

    /// Attaches credentials to subsequent requests.
    #[must_use]
    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Replaces the transport retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Sends a GET and follows redirects, returning the first non-redirect
    /// response that is a success.
    async fn send(&self, url: &str) -> Result<reqwest::Response, FetchError> {
        let mut current = Url::parse(url).map_err(|_| FetchError::invalid_url(url))?;

        for _ in 0..=MAX_REDIRECTS {
            let mut request = self.client.get(current.clone());
            if let Some(credentials) = &self.credentials {
                request = credentials.authorize(request, current.host_str());
            }

            let response = request.send().await.map_err(|e| {
                if e.is_timeout() {
                    FetchError::timeout(url)
                } else {
                    FetchError::network(url, e)
                }
            })?;
            let status = response.status();

            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        FetchError::redirect(url, format!("HTTP {status} without Location"))
                    })?;
                current = current.join(location).map_err(|_| {
                    FetchError::redirect(url, format!("unparseable Location '{location}'"))
                })?;
                debug!(next = %current, "following redirect");
                continue;
            }

            if !status.is_success() {
                let status_code = status.as_u16();
                if matches!(status_code, 401 | 403 | 407) {
                    let domain = current.host_str().unwrap_or("unknown").to_string();
                    return Err(FetchError::auth_required(url, status_code, domain));
                }
                let retry_after = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .map(std::string::ToString::to_string);
                return Err(FetchError::http_status_with_retry_after(
                    url,
                    status_code,
                    retry_after,
                ));
            }

            if let Some(auth_err) = detect_login_page(url, &response) {
                return Err(auth_err);
            }
            return Ok(response);
        }

        Err(FetchError::redirect(
            url,
            format!("more than {MAX_REDIRECTS} redirects"),
        ))
    }

    /// One transport attempt: request, stream to the part file, verify, rename.
    async fn fetch_once(
        &self,
        link: &DownloadLink,
        dest_dir: &Path,
    ) -> Result<u64, FetchError> {
        let url = link.url();
        let final_path = dest_dir.join(filename_for_url(url));
        let part = part_path(&final_path);

        let response = self.send(url).await?;
        let content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|e| FetchError::io(dest_dir, e))?;

        let stream_result = stream_to_file(response, url, &part).await;
        let bytes = match stream_result {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(path = %part.display(), "cleaning up partial file after error");
                let _ = tokio::fs::remove_file(&part).await;
                return Err(e);
            }
        };

        if let Some(expected) = link.expected_size_bytes().or(content_length)
            && expected != bytes
        {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(FetchError::size_mismatch(&final_path, expected, bytes));
        }

        tokio::fs::rename(&part, &final_path)
            .await
            .map_err(|e| FetchError::io(&final_path, e))?;
        Ok(bytes)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[instrument(skip(self, link, dest_dir), fields(url = %link.url()))]
    async fn fetch(&self, link: &DownloadLink, dest_dir: &Path) -> Result<FetchResult, FetchError> {
        let started = Instant::now();
        let mut attempt = 1;

        loop {
            match self.fetch_once(link, dest_dir).await {
                Ok(bytes) => {
                    let duration_ms =
                        u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                    let path = dest_dir.join(filename_for_url(link.url()));
                    info!(path = %path.display(), bytes, duration_ms, attempt, "download complete");
                    return Ok(FetchResult {
                        path,
                        bytes,
                        duration_ms,
                    });
                }
                Err(error) => match self.retry_policy.should_retry(classify_error(&error), attempt)
                {
                    RetryDecision::Retry {
                        delay,
                        attempt: next,
                    } => {
                        let delay = error
                            .retry_after()
                            .and_then(parse_retry_after)
                            .map_or(delay, |server| server.max(delay));
                        warn!(
                            error = %error,
                            attempt,
                            delay_ms = delay.as_millis(),
                            "transient failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt = next;
                    }
                    RetryDecision::DoNotRetry { reason } => {
                        debug!(error = %error, attempt, reason = %reason, "giving up on link");
                        return Err(error);
                    }
                },
            }
        }
    }
}

/// Streams the response body to `path`, returning bytes written.
async fn stream_to_file(
    response: reqwest::Response,
    url: &str,
    path: &Path,
) -> Result<u64, FetchError> {
    let file = File::create(path)
        .await
        .map_err(|e| FetchError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| {
            if e.is_timeout() {
                FetchError::timeout(url)
            } else {
                FetchError::network(url, e)
            }
        })?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| FetchError::io(path, e))?;
        bytes_written += chunk.len() as u64;
    }

    writer.flush().await.map_err(|e| FetchError::io(path, e))?;
    Ok(bytes_written)
}

/// Detects a login page served with 200 in place of the requested object.
fn detect_login_page(original_url: &str, response: &reqwest::Response) -> Option<FetchError> {
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type.to_ascii_lowercase().contains("text/html") {
        return None;
    }

    let response_url = response.url().as_str().to_lowercase();
    let original = original_url.to_lowercase();
    let login_pattern = LOGIN_PATTERNS
        .iter()
        .find(|pattern| response_url.contains(*pattern) && !original.contains(*pattern))?;

    let domain = response.url().host_str().unwrap_or("unknown").to_string();
    debug!(
        url = %original_url,
        response_url = %response_url,
        pattern = %login_pattern,
        "login page detected"
    );
    Some(FetchError::auth_required(original_url, 0, domain))
}
