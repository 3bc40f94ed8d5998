//! Error types for the download module.
//!
//! [`FetchError`] carries the context of one failed link fetch (URL, path,
//! status). [`FetchErrorKind`] is the coarse classification persisted in
//! the snapshot, the ledger and the failure record.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Persisted classification of a fetch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    /// Credentials missing, rejected, or redirected to a login page. Fatal for a run.
    Auth,
    /// The remote object does not exist (404/410).
    NotFound,
    /// The request timed out.
    Timeout,
    /// Connection failures and unexpected HTTP statuses.
    Network,
    /// Bytes on disk differ from the advertised size.
    SizeMismatch,
    /// Local filesystem failure.
    Io,
}

impl FetchErrorKind {
    /// Returns the stable string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::NotFound => "not_found",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::SizeMismatch => "size_mismatch",
            Self::Io => "io",
        }
    }

    /// Whether a failure of this kind must stop the whole run.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth)
    }
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for FetchErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auth" => Ok(Self::Auth),
            "not_found" => Ok(Self::NotFound),
            "timeout" => Ok(Self::Timeout),
            "network" => Ok(Self::Network),
            "size_mismatch" => Ok(Self::SizeMismatch),
            "io" => Ok(Self::Io),
            _ => Err(format!("invalid fetch error kind: {s}")),
        }
    }
}

/// Errors that can occur while fetching one link.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response other than the authentication statuses.
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The Retry-After header value, if present.
        retry_after: Option<String>,
    },

    /// Authentication or authorization required to access the resource.
    #[error(
        "[AUTH] authentication required for {domain} (HTTP {status}) downloading {url}\n  Suggestion: {suggestion}"
    )]
    AuthRequired {
        /// The URL that requires authentication.
        url: String,
        /// The HTTP status code (401, 403, 407, or 0 for login redirect).
        status: u16,
        /// The domain requiring authentication.
        domain: String,
        /// User-facing suggestion for resolving the auth issue.
        suggestion: &'static str,
    },

    /// Redirect chain exceeded the hop limit or had no usable Location.
    #[error("redirect error downloading {url}: {reason}")]
    Redirect {
        /// The URL that started the chain.
        url: String,
        /// What went wrong.
        reason: String,
    },

    /// Downloaded byte count does not match the advertised size.
    #[error("size mismatch for {path}: expected {expected_bytes} bytes, got {actual_bytes}")]
    SizeMismatch {
        /// Download path that failed verification.
        path: PathBuf,
        /// Expected size in bytes.
        expected_bytes: u64,
        /// Actual size in bytes.
        actual_bytes: u64,
    },

    /// File system error during download (create dir, write, rename).
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The URL is malformed.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },
}

impl FetchError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error with a Retry-After header value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates an authentication-required error.
    ///
    /// 407 suggests proxy configuration; every other status suggests
    /// checking the Earthdata Login credentials.
    pub fn auth_required(url: impl Into<String>, status: u16, domain: impl Into<String>) -> Self {
        let suggestion = if status == 407 {
            "Configure your HTTP proxy settings or check proxy credentials."
        } else {
            "Check the urs.earthdata.nasa.gov entry in your .netrc or set EARTHDATA_TOKEN."
        };
        Self::AuthRequired {
            url: url.into(),
            status,
            domain: domain.into(),
            suggestion,
        }
    }

    /// Creates a redirect error.
    pub fn redirect(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Redirect {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates a size mismatch error.
    pub fn size_mismatch(path: impl Into<PathBuf>, expected_bytes: u64, actual_bytes: u64) -> Self {
        Self::SizeMismatch {
            path: path.into(),
            expected_bytes,
            actual_bytes,
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Persisted classification of this error.
    #[must_use]
    pub fn kind(&self) -> FetchErrorKind {
        match self {
            Self::AuthRequired { .. } => FetchErrorKind::Auth,
            Self::HttpStatus { status: 404 | 410, .. } | Self::InvalidUrl { .. } => {
                FetchErrorKind::NotFound
            }
            Self::HttpStatus { status: 408, .. } | Self::Timeout { .. } => FetchErrorKind::Timeout,
            Self::Network { source, .. } if source.is_timeout() => FetchErrorKind::Timeout,
            Self::Network { .. } | Self::HttpStatus { .. } | Self::Redirect { .. } => {
                FetchErrorKind::Network
            }
            Self::SizeMismatch { .. } => FetchErrorKind::SizeMismatch,
            Self::Io { .. } => FetchErrorKind::Io,
        }
    }

    /// Retry-After header value carried by an HTTP status error.
    #[must_use]
    pub fn retry_after(&self) -> Option<&str> {
        match self {
            Self::HttpStatus { retry_after, .. } => retry_after.as_deref(),
            _ => None,
        }
    }
}
