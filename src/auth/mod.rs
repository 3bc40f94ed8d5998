//! Credentials for the identity provider guarding the data hosts.
//!
//! The orchestrator authenticates once per run through an
//! [`Authenticator`] and hands the resulting [`Credentials`] to the HTTP
//! fetcher, which attaches them to each request they apply to.

mod netrc;

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::RequestBuilder;
use thiserror::Error;

pub use netrc::{
    EARTHDATA_MACHINE, NetrcAuthenticator, NetrcEntry, TOKEN_ENV_VAR, find_entry, parse_netrc,
};

/// Credentials attached to outgoing requests.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// HTTP basic credentials, sent only to `host`.
    Basic {
        /// The identity provider host.
        host: String,
        /// Login name.
        username: String,
        /// Password (sensitive).
        password: String,
    },
    /// Bearer token, sent to every host.
    Bearer {
        /// The token (sensitive).
        token: String,
    },
}

impl Credentials {
    /// Creates basic credentials scoped to `host`.
    #[must_use]
    pub fn basic(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self::Basic {
            host: host.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    /// Creates a bearer token credential.
    #[must_use]
    pub fn bearer(token: impl Into<String>) -> Self {
        Self::Bearer {
            token: token.into(),
        }
    }

    /// Whether these credentials should be sent to `host`.
    #[must_use]
    pub fn applies_to(&self, host: Option<&str>) -> bool {
        match self {
            Self::Basic { host: scope, .. } => {
                host.is_some_and(|h| h.eq_ignore_ascii_case(scope))
            }
            Self::Bearer { .. } => true,
        }
    }

    /// Adds the authorization header when the credentials apply to `host`.
    #[must_use]
    pub fn authorize(&self, request: RequestBuilder, host: Option<&str>) -> RequestBuilder {
        if !self.applies_to(host) {
            return request;
        }
        match self {
            Self::Basic {
                username, password, ..
            } => request.basic_auth(username, Some(password)),
            Self::Bearer { token } => request.bearer_auth(token),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic { host, username, .. } => f
                .debug_struct("Basic")
                .field("host", host)
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
            Self::Bearer { .. } => f
                .debug_struct("Bearer")
                .field("token", &"[REDACTED]")
                .finish(),
        }
    }
}

/// Errors raised while obtaining credentials. All of them are fatal for a run.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The netrc file does not exist.
    #[error("netrc file not found at {path}; create it or set EARTHDATA_TOKEN")]
    NetrcNotFound {
        /// Expected location.
        path: PathBuf,
    },

    /// The netrc file has no entry for the identity provider.
    #[error("no entry for machine {machine} in {path}")]
    MissingMachine {
        /// Machine that was looked up.
        machine: String,
        /// The netrc file.
        path: PathBuf,
    },

    /// The netrc file could not be parsed.
    #[error("malformed netrc file {path}: {reason}")]
    MalformedNetrc {
        /// The netrc file.
        path: PathBuf,
        /// What was wrong.
        reason: String,
    },

    /// The netrc file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// The netrc file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// `HOME` is not set, so the default netrc location is unknown.
    #[error("cannot locate ~/.netrc: HOME is not set")]
    NoHomeDirectory,

    /// The identity provider rejected the credentials.
    #[error("credentials rejected: {reason}")]
    Rejected {
        /// Detail from the provider or the fetch that failed.
        reason: String,
    },
}

impl AuthError {
    /// Creates a malformed-netrc error.
    pub fn malformed(path: &Path, reason: impl Into<String>) -> Self {
        Self::MalformedNetrc {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    /// Creates an IO error.
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Source of credentials for one run.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Obtains credentials.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] when no usable credentials exist.
    async fn authenticate(&self) -> Result<Credentials, AuthError>;
}

/// Authenticator that always yields the same credentials (or none).
#[derive(Debug, Clone, Default)]
pub struct StaticAuthenticator {
    credentials: Option<Credentials>,
}

impl StaticAuthenticator {
    /// Creates an authenticator yielding `credentials`.
    #[must_use]
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials: Some(credentials),
        }
    }

    /// Creates an authenticator that always fails with [`AuthError::Rejected`].
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self) -> Result<Credentials, AuthError> {
        self.credentials.clone().ok_or_else(|| AuthError::Rejected {
            reason: "no credentials configured".to_string(),
        })
    }
}
