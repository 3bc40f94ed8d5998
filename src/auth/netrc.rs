//! `.netrc` parser and the Earthdata Login authenticator built on it.
//!
//! The file is a stream of whitespace-separated tokens: `machine <host>`
//! starts an entry, `default` starts the catch-all entry, and `login`,
//! `password` and `account` fill the current one. `macdef` bodies run to
//! the next blank line and are skipped.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::{AuthError, Authenticator, Credentials};

/// Identity provider host looked up in the netrc file.
pub const EARTHDATA_MACHINE: &str = "urs.earthdata.nasa.gov";

/// Environment variable holding an Earthdata bearer token.
pub const TOKEN_ENV_VAR: &str = "EARTHDATA_TOKEN";

/// One `machine` (or `default`) entry.
#[derive(Clone, PartialEq, Eq)]
pub struct NetrcEntry {
    /// Host name, `None` for the `default` entry.
    pub machine: Option<String>,
    /// Login name.
    pub login: Option<String>,
    password: Option<String>,
}

impl NetrcEntry {
    /// Password for the entry (sensitive, never log).
    #[must_use]
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }
}

impl fmt::Debug for NetrcEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetrcEntry")
            .field("machine", &self.machine)
            .field("login", &self.login)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Parses netrc content into entries, in file order.
///
/// # Errors
///
/// Returns [`AuthError::MalformedNetrc`] when a keyword is missing its value
/// or a field appears before any `machine`/`default` keyword.
pub fn parse_netrc(content: &str, path: &Path) -> Result<Vec<NetrcEntry>, AuthError> {
    let mut entries: Vec<NetrcEntry> = Vec::new();
    let mut lines = content.lines();

    while let Some(line) = lines.next() {
        let mut tokens = line.split_whitespace();
        while let Some(token) = tokens.next() {
            if token.starts_with('#') {
                break;
            }
            let mut value = |keyword: &str| {
                tokens.next().map(str::to_string).ok_or_else(|| {
                    AuthError::malformed(path, format!("'{keyword}' has no value"))
                })
            };
            match token {
                "machine" => {
                    let machine = value("machine")?;
                    entries.push(NetrcEntry {
                        machine: Some(machine),
                        login: None,
                        password: None,
                    });
                }
                "default" => entries.push(NetrcEntry {
                    machine: None,
                    login: None,
                    password: None,
                }),
                "login" | "password" | "account" => {
                    let field = value(token)?;
                    let entry = entries.last_mut().ok_or_else(|| {
                        AuthError::malformed(path, format!("'{token}' before any machine entry"))
                    })?;
                    match token {
                        "login" => entry.login = Some(field),
                        "password" => entry.password = Some(field),
                        _ => {}
                    }
                }
                "macdef" => {
                    for body in lines.by_ref() {
                        if body.trim().is_empty() {
                            break;
                        }
                    }
                    break;
                }
                other => {
                    debug!(token = %other, "ignoring unknown netrc token");
                }
            }
        }
    }

    Ok(entries)
}

/// Finds the entry for `machine`, falling back to the `default` entry.
#[must_use]
pub fn find_entry<'a>(entries: &'a [NetrcEntry], machine: &str) -> Option<&'a NetrcEntry> {
    entries
        .iter()
        .find(|entry| entry.machine.as_deref() == Some(machine))
        .or_else(|| entries.iter().find(|entry| entry.machine.is_none()))
}

/// Resolves Earthdata credentials from a bearer token or a netrc file.
///
/// A non-empty token takes precedence. Otherwise the netrc entry for the
/// configured machine supplies basic credentials, which are only ever sent
/// to that machine.
#[derive(Clone)]
pub struct NetrcAuthenticator {
    path: PathBuf,
    machine: String,
    token: Option<String>,
}

impl fmt::Debug for NetrcAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetrcAuthenticator")
            .field("path", &self.path)
            .field("machine", &self.machine)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl NetrcAuthenticator {
    /// Creates an authenticator reading `path` for [`EARTHDATA_MACHINE`].
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            machine: EARTHDATA_MACHINE.to_string(),
            token: None,
        }
    }

    /// Uses `$HOME/.netrc`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::NoHomeDirectory`] when `HOME` is unset.
    pub fn from_home() -> Result<Self, AuthError> {
        let home = std::env::var_os("HOME").ok_or(AuthError::NoHomeDirectory)?;
        Ok(Self::new(PathBuf::from(home).join(".netrc")))
    }

    /// Overrides the machine name looked up in the file.
    #[must_use]
    pub fn with_machine(mut self, machine: impl Into<String>) -> Self {
        self.machine = machine.into();
        self
    }

    /// Sets a bearer token that takes precedence over the netrc file.
    #[must_use]
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.trim().is_empty());
        self
    }

    /// Path of the netrc file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Authenticator for NetrcAuthenticator {
    #[instrument(skip(self), fields(machine = %self.machine))]
    async fn authenticate(&self) -> Result<Credentials, AuthError> {
        if let Some(token) = &self.token {
            info!("using bearer token from environment");
            return Ok(Credentials::bearer(token.clone()));
        }

        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AuthError::NetrcNotFound {
                    path: self.path.clone(),
                });
            }
            Err(e) => return Err(AuthError::io(&self.path, e)),
        };
        warn_on_loose_permissions(&self.path).await;

        let entries = parse_netrc(&content, &self.path)?;
        let entry =
            find_entry(&entries, &self.machine).ok_or_else(|| AuthError::MissingMachine {
                machine: self.machine.clone(),
                path: self.path.clone(),
            })?;
        let (Some(login), Some(password)) = (entry.login.as_ref(), entry.password()) else {
            return Err(AuthError::malformed(
                &self.path,
                format!("entry for {} needs both login and password", self.machine),
            ));
        };

        info!(login = %login, path = %self.path.display(), "loaded netrc credentials");
        Ok(Credentials::basic(&self.machine, login, password))
    }
}

#[cfg(unix)]
async fn warn_on_loose_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(metadata) = tokio::fs::metadata(path).await {
        let mode = metadata.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            warn!(
                path = %path.display(),
                mode = format!("{mode:o}"),
                "netrc file is readable by other users; run `chmod 600` on it"
            );
        }
    }
}

#[cfg(not(unix))]
async fn warn_on_loose_permissions(_path: &Path) {}
