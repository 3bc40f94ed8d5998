//! Config file loading and merging with CLI flags.
//!
//! Precedence: CLI flag, then config file, then built-in default.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use granule_core::download::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
use granule_core::download::{DEFAULT_MAX_RETRIES, RetryPolicy};
use granule_core::{DEFAULT_CHECKPOINT_EVERY, DEFAULT_CONCURRENCY, Settings};
use serde::Deserialize;

use crate::cli::Args;

/// Default granule cap for a collection query.
pub const DEFAULT_LIMIT: usize = 2000;

const CONFIG_DIR_NAME: &str = "granule-downloader";

/// TOML-backed defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// Directory for downloaded files.
    pub download_dir: Option<PathBuf>,
    /// Directory for snapshots and run state.
    pub cache_dir: Option<PathBuf>,
    /// Concurrent asset downloads (1..=100).
    pub concurrency: Option<usize>,
    /// Completed assets between checkpoints (>= 1).
    pub checkpoint_every: Option<usize>,
    /// Granule cap for queries.
    pub limit: Option<usize>,
    /// Download connect timeout in seconds (1..=3600).
    pub connect_timeout_secs: Option<u64>,
    /// Download read timeout in seconds (1..=3600).
    pub read_timeout_secs: Option<u64>,
    /// Transport attempts per link (1..=10).
    pub max_transport_retries: Option<u32>,
    /// Netrc file with Earthdata credentials.
    pub netrc_file: Option<PathBuf>,
    /// Draw the progress bar.
    pub progress: Option<bool>,
}

impl FileConfig {
    /// Parses and validates TOML.
    pub fn parse(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates config values against runtime constraints.
    pub fn validate(&self) -> Result<()> {
        if let Some(concurrency) = self.concurrency
            && !(1..=100).contains(&concurrency)
        {
            bail!("Invalid config value for `concurrency`: {concurrency}. Expected range: 1..=100");
        }
        if self.checkpoint_every == Some(0) {
            bail!("Invalid config value for `checkpoint_every`: 0. Expected at least 1");
        }
        if let Some(retries) = self.max_transport_retries
            && !(1..=10).contains(&retries)
        {
            bail!(
                "Invalid config value for `max_transport_retries`: {retries}. Expected range: 1..=10"
            );
        }
        validate_timeout_secs("connect_timeout_secs", self.connect_timeout_secs)?;
        validate_timeout_secs("read_timeout_secs", self.read_timeout_secs)?;
        Ok(())
    }
}

fn validate_timeout_secs(field: &str, value: Option<u64>) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(1..=3600).contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: 1..=3600");
    }
    Ok(())
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/granule-downloader/config.toml`
/// 2. `$HOME/.config/granule-downloader/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config_home).join(CONFIG_DIR_NAME).join("config.toml"));
    }
    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join(CONFIG_DIR_NAME)
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads the config at the default path when it exists.
pub fn load_default_file_config() -> Result<Option<FileConfig>> {
    match resolve_default_config_path() {
        Some(path) if path.exists() => load_file_config(&path).map(Some),
        _ => Ok(None),
    }
}

/// Loads and validates the config at `path`.
pub fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    FileConfig::parse(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

/// Everything the binary needs after merging flags and file.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Orchestrator settings.
    pub settings: Settings,
    /// Granule cap; `None` when unlimited.
    pub limit: Option<usize>,
    /// Download connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Download read timeout in seconds.
    pub read_timeout_secs: u64,
    /// Transport retry policy.
    pub retry_policy: RetryPolicy,
    /// Explicit netrc path.
    pub netrc_file: Option<PathBuf>,
}

/// Merges CLI flags over file values over defaults.
pub fn resolve(args: &Args, file: Option<&FileConfig>) -> ResolvedConfig {
    let file = file.cloned().unwrap_or_default();

    let limit = args.limit.or(file.limit).unwrap_or(DEFAULT_LIMIT);
    let max_retries = args
        .max_retries
        .or(file.max_transport_retries)
        .unwrap_or(DEFAULT_MAX_RETRIES);
    let show_progress = !args.no_progress && !args.quiet && file.progress.unwrap_or(true);

    ResolvedConfig {
        settings: Settings {
            download_dir: args
                .download_dir
                .clone()
                .or(file.download_dir)
                .unwrap_or_else(|| PathBuf::from("./data")),
            cache_dir: args
                .cache_dir
                .clone()
                .or(file.cache_dir)
                .unwrap_or_else(|| PathBuf::from("./cache")),
            concurrency: args
                .concurrency
                .map(usize::from)
                .or(file.concurrency)
                .unwrap_or(DEFAULT_CONCURRENCY),
            checkpoint_every: args
                .checkpoint_every
                .map(|n| n as usize)
                .or(file.checkpoint_every)
                .unwrap_or(DEFAULT_CHECKPOINT_EVERY),
            refresh: args.refresh,
            show_progress,
        },
        limit: (limit > 0).then_some(limit),
        connect_timeout_secs: file.connect_timeout_secs.unwrap_or(CONNECT_TIMEOUT_SECS),
        read_timeout_secs: file.read_timeout_secs.unwrap_or(READ_TIMEOUT_SECS),
        retry_policy: RetryPolicy::with_max_attempts(max_retries),
        netrc_file: args.netrc_file.clone().or(file.netrc_file),
    }
}
