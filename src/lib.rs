//! Granule Downloader Core Library
//!
//! Resolves a remote Earthdata collection into granule assets and downloads
//! them under bounded concurrency, keeping an on-disk record that survives
//! interruption at any point.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`catalog`] - Raw UMM-JSON granule records to a payload snapshot
//! - [`store`] - Payload snapshot model, atomic persistence, failure record
//! - [`download`] - HTTP fetcher with streaming writes, retries and the worker pool
//! - [`ledger`] - Append-only attempt history
//! - [`orchestrator`] - Snapshot resolution, runs, retry, stats and verify
//! - [`auth`] - Netrc and token credentials
//! - [`query`] - CMR granule search and the raw-record cache

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod catalog;
pub mod download;
pub mod ledger;
pub mod orchestrator;
pub mod query;
pub mod store;

// Re-export commonly used types
pub use auth::{AuthError, Authenticator, Credentials, NetrcAuthenticator, StaticAuthenticator};
pub use catalog::{CatalogError, CollectionKey, DownloadLink, LinkRole, TemporalRange};
pub use download::{
    AssetOutcome, DEFAULT_CONCURRENCY, FetchError, FetchErrorKind, FetchResult, Fetcher,
    HttpFetcher, RetryPolicy, WorkerPool,
};
pub use ledger::{LedgerEntry, LedgerError, LedgerSummary};
pub use orchestrator::{
    DEFAULT_CHECKPOINT_EVERY, DownloadReport, HttpFetcherFactory, Orchestrator,
    OrchestratorError, Settings, StatsReport, VerifyReport,
};
pub use query::{CatalogQuery, CmrQuery, QueryError, RecordsFileQuery};
pub use store::{Asset, AssetStatus, PayloadSnapshot, StatePaths, StoreError};
