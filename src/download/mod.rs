//! Fetching asset links from the network onto local disk.
//!
//! # Features
//!
//! - [`Fetcher`] seam with the streaming [`HttpFetcher`] implementation
//! - Part-file writes renamed into place only after size verification
//! - Transport retries with exponential backoff honoring Retry-After
//! - [`WorkerPool`] running assets under bounded concurrency
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use granule_core::catalog::{DownloadLink, LinkRole};
//! use granule_core::download::{Fetcher, HttpFetcher};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let fetcher = HttpFetcher::new()?;
//! let link = DownloadLink::new("https://example.com/granule.h5", LinkRole::PrimaryData);
//! let result = fetcher.fetch(&link, Path::new("./data/G1")).await?;
//! println!("Downloaded: {}", result.path.display());
//! # Ok(())
//! # }
//! ```

mod client;
pub mod constants;
mod error;
mod fetcher;
pub mod filename;
pub mod pool;
mod retry;

pub use client::{HttpFetcher, USER_AGENT};
pub use constants::DEFAULT_CONCURRENCY;
pub use error::{FetchError, FetchErrorKind};
pub use fetcher::{AssetOutcome, FetchResult, Fetcher, LinkFetch, asset_dir, fetch_asset};
pub use pool::{PoolError, PoolObserver, RunSummary, WorkerPool};
pub use retry::{
    DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error,
    parse_retry_after,
};
