//! Constants for the download module (timeouts, retry caps, pool bounds).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes): the longest a response may stall
/// between two reads. A transfer as a whole is never capped.
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Maximum Retry-After header value (1 hour) to prevent excessive delays.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Maximum redirect hops followed per request (the login round trip takes two).
pub const MAX_REDIRECTS: usize = 10;

/// Minimum allowed concurrency value.
pub const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency value.
pub const MAX_CONCURRENCY: usize = 100;

/// Default number of assets fetched in parallel.
pub const DEFAULT_CONCURRENCY: usize = 4;
