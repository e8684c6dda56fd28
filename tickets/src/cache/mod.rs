//! Network cache client abstraction.
//!
//! The distributed registry and the trust storage talk to a remote key/value
//! cache through [`CacheClient`]. The trait captures exactly the primitives
//! they need:
//!
//! - Per-key versioned values with compare-and-swap (no cross-key transactions)
//! - Physical TTLs
//! - Prefix scans
//! - String sets, used as secondary indexes
//!
//! [`InMemoryCache`] is a simulated remote cache with fault injection, used
//! in tests and single-node deployments.

mod memory;

pub use memory::{FaultConfig, InMemoryCache};

use std::future::Future;
use std::time::Duration;

use crate::error::TicketError;

/// A versioned value read from the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Stored bytes.
    pub value: Vec<u8>,
    /// Version assigned by the cache at the last write of this key.
    pub version: u64,
}

/// Result of a compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The value was replaced; carries the new version.
    Swapped { version: u64 },
    /// The key exists but its version differs from the expected one.
    VersionMismatch,
    /// The key does not exist (never written, deleted, or evicted).
    Missing,
}

/// Errors reported by a cache client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// The cache could not be reached or refused the request.
    Unavailable(String),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(reason) => write!(f, "cache unavailable: {reason}"),
        }
    }
}

impl std::error::Error for CacheError {}

impl From<CacheError> for TicketError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Unavailable(reason) => Self::StorageUnavailable(reason),
        }
    }
}

/// Client for a remote key/value cache.
///
/// # Implementation Notes
///
/// Implementations must ensure:
/// - `compare_and_swap` is atomic per key
/// - A key whose TTL elapsed behaves as absent
/// - Every returned future is `Send`, so calls can run on any runtime worker
pub trait CacheClient: Send + Sync + 'static {
    /// Read a key.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<CacheEntry>, CacheError>> + Send;

    /// Write a key unconditionally, returning the new version.
    fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<u64, CacheError>> + Send;

    /// Write a key only if it does not exist.
    ///
    /// Returns the new version, or `None` if the key already existed.
    fn insert_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<Option<u64>, CacheError>> + Send;

    /// Replace a key only if its version equals `expected_version`.
    fn compare_and_swap(
        &self,
        key: &str,
        expected_version: u64,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<CasOutcome, CacheError>> + Send;

    /// Delete a key, returning whether it existed.
    fn delete(&self, key: &str) -> impl Future<Output = Result<bool, CacheError>> + Send;

    /// List live keys starting with `prefix`, in lexicographic order.
    fn scan_prefix(&self, prefix: &str) -> impl Future<Output = Result<Vec<String>, CacheError>> + Send;

    /// Add a member to the set stored at `key`.
    ///
    /// With a `ttl`, the set lives at least `ttl` from now; an existing
    /// later expiry is kept. Without one, the set no longer expires.
    fn set_add(
        &self,
        key: &str,
        member: &str,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<(), CacheError>> + Send;

    /// Remove a member from the set stored at `key`.
    fn set_remove(&self, key: &str, member: &str) -> impl Future<Output = Result<(), CacheError>> + Send;

    /// List the members of the set stored at `key`.
    fn set_members(&self, key: &str) -> impl Future<Output = Result<Vec<String>, CacheError>> + Send;
}

/// Run one cache call bounded by `timeout`.
///
/// A call that does not finish in time surfaces as
/// [`TicketError::StorageUnavailable`], never as stale data.
///
/// # Errors
///
/// Returns `StorageUnavailable` on timeout or when the cache reports an error.
pub(crate) async fn bounded<T>(
    operation: &str,
    timeout: Duration,
    call: impl Future<Output = Result<T, CacheError>>,
) -> Result<T, TicketError> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.map_err(TicketError::from),
        Err(_) => Err(TicketError::StorageUnavailable(format!(
            "{operation} timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}
