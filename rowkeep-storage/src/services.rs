//! Substrate traits.
//!
//! Everything the access layer needs from the outside world goes through
//! one of four seams: the remote table, the shared cache, the distributed
//! lock service, and the small synchronous property store. Each has an
//! in-memory implementation in [`crate::memory`]; LMDB and HTTP
//! implementations live in [`crate::lmdb`] and [`crate::http_table`].

use async_trait::async_trait;
use rowkeep_core::{A1Range, CacheError, LockError, DEFAULT_MAX_ENTRY_BYTES};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// REMOTE TABLE
// ============================================================================

/// HTTP status used for transport failures that never reached the server.
pub const TRANSPORT_FAILURE: u16 = 0;
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;
pub const STATUS_FORBIDDEN: u16 = 403;

/// Non-success outcome of a table call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStatus {
    pub code: u16,
    pub message: String,
}

impl RemoteStatus {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn rate_limited() -> Self {
        Self::new(STATUS_TOO_MANY_REQUESTS, "Quota exceeded: rateLimitExceeded")
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(TRANSPORT_FAILURE, message)
    }

    /// 429, or a 403 whose body names a rate-limit reason.
    pub fn is_rate_limited(&self) -> bool {
        match self.code {
            STATUS_TOO_MANY_REQUESTS => true,
            STATUS_FORBIDDEN => {
                self.message.contains("rateLimitExceeded")
                    || self.message.contains("userRateLimitExceeded")
            }
            _ => false,
        }
    }
}

impl fmt::Display for RemoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

/// Cells of one range, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueRange {
    pub range: A1Range,
    pub values: Vec<Vec<Value>>,
}

impl ValueRange {
    pub fn new(range: A1Range, values: Vec<Vec<Value>>) -> Self {
        Self { range, values }
    }
}

/// Result of an append; `updated_range` is the A1 range actually written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendResult {
    pub updated_range: String,
    pub updated_rows: u32,
}

/// The remote tabular API.
#[async_trait]
pub trait TableApi: Send + Sync {
    /// Read one range. Trailing empty rows may be omitted.
    async fn get(&self, range: &A1Range) -> Result<ValueRange, RemoteStatus>;

    /// Read several ranges in one call; results are in request order.
    async fn batch_get(&self, ranges: &[A1Range]) -> Result<Vec<ValueRange>, RemoteStatus>;

    /// Append rows after the last non-empty row of the table at `range`.
    async fn append(
        &self,
        range: &A1Range,
        rows: &[Vec<Value>],
    ) -> Result<AppendResult, RemoteStatus>;

    /// Overwrite several ranges in one call. Returns the number of cells written.
    async fn batch_update(&self, updates: &[ValueRange]) -> Result<u32, RemoteStatus>;
}

// ============================================================================
// SHARED CACHE
// ============================================================================

/// Distributed cache service. There is no prefix or wildcard delete.
#[async_trait]
pub trait CacheService: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    async fn remove(&self, key: &str) -> Result<(), CacheError>;

    /// Largest value the backend accepts.
    fn max_entry_bytes(&self) -> usize {
        DEFAULT_MAX_ENTRY_BYTES
    }
}

// ============================================================================
// DISTRIBUTED LOCKS
// ============================================================================

/// Distributed mutex service.
///
/// `holder` identifies the acquirer so a late release from a previous
/// holder cannot free a lease someone else now owns.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Wait up to `wait` for the lock. The lease expires after `lease`
    /// even if never released.
    async fn try_acquire(
        &self,
        name: &str,
        holder: Uuid,
        wait: Duration,
        lease: Duration,
    ) -> Result<bool, LockError>;

    async fn release(&self, name: &str, holder: Uuid) -> Result<(), LockError>;
}

// ============================================================================
// PROPERTY STORE
// ============================================================================

/// Small synchronous key-value store for breaker state and cache versions.
pub trait PropertyStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Last writer wins. `ttl = None` keeps the value until deleted.
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;

    fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Atomically add one to an integer property (missing reads as 0) and
    /// return the new value. An existing expiry is kept.
    fn increment(&self, key: &str) -> Result<u64, CacheError> {
        self.increment_with_ttl(key, None)
    }

    /// Like [`increment`](Self::increment), but `ttl = Some(_)` also resets
    /// the expiry to `now + ttl` in the same atomic step.
    fn increment_with_ttl(&self, key: &str, ttl: Option<Duration>) -> Result<u64, CacheError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_detection() {
        assert!(RemoteStatus::rate_limited().is_rate_limited());
        assert!(RemoteStatus::new(403, "reason: userRateLimitExceeded").is_rate_limited());
        assert!(!RemoteStatus::new(403, "The caller does not have permission").is_rate_limited());
        assert!(!RemoteStatus::new(500, "rateLimitExceeded").is_rate_limited());
        assert!(!RemoteStatus::transport("connection reset").is_rate_limited());
    }
}
