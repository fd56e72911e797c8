//! Cache entry envelope and read results.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A cached lookup result. `Absent` records a confirmed "not found".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CachedValue<T> {
    Present(T),
    Absent,
}

impl<T> CachedValue<T> {
    pub fn from_option(value: Option<T>) -> Self {
        match value {
            Some(v) => Self::Present(v),
            None => Self::Absent,
        }
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Present(v) => Some(v),
            Self::Absent => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }
}

/// What is stored under a versioned key in either tier.
///
/// The entry repeats the version stamp of its key so a read can verify
/// `versionAtStore == currentVersion` independently of key construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub stored_at_ms: i64,
    pub ttl_ms: u64,
    pub version: String,
    pub value: CachedValue<T>,
}

impl<T> CacheEntry<T> {
    pub fn new(value: CachedValue<T>, version: &str, stored_at_ms: i64, ttl: Duration) -> Self {
        Self {
            stored_at_ms,
            ttl_ms: ttl.as_millis() as u64,
            version: version.to_string(),
            value,
        }
    }

    pub fn age_ms(&self, now_ms: i64) -> i64 {
        (now_ms - self.stored_at_ms).max(0)
    }

    /// Valid iff younger than its TTL and stored under the current version.
    pub fn is_valid(&self, now_ms: i64, current_version: &str) -> bool {
        (self.age_ms(now_ms) as u64) < self.ttl_ms && self.version == current_version
    }

    pub fn expires_at_ms(&self) -> i64 {
        self.stored_at_ms + self.ttl_ms as i64
    }
}

/// Which tier served a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    /// Process-local map.
    Local,
    /// Shared cache service.
    Shared,
    /// Neither; the value came from the fetch function.
    Origin,
}

/// Result of a cache read, with where it came from and how old it is.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRead<T> {
    value: CachedValue<T>,
    tier: CacheTier,
    age: Duration,
}

impl<T> CacheRead<T> {
    pub fn new(value: CachedValue<T>, tier: CacheTier, age: Duration) -> Self {
        Self { value, tier, age }
    }

    pub fn from_origin(value: Option<T>) -> Self {
        Self::new(CachedValue::from_option(value), CacheTier::Origin, Duration::ZERO)
    }

    pub fn tier(&self) -> CacheTier {
        self.tier
    }

    pub fn age(&self) -> Duration {
        self.age
    }

    pub fn was_cache_hit(&self) -> bool {
        self.tier != CacheTier::Origin
    }

    pub fn value(&self) -> &CachedValue<T> {
        &self.value
    }

    pub fn into_option(self) -> Option<T> {
        self.value.into_option()
    }
}
