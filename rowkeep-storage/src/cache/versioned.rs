//! Two-tier cache with versioned invalidation.

use super::entry::{CacheEntry, CacheRead, CacheTier, CachedValue};
use super::key::{LogicalKey, Namespace, VersionedKey};
use super::local::LocalCache;
use crate::services::{CacheService, PropertyStore};
use rowkeep_core::{CacheError, Clock, RowkeepResult};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub local_hits: u64,
    pub shared_hits: u64,
    /// Hits (either tier) on a cached "not found".
    pub negative_hits: u64,
    pub misses: u64,
    /// Shared-tier writes skipped for exceeding the entry limit.
    pub oversized_skips: u64,
    /// Cache or property store failures that were absorbed.
    pub errors: u64,
    pub bumps: u64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.local_hits + self.shared_hits
    }
}

#[derive(Debug, Default)]
struct Counters {
    local_hits: AtomicU64,
    shared_hits: AtomicU64,
    negative_hits: AtomicU64,
    misses: AtomicU64,
    oversized_skips: AtomicU64,
    errors: AtomicU64,
    bumps: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            local_hits: self.local_hits.load(Ordering::Relaxed),
            shared_hits: self.shared_hits.load(Ordering::Relaxed),
            negative_hits: self.negative_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            oversized_skips: self.oversized_skips.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            bumps: self.bumps.load(Ordering::Relaxed),
        }
    }
}

/// Process-local tier in front of a shared cache service, keyed by
/// [`LogicalKey`] plus the current namespace versions.
///
/// Cache and property store failures are logged and absorbed; a read
/// that cannot use the cache falls through to the fetch function.
pub struct VersionedCache {
    local: LocalCache,
    shared: Arc<dyn CacheService>,
    properties: Arc<dyn PropertyStore>,
    clock: Arc<dyn Clock>,
    negative_ttl: Duration,
    counters: Counters,
}

impl std::fmt::Debug for VersionedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionedCache")
            .field("local_entries", &self.local.len())
            .field("negative_ttl", &self.negative_ttl)
            .field("stats", &self.counters.snapshot())
            .finish()
    }
}

impl VersionedCache {
    pub fn new(
        shared: Arc<dyn CacheService>,
        properties: Arc<dyn PropertyStore>,
        clock: Arc<dyn Clock>,
        negative_ttl: Duration,
    ) -> Self {
        Self {
            local: LocalCache::default(),
            shared,
            properties,
            clock,
            negative_ttl,
            counters: Counters::default(),
        }
    }

    pub fn with_local_capacity(mut self, capacity: usize) -> Self {
        self.local = LocalCache::with_capacity(capacity);
        self
    }

    pub fn negative_ttl(&self) -> Duration {
        self.negative_ttl
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }

    /// Drop every process-local entry.
    pub fn clear_local(&self) {
        self.local.clear();
    }

    // ------------------------------------------------------------------------
    // Versions
    // ------------------------------------------------------------------------

    /// Current version of a namespace; never-bumped namespaces are at 0.
    pub fn version(&self, namespace: &Namespace) -> Result<u64, CacheError> {
        match self.properties.get(&namespace.version_key())? {
            None => Ok(0),
            Some(raw) => raw.parse().map_err(|e| CacheError::Property {
                reason: format!("version of {} is not a number: {}", namespace, e),
            }),
        }
    }

    /// Invalidate every key embedding this namespace.
    pub fn bump(&self, namespace: &Namespace) -> Result<u64, CacheError> {
        let version = self.properties.increment(&namespace.version_key())?;
        Counters::bump(&self.counters.bumps);
        tracing::debug!(namespace = %namespace, version, "Cache namespace bumped");
        Ok(version)
    }

    /// Bump, logging instead of failing.
    pub fn bump_or_log(&self, namespace: &Namespace) -> bool {
        match self.bump(namespace) {
            Ok(_) => true,
            Err(e) => {
                Counters::bump(&self.counters.errors);
                tracing::error!(namespace = %namespace, error = %e, "Failed to bump cache namespace");
                false
            }
        }
    }

    /// Concrete key under the current versions.
    pub fn resolve(&self, key: &LogicalKey) -> Result<VersionedKey, CacheError> {
        let [outer, inner] = key.namespaces();
        Ok(key.versioned([self.version(&outer)?, self.version(&inner)?]))
    }

    fn resolve_or_log(&self, key: &LogicalKey) -> Option<VersionedKey> {
        match self.resolve(key) {
            Ok(versioned) => Some(versioned),
            Err(e) => {
                Counters::bump(&self.counters.errors);
                tracing::warn!(key = %key, error = %e, "Cache versions unavailable, bypassing cache");
                None
            }
        }
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Look a key up in both tiers without fetching.
    pub async fn lookup<T: DeserializeOwned>(&self, key: &LogicalKey) -> Option<CacheRead<T>> {
        let versioned = self.resolve_or_log(key)?;
        self.lookup_versioned(&versioned).await
    }

    /// Look up an already resolved key. Pair with [`put_at`](Self::put_at)
    /// when the fetch happens outside [`get_or_fetch`](Self::get_or_fetch).
    pub async fn lookup_at<T: DeserializeOwned>(
        &self,
        versioned: &VersionedKey,
    ) -> Option<CacheRead<T>> {
        self.lookup_versioned(versioned).await
    }

    /// Read through both tiers, calling `fetch` on a miss and storing its
    /// result (including "not found") in both tiers.
    pub async fn get_or_fetch<T, F, Fut>(
        &self,
        key: &LogicalKey,
        ttl: Duration,
        fetch: F,
    ) -> RowkeepResult<CacheRead<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = RowkeepResult<Option<T>>>,
    {
        // Resolve before fetching: a concurrent bump then strands our
        // write under the old key instead of hiding the new value.
        let versioned = self.resolve_or_log(key);
        if let Some(versioned) = &versioned {
            if let Some(hit) = self.lookup_versioned(versioned).await {
                return Ok(hit);
            }
        }
        Counters::bump(&self.counters.misses);

        let fetched = fetch().await?;
        if let Some(versioned) = &versioned {
            let value = match &fetched {
                Some(v) => CachedValue::Present(v),
                None => CachedValue::Absent,
            };
            self.store(versioned, value, ttl).await;
        }
        Ok(CacheRead::from_origin(fetched))
    }

    async fn lookup_versioned<T: DeserializeOwned>(
        &self,
        versioned: &VersionedKey,
    ) -> Option<CacheRead<T>> {
        let encoded = versioned.encode();
        let now = self.clock.now_ms();

        if let Some(bytes) = self.local.get(&encoded, now) {
            match self.decode::<T>(&encoded, &bytes, versioned, now) {
                Some(entry) => {
                    Counters::bump(&self.counters.local_hits);
                    return Some(self.hit(entry, CacheTier::Local, now));
                }
                None => self.local.remove(&encoded),
            }
        }

        match self.shared.get(&encoded).await {
            Ok(Some(bytes)) => {
                let entry = self.decode::<T>(&encoded, &bytes, versioned, now)?;
                self.local.put(&encoded, bytes, now, entry.expires_at_ms());
                Counters::bump(&self.counters.shared_hits);
                Some(self.hit(entry, CacheTier::Shared, now))
            }
            Ok(None) => None,
            Err(e) => {
                Counters::bump(&self.counters.errors);
                tracing::warn!(key = %encoded, error = %e, "Shared cache read failed");
                None
            }
        }
    }

    fn decode<T: DeserializeOwned>(
        &self,
        encoded: &str,
        bytes: &[u8],
        versioned: &VersionedKey,
        now: i64,
    ) -> Option<CacheEntry<T>> {
        match serde_json::from_slice::<CacheEntry<T>>(bytes) {
            Ok(entry) if entry.is_valid(now, versioned.stamp()) => Some(entry),
            Ok(_) => None,
            Err(e) => {
                Counters::bump(&self.counters.errors);
                tracing::warn!(key = encoded, error = %e, "Discarding undecodable cache entry");
                None
            }
        }
    }

    fn hit<T>(&self, entry: CacheEntry<T>, tier: CacheTier, now: i64) -> CacheRead<T> {
        if entry.value.is_absent() {
            Counters::bump(&self.counters.negative_hits);
        }
        let age = Duration::from_millis(entry.age_ms(now) as u64);
        CacheRead::new(entry.value, tier, age)
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Store a known-fresh value under the current versions.
    pub async fn put<T: Serialize>(&self, key: &LogicalKey, value: &T, ttl: Duration) {
        if let Some(versioned) = self.resolve_or_log(key) {
            self.store(&versioned, CachedValue::Present(value), ttl)
                .await;
        }
    }

    /// Store under a key resolved before the value was fetched.
    pub async fn put_at<T: Serialize>(
        &self,
        versioned: &VersionedKey,
        value: Option<&T>,
        ttl: Duration,
    ) {
        let value = match value {
            Some(v) => CachedValue::Present(v),
            None => CachedValue::Absent,
        };
        self.store(versioned, value, ttl).await;
    }

    /// Record a confirmed "not found" under the current versions.
    pub async fn put_absent(&self, key: &LogicalKey) {
        if let Some(versioned) = self.resolve_or_log(key) {
            self.store::<()>(&versioned, CachedValue::Absent, self.negative_ttl)
                .await;
        }
    }

    /// Remove the entry at the current versions from both tiers.
    pub async fn evict(&self, key: &LogicalKey) {
        let Some(versioned) = self.resolve_or_log(key) else {
            return;
        };
        let encoded = versioned.encode();
        self.local.remove(&encoded);
        if let Err(e) = self.shared.remove(&encoded).await {
            Counters::bump(&self.counters.errors);
            tracing::warn!(key = %encoded, error = %e, "Shared cache remove failed");
        }
    }

    async fn store<T: Serialize>(
        &self,
        versioned: &VersionedKey,
        value: CachedValue<&T>,
        ttl: Duration,
    ) {
        let ttl = if value.is_absent() {
            ttl.min(self.negative_ttl)
        } else {
            ttl
        };
        let now = self.clock.now_ms();
        let entry = CacheEntry::new(value, versioned.stamp(), now, ttl);
        let encoded = versioned.encode();

        let bytes = match serde_json::to_vec(&entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                Counters::bump(&self.counters.errors);
                tracing::warn!(key = %encoded, error = %e, "Failed to encode cache entry");
                return;
            }
        };

        let limit = self.shared.max_entry_bytes();
        if bytes.len() > limit {
            Counters::bump(&self.counters.oversized_skips);
            tracing::warn!(
                key = %encoded,
                size = bytes.len(),
                limit,
                "Entry exceeds shared cache limit, skipping shared write"
            );
        } else if let Err(e) = self.shared.put(&encoded, bytes.clone(), ttl).await {
            Counters::bump(&self.counters.errors);
            tracing::warn!(key = %encoded, error = %e, "Shared cache write failed");
        }

        self.local.put(&encoded, bytes, now, entry.expires_at_ms());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryCacheService, InMemoryPropertyStore};
    use rowkeep_core::{ManualClock, RecordId};
    use std::sync::atomic::AtomicU32;

    struct Harness {
        clock: Arc<ManualClock>,
        shared: Arc<InMemoryCacheService>,
        properties: Arc<InMemoryPropertyStore>,
    }

    impl Harness {
        fn new(max_entry_bytes: usize) -> Self {
            let clock = Arc::new(ManualClock::default());
            Self {
                shared: Arc::new(InMemoryCacheService::with_max_entry_bytes(
                    clock.clone(),
                    max_entry_bytes,
                )),
                properties: Arc::new(InMemoryPropertyStore::new(clock.clone())),
                clock,
            }
        }

        fn cache(&self) -> VersionedCache {
            VersionedCache::new(
                self.shared.clone(),
                self.properties.clone(),
                self.clock.clone(),
                Duration::from_secs(30),
            )
        }
    }

    fn record_key(id: &str) -> LogicalKey {
        LogicalKey::Record(RecordId::from(id))
    }

    async fn fetch_counting(
        cache: &VersionedCache,
        key: &LogicalKey,
        calls: &AtomicU32,
        value: Option<String>,
    ) -> CacheRead<String> {
        cache
            .get_or_fetch(key, Duration::from_secs(600), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(value)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_miss_then_local_hit() {
        let h = Harness::new(1024);
        let cache = h.cache();
        let calls = AtomicU32::new(0);
        let key = record_key("u1");

        let first = fetch_counting(&cache, &key, &calls, Some("v1".into())).await;
        assert_eq!(first.tier(), CacheTier::Origin);
        let second = fetch_counting(&cache, &key, &calls, Some("other".into())).await;
        assert_eq!(second.tier(), CacheTier::Local);
        assert_eq!(second.into_option(), Some("v1".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shared_hit_repopulates_local() {
        let h = Harness::new(1024);
        let writer = h.cache();
        let reader = h.cache();
        let calls = AtomicU32::new(0);
        let key = record_key("u1");

        fetch_counting(&writer, &key, &calls, Some("v1".into())).await;
        let read = fetch_counting(&reader, &key, &calls, None).await;
        assert_eq!(read.tier(), CacheTier::Shared);
        let read = fetch_counting(&reader, &key, &calls, None).await;
        assert_eq!(read.tier(), CacheTier::Local);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bump_hides_old_entries_in_every_process() {
        let h = Harness::new(1024);
        let a = h.cache();
        let b = h.cache();
        let calls = AtomicU32::new(0);
        let key = record_key("u1");

        fetch_counting(&a, &key, &calls, Some("old".into())).await;
        fetch_counting(&b, &key, &calls, Some("old".into())).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        a.bump(&Namespace::Record(RecordId::from("u1"))).unwrap();
        let read = fetch_counting(&b, &key, &calls, Some("new".into())).await;
        assert_eq!(read.into_option(), Some("new".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        a.bump(&Namespace::Records).unwrap();
        let read = fetch_counting(&a, &key, &calls, Some("newer".into())).await;
        assert_eq!(read.into_option(), Some("newer".to_string()));
    }

    #[tokio::test]
    async fn test_bump_of_unrelated_namespace_keeps_entry() {
        let h = Harness::new(1024);
        let cache = h.cache();
        let calls = AtomicU32::new(0);
        let key = record_key("u1");

        fetch_counting(&cache, &key, &calls, Some("v".into())).await;
        cache.bump(&Namespace::Record(RecordId::from("u2"))).unwrap();
        cache.bump(&Namespace::RecordIndex).unwrap();
        fetch_counting(&cache, &key, &calls, Some("v".into())).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_negative_results_expire_sooner() {
        let h = Harness::new(1024);
        let cache = h.cache();
        let calls = AtomicU32::new(0);
        let key = record_key("ghost");

        let read = fetch_counting(&cache, &key, &calls, None).await;
        assert!(read.value().is_absent());
        let read = fetch_counting(&cache, &key, &calls, None).await;
        assert!(read.was_cache_hit());
        assert_eq!(cache.stats().negative_hits, 1);

        h.clock.advance(Duration::from_secs(30));
        fetch_counting(&cache, &key, &calls, Some("created".into())).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_oversized_entries_skip_shared_tier() {
        let h = Harness::new(64);
        let cache = h.cache();
        let calls = AtomicU32::new(0);
        let key = LogicalKey::Scan;

        let big = "x".repeat(500);
        fetch_counting(&cache, &key, &calls, Some(big.clone())).await;
        assert_eq!(cache.stats().oversized_skips, 1);
        assert_eq!(h.shared.put_count(), 0);

        // Still served locally; a second process has to fetch.
        let read = fetch_counting(&cache, &key, &calls, Some(big.clone())).await;
        assert_eq!(read.tier(), CacheTier::Local);
        let other = h.cache();
        let read = fetch_counting(&other, &key, &calls, Some(big)).await;
        assert_eq!(read.tier(), CacheTier::Origin);
    }

    #[tokio::test]
    async fn test_shared_cache_outage_falls_through() {
        let h = Harness::new(1024);
        h.shared.set_failing(true);
        let cache = h.cache();
        let calls = AtomicU32::new(0);
        let key = record_key("u1");

        let read = fetch_counting(&cache, &key, &calls, Some("v".into())).await;
        assert_eq!(read.into_option(), Some("v".to_string()));
        assert!(cache.stats().errors >= 1);
    }

    #[tokio::test]
    async fn test_property_outage_bypasses_cache() {
        let h = Harness::new(1024);
        let cache = h.cache();
        let calls = AtomicU32::new(0);
        let key = record_key("u1");
        fetch_counting(&cache, &key, &calls, Some("v".into())).await;

        h.properties.set_failing(true);
        let read = fetch_counting(&cache, &key, &calls, Some("fresh".into())).await;
        assert_eq!(read.tier(), CacheTier::Origin);
        assert_eq!(read.into_option(), Some("fresh".to_string()));
        assert!(!cache.bump_or_log(&Namespace::Records));
    }

    #[tokio::test]
    async fn test_put_warms_and_evict_clears() {
        let h = Harness::new(1024);
        let cache = h.cache();
        let key = record_key("u1");

        cache.put(&key, &"warm".to_string(), Duration::from_secs(60)).await;
        let read: CacheRead<String> = cache.lookup(&key).await.unwrap();
        assert_eq!(read.into_option(), Some("warm".to_string()));

        cache.evict(&key).await;
        assert!(cache.lookup::<String>(&key).await.is_none());

        cache.put_absent(&key).await;
        let read: CacheRead<String> = cache.lookup(&key).await.unwrap();
        assert!(read.value().is_absent());
    }
}
