//! LMDB-backed shared cache and property store.
//!
//! One environment holds two named databases, `cache` and `properties`.
//! Every value is stored behind an 8-byte little-endian expiry header
//! (epoch millis, 0 = never); expired entries read as absent and are
//! removed by [`LmdbSubstrate::purge_expired`].
//!
//! LMDB serializes write transactions across every process that maps the
//! environment, so [`PropertyStore::increment`] is a read-modify-write
//! inside one write transaction.
//!
//! An environment must be opened at most once per process; share the
//! returned `Arc` instead of opening the same path again.

use crate::services::{CacheService, PropertyStore};
use async_trait::async_trait;
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions};
use rowkeep_core::{CacheError, Clock, DEFAULT_MAX_ENTRY_BYTES};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const CACHE_DB: &str = "cache";
const PROPERTIES_DB: &str = "properties";
const EXPIRY_HEADER_LEN: usize = 8;

/// Error type for LMDB substrate operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbError {
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    #[error("Failed to open database: {0}")]
    DbOpen(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbError> for CacheError {
    fn from(e: LmdbError) -> Self {
        CacheError::Backend {
            reason: e.to_string(),
        }
    }
}

fn txn_error(e: heed::Error) -> LmdbError {
    LmdbError::Transaction(e.to_string())
}

// ============================================================================
// ENTRY FORMAT
// ============================================================================

/// Format: `[expires_at_ms: 8 bytes LE][value]`.
fn encode_entry(expires_at_ms: i64, value: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(EXPIRY_HEADER_LEN + value.len());
    bytes.extend_from_slice(&expires_at_ms.to_le_bytes());
    bytes.extend_from_slice(value);
    bytes
}

/// `None` for entries too short to carry a header.
fn decode_entry(bytes: &[u8]) -> Option<(i64, &[u8])> {
    let header: [u8; EXPIRY_HEADER_LEN] = bytes.get(..EXPIRY_HEADER_LEN)?.try_into().ok()?;
    Some((i64::from_le_bytes(header), &bytes[EXPIRY_HEADER_LEN..]))
}

fn is_live(expires_at_ms: i64, now_ms: i64) -> bool {
    expires_at_ms == 0 || expires_at_ms > now_ms
}

// ============================================================================
// SUBSTRATE
// ============================================================================

/// An opened LMDB environment with the cache and property databases.
pub struct LmdbSubstrate {
    env: Env,
    cache: Database<Str, Bytes>,
    properties: Database<Str, Bytes>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for LmdbSubstrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbSubstrate")
            .field("path", &self.env.path())
            .finish_non_exhaustive()
    }
}

impl LmdbSubstrate {
    /// Open (creating if needed) the environment at `path`.
    pub fn open<P: AsRef<Path>>(
        path: P,
        max_size_mb: usize,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, LmdbError> {
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(2)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_error)?;
        let cache: Database<Str, Bytes> = env
            .create_database(&mut wtxn, Some(CACHE_DB))
            .map_err(|e| LmdbError::DbOpen(e.to_string()))?;
        let properties: Database<Str, Bytes> = env
            .create_database(&mut wtxn, Some(PROPERTIES_DB))
            .map_err(|e| LmdbError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_error)?;

        tracing::info!(path = %path.as_ref().display(), max_size_mb, "LMDB substrate opened");
        Ok(Arc::new(Self {
            env,
            cache,
            properties,
            clock,
        }))
    }

    pub fn cache_service(self: &Arc<Self>) -> LmdbCacheService {
        LmdbCacheService {
            substrate: self.clone(),
            max_entry_bytes: DEFAULT_MAX_ENTRY_BYTES,
        }
    }

    pub fn property_store(self: &Arc<Self>) -> LmdbPropertyStore {
        LmdbPropertyStore {
            substrate: self.clone(),
        }
    }

    fn expiry_for(&self, ttl: Option<Duration>) -> i64 {
        match ttl {
            Some(ttl) => self.clock.now_ms() + ttl.as_millis() as i64,
            None => 0,
        }
    }

    fn read(&self, db: Database<Str, Bytes>, key: &str) -> Result<Option<Vec<u8>>, LmdbError> {
        let rtxn = self.env.read_txn().map_err(txn_error)?;
        let Some(bytes) = db.get(&rtxn, key).map_err(txn_error)? else {
            return Ok(None);
        };
        match decode_entry(bytes) {
            Some((expires_at_ms, value)) if is_live(expires_at_ms, self.clock.now_ms()) => {
                Ok(Some(value.to_vec()))
            }
            Some(_) => Ok(None),
            None => {
                tracing::warn!(key, "LMDB entry without expiry header, ignoring");
                Ok(None)
            }
        }
    }

    fn write(
        &self,
        db: Database<Str, Bytes>,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), LmdbError> {
        let bytes = encode_entry(self.expiry_for(ttl), value);
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        db.put(&mut wtxn, key, &bytes).map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)
    }

    fn remove(&self, db: Database<Str, Bytes>, key: &str) -> Result<(), LmdbError> {
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        db.delete(&mut wtxn, key).map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)
    }

    /// Delete expired entries from both databases. Returns how many were
    /// removed.
    pub fn purge_expired(&self) -> Result<usize, LmdbError> {
        let now = self.clock.now_ms();
        let mut wtxn = self.env.write_txn().map_err(txn_error)?;
        let mut removed = 0;
        for db in [self.cache, self.properties] {
            let expired: Vec<String> = db
                .iter(&wtxn)
                .map_err(txn_error)?
                .filter_map(|entry| entry.ok())
                .filter(|(_, bytes)| {
                    decode_entry(bytes).map_or(true, |(expires_at_ms, _)| !is_live(expires_at_ms, now))
                })
                .map(|(key, _)| key.to_string())
                .collect();
            for key in &expired {
                if db.delete(&mut wtxn, key).map_err(txn_error)? {
                    removed += 1;
                }
            }
        }
        wtxn.commit().map_err(txn_error)?;
        if removed > 0 {
            tracing::debug!(removed, "Purged expired LMDB entries");
        }
        Ok(removed)
    }
}

// ============================================================================
// CACHE SERVICE
// ============================================================================

/// Shared cache tier over the `cache` database.
#[derive(Debug, Clone)]
pub struct LmdbCacheService {
    substrate: Arc<LmdbSubstrate>,
    max_entry_bytes: usize,
}

impl LmdbCacheService {
    pub fn with_max_entry_bytes(mut self, max_entry_bytes: usize) -> Self {
        self.max_entry_bytes = max_entry_bytes;
        self
    }
}

#[async_trait]
impl CacheService for LmdbCacheService {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.substrate.read(self.substrate.cache, key)?)
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        if value.len() > self.max_entry_bytes {
            return Err(CacheError::Backend {
                reason: format!(
                    "entry of {} bytes exceeds limit of {}",
                    value.len(),
                    self.max_entry_bytes
                ),
            });
        }
        Ok(self
            .substrate
            .write(self.substrate.cache, key, &value, Some(ttl))?)
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        Ok(self.substrate.remove(self.substrate.cache, key)?)
    }

    fn max_entry_bytes(&self) -> usize {
        self.max_entry_bytes
    }
}

// ============================================================================
// PROPERTY STORE
// ============================================================================

/// Breaker state and cache versions over the `properties` database.
#[derive(Debug, Clone)]
pub struct LmdbPropertyStore {
    substrate: Arc<LmdbSubstrate>,
}

impl PropertyStore for LmdbPropertyStore {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let Some(bytes) = self.substrate.read(self.substrate.properties, key)? else {
            return Ok(None);
        };
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| CacheError::Codec {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        Ok(self
            .substrate
            .write(self.substrate.properties, key, value.as_bytes(), ttl)?)
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        Ok(self.substrate.remove(self.substrate.properties, key)?)
    }

    fn increment_with_ttl(&self, key: &str, ttl: Option<Duration>) -> Result<u64, CacheError> {
        let substrate = &self.substrate;
        let db = substrate.properties;
        let now = substrate.clock.now_ms();
        let mut wtxn = substrate.env.write_txn().map_err(txn_error)?;

        let (current, expires_at_ms) = match db.get(&wtxn, key).map_err(txn_error)? {
            Some(bytes) => match decode_entry(bytes) {
                Some((expires_at_ms, value)) if is_live(expires_at_ms, now) => {
                    let text = std::str::from_utf8(value).map_err(|e| CacheError::Codec {
                        key: key.to_string(),
                        reason: e.to_string(),
                    })?;
                    let current = text.trim().parse::<u64>().map_err(|e| CacheError::Codec {
                        key: key.to_string(),
                        reason: format!("{:?} is not a counter: {}", text, e),
                    })?;
                    (current, expires_at_ms)
                }
                _ => (0, 0),
            },
            None => (0, 0),
        };

        let next = current + 1;
        let expires_at_ms = match ttl {
            Some(_) => substrate.expiry_for(ttl),
            None => expires_at_ms,
        };
        let bytes = encode_entry(expires_at_ms, next.to_string().as_bytes());
        db.put(&mut wtxn, key, &bytes).map_err(txn_error)?;
        wtxn.commit().map_err(txn_error)?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowkeep_core::ManualClock;

    fn open() -> (tempfile::TempDir, Arc<LmdbSubstrate>, Arc<ManualClock>) {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let substrate = LmdbSubstrate::open(dir.path(), 16, clock.clone()).unwrap();
        (dir, substrate, clock)
    }

    #[test]
    fn test_entry_header_roundtrip() {
        let bytes = encode_entry(1_234, b"value");
        assert_eq!(decode_entry(&bytes), Some((1_234, &b"value"[..])));
        assert_eq!(decode_entry(b"short"), None);
    }

    #[tokio::test]
    async fn test_cache_ttl_expiry() {
        let (_dir, substrate, clock) = open();
        let cache = substrate.cache_service();

        cache
            .put("k", b"v".to_vec(), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(b"v".to_vec()));

        clock.advance(Duration::from_secs(10));
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert_eq!(substrate.purge_expired().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cache_rejects_oversized_entries() {
        let (_dir, substrate, _clock) = open();
        let cache = substrate.cache_service().with_max_entry_bytes(4);
        assert_eq!(cache.max_entry_bytes(), 4);
        assert!(cache
            .put("k", vec![0; 5], Duration::from_secs(1))
            .await
            .is_err());
        cache.remove("k").await.unwrap();
    }

    #[test]
    fn test_property_increment_and_ttl() {
        let (_dir, substrate, clock) = open();
        let props = substrate.property_store();

        assert_eq!(props.increment("v").unwrap(), 1);
        assert_eq!(props.increment("v").unwrap(), 2);
        assert_eq!(props.get("v").unwrap().as_deref(), Some("2"));

        props
            .set("circuit", "{}", Some(Duration::from_secs(60)))
            .unwrap();
        clock.advance(Duration::from_secs(61));
        assert_eq!(props.get("circuit").unwrap(), None);

        props.set("bad", "x", None).unwrap();
        assert!(props.increment("bad").is_err());
        props.delete("bad").unwrap();
        assert_eq!(props.get("bad").unwrap(), None);
    }

    #[test]
    fn test_increment_with_ttl_refreshes_expiry() {
        let (_dir, substrate, clock) = open();
        let props = substrate.property_store();
        let ttl = Some(Duration::from_secs(60));

        assert_eq!(props.increment_with_ttl("errors", ttl).unwrap(), 1);
        clock.advance(Duration::from_secs(30));
        assert_eq!(props.increment_with_ttl("errors", ttl).unwrap(), 2);
        clock.advance(Duration::from_secs(45));
        assert_eq!(props.get("errors").unwrap().as_deref(), Some("2"));

        // a plain increment keeps the refreshed expiry
        assert_eq!(props.increment("errors").unwrap(), 3);
        clock.advance(Duration::from_secs(20));
        assert_eq!(props.get("errors").unwrap(), None);
        assert_eq!(props.increment_with_ttl("errors", ttl).unwrap(), 1);
    }

    #[test]
    fn test_databases_are_separate() {
        let (_dir, substrate, _clock) = open();
        substrate
            .write(substrate.cache, "shared-name", b"cache", None)
            .unwrap();
        let props = substrate.property_store();
        assert_eq!(props.get("shared-name").unwrap(), None);
    }

    #[test]
    fn test_concurrent_increments_are_atomic() {
        let (_dir, substrate, _clock) = open();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let props = substrate.property_store();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        props.increment("counter").unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(
            substrate.property_store().get("counter").unwrap().as_deref(),
            Some("100")
        );
    }
}
