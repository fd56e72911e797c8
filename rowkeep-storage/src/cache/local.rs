//! Process-local cache tier.
//!
//! Holds encoded entries for the life of one process. Nothing here is
//! shared; coherence across processes comes from versioned keys.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub const DEFAULT_LOCAL_CAPACITY: usize = 1_024;

#[derive(Debug)]
struct LocalEntry {
    bytes: Vec<u8>,
    stored_at_ms: i64,
    expires_at_ms: i64,
}

/// Bounded map of encoded cache entries.
#[derive(Debug)]
pub struct LocalCache {
    entries: Mutex<HashMap<String, LocalEntry>>,
    capacity: usize,
}

impl Default for LocalCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOCAL_CAPACITY)
    }
}

impl LocalCache {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, LocalEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str, now_ms: i64) -> Option<Vec<u8>> {
        let mut entries = self.entries();
        match entries.get(key) {
            Some(entry) if entry.expires_at_ms > now_ms => Some(entry.bytes.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: &str, bytes: Vec<u8>, now_ms: i64, expires_at_ms: i64) {
        let mut entries = self.entries();
        if entries.len() >= self.capacity && !entries.contains_key(key) {
            entries.retain(|_, e| e.expires_at_ms > now_ms);
            if entries.len() >= self.capacity {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.stored_at_ms)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(
            key.to_string(),
            LocalEntry {
                bytes,
                stored_at_ms: now_ms,
                expires_at_ms,
            },
        );
    }

    pub fn remove(&self, key: &str) {
        self.entries().remove(key);
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expired_entries_read_as_missing() {
        let cache = LocalCache::default();
        cache.put("k", vec![1], 0, 100);
        assert_eq!(cache.get("k", 99), Some(vec![1]));
        assert_eq!(cache.get("k", 100), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let cache = LocalCache::with_capacity(2);
        cache.put("a", vec![1], 0, 1_000);
        cache.put("b", vec![2], 10, 1_000);
        cache.put("c", vec![3], 20, 1_000);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a", 30), None);
        assert_eq!(cache.get("c", 30), Some(vec![3]));
    }

    #[test]
    fn test_capacity_prefers_dropping_expired() {
        let cache = LocalCache::with_capacity(2);
        cache.put("a", vec![1], 0, 1_000);
        cache.put("b", vec![2], 10, 50);
        cache.put("c", vec![3], 60, 1_000);

        assert_eq!(cache.get("a", 70), Some(vec![1]));
        assert_eq!(cache.get("b", 70), None);
    }
}
