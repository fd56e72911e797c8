//! Two-tier cache with versioned invalidation.
//!
//! Reads check a process-local map first, then the shared cache service,
//! then the authoritative fetch. Every key embeds the current versions of
//! the namespaces it belongs to, so invalidation is a counter bump in the
//! property store rather than an enumeration of keys.
//!
//! # Example
//!
//! ```ignore
//! let read = cache
//!     .get_or_fetch(&LogicalKey::Record(id.clone()), ttl, || store.fetch(&id))
//!     .await?;
//!
//! // After a write, every process computes a new key for this record.
//! cache.bump(&Namespace::Record(id))?;
//! ```

pub mod entry;
pub mod key;
pub mod local;
pub mod versioned;

pub use entry::{CacheEntry, CacheRead, CacheTier, CachedValue};
pub use key::{LogicalKey, Namespace, VersionedKey};
pub use local::{LocalCache, DEFAULT_LOCAL_CAPACITY};
pub use versioned::{CacheStats, VersionedCache};
