//! Namespaced, versioned cache keys.
//!
//! The shared cache has no wildcard delete, so invalidation works by
//! changing the key: every key embeds the current version of each
//! namespace it belongs to, and bumping a namespace makes every old key
//! unreachable.

use rowkeep_core::{OwnerKey, RecordId};
use std::fmt;

const KEY_PREFIX: &str = "rk";
const VERSION_PREFIX: &str = "rowkeep:v";

/// A group of cache keys sharing one version counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Namespace {
    /// Everything. Bumping it invalidates every key.
    Records,
    /// The row index and owner lookups.
    RecordIndex,
    /// The cached full-table scan.
    Scan,
    /// One record.
    Record(RecordId),
}

impl Namespace {
    /// Property key holding this namespace's version counter.
    pub fn version_key(&self) -> String {
        match self {
            Namespace::Records => format!("{}:records", VERSION_PREFIX),
            Namespace::RecordIndex => format!("{}:index", VERSION_PREFIX),
            Namespace::Scan => format!("{}:scan", VERSION_PREFIX),
            Namespace::Record(id) => format!("{}:record:{}", VERSION_PREFIX, id),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Namespace::Records => f.write_str("records"),
            Namespace::RecordIndex => f.write_str("index"),
            Namespace::Scan => f.write_str("scan"),
            Namespace::Record(id) => write!(f, "record:{}", id),
        }
    }
}

/// What a cache entry is about, before versions are applied.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LogicalKey {
    Record(RecordId),
    Owner(OwnerKey),
    RowIndex,
    Scan,
}

impl LogicalKey {
    /// Namespaces whose versions this key embeds, outermost first.
    pub fn namespaces(&self) -> [Namespace; 2] {
        match self {
            LogicalKey::Record(id) => [Namespace::Records, Namespace::Record(id.clone())],
            LogicalKey::Owner(_) | LogicalKey::RowIndex => {
                [Namespace::Records, Namespace::RecordIndex]
            }
            LogicalKey::Scan => [Namespace::Records, Namespace::Scan],
        }
    }

    fn base(&self) -> String {
        match self {
            LogicalKey::Record(id) => format!("{}:rec:{}", KEY_PREFIX, id),
            LogicalKey::Owner(owner) => format!("{}:own:{}", KEY_PREFIX, owner.digest()),
            LogicalKey::RowIndex => format!("{}:idx", KEY_PREFIX),
            LogicalKey::Scan => format!("{}:scan", KEY_PREFIX),
        }
    }

    /// Apply namespace versions, in [`namespaces`](Self::namespaces) order.
    pub fn versioned(&self, versions: [u64; 2]) -> VersionedKey {
        VersionedKey {
            base: self.base(),
            stamp: format!("{}.{}", versions[0], versions[1]),
        }
    }
}

impl fmt::Display for LogicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base())
    }
}

/// A concrete cache key: logical base plus a version stamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionedKey {
    base: String,
    stamp: String,
}

impl VersionedKey {
    /// The version stamp; also stored inside the entry and checked on read.
    pub fn stamp(&self) -> &str {
        &self.stamp
    }

    pub fn encode(&self) -> String {
        format!("{}@{}", self.base, self.stamp)
    }
}

impl fmt::Display for VersionedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.base, self.stamp)
    }
}
