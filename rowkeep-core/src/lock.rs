//! Lock typestate for compile-time safety of lock lifecycle.
//!
//! A lease can only be released while in the `Acquired` state, and
//! releasing consumes it.
//!
//! # State Transition Diagram
//!
//! ```text
//! (unlocked) ─── acquire() ──→ Acquired ─── release() ──→ Released
//! ```

use crate::{OwnerKey, RecordId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_RECORD_LOCK_WAIT_MS: u64 = 5_000;
pub const DEFAULT_CREATION_LOCK_WAIT_MS: u64 = 15_000;
pub const DEFAULT_LOCK_LEASE_MS: u64 = 30_000;

// ============================================================================
// LOCK SCOPE
// ============================================================================

/// Granularity of a distributed lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockScope {
    /// Guards one record update (short wait).
    Record,
    /// Guards a multi-step creation flow (long wait).
    Creation,
}

impl LockScope {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            LockScope::Record => "record",
            LockScope::Creation => "create",
        }
    }
}

/// Name of a distributed mutex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockName {
    scope: LockScope,
    key: String,
}

impl LockName {
    pub fn record(id: &RecordId) -> Self {
        Self {
            scope: LockScope::Record,
            key: id.as_str().to_string(),
        }
    }

    /// Creation locks are keyed by a digest so raw owner keys never appear
    /// in lock names.
    pub fn creation(owner_key: &OwnerKey) -> Self {
        Self {
            scope: LockScope::Creation,
            key: owner_key.digest(),
        }
    }

    pub fn scope(&self) -> LockScope {
        self.scope
    }
}

impl fmt::Display for LockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope.as_db_str(), self.key)
    }
}

// ============================================================================
// LEASE DATA
// ============================================================================

/// Data describing one held lease, independent of typestate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseData {
    pub name: LockName,
    /// Token identifying the holder; release is a no-op for other holders.
    pub holder: Uuid,
    pub acquired_at: Timestamp,
    pub expires_at: Timestamp,
}

impl LeaseData {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    pub fn remaining_duration(&self, now: Timestamp) -> Option<Duration> {
        if now >= self.expires_at {
            None
        } else {
            (self.expires_at - now).to_std().ok()
        }
    }
}

// ============================================================================
// TYPESTATE MARKERS
// ============================================================================

/// Marker trait for lease states.
pub trait LeaseState: private::Sealed + Send + Sync {}

/// Lease is currently held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquired;
impl LeaseState for Acquired {}

/// Lease has been handed back to the lock service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Released;
impl LeaseState for Released {}

mod private {
    pub trait Sealed {}
    impl Sealed for super::Acquired {}
    impl Sealed for super::Released {}
}

/// A lease with compile-time state tracking.
#[derive(Debug)]
pub struct Lease<S: LeaseState> {
    data: LeaseData,
    _state: PhantomData<S>,
}

impl<S: LeaseState> Lease<S> {
    pub fn data(&self) -> &LeaseData {
        &self.data
    }

    pub fn name(&self) -> &LockName {
        &self.data.name
    }

    pub fn holder(&self) -> Uuid {
        self.data.holder
    }
}

impl Lease<Acquired> {
    /// Only called by a lock coordinator after a successful acquire.
    pub fn new(data: LeaseData) -> Self {
        Lease {
            data,
            _state: PhantomData,
        }
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.data.is_expired(now)
    }

    /// Consume the lease. The released lease still names what was held.
    pub fn release(self) -> Lease<Released> {
        Lease {
            data: self.data,
            _state: PhantomData,
        }
    }
}

impl Lease<Released> {
    /// How long the lease was held, measured at `released_at`.
    pub fn held_for(&self, released_at: Timestamp) -> Duration {
        (released_at - self.data.acquired_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_lease_data() -> LeaseData {
        let now = Utc::now();
        LeaseData {
            name: LockName::record(&RecordId::from("u1")),
            holder: Uuid::now_v7(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(30),
        }
    }

    #[test]
    fn test_lock_names() {
        assert_eq!(LockName::record(&RecordId::from("u1")).to_string(), "record:u1");
        let creation = LockName::creation(&OwnerKey::from("a@x.com"));
        assert!(creation.to_string().starts_with("create:"));
        assert!(!creation.to_string().contains('@'));
        assert_eq!(creation.scope(), LockScope::Creation);
    }

    #[test]
    fn test_lease_release_consumes() {
        let data = make_lease_data();
        let lease = Lease::<Acquired>::new(data.clone());
        let released: Lease<Released> = lease.release();
        assert_eq!(released.holder(), data.holder);
        assert_eq!(released.name(), &data.name);
        assert_eq!(
            released.held_for(data.acquired_at + chrono::Duration::seconds(2)),
            Duration::from_secs(2)
        );
        assert_eq!(released.held_for(data.acquired_at), Duration::ZERO);
    }

    #[test]
    fn test_lease_expiry() {
        let data = make_lease_data();
        let lease = Lease::<Acquired>::new(data.clone());
        assert!(!lease.is_expired(data.acquired_at));
        assert!(lease.is_expired(data.expires_at));
        assert!(data.remaining_duration(data.expires_at).is_none());
        assert!(data.remaining_duration(data.acquired_at).is_some());
    }
}
