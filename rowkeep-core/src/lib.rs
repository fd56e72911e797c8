//! Rowkeep Core - Data Types
//!
//! Pure data structures for the rowkeep table access layer: the fixed
//! record schema, versioned payloads, A1 ranges, retry and circuit state,
//! lock leases, configuration, and the error taxonomy. No I/O lives here;
//! everything that talks to a substrate is in `rowkeep-storage`.

use chrono::{DateTime, Utc};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

pub mod circuit;
pub mod clock;
pub mod config;
pub mod error;
pub mod lock;
pub mod payload;
pub mod range;
pub mod record;
pub mod retry;

pub use circuit::{
    CircuitPhase, CircuitState, DEFAULT_CIRCUIT_COOL_DOWN_SECS, DEFAULT_CIRCUIT_FAILURE_THRESHOLD,
    DEFAULT_CIRCUIT_STATE_TTL_SECS,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    CacheConfig, CircuitConfig, ConflictPolicy, LockConfig, RetryConfig, StoreConfig, TableConfig,
    DEFAULT_INDEX_TTL_MS, DEFAULT_MAX_ENTRY_BYTES, DEFAULT_NEGATIVE_TTL_MS, DEFAULT_RECORD_TTL_MS,
};
pub use error::{
    CacheError, ConfigError, LockError, RemoteError, RowkeepError, RowkeepResult, StorageError,
    UserFacing,
};
pub use lock::{
    Acquired, Lease, LeaseData, LeaseState, LockName, LockScope, Released,
    DEFAULT_CREATION_LOCK_WAIT_MS, DEFAULT_LOCK_LEASE_MS, DEFAULT_RECORD_LOCK_WAIT_MS,
};
pub use payload::{Payload, PayloadSchema, VERSION_KEY};
pub use range::A1Range;
pub use record::{
    format_timestamp, truncate_millis, Column, OwnerKey, Record, RecordId, StoredRow,
    FIRST_DATA_ROW,
};
pub use retry::{
    RetryPolicy, DEFAULT_RETRY_BASE_MS, DEFAULT_RETRY_CAP_MS, DEFAULT_RETRY_MAX_ATTEMPTS,
};
