//! Rowkeep Storage - Resilient Table Access
//!
//! Everything that talks to a substrate: the backoff client and shared
//! circuit breaker in front of the remote table, the two-tier versioned
//! cache, the record store, named locks, execution contexts with
//! single-write commits, and the [`RecordGateway`] facade over all of it.
//!
//! Substrates are traits (see [`services`]). In-memory fakes live in
//! [`memory`], an LMDB-backed cache and property store in [`lmdb`], and an
//! HTTP table client in [`http_table`].

pub mod cache;
pub mod client;
pub mod context;
pub mod gateway;
pub mod http_table;
pub mod lmdb;
pub mod lock_coordinator;
pub mod memory;
pub mod record_store;
pub mod services;
pub mod telemetry;

pub use cache::{
    CacheEntry, CacheRead, CacheStats, CacheTier, CachedValue, LocalCache, LogicalKey, Namespace,
    VersionedCache, VersionedKey, DEFAULT_LOCAL_CAPACITY,
};
pub use client::{
    execute_with_policy, Attempt, BackoffClient, PolicyError, SharedCircuitBreaker,
    CIRCUIT_ERRORS_KEY, CIRCUIT_STATE_KEY,
};
pub use context::{CommitOutcome, ContextState, ContextStats, ExecutionContext};
pub use gateway::{Created, RecordGateway, Substrates};
pub use http_table::HttpTableApi;
pub use lmdb::{LmdbCacheService, LmdbError, LmdbPropertyStore, LmdbSubstrate};
pub use lock_coordinator::{LockCoordinator, LockGuard};
pub use memory::{
    InMemoryCacheService, InMemoryLockService, InMemoryPropertyStore, InMemoryTable, TableCall,
    WriteLogEntry,
};
pub use record_store::{AppendOutcome, RecordStore, RowIndex};
pub use services::{
    AppendResult, CacheService, LockService, PropertyStore, RemoteStatus, TableApi, ValueRange,
    STATUS_FORBIDDEN, STATUS_TOO_MANY_REQUESTS, TRANSPORT_FAILURE,
};
pub use telemetry::{init_tracing, TelemetryConfig, DEFAULT_LOG_FILTER};
