//! Rowkeep Test Utilities
//!
//! Shared test infrastructure for the rowkeep workspace:
//! - Proptest generators for records, payloads, and configuration
//! - A [`fixtures::TestEnv`] bundling in-memory substrates behind one
//!   manual clock, from which any number of gateways can be built
//! - Assertions for the error taxonomy

// Re-export core types for convenience
pub use rowkeep_core::{
    CacheConfig, CircuitConfig, Clock, Column, ConflictPolicy, LockConfig, ManualClock, OwnerKey,
    Payload, Record, RecordId, RemoteError, RetryConfig, RowkeepError, RowkeepResult,
    StorageError, StoreConfig, Timestamp,
};
pub use rowkeep_storage::{
    InMemoryCacheService, InMemoryLockService, InMemoryPropertyStore, InMemoryTable,
    RecordGateway, Substrates,
};

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    use super::*;
    use proptest::prelude::*;
    use serde_json::{Map, Value};
    use uuid::Uuid;

    /// Generate a RecordId from random UUID bytes.
    pub fn arb_record_id() -> impl Strategy<Value = RecordId> {
        any::<[u8; 16]>().prop_map(|bytes| RecordId::new(Uuid::from_bytes(bytes).to_string()))
    }

    /// Generate a normalized, email-shaped OwnerKey.
    pub fn arb_owner_key() -> impl Strategy<Value = OwnerKey> {
        ("[a-z]{1,12}", "[a-z]{2,8}").prop_map(|(user, domain)| {
            OwnerKey::new(format!("{}@{}.com", user, domain))
        })
    }

    /// Generate a millisecond-precision timestamp between 2020 and 2030.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1_577_836_800_000i64..1_893_456_000_000i64)
            .prop_map(|ms| Timestamp::from_timestamp_millis(ms).unwrap_or_default())
    }

    /// Generate a scalar JSON attribute value.
    pub fn arb_attribute_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<bool>().prop_map(Value::Bool),
            (-1_000_000i64..1_000_000).prop_map(Value::from),
            "[a-zA-Z0-9 ]{0,24}".prop_map(Value::String),
        ]
    }

    /// Generate a payload with up to eight attributes.
    pub fn arb_payload() -> impl Strategy<Value = Payload> {
        (
            0u32..4,
            prop::collection::btree_map("[a-z][a-z_]{0,9}", arb_attribute_value(), 0..8),
        )
            .prop_map(|(version, attrs)| {
                let attributes: Map<String, Value> = attrs.into_iter().collect();
                Payload::new(version, attributes)
            })
    }

    /// Generate a full record.
    pub fn arb_record() -> impl Strategy<Value = Record> {
        (
            arb_record_id(),
            arb_owner_key(),
            any::<bool>(),
            arb_payload(),
            arb_timestamp(),
        )
            .prop_map(|(id, owner_key, is_active, payload, last_modified)| Record {
                id,
                owner_key,
                is_active,
                payload,
                last_modified,
            })
    }

    /// Generate one of the mutable columns.
    pub fn arb_mutable_column() -> impl Strategy<Value = Column> {
        prop_oneof![
            Just(Column::OwnerKey),
            Just(Column::IsActive),
            Just(Column::Payload),
        ]
    }

    pub fn arb_conflict_policy() -> impl Strategy<Value = ConflictPolicy> {
        prop_oneof![Just(ConflictPolicy::Detect), Just(ConflictPolicy::Overwrite)]
    }

    /// Generate a configuration that passes validation.
    pub fn arb_valid_config() -> impl Strategy<Value = StoreConfig> {
        (
            (1u32..8, 0u64..1_000, 0u64..4_000),
            (1u32..10, 1u64..120_000),
            (1u64..60_000, 1_000u64..100_000),
            (1u64..30_000, 1u64..30_000, 1u64..120_000),
            arb_conflict_policy(),
        )
            .prop_map(
                |((max_attempts, base_ms, extra_ms), (threshold, cool_down_ms), (negative, extra_ttl), (record_wait, creation_wait, lease), policy)| {
                    let mut config = StoreConfig::default();
                    config.retry = RetryConfig {
                        max_attempts,
                        base_ms,
                        cap_ms: base_ms + extra_ms,
                    };
                    config.circuit = CircuitConfig {
                        failure_threshold: threshold,
                        cool_down_ms,
                        state_ttl_ms: cool_down_ms * 2,
                    };
                    config.cache.negative_ttl_ms = negative;
                    config.cache.record_ttl_ms = negative + extra_ttl;
                    config.cache.index_ttl_ms = negative + extra_ttl;
                    config.locks = LockConfig {
                        record_wait_ms: record_wait,
                        creation_wait_ms: creation_wait,
                        lease_ms: lease,
                    };
                    config.conflict_policy = policy;
                    config
                },
            )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    use super::*;
    use serde_json::{json, Map};
    use std::sync::Arc;

    /// 2024-01-01T00:00:00Z, the start of every fixture clock.
    pub fn fixed_time() -> Timestamp {
        Timestamp::from_timestamp_millis(1_704_067_200_000).unwrap_or_default()
    }

    /// Defaults with sleep-free retries and short lock waits.
    pub fn fast_config() -> StoreConfig {
        let mut config = StoreConfig::default();
        config.retry = RetryConfig {
            max_attempts: 3,
            base_ms: 0,
            cap_ms: 0,
        };
        config.locks = LockConfig {
            record_wait_ms: 2_000,
            creation_wait_ms: 3_000,
            lease_ms: 30_000,
        };
        config
    }

    /// Payload `{"n": n}` at schema version 1.
    pub fn counter_payload(n: i64) -> Payload {
        let mut attributes = Map::new();
        attributes.insert("n".to_string(), json!(n));
        Payload::new(1, attributes)
    }

    /// Active record stamped one minute before [`fixed_time`].
    pub fn record(id: &str, owner: &str, payload: Payload) -> Record {
        Record::new(
            RecordId::from(id),
            OwnerKey::from(owner),
            payload,
            fixed_time() - chrono::Duration::minutes(1),
        )
    }

    /// In-memory substrates sharing one manual clock. Every gateway built
    /// from the same env behaves like a separate process on shared
    /// infrastructure.
    #[derive(Debug, Clone)]
    pub struct TestEnv {
        pub clock: Arc<ManualClock>,
        pub table: Arc<InMemoryTable>,
        pub cache: Arc<InMemoryCacheService>,
        pub locks: Arc<InMemoryLockService>,
        pub properties: Arc<InMemoryPropertyStore>,
        pub config: StoreConfig,
    }

    impl Default for TestEnv {
        fn default() -> Self {
            Self::with_config(fast_config())
        }
    }

    impl TestEnv {
        pub fn new() -> Self {
            Self::default()
        }

        /// Like [`new`](Self::new), but every table call yields first so
        /// concurrent gateways genuinely interleave.
        pub fn interleaved() -> Self {
            let env = Self::new();
            env.table.set_interleaving(true);
            env
        }

        pub fn with_config(config: StoreConfig) -> Self {
            let clock = Arc::new(ManualClock::new(fixed_time()));
            Self {
                table: Arc::new(InMemoryTable::new(config.table.sheet.clone())),
                cache: Arc::new(InMemoryCacheService::with_max_entry_bytes(
                    clock.clone(),
                    config.cache.max_entry_bytes,
                )),
                locks: Arc::new(InMemoryLockService::new(clock.clone())),
                properties: Arc::new(InMemoryPropertyStore::new(clock.clone())),
                clock,
                config,
            }
        }

        pub fn substrates(&self) -> Substrates {
            Substrates {
                table: self.table.clone(),
                cache: self.cache.clone(),
                locks: self.locks.clone(),
                properties: self.properties.clone(),
                clock: self.clock.clone(),
            }
        }

        /// A fresh gateway with its own process-local cache.
        pub fn gateway(&self) -> RecordGateway {
            RecordGateway::new(self.substrates(), self.config.clone())
                .expect("fixture config is valid")
        }

        /// Write records straight into the table, bypassing every cache.
        pub fn seed(&self, records: &[Record]) -> Vec<u32> {
            self.table.seed(records)
        }

        /// Seed one counter record and return it.
        pub fn seed_counter(&self, id: &str, owner: &str, n: i64) -> Record {
            let record = record(id, owner, counter_payload(n));
            self.table.seed(std::slice::from_ref(&record));
            record
        }

        /// The stored record with `id`, read directly from the table.
        pub fn stored(&self, id: &str) -> Option<Record> {
            self.table
                .records()
                .into_iter()
                .find(|r| r.id.as_str() == id)
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    use super::*;
    use rowkeep_core::LockError;

    pub fn assert_not_found<T: std::fmt::Debug>(result: &RowkeepResult<T>) {
        assert!(
            matches!(result, Err(RowkeepError::Storage(StorageError::NotFound { .. }))),
            "Expected NotFound, got {:?}",
            result
        );
    }

    pub fn assert_stale_conflict<T: std::fmt::Debug>(result: &RowkeepResult<T>) {
        assert!(
            matches!(
                result,
                Err(RowkeepError::Storage(StorageError::StaleCommitConflict { .. }))
            ),
            "Expected StaleCommitConflict, got {:?}",
            result
        );
    }

    pub fn assert_owner_taken<T: std::fmt::Debug>(result: &RowkeepResult<T>) {
        assert!(
            matches!(result, Err(RowkeepError::Storage(StorageError::OwnerTaken { .. }))),
            "Expected OwnerTaken, got {:?}",
            result
        );
    }

    pub fn assert_circuit_open<T: std::fmt::Debug>(result: &RowkeepResult<T>) {
        assert!(
            matches!(result, Err(RowkeepError::Remote(RemoteError::CircuitOpen { .. }))),
            "Expected CircuitOpen, got {:?}",
            result
        );
    }

    pub fn assert_quota_exceeded<T: std::fmt::Debug>(result: &RowkeepResult<T>) {
        assert!(
            matches!(result, Err(RowkeepError::Remote(RemoteError::QuotaExceeded { .. }))),
            "Expected QuotaExceeded, got {:?}",
            result
        );
    }

    pub fn assert_lock_timeout<T: std::fmt::Debug>(result: &RowkeepResult<T>) {
        assert!(
            matches!(result, Err(RowkeepError::Lock(LockError::Timeout { .. }))),
            "Expected lock Timeout, got {:?}",
            result
        );
    }

    /// The integer attribute `key` of a record's payload.
    pub fn payload_int(record: &Record, key: &str) -> i64 {
        record
            .payload
            .get(key)
            .and_then(|v| v.as_i64())
            .unwrap_or_else(|| panic!("payload has no integer {:?}: {:?}", key, record.payload))
    }
}
