//! The surface business logic uses.
//!
//! [`RecordGateway`] wires the substrates into one client, cache, store,
//! and lock coordinator, and exposes record reads, locked transactions,
//! idempotent creation, and the administrative writes.

use crate::cache::{CacheStats, Namespace, VersionedCache};
use crate::client::{BackoffClient, SharedCircuitBreaker};
use crate::context::{CommitOutcome, ExecutionContext};
use crate::lock_coordinator::LockCoordinator;
use crate::record_store::RecordStore;
use crate::services::{CacheService, LockService, PropertyStore, TableApi};
use rowkeep_core::{
    CircuitPhase, Clock, Column, LockName, OwnerKey, Payload, Record, RecordId, RowkeepResult,
    StorageError, StoreConfig,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// The external collaborators a gateway runs on. Everything except the
/// clock must be shared between processes for cross-process guarantees.
#[derive(Clone)]
pub struct Substrates {
    pub table: Arc<dyn TableApi>,
    pub cache: Arc<dyn CacheService>,
    pub locks: Arc<dyn LockService>,
    pub properties: Arc<dyn PropertyStore>,
    pub clock: Arc<dyn Clock>,
}

/// Result of [`RecordGateway::create_record_if_absent`].
#[derive(Debug, Clone, PartialEq)]
pub struct Created {
    pub record: Record,
    /// False when the owner already had a record.
    pub created: bool,
}

#[derive(Debug)]
pub struct RecordGateway {
    store: RecordStore,
    locks: LockCoordinator,
    clock: Arc<dyn Clock>,
    config: StoreConfig,
}

impl RecordGateway {
    pub fn new(substrates: Substrates, config: StoreConfig) -> RowkeepResult<Self> {
        config.validate()?;

        let breaker = SharedCircuitBreaker::new(
            substrates.properties.clone(),
            substrates.clock.clone(),
            config.circuit.clone(),
        );
        let client = BackoffClient::new(substrates.table, breaker, config.retry.policy());
        let cache = Arc::new(VersionedCache::new(
            substrates.cache,
            substrates.properties,
            substrates.clock.clone(),
            config.cache.negative_ttl(),
        ));
        let store = RecordStore::new(
            client,
            cache,
            substrates.clock.clone(),
            config.table.sheet.clone(),
            config.cache.clone(),
        );
        let locks = LockCoordinator::new(
            substrates.locks,
            substrates.clock.clone(),
            config.locks.clone(),
        );

        tracing::info!(
            sheet = %config.table.sheet,
            conflict_policy = ?config.conflict_policy,
            "Record gateway ready"
        );
        Ok(Self {
            store,
            locks,
            clock: substrates.clock,
            config,
        })
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn locks(&self) -> &LockCoordinator {
        &self.locks
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Read one record. A missing record is `Ok(None)`.
    pub async fn read_record(&self, id: &RecordId) -> RowkeepResult<Option<Record>> {
        Ok(self.store.find(id).await?.map(|stored| stored.record))
    }

    /// Read several records; missing ids are absent from the map.
    pub async fn read_records(&self, ids: &[RecordId]) -> RowkeepResult<BTreeMap<RecordId, Record>> {
        Ok(self
            .store
            .batch_get(ids)
            .await?
            .into_iter()
            .map(|(id, stored)| (id, stored.record))
            .collect())
    }

    pub async fn find_by_owner(&self, owner: &OwnerKey) -> RowkeepResult<Option<Record>> {
        Ok(self
            .store
            .find_by_owner(owner)
            .await?
            .map(|stored| stored.record))
    }

    /// Every live record.
    pub async fn list_records(&self) -> RowkeepResult<Vec<Record>> {
        Ok(self
            .store
            .scan()
            .await?
            .into_iter()
            .map(|stored| stored.record)
            .collect())
    }

    // ------------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------------

    /// Run `f` against a fresh context for `id` under the record lock and
    /// commit its changes with at most one write before releasing.
    ///
    /// If `f` fails the context is discarded and nothing is written. A
    /// missing record fails with `NotFound`.
    pub async fn with_record_transaction<T, F>(&self, id: &RecordId, f: F) -> RowkeepResult<T>
    where
        F: FnOnce(&mut ExecutionContext) -> RowkeepResult<T>,
    {
        let name = LockName::record(id);
        let wait = self.config.locks.record_wait();
        self.locks
            .with_lock(name, wait, move || async move {
                let base = self.store.get(id).await?;
                let mut context = ExecutionContext::new(base);
                let value = match f(&mut context) {
                    Ok(value) => value,
                    Err(e) => {
                        let _ = context.discard();
                        tracing::debug!(id = %id, error = %e, "Transaction body failed, discarded");
                        return Err(e);
                    }
                };
                context
                    .commit(&self.store, self.config.conflict_policy)
                    .await?;
                Ok(value)
            })
            .await
    }

    /// Create a record for `owner` unless one exists. Concurrent calls for
    /// the same owner serialize on the creation lock and all receive the
    /// same record.
    pub async fn create_record_if_absent(
        &self,
        owner: &OwnerKey,
        payload: Payload,
    ) -> RowkeepResult<Created> {
        if owner.is_empty() {
            return Err(StorageError::InvalidCell {
                column: Column::OwnerKey,
                reason: "owner key is empty".to_string(),
            }
            .into());
        }
        if let Some(existing) = self.store.find_by_owner(owner).await? {
            return Ok(Created {
                record: existing.record,
                created: false,
            });
        }

        let name = LockName::creation(owner);
        let wait = self.config.locks.creation_wait();
        self.locks
            .with_lock(name, wait, move || async move {
                let record = Record::new(
                    RecordId::generate(),
                    owner.clone(),
                    payload,
                    self.clock.now(),
                );
                let outcome = self.store.append(record).await?;
                Ok(Created {
                    created: outcome.was_created(),
                    record: outcome.into_row().record,
                })
            })
            .await
    }

    /// Snapshot `id` into a context without locking. The caller owns any
    /// lock and commits with [`commit`](Self::commit).
    pub async fn begin(&self, id: &RecordId) -> RowkeepResult<ExecutionContext> {
        Ok(ExecutionContext::new(self.store.get(id).await?))
    }

    pub async fn commit(&self, context: &mut ExecutionContext) -> RowkeepResult<CommitOutcome> {
        context
            .commit(&self.store, self.config.conflict_policy)
            .await
    }

    // ------------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------------

    /// Move a record to a new owner key. Fails with `OwnerTaken` if another
    /// record already holds it.
    pub async fn set_owner_key(&self, id: &RecordId, owner: &OwnerKey) -> RowkeepResult<Record> {
        if owner.is_empty() {
            return Err(StorageError::InvalidCell {
                column: Column::OwnerKey,
                reason: "owner key is empty".to_string(),
            }
            .into());
        }

        let creation = self
            .locks
            .acquire(LockName::creation(owner), self.config.locks.creation_wait())
            .await?;
        let result = self.move_owner(id, owner).await;
        creation.release().await;
        result
    }

    async fn move_owner(&self, id: &RecordId, owner: &OwnerKey) -> RowkeepResult<Record> {
        if let Some(holder) = self.store.find_by_owner(owner).await? {
            if holder.record.id != *id {
                return Err(StorageError::OwnerTaken {
                    owner_key: owner.to_string(),
                    existing: holder.record.id,
                }
                .into());
            }
        }
        let record = self
            .with_record_transaction(id, |context| {
                context.set_owner_key(owner.clone())?;
                Ok(context.record().clone())
            })
            .await?;
        tracing::info!(id = %id, "Owner key changed");
        Ok(record)
    }

    /// Tombstone a record. The id is never reused.
    pub async fn delete_record(&self, id: &RecordId) -> RowkeepResult<()> {
        self.locks
            .with_lock(
                LockName::record(id),
                self.config.locks.record_wait(),
                || self.store.delete(id),
            )
            .await
    }

    /// Invalidate every cached key in `namespace`. Bumping
    /// [`Namespace::Records`] invalidates everything.
    pub fn invalidate_all(&self, namespace: &Namespace) -> RowkeepResult<u64> {
        let version = self.store.invalidate(namespace)?;
        tracing::info!(namespace = %namespace, version, "Cache namespace invalidated");
        Ok(version)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.store.cache().stats()
    }

    pub fn circuit_phase(&self) -> CircuitPhase {
        self.store.client().breaker().phase()
    }
}
