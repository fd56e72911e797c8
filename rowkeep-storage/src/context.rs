//! Pseudo-transactions over one record.
//!
//! An [`ExecutionContext`] holds a snapshot of one record and accumulates
//! field changes in memory. Reads through the context see pending changes.
//! [`commit`](ExecutionContext::commit) flushes everything with at most one
//! physical write.
//!
//! # State Transition Diagram
//!
//! ```text
//! Created ──mutate──→ Accumulating ──commit──→ Committed
//!    │                    │  └──commit fails──→ Accumulating
//!    │                    └──discard──→ Discarded
//!    ├──commit (nothing pending)──→ Committed
//!    └──discard──→ Discarded
//! ```

use crate::cache::Namespace;
use crate::record_store::RecordStore;
use rowkeep_core::{
    Column, ConflictPolicy, OwnerKey, Payload, PayloadSchema, Record, RecordId, RowkeepResult,
    StorageError, StoredRow,
};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Lifecycle of an [`ExecutionContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Created,
    Accumulating,
    Committed,
    Discarded,
}

impl ContextState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextState::Created => "created",
            ContextState::Accumulating => "accumulating",
            ContextState::Committed => "committed",
            ContextState::Discarded => "discarded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ContextState::Committed | ContextState::Discarded)
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters for one context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    /// Mutator calls, including ones that ended up changing nothing.
    pub mutations: u32,
    /// Distinct columns touched by any mutator.
    pub distinct_fields: usize,
    /// Physical writes issued. Never more than one.
    pub writes: u32,
}

/// What a commit did.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// Nothing was pending; no write was issued.
    Unchanged,
    Written(StoredRow),
}

impl CommitOutcome {
    pub fn wrote(&self) -> bool {
        matches!(self, CommitOutcome::Written(_))
    }
}

/// In-memory accumulator over one record snapshot.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    base: StoredRow,
    working: Record,
    pending: BTreeMap<Column, Value>,
    touched: BTreeSet<Column>,
    state: ContextState,
    stats: ContextStats,
}

impl ExecutionContext {
    pub fn new(base: StoredRow) -> Self {
        Self {
            working: base.record.clone(),
            base,
            pending: BTreeMap::new(),
            touched: BTreeSet::new(),
            state: ContextState::Created,
            stats: ContextStats::default(),
        }
    }

    pub fn id(&self) -> &RecordId {
        &self.base.record.id
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    /// The snapshot the context was built from.
    pub fn base(&self) -> &StoredRow {
        &self.base
    }

    /// The record with pending changes applied.
    pub fn record(&self) -> &Record {
        &self.working
    }

    pub fn is_dirty(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_columns(&self) -> impl Iterator<Item = Column> + '_ {
        self.pending.keys().copied()
    }

    pub fn stats(&self) -> ContextStats {
        self.stats
    }

    /// Typed view of the working payload.
    pub fn typed<T: PayloadSchema>(&self) -> Result<T, StorageError> {
        self.working.payload.typed()
    }

    // ------------------------------------------------------------------------
    // Mutators
    // ------------------------------------------------------------------------

    pub fn set_active(&mut self, active: bool) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.working.is_active = active;
        self.stage(Column::IsActive);
        Ok(())
    }

    /// Edit the working payload in place.
    pub fn update_payload<F>(&mut self, edit: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut Payload),
    {
        self.ensure_open()?;
        edit(&mut self.working.payload);
        self.stage(Column::Payload);
        Ok(())
    }

    pub fn set_payload_field(
        &mut self,
        key: impl Into<String>,
        value: Value,
    ) -> Result<(), StorageError> {
        self.update_payload(|payload| payload.set(key, value))
    }

    pub fn remove_payload_field(&mut self, key: &str) -> Result<(), StorageError> {
        self.update_payload(|payload| {
            payload.remove(key);
        })
    }

    /// Edit the payload through its typed schema. The payload is migrated
    /// on read and written back at the schema's current version.
    pub fn update_typed<T, F>(&mut self, edit: F) -> Result<(), StorageError>
    where
        T: PayloadSchema,
        F: FnOnce(&mut T),
    {
        self.ensure_open()?;
        let mut typed: T = self.working.payload.typed()?;
        edit(&mut typed);
        self.working.payload.set_typed(&typed)?;
        self.stage(Column::Payload);
        Ok(())
    }

    /// Administrative: owner keys are otherwise immutable.
    pub(crate) fn set_owner_key(&mut self, owner: OwnerKey) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.working.owner_key = owner;
        self.stage(Column::OwnerKey);
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.state.is_terminal() {
            return Err(StorageError::ContextState {
                id: self.id().clone(),
                state: self.state.to_string(),
                expected: "created or accumulating".to_string(),
            });
        }
        Ok(())
    }

    /// Record the working value of `column` as pending, or drop it if it
    /// is back to the snapshot value.
    fn stage(&mut self, column: Column) {
        self.state = ContextState::Accumulating;
        self.stats.mutations += 1;
        self.touched.insert(column);
        self.stats.distinct_fields = self.touched.len();

        let value = self.working.cell(column);
        if value == self.base.record.cell(column) {
            self.pending.remove(&column);
        } else {
            self.pending.insert(column, value);
        }
    }

    // ------------------------------------------------------------------------
    // Commit
    // ------------------------------------------------------------------------

    /// Flush pending changes with one write. With nothing pending this
    /// issues no call at all. A failed write leaves the context
    /// accumulating with its changes intact.
    pub async fn commit(
        &mut self,
        store: &RecordStore,
        policy: ConflictPolicy,
    ) -> RowkeepResult<CommitOutcome> {
        self.ensure_open()?;

        if self.pending.is_empty() {
            self.state = ContextState::Committed;
            tracing::debug!(
                id = %self.id(),
                mutations = self.stats.mutations,
                "No pending changes, skipping write"
            );
            return Ok(CommitOutcome::Unchanged);
        }

        if policy == ConflictPolicy::Detect {
            self.check_conflict(store).await?;
        }

        let stored = store.apply_update(&self.base, &self.pending).await?;
        self.stats.writes += 1;
        let fields = self.pending.len();
        self.pending.clear();
        self.working = stored.record.clone();
        self.base = stored.clone();
        self.state = ContextState::Committed;

        tracing::info!(
            id = %self.id(),
            fields,
            mutations = self.stats.mutations,
            "Context committed"
        );
        Ok(CommitOutcome::Written(stored))
    }

    /// Drop pending changes. Nothing was written, so there is nothing to
    /// undo remotely.
    pub fn discard(&mut self) -> Result<(), StorageError> {
        if self.state == ContextState::Committed {
            return Err(StorageError::ContextState {
                id: self.id().clone(),
                state: self.state.to_string(),
                expected: "not committed".to_string(),
            });
        }
        self.pending.clear();
        self.working = self.base.record.clone();
        self.state = ContextState::Discarded;
        Ok(())
    }

    /// Fail if the row moved since the snapshot. The cached copy is
    /// invalidated so a retry re-reads the current row.
    async fn check_conflict(&self, store: &RecordStore) -> RowkeepResult<()> {
        let current = store.read_row_uncached(self.base.row).await?;
        let expected = self.base.record.last_modified;
        let found = current
            .as_ref()
            .filter(|row| row.record.id == *self.id())
            .map(|row| row.record.last_modified);
        if found == Some(expected) {
            return Ok(());
        }

        tracing::warn!(
            id = %self.id(),
            row = self.base.row,
            expected = %expected,
            found = ?found,
            "Stale commit detected"
        );
        store.cache().bump_or_log(&Namespace::Record(self.id().clone()));
        if found.is_none() {
            store.cache().bump_or_log(&Namespace::RecordIndex);
        }
        Err(StorageError::StaleCommitConflict {
            id: self.id().clone(),
            expected: Some(expected),
            found,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::VersionedCache;
    use crate::client::{BackoffClient, SharedCircuitBreaker};
    use crate::memory::{InMemoryCacheService, InMemoryPropertyStore, InMemoryTable};
    use crate::services::RemoteStatus;
    use proptest::prelude::*;
    use rowkeep_core::{
        CacheConfig, CircuitConfig, Clock, ManualClock, RetryPolicy, RowkeepError,
    };
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    struct Harness {
        clock: Arc<ManualClock>,
        table: Arc<InMemoryTable>,
        store: RecordStore,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::default());
        let table = Arc::new(InMemoryTable::new("Records"));
        let properties = Arc::new(InMemoryPropertyStore::new(clock.clone()));
        let breaker =
            SharedCircuitBreaker::new(properties.clone(), clock.clone(), CircuitConfig::default());
        let client = BackoffClient::new(table.clone(), breaker, RetryPolicy::immediate(1));
        let cache = Arc::new(VersionedCache::new(
            Arc::new(InMemoryCacheService::new(clock.clone())),
            properties,
            clock.clone(),
            Duration::from_secs(30),
        ));
        let store = RecordStore::new(client, cache, clock.clone(), "Records", CacheConfig::default());
        Harness {
            clock,
            table,
            store,
        }
    }

    fn seeded(h: &Harness) -> StoredRow {
        let mut payload = Payload::default();
        payload.set("n", json!(0));
        let record = Record::new(
            RecordId::from("u1"),
            OwnerKey::from("a@x.com"),
            payload,
            h.clock.now(),
        );
        let rows = h.table.seed(&[record.clone()]);
        StoredRow {
            row: rows[0],
            record,
        }
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    #[serde(default)]
    struct Counter {
        n: i64,
    }

    impl PayloadSchema for Counter {
        const VERSION: u32 = 1;
    }

    #[test]
    fn test_reads_see_pending_changes() {
        let h = harness();
        let mut ctx = ExecutionContext::new(seeded(&h));
        assert_eq!(ctx.state(), ContextState::Created);

        ctx.set_payload_field("n", json!(4)).unwrap();
        ctx.set_active(false).unwrap();

        assert_eq!(ctx.state(), ContextState::Accumulating);
        assert_eq!(ctx.record().payload.get("n"), Some(&json!(4)));
        assert!(!ctx.record().is_active);
        assert!(ctx.base().record.is_active);
        assert_eq!(
            ctx.pending_columns().collect::<Vec<_>>(),
            vec![Column::IsActive, Column::Payload]
        );
    }

    #[test]
    fn test_reverting_a_change_clears_it() {
        let h = harness();
        let mut ctx = ExecutionContext::new(seeded(&h));
        ctx.set_active(false).unwrap();
        ctx.set_active(true).unwrap();

        assert!(!ctx.is_dirty());
        assert_eq!(ctx.stats().mutations, 2);
        assert_eq!(ctx.stats().distinct_fields, 1);
    }

    #[tokio::test]
    async fn test_many_changes_one_write() {
        let h = harness();
        let mut ctx = ExecutionContext::new(seeded(&h));
        for i in 1..=10 {
            ctx.set_payload_field(format!("k{}", i), json!(i)).unwrap();
        }
        ctx.set_active(false).unwrap();
        h.table.clear_calls();

        let outcome = ctx.commit(&h.store, ConflictPolicy::Detect).await.unwrap();

        assert!(outcome.wrote());
        assert_eq!(h.table.write_calls(), 1);
        assert_eq!(ctx.state(), ContextState::Committed);
        assert_eq!(ctx.stats().writes, 1);
        let stored = &h.table.records()[0];
        assert_eq!(stored.payload.get("k10"), Some(&json!(10)));
        assert!(!stored.is_active);
    }

    #[tokio::test]
    async fn test_noop_commit_makes_no_calls() {
        let h = harness();
        let mut ctx = ExecutionContext::new(seeded(&h));
        ctx.set_payload_field("n", json!(0)).unwrap();
        h.table.clear_calls();

        let outcome = ctx.commit(&h.store, ConflictPolicy::Detect).await.unwrap();

        assert_eq!(outcome, CommitOutcome::Unchanged);
        assert_eq!(h.table.total_calls(), 0);
        assert_eq!(ctx.state(), ContextState::Committed);
    }

    #[tokio::test]
    async fn test_failed_write_keeps_context_open() {
        let h = harness();
        let mut ctx = ExecutionContext::new(seeded(&h));
        ctx.set_payload_field("n", json!(1)).unwrap();

        h.table.fail_next(RemoteStatus::new(500, "backend error"));
        let err = ctx
            .commit(&h.store, ConflictPolicy::Overwrite)
            .await
            .unwrap_err();

        assert!(matches!(err, RowkeepError::Remote(_)));
        assert_eq!(ctx.state(), ContextState::Accumulating);
        assert!(ctx.is_dirty());

        let outcome = ctx.commit(&h.store, ConflictPolicy::Detect).await.unwrap();
        assert!(outcome.wrote());
        assert_eq!(h.table.records()[0].payload.get("n"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_stale_snapshot_is_a_conflict() {
        let h = harness();
        let base = seeded(&h);
        let mut ctx = ExecutionContext::new(base.clone());
        ctx.set_payload_field("n", json!(1)).unwrap();

        // Another writer commits first.
        h.clock.advance(Duration::from_secs(1));
        let mut other = ExecutionContext::new(base);
        other.set_payload_field("n", json!(9)).unwrap();
        other.commit(&h.store, ConflictPolicy::Detect).await.unwrap();

        let err = ctx.commit(&h.store, ConflictPolicy::Detect).await.unwrap_err();
        assert!(matches!(
            err,
            RowkeepError::Storage(StorageError::StaleCommitConflict { .. })
        ));
        assert_eq!(ctx.state(), ContextState::Accumulating);
        assert_eq!(h.table.records()[0].payload.get("n"), Some(&json!(9)));

        // Overwrite skips the check.
        ctx.commit(&h.store, ConflictPolicy::Overwrite).await.unwrap();
        assert_eq!(h.table.records()[0].payload.get("n"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_terminal_states_reject_mutation() {
        let h = harness();
        let mut ctx = ExecutionContext::new(seeded(&h));
        ctx.commit(&h.store, ConflictPolicy::Detect).await.unwrap();

        assert!(matches!(
            ctx.set_active(false),
            Err(StorageError::ContextState { .. })
        ));
        assert!(ctx.discard().is_err());
        assert!(ctx.commit(&h.store, ConflictPolicy::Detect).await.is_err());

        let mut discarded = ExecutionContext::new(seeded(&h));
        discarded.set_active(false).unwrap();
        discarded.discard().unwrap();
        assert!(discarded.record().is_active);
        assert_eq!(discarded.state(), ContextState::Discarded);
    }

    #[test]
    fn test_update_typed_writes_schema_version() {
        let h = harness();
        let mut ctx = ExecutionContext::new(seeded(&h));
        ctx.update_typed::<Counter, _>(|c| c.n += 1).unwrap();

        assert_eq!(ctx.typed::<Counter>().unwrap().n, 1);
        assert_eq!(ctx.record().payload.schema_version, 1);
        assert!(ctx.is_dirty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_pending_matches_diff_from_base(
            ops in prop::collection::vec((any::<bool>(), 0i64..3), 0..20)
        ) {
            let h = harness();
            let mut ctx = ExecutionContext::new(seeded(&h));
            for (active, n) in &ops {
                ctx.set_active(*active).unwrap();
                ctx.set_payload_field("n", json!(n)).unwrap();
            }

            for column in Column::ALL {
                let differs = ctx.record().cell(column) != ctx.base().record.cell(column);
                prop_assert_eq!(differs, ctx.pending_columns().any(|c| c == column));
            }
            prop_assert_eq!(ctx.stats().mutations as usize, ops.len() * 2);
        }
    }
}
