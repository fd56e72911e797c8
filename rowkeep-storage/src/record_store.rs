//! Record-level access to the remote table.
//!
//! Reads go through the [`VersionedCache`]; writes go through the
//! [`BackoffClient`] and then bump the affected namespaces and warm the
//! cache with the value just written.

use crate::cache::{LogicalKey, Namespace, VersionedCache};
use crate::client::BackoffClient;
use crate::services::ValueRange;
use rowkeep_core::{
    truncate_millis, A1Range, CacheConfig, Clock, Column, OwnerKey, Record, RecordId, RemoteError,
    RowkeepResult, StorageError, StoredRow, Timestamp, FIRST_DATA_ROW,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

// ============================================================================
// ROW INDEX
// ============================================================================

/// Where each live record sits, built from one scan of columns `A:B`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowIndex {
    by_id: BTreeMap<RecordId, u32>,
    by_owner: BTreeMap<OwnerKey, RecordId>,
}

impl RowIndex {
    /// Build from `id, ownerKey` pairs whose first entry is at `first_row`.
    /// Blank ids are tombstones. A duplicated id or owner keeps its first row.
    pub fn from_rows(first_row: u32, rows: &[Vec<Value>]) -> Self {
        let mut index = Self::default();
        for (offset, cells) in rows.iter().enumerate() {
            let row = first_row + offset as u32;
            let Some(id) = cells.first().and_then(text) else {
                continue;
            };
            let id = RecordId::new(id);
            if index.by_id.contains_key(&id) {
                tracing::warn!(id = %id, row, "Duplicate record id in table, keeping first row");
                continue;
            }
            index.by_id.insert(id.clone(), row);

            if let Some(owner) = cells.get(1).and_then(text) {
                let owner = OwnerKey::new(owner);
                if !owner.is_empty() {
                    index.by_owner.entry(owner).or_insert(id);
                }
            }
        }
        index
    }

    pub fn row_of(&self, id: &RecordId) -> Option<u32> {
        self.by_id.get(id).copied()
    }

    pub fn owner_of(&self, owner: &OwnerKey) -> Option<&RecordId> {
        self.by_owner.get(owner)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

fn text(value: &Value) -> Option<String> {
    let s = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

// ============================================================================
// APPEND OUTCOME
// ============================================================================

/// Result of an idempotent append.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    Created(StoredRow),
    /// The owner key was already taken; nothing was written.
    Existing(StoredRow),
}

impl AppendOutcome {
    pub fn was_created(&self) -> bool {
        matches!(self, AppendOutcome::Created(_))
    }

    pub fn row(&self) -> &StoredRow {
        match self {
            AppendOutcome::Created(row) | AppendOutcome::Existing(row) => row,
        }
    }

    pub fn into_row(self) -> StoredRow {
        match self {
            AppendOutcome::Created(row) | AppendOutcome::Existing(row) => row,
        }
    }
}

// ============================================================================
// RECORD STORE
// ============================================================================

/// The fixed five-column record table.
#[derive(Debug, Clone)]
pub struct RecordStore {
    client: BackoffClient,
    cache: Arc<VersionedCache>,
    clock: Arc<dyn Clock>,
    sheet: String,
    ttls: CacheConfig,
}

impl RecordStore {
    pub fn new(
        client: BackoffClient,
        cache: Arc<VersionedCache>,
        clock: Arc<dyn Clock>,
        sheet: impl Into<String>,
        ttls: CacheConfig,
    ) -> Self {
        Self {
            client,
            cache,
            clock,
            sheet: sheet.into(),
            ttls,
        }
    }

    pub fn client(&self) -> &BackoffClient {
        &self.client
    }

    pub fn cache(&self) -> &VersionedCache {
        &self.cache
    }

    pub fn sheet(&self) -> &str {
        &self.sheet
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Load a record, failing with `NotFound` if it does not exist.
    pub async fn get(&self, id: &RecordId) -> RowkeepResult<StoredRow> {
        self.find(id)
            .await?
            .ok_or_else(|| StorageError::NotFound { id: id.clone() }.into())
    }

    /// Load a record if it exists. "Not found" is cached briefly.
    pub async fn find(&self, id: &RecordId) -> RowkeepResult<Option<StoredRow>> {
        let read = self
            .cache
            .get_or_fetch(&LogicalKey::Record(id.clone()), self.ttls.record_ttl(), || {
                self.fetch_record(id)
            })
            .await?;
        Ok(read.into_option())
    }

    /// A stale index is invalidated and rebuilt once before the id is
    /// reported missing, so a moved row is never cached as absent.
    async fn fetch_record(&self, id: &RecordId) -> RowkeepResult<Option<StoredRow>> {
        for rebuilt in [false, true] {
            let index = self.row_index().await?;
            let Some(row) = index.row_of(id) else {
                return Ok(None);
            };
            match self.read_row_uncached(row).await? {
                Some(stored) if stored.record.id == *id => return Ok(Some(stored)),
                other => {
                    tracing::warn!(
                        id = %id,
                        row,
                        rebuilt,
                        found = ?other.map(|s| s.record.id),
                        "Row index is stale, invalidating"
                    );
                    self.cache.bump_or_log(&Namespace::RecordIndex);
                }
            }
        }
        Ok(None)
    }

    /// Read one physical row straight from the table, bypassing the cache.
    pub async fn read_row_uncached(&self, row: u32) -> RowkeepResult<Option<StoredRow>> {
        let range = A1Range::full_row(&self.sheet, row);
        let cells = self
            .client
            .get(&range)
            .await?
            .values
            .into_iter()
            .next()
            .unwrap_or_default();
        Ok(Record::from_row(row, &cells)?.map(|record| StoredRow { row, record }))
    }

    /// Load several records with at most one `batch_get` for the cache
    /// misses. Ids that do not exist are left out of the result.
    pub async fn batch_get(
        &self,
        ids: &[RecordId],
    ) -> RowkeepResult<BTreeMap<RecordId, StoredRow>> {
        let ids: BTreeSet<&RecordId> = ids.iter().collect();
        let mut found = BTreeMap::new();
        let mut missing = Vec::new();

        for id in ids {
            let key = LogicalKey::Record(id.clone());
            let versioned = self.cache.resolve(&key).ok();
            if let Some(versioned) = &versioned {
                if let Some(hit) = self.cache.lookup_at::<StoredRow>(versioned).await {
                    if let Some(stored) = hit.into_option() {
                        found.insert(id.clone(), stored);
                    }
                    continue;
                }
            }
            missing.push((id.clone(), versioned));
        }
        if missing.is_empty() {
            return Ok(found);
        }

        let index = self.row_index().await?;
        let mut wanted = Vec::new();
        for (id, versioned) in missing {
            match index.row_of(&id) {
                Some(row) => wanted.push((id, row, versioned)),
                None => {
                    if let Some(versioned) = versioned {
                        self.cache
                            .put_at::<StoredRow>(&versioned, None, self.ttls.negative_ttl())
                            .await;
                    }
                }
            }
        }
        if wanted.is_empty() {
            return Ok(found);
        }

        let ranges: Vec<A1Range> = wanted
            .iter()
            .map(|(_, row, _)| A1Range::full_row(&self.sheet, *row))
            .collect();
        let results = self.client.batch_get(&ranges).await?;
        if results.len() != ranges.len() {
            return Err(RemoteError::MalformedResponse {
                operation: "batch_get".to_string(),
                reason: format!("asked for {} ranges, got {}", ranges.len(), results.len()),
            }
            .into());
        }

        for ((id, row, versioned), result) in wanted.into_iter().zip(results) {
            let cells = result.values.into_iter().next().unwrap_or_default();
            let stored = Record::from_row(row, &cells)?
                .filter(|record| record.id == id)
                .map(|record| StoredRow { row, record });
            if let Some(versioned) = versioned {
                self.cache
                    .put_at(&versioned, stored.as_ref(), self.ttls.record_ttl())
                    .await;
            }
            if let Some(stored) = stored {
                found.insert(id, stored);
            }
        }
        Ok(found)
    }

    /// Look up the record owning `owner`. The owner-to-id mapping is cached
    /// under the index namespace, including "no such owner".
    pub async fn find_by_owner(&self, owner: &OwnerKey) -> RowkeepResult<Option<StoredRow>> {
        let read = self
            .cache
            .get_or_fetch(&LogicalKey::Owner(owner.clone()), self.ttls.index_ttl(), || async {
                Ok(self.row_index().await?.owner_of(owner).cloned())
            })
            .await?;
        match read.into_option() {
            Some(id) => self.find(&id).await,
            None => Ok(None),
        }
    }

    /// The cached `id -> row` / `owner -> id` index.
    pub async fn row_index(&self) -> RowkeepResult<RowIndex> {
        let read = self
            .cache
            .get_or_fetch(&LogicalKey::RowIndex, self.ttls.index_ttl(), || async {
                let range =
                    A1Range::open_columns(&self.sheet, Column::Id, Column::OwnerKey, FIRST_DATA_ROW);
                let values = self.client.get(&range).await?.values;
                Ok(Some(RowIndex::from_rows(FIRST_DATA_ROW, &values)))
            })
            .await?;
        Ok(read.into_option().unwrap_or_default())
    }

    /// Every live record. Rows that fail to decode are logged and skipped.
    pub async fn scan(&self) -> RowkeepResult<Vec<StoredRow>> {
        let read = self
            .cache
            .get_or_fetch(&LogicalKey::Scan, self.ttls.index_ttl(), || async {
                let range = A1Range::open_columns(
                    &self.sheet,
                    Column::Id,
                    Column::LastModified,
                    FIRST_DATA_ROW,
                );
                let values = self.client.get(&range).await?.values;
                let mut rows = Vec::new();
                for (offset, cells) in values.iter().enumerate() {
                    let row = FIRST_DATA_ROW + offset as u32;
                    match Record::from_row(row, cells) {
                        Ok(Some(record)) => rows.push(StoredRow { row, record }),
                        Ok(None) => {}
                        Err(e) => tracing::warn!(row, error = %e, "Skipping undecodable row"),
                    }
                }
                Ok(Some(rows))
            })
            .await?;
        Ok(read.into_option().unwrap_or_default())
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Append a new record unless its owner key is already taken, in which
    /// case the existing record is returned and nothing is written.
    pub async fn append(&self, record: Record) -> RowkeepResult<AppendOutcome> {
        if let Some(existing) = self.find_by_owner(&record.owner_key).await? {
            tracing::debug!(
                id = %existing.record.id,
                "Owner already has a record, skipping append"
            );
            return Ok(AppendOutcome::Existing(existing));
        }

        let table = A1Range::open_columns(&self.sheet, Column::Id, Column::LastModified, 1);
        let result = self.client.append(&table, &[record.to_row()]).await?;
        let written = A1Range::parse(&result.updated_range).map_err(|e| {
            RemoteError::MalformedResponse {
                operation: "append".to_string(),
                reason: format!("updated range {:?}: {}", result.updated_range, e),
            }
        })?;

        let stored = StoredRow {
            row: written.start_row,
            record,
        };
        self.after_write(&stored, true).await;
        self.cache
            .put(
                &LogicalKey::Owner(stored.record.owner_key.clone()),
                &stored.record.id,
                self.ttls.index_ttl(),
            )
            .await;
        tracing::info!(id = %stored.record.id, row = stored.row, "Record appended");
        Ok(AppendOutcome::Created(stored))
    }

    /// Load `id` and apply `deltas` to it in one write.
    pub async fn batch_update(
        &self,
        id: &RecordId,
        deltas: &BTreeMap<Column, Value>,
    ) -> RowkeepResult<StoredRow> {
        let base = self.get(id).await?;
        self.apply_update(&base, deltas).await
    }

    /// Apply encoded cell changes on top of `base` with exactly one
    /// `batch_update` covering the span from the leftmost changed column to
    /// `lastModified`, which is always rewritten. Empty deltas write nothing.
    pub async fn apply_update(
        &self,
        base: &StoredRow,
        deltas: &BTreeMap<Column, Value>,
    ) -> RowkeepResult<StoredRow> {
        let Some(first) = deltas.keys().next().copied() else {
            return Ok(base.clone());
        };

        let mut record = base.record.clone();
        for (column, value) in deltas {
            if *column != Column::LastModified {
                record.apply_cell(*column, value)?;
            }
        }
        record.last_modified = self.next_stamp(base.record.last_modified);

        let span = A1Range::row_span(&self.sheet, base.row, first, Column::LastModified);
        let cells: Vec<Value> = Column::ALL[first.index()..]
            .iter()
            .map(|column| record.cell(*column))
            .collect();
        self.client
            .batch_update(&[ValueRange::new(span.clone(), vec![cells])])
            .await?;

        let stored = StoredRow {
            row: base.row,
            record,
        };
        let owner_changed = stored.record.owner_key != base.record.owner_key;
        self.after_write(&stored, owner_changed).await;
        tracing::debug!(
            id = %stored.record.id,
            range = %span,
            fields = deltas.len(),
            "Record updated"
        );
        Ok(stored)
    }

    /// Tombstone a record by blanking its row. Rows never shift, so the
    /// slot stays empty and the id is never reused.
    pub async fn delete(&self, id: &RecordId) -> RowkeepResult<()> {
        let base = self.get(id).await?;
        let span = A1Range::full_row(&self.sheet, base.row);
        let blanks = vec![Value::String(String::new()); Column::ALL.len()];
        self.client
            .batch_update(&[ValueRange::new(span, vec![blanks])])
            .await?;

        self.cache.bump_or_log(&Namespace::Record(id.clone()));
        self.cache.bump_or_log(&Namespace::Scan);
        self.cache.bump_or_log(&Namespace::RecordIndex);
        self.cache.put_absent(&LogicalKey::Record(id.clone())).await;
        tracing::info!(id = %id, row = base.row, "Record deleted");
        Ok(())
    }

    /// Bump a namespace, propagating property store failures.
    pub fn invalidate(&self, namespace: &Namespace) -> RowkeepResult<u64> {
        Ok(self.cache.bump(namespace)?)
    }

    /// `lastModified` for a write on top of `previous`: now, but strictly
    /// later than `previous` so a conflict check always sees the move.
    fn next_stamp(&self, previous: Timestamp) -> Timestamp {
        let now = truncate_millis(self.clock.now());
        if now > previous {
            now
        } else {
            previous + chrono::Duration::milliseconds(1)
        }
    }

    async fn after_write(&self, stored: &StoredRow, index_changed: bool) {
        let id = &stored.record.id;
        self.cache.bump_or_log(&Namespace::Record(id.clone()));
        self.cache.bump_or_log(&Namespace::Scan);
        if index_changed {
            self.cache.bump_or_log(&Namespace::RecordIndex);
        }
        self.cache
            .put(&LogicalKey::Record(id.clone()), stored, self.ttls.record_ttl())
            .await;
    }
}

// ============================================================================
// TESTS
// ============================================================================
