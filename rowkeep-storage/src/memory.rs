//! In-memory substrates.
//!
//! These back tests and single-process deployments. Wrap each in an `Arc`
//! and hand clones to several gateways to model separate processes that
//! share the same remote table, cache service, lock service, and property
//! store.

use crate::services::{
    AppendResult, CacheService, LockService, PropertyStore, RemoteStatus, TableApi, ValueRange,
};
use async_trait::async_trait;
use rowkeep_core::{
    A1Range, CacheError, Clock, Column, LockError, Record, DEFAULT_MAX_ENTRY_BYTES,
};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

/// How often a lock waiter re-checks for leases that expired without a
/// release.
const LEASE_POLL_INTERVAL: Duration = Duration::from_millis(20);

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn blank() -> Value {
    Value::String(String::new())
}

fn is_blank(cell: &Value) -> bool {
    match cell {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

// ============================================================================
// TABLE
// ============================================================================

/// One call observed by [`InMemoryTable`].
#[derive(Debug, Clone, PartialEq)]
pub enum TableCall {
    Get(A1Range),
    BatchGet(Vec<A1Range>),
    Append(A1Range),
    BatchUpdate(Vec<A1Range>),
}

impl TableCall {
    pub fn is_write(&self) -> bool {
        matches!(self, TableCall::Append(_) | TableCall::BatchUpdate(_))
    }
}

/// A successful write, in the order the table applied it.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteLogEntry {
    pub sequence: u64,
    pub ranges: Vec<A1Range>,
    pub values: Vec<Vec<Vec<Value>>>,
}

#[derive(Debug)]
struct TableState {
    /// `rows[0]` is row 1 (the header).
    rows: Vec<Vec<Value>>,
    calls: Vec<TableCall>,
    scripted: VecDeque<RemoteStatus>,
    write_log: Vec<WriteLogEntry>,
}

/// A remote table held in memory, with call accounting and scripted
/// failures.
///
/// By default every call completes without suspending. With
/// [`set_interleaving`](Self::set_interleaving) each call yields to the
/// scheduler before it touches the table, so concurrent callers interleave
/// the way they would against a real network service.
#[derive(Debug)]
pub struct InMemoryTable {
    sheet: String,
    state: Mutex<TableState>,
    interleave: AtomicBool,
}

impl InMemoryTable {
    /// An empty sheet with the header row already written.
    pub fn new(sheet: impl Into<String>) -> Self {
        let header = Column::ALL
            .iter()
            .map(|c| Value::String(c.header().to_string()))
            .collect();
        Self {
            sheet: sheet.into(),
            state: Mutex::new(TableState {
                rows: vec![header],
                calls: Vec::new(),
                scripted: VecDeque::new(),
                write_log: Vec::new(),
            }),
            interleave: AtomicBool::new(false),
        }
    }

    pub fn sheet(&self) -> &str {
        &self.sheet
    }

    /// Write records directly below the current data without recording a
    /// call. Returns the rows used.
    pub fn seed(&self, records: &[Record]) -> Vec<u32> {
        let mut state = guard(&self.state);
        records
            .iter()
            .map(|record| {
                state.rows.push(record.to_row());
                state.rows.len() as u32
            })
            .collect()
    }

    /// Overwrite one cell out of band, as another writer would.
    pub fn set_cell(&self, row: u32, column: Column, value: Value) {
        let mut state = guard(&self.state);
        write_cell(&mut state.rows, row as usize, column.index(), value);
    }

    /// Snapshot of one physical row, padded to five cells.
    pub fn row(&self, row: u32) -> Vec<Value> {
        let state = guard(&self.state);
        let mut cells = (row as usize)
            .checked_sub(1)
            .and_then(|i| state.rows.get(i))
            .cloned()
            .unwrap_or_default();
        cells.resize(Column::ALL.len(), blank());
        cells
    }

    /// Number of physical rows, header included.
    pub fn row_count(&self) -> u32 {
        guard(&self.state).rows.len() as u32
    }

    /// Decode every live record, in row order.
    pub fn records(&self) -> Vec<Record> {
        let state = guard(&self.state);
        state
            .rows
            .iter()
            .enumerate()
            .skip(1)
            .filter_map(|(i, cells)| Record::from_row(i as u32 + 1, cells).ok().flatten())
            .collect()
    }

    pub fn calls(&self) -> Vec<TableCall> {
        guard(&self.state).calls.clone()
    }

    pub fn write_calls(&self) -> usize {
        guard(&self.state).calls.iter().filter(|c| c.is_write()).count()
    }

    pub fn read_calls(&self) -> usize {
        guard(&self.state).calls.iter().filter(|c| !c.is_write()).count()
    }

    pub fn total_calls(&self) -> usize {
        guard(&self.state).calls.len()
    }

    pub fn clear_calls(&self) {
        guard(&self.state).calls.clear();
    }

    pub fn write_log(&self) -> Vec<WriteLogEntry> {
        guard(&self.state).write_log.clone()
    }

    /// Fail the next call with `status`.
    pub fn fail_next(&self, status: RemoteStatus) {
        self.fail_next_times(1, status);
    }

    /// Fail the next `times` calls with `status`.
    pub fn fail_next_times(&self, times: usize, status: RemoteStatus) {
        let mut state = guard(&self.state);
        for _ in 0..times {
            state.scripted.push_back(status.clone());
        }
    }

    pub fn pending_failures(&self) -> usize {
        guard(&self.state).scripted.len()
    }

    /// Yield before every call when `on`.
    pub fn set_interleaving(&self, on: bool) {
        self.interleave.store(on, Ordering::SeqCst);
    }

    async fn in_flight(&self) {
        if self.interleave.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
    }

    fn admit(&self, state: &mut TableState, call: TableCall) -> Result<(), RemoteStatus> {
        let ranges: Vec<&A1Range> = match &call {
            TableCall::Get(r) | TableCall::Append(r) => vec![r],
            TableCall::BatchGet(rs) | TableCall::BatchUpdate(rs) => rs.iter().collect(),
        };
        state.calls.push(call.clone());
        if let Some(status) = state.scripted.pop_front() {
            return Err(status);
        }
        for range in ranges {
            if range.sheet != self.sheet {
                return Err(RemoteStatus::new(
                    400,
                    format!("Unable to parse range: {}", range),
                ));
            }
            if range.start_row == 0 {
                return Err(RemoteStatus::new(400, format!("Invalid range: {}", range)));
            }
        }
        Ok(())
    }
}

fn write_cell(rows: &mut Vec<Vec<Value>>, row: usize, col: usize, value: Value) {
    if rows.len() < row {
        rows.resize(row, Vec::new());
    }
    let cells = &mut rows[row - 1];
    if cells.len() <= col {
        cells.resize(col + 1, blank());
    }
    cells[col] = value;
}

fn read_range(rows: &[Vec<Value>], range: &A1Range) -> Vec<Vec<Value>> {
    let start = range.start_row as usize;
    let end = range.end_row.map(|r| r as usize).unwrap_or(rows.len()).min(rows.len());
    let cols = range.start_column.index()..=range.end_column.index();

    let mut values: Vec<Vec<Value>> = (start..=end)
        .map(|r| {
            let cells = &rows[r - 1];
            let mut slice: Vec<Value> = cols
                .clone()
                .map(|c| cells.get(c).cloned().unwrap_or_else(blank))
                .collect();
            while slice.last().is_some_and(is_blank) {
                slice.pop();
            }
            slice
        })
        .collect();
    while values.last().is_some_and(|row| row.is_empty()) {
        values.pop();
    }
    values
}

#[async_trait]
impl TableApi for InMemoryTable {
    async fn get(&self, range: &A1Range) -> Result<ValueRange, RemoteStatus> {
        self.in_flight().await;
        let mut state = guard(&self.state);
        self.admit(&mut state, TableCall::Get(range.clone()))?;
        Ok(ValueRange::new(range.clone(), read_range(&state.rows, range)))
    }

    async fn batch_get(&self, ranges: &[A1Range]) -> Result<Vec<ValueRange>, RemoteStatus> {
        self.in_flight().await;
        let mut state = guard(&self.state);
        self.admit(&mut state, TableCall::BatchGet(ranges.to_vec()))?;
        Ok(ranges
            .iter()
            .map(|r| ValueRange::new(r.clone(), read_range(&state.rows, r)))
            .collect())
    }

    async fn append(
        &self,
        range: &A1Range,
        rows: &[Vec<Value>],
    ) -> Result<AppendResult, RemoteStatus> {
        self.in_flight().await;
        let mut state = guard(&self.state);
        self.admit(&mut state, TableCall::Append(range.clone()))?;

        let width = rows.iter().map(Vec::len).max().unwrap_or(0).max(1);
        let end_column = Column::from_index(range.start_column.index() + width - 1)
            .ok_or_else(|| RemoteStatus::new(400, "append is wider than the table"))?;

        let last_used = state
            .rows
            .iter()
            .rposition(|cells| cells.iter().any(|c| !is_blank(c)))
            .map(|i| i + 1)
            .unwrap_or(0);
        let first = last_used + 1;

        for (offset, cells) in rows.iter().enumerate() {
            for (c, value) in cells.iter().enumerate() {
                write_cell(
                    &mut state.rows,
                    first + offset,
                    range.start_column.index() + c,
                    value.clone(),
                );
            }
        }

        let written = A1Range {
            sheet: self.sheet.clone(),
            start_column: range.start_column,
            start_row: first as u32,
            end_column,
            end_row: Some((first + rows.len().max(1) - 1) as u32),
        };
        let sequence = state.write_log.len() as u64 + 1;
        state.write_log.push(WriteLogEntry {
            sequence,
            ranges: vec![written.clone()],
            values: vec![rows.to_vec()],
        });

        Ok(AppendResult {
            updated_range: written.to_string(),
            updated_rows: rows.len() as u32,
        })
    }

    async fn batch_update(&self, updates: &[ValueRange]) -> Result<u32, RemoteStatus> {
        self.in_flight().await;
        let mut state = guard(&self.state);
        self.admit(
            &mut state,
            TableCall::BatchUpdate(updates.iter().map(|u| u.range.clone()).collect()),
        )?;

        for update in updates {
            let fits_width = update.values.iter().all(|r| r.len() <= update.range.width());
            let fits_height = match update.range.height() {
                Some(h) => update.values.len() <= h as usize,
                None => true,
            };
            if !fits_width || !fits_height {
                return Err(RemoteStatus::new(
                    400,
                    format!("Requested writing outside of range {}", update.range),
                ));
            }
        }

        let mut cells = 0u32;
        for update in updates {
            for (r, row) in update.values.iter().enumerate() {
                for (c, value) in row.iter().enumerate() {
                    write_cell(
                        &mut state.rows,
                        update.range.start_row as usize + r,
                        update.range.start_column.index() + c,
                        value.clone(),
                    );
                    cells += 1;
                }
            }
        }

        let sequence = state.write_log.len() as u64 + 1;
        state.write_log.push(WriteLogEntry {
            sequence,
            ranges: updates.iter().map(|u| u.range.clone()).collect(),
            values: updates.iter().map(|u| u.values.clone()).collect(),
        });
        Ok(cells)
    }
}

// ============================================================================
// CACHE SERVICE
// ============================================================================

#[derive(Debug)]
struct CachedBytes {
    bytes: Vec<u8>,
    expires_at_ms: i64,
}

/// TTL cache with a per-entry size limit and switchable failure mode.
#[derive(Debug)]
pub struct InMemoryCacheService {
    entries: Mutex<HashMap<String, CachedBytes>>,
    clock: Arc<dyn Clock>,
    max_entry_bytes: usize,
    failing: AtomicBool,
    puts: AtomicU64,
}

impl InMemoryCacheService {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_max_entry_bytes(clock, DEFAULT_MAX_ENTRY_BYTES)
    }

    pub fn with_max_entry_bytes(clock: Arc<dyn Clock>, max_entry_bytes: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            max_entry_bytes,
            failing: AtomicBool::new(false),
            puts: AtomicU64::new(0),
        }
    }

    /// Make every call fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Successful puts so far.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    /// Live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        guard(&self.entries)
            .values()
            .filter(|e| e.expires_at_ms > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CacheError::Backend {
                reason: "cache service unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CacheService for InMemoryCacheService {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.check()?;
        let now = self.clock.now_ms();
        let mut entries = guard(&self.entries);
        match entries.get(key) {
            Some(entry) if entry.expires_at_ms > now => Ok(Some(entry.bytes.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        self.check()?;
        if value.len() > self.max_entry_bytes {
            return Err(CacheError::Backend {
                reason: format!(
                    "argument too large: {} bytes exceeds {}",
                    value.len(),
                    self.max_entry_bytes
                ),
            });
        }
        let expires_at_ms = self.clock.now_ms() + ttl.as_millis() as i64;
        guard(&self.entries).insert(
            key.to_string(),
            CachedBytes {
                bytes: value,
                expires_at_ms,
            },
        );
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.check()?;
        guard(&self.entries).remove(key);
        Ok(())
    }

    fn max_entry_bytes(&self) -> usize {
        self.max_entry_bytes
    }
}

// ============================================================================
// LOCK SERVICE
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct HeldLease {
    holder: Uuid,
    expires_at_ms: i64,
}

/// Named leases with bounded waits. Lease expiry follows the injected
/// clock; wait bounds follow tokio time.
#[derive(Debug)]
pub struct InMemoryLockService {
    leases: Mutex<HashMap<String, HeldLease>>,
    released: Notify,
    clock: Arc<dyn Clock>,
}

impl InMemoryLockService {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            released: Notify::new(),
            clock,
        }
    }

    pub fn is_held(&self, name: &str) -> bool {
        let now = self.clock.now_ms();
        guard(&self.leases)
            .get(name)
            .is_some_and(|l| l.expires_at_ms > now)
    }

    fn try_take(&self, name: &str, holder: Uuid, lease: Duration) -> bool {
        let now = self.clock.now_ms();
        let mut leases = guard(&self.leases);
        let free = match leases.get(name) {
            None => true,
            Some(current) => current.expires_at_ms <= now || current.holder == holder,
        };
        if free {
            leases.insert(
                name.to_string(),
                HeldLease {
                    holder,
                    expires_at_ms: now + lease.as_millis() as i64,
                },
            );
        }
        free
    }
}

#[async_trait]
impl LockService for InMemoryLockService {
    async fn try_acquire(
        &self,
        name: &str,
        holder: Uuid,
        wait: Duration,
        lease: Duration,
    ) -> Result<bool, LockError> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_take(name, holder, lease) {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let _ = tokio::time::timeout((deadline - now).min(LEASE_POLL_INTERVAL), notified).await;
        }
    }

    async fn release(&self, name: &str, holder: Uuid) -> Result<(), LockError> {
        let removed = {
            let mut leases = guard(&self.leases);
            match leases.get(name) {
                Some(current) if current.holder == holder => leases.remove(name).is_some(),
                _ => false,
            }
        };
        if removed {
            self.released.notify_waiters();
        } else {
            tracing::debug!(lock = name, holder = %holder, "Release ignored, lease not held");
        }
        Ok(())
    }
}

// ============================================================================
// PROPERTY STORE
// ============================================================================

#[derive(Debug, Clone)]
struct Property {
    value: String,
    expires_at_ms: Option<i64>,
}

/// Synchronous string properties with optional TTL.
#[derive(Debug)]
pub struct InMemoryPropertyStore {
    values: Mutex<HashMap<String, Property>>,
    clock: Arc<dyn Clock>,
    failing: AtomicBool,
}

impl InMemoryPropertyStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            clock,
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CacheError::Property {
                reason: "property store unavailable".to_string(),
            });
        }
        Ok(())
    }

    fn live<'a>(&self, values: &'a HashMap<String, Property>, key: &str) -> Option<&'a Property> {
        let now = self.clock.now_ms();
        values
            .get(key)
            .filter(|p| p.expires_at_ms.map_or(true, |exp| exp > now))
    }
}

impl PropertyStore for InMemoryPropertyStore {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.check()?;
        let values = guard(&self.values);
        Ok(self.live(&values, key).map(|p| p.value.clone()))
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.check()?;
        let expires_at_ms = ttl.map(|t| self.clock.now_ms() + t.as_millis() as i64);
        guard(&self.values).insert(
            key.to_string(),
            Property {
                value: value.to_string(),
                expires_at_ms,
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.check()?;
        guard(&self.values).remove(key);
        Ok(())
    }

    fn increment_with_ttl(&self, key: &str, ttl: Option<Duration>) -> Result<u64, CacheError> {
        self.check()?;
        let mut values = guard(&self.values);
        let (current, kept_expiry) = match self.live(&values, key) {
            Some(p) => (
                p.value.parse::<u64>().map_err(|e| CacheError::Property {
                    reason: format!("{} is not a counter: {}", key, e),
                })?,
                p.expires_at_ms,
            ),
            None => (0, None),
        };
        let next = current + 1;
        let expires_at_ms = match ttl {
            Some(ttl) => Some(self.clock.now_ms() + ttl.as_millis() as i64),
            None => kept_expiry,
        };
        values.insert(
            key.to_string(),
            Property {
                value: next.to_string(),
                expires_at_ms,
            },
        );
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowkeep_core::{ManualClock, OwnerKey, Payload, RecordId};
    use serde_json::json;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::default())
    }

    fn record(id: &str, owner: &str) -> Record {
        Record::new(
            RecordId::from(id),
            OwnerKey::from(owner),
            Payload::default(),
            chrono::Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_table_append_reports_row() {
        let table = InMemoryTable::new("Records");
        table.seed(&[record("u1", "a@x.com")]);

        let range = A1Range::open_columns("Records", Column::Id, Column::LastModified, 1);
        let result = table
            .append(&range, &[record("u2", "b@x.com").to_row()])
            .await
            .unwrap();
        assert_eq!(result.updated_range, "Records!A3:E3");
        assert_eq!(table.write_calls(), 1);
        assert_eq!(table.records().len(), 2);
    }

    #[tokio::test]
    async fn test_table_get_keeps_interior_blank_rows() {
        let table = InMemoryTable::new("Records");
        table.seed(&[record("u1", "a"), record("u2", "b"), record("u3", "c")]);
        for column in Column::ALL {
            table.set_cell(3, column, json!(""));
        }

        let range = A1Range::open_columns("Records", Column::Id, Column::OwnerKey, 2);
        let values = table.get(&range).await.unwrap().values;
        assert_eq!(values.len(), 3);
        assert!(values[1].is_empty());
        assert_eq!(values[2][0], json!("u3"));
    }

    #[tokio::test]
    async fn test_table_scripted_failures_are_consumed_in_order() {
        let table = InMemoryTable::new("Records");
        table.fail_next_times(2, RemoteStatus::rate_limited());
        let range = A1Range::full_row("Records", 1);

        assert!(table.get(&range).await.is_err());
        assert!(table.get(&range).await.is_err());
        assert!(table.get(&range).await.is_ok());
        assert_eq!(table.total_calls(), 3);
    }

    #[tokio::test]
    async fn test_table_rejects_out_of_range_write() {
        let table = InMemoryTable::new("Records");
        let range = A1Range::row_span("Records", 2, Column::Payload, Column::LastModified);
        let err = table
            .batch_update(&[ValueRange::new(range, vec![vec![json!(1), json!(2), json!(3)]])])
            .await
            .unwrap_err();
        assert_eq!(err.code, 400);
        assert!(table.write_log().is_empty());
    }

    #[tokio::test]
    async fn test_table_rejects_unknown_sheet() {
        let table = InMemoryTable::new("Records");
        let err = table.get(&A1Range::full_row("Other", 2)).await.unwrap_err();
        assert_eq!(err.code, 400);
    }

    #[tokio::test]
    async fn test_cache_service_ttl_and_size_limit() {
        let clock = clock();
        let cache = InMemoryCacheService::with_max_entry_bytes(clock.clone(), 8);

        cache.put("k", b"small".to_vec(), Duration::from_secs(10)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(b"small".to_vec()));

        clock.advance(Duration::from_secs(10));
        assert_eq!(cache.get("k").await.unwrap(), None);

        assert!(cache
            .put("big", vec![0u8; 9], Duration::from_secs(10))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_lock_service_excludes_and_times_out() {
        let locks = InMemoryLockService::new(clock());
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        let lease = Duration::from_secs(30);

        assert!(locks.try_acquire("record:u1", a, Duration::ZERO, lease).await.unwrap());
        assert!(!locks
            .try_acquire("record:u1", b, Duration::from_millis(50), lease)
            .await
            .unwrap());
        assert!(locks.try_acquire("record:u2", b, Duration::ZERO, lease).await.unwrap());

        // Release by a non-holder is ignored.
        locks.release("record:u1", b).await.unwrap();
        assert!(locks.is_held("record:u1"));
        locks.release("record:u1", a).await.unwrap();
        assert!(!locks.is_held("record:u1"));
    }

    #[tokio::test]
    async fn test_lock_service_wakes_waiter_on_release() {
        let locks = Arc::new(InMemoryLockService::new(clock()));
        let a = Uuid::now_v7();
        let lease = Duration::from_secs(30);
        assert!(locks.try_acquire("create:x", a, Duration::ZERO, lease).await.unwrap());

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .try_acquire("create:x", Uuid::now_v7(), Duration::from_secs(5), lease)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        locks.release("create:x", a).await.unwrap();
        assert!(waiter.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken() {
        let clock = clock();
        let locks = InMemoryLockService::new(clock.clone());
        let lease = Duration::from_secs(30);
        assert!(locks
            .try_acquire("record:u1", Uuid::now_v7(), Duration::ZERO, lease)
            .await
            .unwrap());

        clock.advance(Duration::from_secs(31));
        assert!(locks
            .try_acquire("record:u1", Uuid::now_v7(), Duration::ZERO, lease)
            .await
            .unwrap());
    }

    #[test]
    fn test_property_store_ttl_and_counter() {
        let clock = clock();
        let props = InMemoryPropertyStore::new(clock.clone());

        props.set("circuit", "{}", Some(Duration::from_secs(60))).unwrap();
        assert!(props.get("circuit").unwrap().is_some());
        clock.advance(Duration::from_secs(60));
        assert!(props.get("circuit").unwrap().is_none());

        assert_eq!(props.increment("v:records").unwrap(), 1);
        assert_eq!(props.increment("v:records").unwrap(), 2);
        props.set("bad", "x", None).unwrap();
        assert!(props.increment("bad").is_err());
    }

    #[test]
    fn test_property_counter_with_ttl() {
        let clock = clock();
        let props = InMemoryPropertyStore::new(clock.clone());
        let ttl = Some(Duration::from_secs(60));

        assert_eq!(props.increment_with_ttl("errors", ttl).unwrap(), 1);
        clock.advance(Duration::from_secs(50));
        assert_eq!(props.increment_with_ttl("errors", ttl).unwrap(), 2);
        clock.advance(Duration::from_secs(50));
        assert_eq!(props.get("errors").unwrap().as_deref(), Some("2"));
        clock.advance(Duration::from_secs(10));
        assert!(props.get("errors").unwrap().is_none());
    }
}
