//! The fixed five-column record schema and its cell encoding.

use crate::{Payload, StorageError, Timestamp};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// First data row; row 1 holds the header.
pub const FIRST_DATA_ROW: u32 = 2;

/// Opaque, immutable record identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh timestamp-sortable identity.
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique owner key (typically an email). Normalized to trimmed lowercase
/// so lookups and uniqueness checks agree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerKey(String);

impl OwnerKey {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Stable digest used in cache keys and lock names, so arbitrary owner
    /// strings never leak into key syntax.
    pub fn digest(&self) -> String {
        use sha2::{Digest, Sha256};
        let hash = Sha256::digest(self.0.as_bytes());
        hex::encode(&hash[..16])
    }
}

impl From<&str> for OwnerKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Columns of the record table, in physical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Column {
    Id,
    OwnerKey,
    IsActive,
    Payload,
    LastModified,
}

impl Column {
    pub const ALL: [Column; 5] = [
        Column::Id,
        Column::OwnerKey,
        Column::IsActive,
        Column::Payload,
        Column::LastModified,
    ];

    /// Zero-based physical index.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// A1 column letter.
    pub fn letter(self) -> char {
        (b'A' + self as u8) as char
    }

    pub fn from_letter(letter: char) -> Option<Self> {
        let upper = letter.to_ascii_uppercase();
        if !upper.is_ascii_uppercase() {
            return None;
        }
        Self::from_index((upper as u8 - b'A') as usize)
    }

    /// Header label written in row 1.
    pub fn header(self) -> &'static str {
        match self {
            Column::Id => "id",
            Column::OwnerKey => "ownerKey",
            Column::IsActive => "isActive",
            Column::Payload => "payload",
            Column::LastModified => "lastModified",
        }
    }
}

/// One row of the remote table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub owner_key: OwnerKey,
    pub is_active: bool,
    pub payload: Payload,
    pub last_modified: Timestamp,
}

impl Record {
    /// Build a new active record stamped at `now`.
    pub fn new(id: RecordId, owner_key: OwnerKey, payload: Payload, now: Timestamp) -> Self {
        Self {
            id,
            owner_key,
            is_active: true,
            payload,
            last_modified: truncate_millis(now),
        }
    }

    /// Encode one column as a table cell.
    pub fn cell(&self, column: Column) -> Value {
        match column {
            Column::Id => Value::String(self.id.as_str().to_string()),
            Column::OwnerKey => Value::String(self.owner_key.as_str().to_string()),
            Column::IsActive => Value::Bool(self.is_active),
            Column::Payload => Value::String(self.payload.to_json_string()),
            Column::LastModified => Value::String(format_timestamp(self.last_modified)),
        }
    }

    /// Encode the full row, `A..E`.
    pub fn to_row(&self) -> Vec<Value> {
        Column::ALL.iter().map(|c| self.cell(*c)).collect()
    }

    /// Apply one encoded cell to this record.
    pub fn apply_cell(&mut self, column: Column, value: &Value) -> Result<(), StorageError> {
        match column {
            Column::Id => {
                let id = text_cell(column, value)?;
                if id != self.id.as_str() {
                    return Err(StorageError::InvalidCell {
                        column,
                        reason: "id is immutable".to_string(),
                    });
                }
            }
            Column::OwnerKey => self.owner_key = OwnerKey::new(text_cell(column, value)?),
            Column::IsActive => self.is_active = bool_cell(value)?,
            Column::Payload => self.payload = Payload::from_cell(value)?,
            Column::LastModified => self.last_modified = parse_timestamp(value)?,
        }
        Ok(())
    }

    /// Decode a row read from the table. Rows with an empty id cell are
    /// tombstones or padding and decode to `None`.
    pub fn from_row(row: u32, cells: &[Value]) -> Result<Option<Self>, StorageError> {
        let cell = |c: Column| cells.get(c.index()).unwrap_or(&Value::Null);

        let id = match cell(Column::Id) {
            Value::Null => return Ok(None),
            Value::String(s) if s.trim().is_empty() => return Ok(None),
            other => text_cell(Column::Id, other).map_err(|e| invalid_row(row, e))?,
        };

        let owner_key = OwnerKey::new(
            text_cell(Column::OwnerKey, cell(Column::OwnerKey)).map_err(|e| invalid_row(row, e))?,
        );
        let is_active = match cell(Column::IsActive) {
            Value::Null => false,
            other => bool_cell(other).map_err(|e| invalid_row(row, e))?,
        };
        let payload = Payload::from_cell(cell(Column::Payload)).map_err(|e| invalid_row(row, e))?;
        let last_modified =
            parse_timestamp(cell(Column::LastModified)).map_err(|e| invalid_row(row, e))?;

        Ok(Some(Self {
            id: RecordId::new(id),
            owner_key,
            is_active,
            payload,
            last_modified,
        }))
    }
}

/// A record together with the physical row it was read from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    pub row: u32,
    pub record: Record,
}

/// Timestamps are persisted at millisecond precision; truncate in memory
/// so a written value compares equal to what is read back.
pub fn truncate_millis(ts: Timestamp) -> Timestamp {
    DateTime::<Utc>::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}

pub fn format_timestamp(ts: Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(value: &Value) -> Result<Timestamp, StorageError> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|dt| truncate_millis(dt.with_timezone(&Utc)))
            .map_err(|e| StorageError::InvalidCell {
                column: Column::LastModified,
                reason: e.to_string(),
            }),
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .ok_or_else(|| StorageError::InvalidCell {
                column: Column::LastModified,
                reason: format!("not an epoch-millis value: {}", n),
            }),
        other => Err(StorageError::InvalidCell {
            column: Column::LastModified,
            reason: format!("unexpected cell {}", other),
        }),
    }
}

fn text_cell(column: Column, value: &Value) -> Result<String, StorageError> {
    match value {
        Value::String(s) => Ok(s.trim().to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        other => Err(StorageError::InvalidCell {
            column,
            reason: format!("expected text, got {}", other),
        }),
    }
}

fn bool_cell(value: &Value) -> Result<bool, StorageError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" | "" => Ok(false),
            other => Err(StorageError::InvalidCell {
                column: Column::IsActive,
                reason: format!("expected boolean, got {:?}", other),
            }),
        },
        other => Err(StorageError::InvalidCell {
            column: Column::IsActive,
            reason: format!("expected boolean, got {}", other),
        }),
    }
}

fn invalid_row(row: u32, err: StorageError) -> StorageError {
    StorageError::InvalidRow {
        row,
        reason: err.to_string(),
    }
}
