//! Error types for rowkeep operations

use crate::{Column, RecordId, Timestamp};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while talking to the remote table.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Quota exceeded during {operation} after {attempts} attempts")]
    QuotaExceeded { operation: String, attempts: u32 },

    #[error("Circuit open, retry after {retry_after_ms}ms")]
    CircuitOpen { retry_after_ms: i64 },

    #[error("Upstream returned {status} for {operation}: {detail}")]
    Upstream {
        operation: String,
        status: u16,
        detail: String,
    },

    #[error("Malformed upstream response for {operation}: {reason}")]
    MalformedResponse { operation: String, reason: String },
}

/// Record-level storage errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Record not found: {id}")]
    NotFound { id: RecordId },

    #[error("No record owned by {owner_key}")]
    OwnerNotFound { owner_key: String },

    #[error("Owner key {owner_key} already belongs to record {existing}")]
    OwnerTaken { owner_key: String, existing: RecordId },

    #[error(
        "Stale commit for record {id}: snapshot at {expected:?}, store has {found:?}"
    )]
    StaleCommitConflict {
        id: RecordId,
        expected: Option<Timestamp>,
        found: Option<Timestamp>,
    },

    #[error("Invalid row {row}: {reason}")]
    InvalidRow { row: u32, reason: String },

    #[error("Invalid cell {column:?}: {reason}")]
    InvalidCell { column: Column, reason: String },

    #[error("Payload error: {reason}")]
    Payload { reason: String },

    #[error("Execution context for {id} is {state}, expected {expected}")]
    ContextState {
        id: RecordId,
        state: String,
        expected: String,
    },
}

/// Distributed lock errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("Timed out after {waited:?} waiting for lock {name}")]
    Timeout { name: String, waited: Duration },

    #[error("Lock service failure for {name}: {reason}")]
    Service { name: String, reason: String },
}

/// Cache substrate errors. Never fatal to callers of the cache layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache backend error: {reason}")]
    Backend { reason: String },

    #[error("Cache codec error for {key}: {reason}")]
    Codec { key: String, reason: String },

    #[error("Property store error: {reason}")]
    Property { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to read config file: {reason}")]
    Io { reason: String },

    #[error("Failed to parse config: {reason}")]
    Parse { reason: String },
}

/// Master error type for all rowkeep errors.
#[derive(Debug, Clone, Error)]
pub enum RowkeepError {
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for rowkeep operations.
pub type RowkeepResult<T> = Result<T, RowkeepError>;

/// What an end user is told about a failed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserFacing {
    /// Quota, breaker, or lock contention: "system busy, retry shortly".
    Busy,
    /// The write target no longer exists.
    RecordGone,
    /// Someone else changed the record; re-read and retry.
    Conflict,
    /// Anything structural. Details stay in the server log under the id.
    Failure { correlation_id: Uuid },
}

impl RowkeepError {
    /// Transient errors may succeed if the caller tries again later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RowkeepError::Remote(RemoteError::QuotaExceeded { .. })
                | RowkeepError::Remote(RemoteError::CircuitOpen { .. })
                | RowkeepError::Lock(LockError::Timeout { .. })
        )
    }

    /// True for the terminal "no such record" cases.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RowkeepError::Storage(StorageError::NotFound { .. })
                | RowkeepError::Storage(StorageError::OwnerNotFound { .. })
        )
    }

    /// Map to the user-visible class, logging structural failures with a
    /// correlation id.
    pub fn user_facing(&self) -> UserFacing {
        if self.is_transient() {
            return UserFacing::Busy;
        }
        match self {
            RowkeepError::Storage(StorageError::NotFound { .. }) => UserFacing::RecordGone,
            RowkeepError::Storage(StorageError::StaleCommitConflict { .. }) => {
                UserFacing::Conflict
            }
            other => {
                let correlation_id = Uuid::now_v7();
                tracing::error!(
                    correlation_id = %correlation_id,
                    error = %other,
                    "Operation failed"
                );
                UserFacing::Failure { correlation_id }
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_display_quota() {
        let err = RemoteError::QuotaExceeded {
            operation: "batch_update".to_string(),
            attempts: 3,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Quota exceeded"));
        assert!(msg.contains("batch_update"));
        assert!(msg.contains('3'));
    }

    #[test]
    fn test_upstream_error_keeps_detail() {
        let err = RemoteError::Upstream {
            operation: "get".to_string(),
            status: 400,
            detail: "Unable to parse range: Nope!A1".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("400"));
        assert!(msg.contains("Unable to parse range"));
    }

    #[test]
    fn test_transient_classification() {
        let quota: RowkeepError = RemoteError::QuotaExceeded {
            operation: "get".to_string(),
            attempts: 3,
        }
        .into();
        let open: RowkeepError = RemoteError::CircuitOpen { retry_after_ms: 10 }.into();
        let lock: RowkeepError = LockError::Timeout {
            name: "record:u1".to_string(),
            waited: Duration::from_secs(5),
        }
        .into();
        let upstream: RowkeepError = RemoteError::Upstream {
            operation: "get".to_string(),
            status: 500,
            detail: "boom".to_string(),
        }
        .into();

        assert!(quota.is_transient());
        assert!(open.is_transient());
        assert!(lock.is_transient());
        assert!(!upstream.is_transient());
    }

    #[test]
    fn test_user_facing_mapping() {
        let open: RowkeepError = RemoteError::CircuitOpen { retry_after_ms: 10 }.into();
        assert_eq!(open.user_facing(), UserFacing::Busy);

        let gone: RowkeepError = StorageError::NotFound {
            id: RecordId::from("u1"),
        }
        .into();
        assert_eq!(gone.user_facing(), UserFacing::RecordGone);
        assert!(gone.is_not_found());

        let stale: RowkeepError = StorageError::StaleCommitConflict {
            id: RecordId::from("u1"),
            expected: None,
            found: None,
        }
        .into();
        assert_eq!(stale.user_facing(), UserFacing::Conflict);

        let upstream: RowkeepError = RemoteError::Upstream {
            operation: "append".to_string(),
            status: 500,
            detail: "internal".to_string(),
        }
        .into();
        assert!(matches!(upstream.user_facing(), UserFacing::Failure { .. }));
    }

    #[test]
    fn test_rowkeep_error_from_variants() {
        let cache = RowkeepError::from(CacheError::Backend {
            reason: "down".to_string(),
        });
        assert!(matches!(cache, RowkeepError::Cache(_)));

        let config = RowkeepError::from(ConfigError::MissingRequired {
            field: "table.sheet".to_string(),
        });
        assert!(matches!(config, RowkeepError::Config(_)));
    }
}
