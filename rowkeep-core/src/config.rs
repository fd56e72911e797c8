//! Configuration types
//!
//! Every section has documented defaults. `from_env` overrides them from
//! `ROWKEEP_*` variables; `from_toml_path` reads a file in which any
//! section or field may be omitted.

use crate::circuit::{
    DEFAULT_CIRCUIT_COOL_DOWN_SECS, DEFAULT_CIRCUIT_FAILURE_THRESHOLD,
    DEFAULT_CIRCUIT_STATE_TTL_SECS,
};
use crate::lock::{DEFAULT_CREATION_LOCK_WAIT_MS, DEFAULT_LOCK_LEASE_MS, DEFAULT_RECORD_LOCK_WAIT_MS};
use crate::retry::{DEFAULT_RETRY_BASE_MS, DEFAULT_RETRY_CAP_MS, DEFAULT_RETRY_MAX_ATTEMPTS};
use crate::{ConfigError, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_SHEET_NAME: &str = "Records";
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_RECORD_TTL_MS: u64 = 6 * 60 * 60 * 1000;
pub const DEFAULT_INDEX_TTL_MS: u64 = 10 * 60 * 1000;
pub const DEFAULT_NEGATIVE_TTL_MS: u64 = 30 * 1000;
/// Per-entry limit of the shared cache tier.
pub const DEFAULT_MAX_ENTRY_BYTES: usize = 100 * 1024;

/// Remote table location and transport settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TableConfig {
    /// Sheet (tab) holding the records.
    pub sheet: String,
    /// Base URL of the values API, e.g.
    /// `https://sheets.googleapis.com/v4/spreadsheets/{id}`.
    pub base_url: Option<String>,
    /// Bearer token for the values API.
    pub access_token: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            sheet: DEFAULT_SHEET_NAME.to_string(),
            base_url: None,
            access_token: None,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl TableConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Retry settings for rate-limited calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_ms: u64,
    pub cap_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            base_ms: DEFAULT_RETRY_BASE_MS,
            cap_ms: DEFAULT_RETRY_CAP_MS,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_ms),
            Duration::from_millis(self.cap_ms),
        )
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitConfig {
    /// Consecutive rate-limit responses before the breaker opens.
    pub failure_threshold: u32,
    /// How long the breaker stays open.
    pub cool_down_ms: u64,
    /// TTL of the persisted state, independent of the open window, so a
    /// crashed writer cannot pin the breaker.
    pub state_ttl_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_CIRCUIT_FAILURE_THRESHOLD,
            cool_down_ms: DEFAULT_CIRCUIT_COOL_DOWN_SECS * 1000,
            state_ttl_ms: DEFAULT_CIRCUIT_STATE_TTL_SECS * 1000,
        }
    }
}

impl CircuitConfig {
    pub fn cool_down(&self) -> Duration {
        Duration::from_millis(self.cool_down_ms)
    }

    pub fn state_ttl(&self) -> Duration {
        Duration::from_millis(self.state_ttl_ms)
    }
}

/// Cache TTLs and limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// TTL for positive record entries.
    pub record_ttl_ms: u64,
    /// TTL for the row index and scans.
    pub index_ttl_ms: u64,
    /// TTL for "not found" entries; must be shorter than both of the above.
    pub negative_ttl_ms: u64,
    /// Entries larger than this are not written to the shared tier.
    pub max_entry_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            record_ttl_ms: DEFAULT_RECORD_TTL_MS,
            index_ttl_ms: DEFAULT_INDEX_TTL_MS,
            negative_ttl_ms: DEFAULT_NEGATIVE_TTL_MS,
            max_entry_bytes: DEFAULT_MAX_ENTRY_BYTES,
        }
    }
}

impl CacheConfig {
    pub fn record_ttl(&self) -> Duration {
        Duration::from_millis(self.record_ttl_ms)
    }

    pub fn index_ttl(&self) -> Duration {
        Duration::from_millis(self.index_ttl_ms)
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_millis(self.negative_ttl_ms)
    }
}

/// Lock waits and lease length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockConfig {
    pub record_wait_ms: u64,
    pub creation_wait_ms: u64,
    pub lease_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            record_wait_ms: DEFAULT_RECORD_LOCK_WAIT_MS,
            creation_wait_ms: DEFAULT_CREATION_LOCK_WAIT_MS,
            lease_ms: DEFAULT_LOCK_LEASE_MS,
        }
    }
}

impl LockConfig {
    pub fn record_wait(&self) -> Duration {
        Duration::from_millis(self.record_wait_ms)
    }

    pub fn creation_wait(&self) -> Duration {
        Duration::from_millis(self.creation_wait_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }
}

/// What a commit does when the stored row moved since the snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Re-read the row before writing and fail with `StaleCommitConflict`.
    #[default]
    Detect,
    /// Write without checking (last writer wins).
    Overwrite,
}

impl FromStr for ConflictPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "detect" => Ok(Self::Detect),
            "overwrite" => Ok(Self::Overwrite),
            other => Err(ConfigError::InvalidValue {
                field: "conflict_policy".to_string(),
                value: other.to_string(),
                reason: "expected detect or overwrite".to_string(),
            }),
        }
    }
}

/// Master configuration struct.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub table: TableConfig,
    pub retry: RetryConfig,
    pub circuit: CircuitConfig,
    pub cache: CacheConfig,
    pub locks: LockConfig,
    pub conflict_policy: ConflictPolicy,
}

impl StoreConfig {
    /// Defaults overridden by environment variables.
    ///
    /// # Environment Variables
    /// - `ROWKEEP_SHEET`, `ROWKEEP_BASE_URL`, `ROWKEEP_ACCESS_TOKEN`,
    ///   `ROWKEEP_REQUEST_TIMEOUT_MS`
    /// - `ROWKEEP_RETRY_MAX_ATTEMPTS`, `ROWKEEP_RETRY_BASE_MS`, `ROWKEEP_RETRY_CAP_MS`
    /// - `ROWKEEP_CIRCUIT_FAILURE_THRESHOLD`, `ROWKEEP_CIRCUIT_COOL_DOWN_MS`,
    ///   `ROWKEEP_CIRCUIT_STATE_TTL_MS`
    /// - `ROWKEEP_CACHE_RECORD_TTL_MS`, `ROWKEEP_CACHE_INDEX_TTL_MS`,
    ///   `ROWKEEP_CACHE_NEGATIVE_TTL_MS`, `ROWKEEP_CACHE_MAX_ENTRY_BYTES`
    /// - `ROWKEEP_LOCK_RECORD_WAIT_MS`, `ROWKEEP_LOCK_CREATION_WAIT_MS`,
    ///   `ROWKEEP_LOCK_LEASE_MS`
    /// - `ROWKEEP_CONFLICT_POLICY` (`detect` | `overwrite`)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(sheet) = lookup("ROWKEEP_SHEET") {
            config.table.sheet = sheet;
        }
        if let Some(url) = lookup("ROWKEEP_BASE_URL") {
            config.table.base_url = Some(url);
        }
        if let Some(token) = lookup("ROWKEEP_ACCESS_TOKEN") {
            config.table.access_token = Some(token);
        }
        override_parsed(&lookup, "ROWKEEP_REQUEST_TIMEOUT_MS", &mut config.table.request_timeout_ms)?;

        override_parsed(&lookup, "ROWKEEP_RETRY_MAX_ATTEMPTS", &mut config.retry.max_attempts)?;
        override_parsed(&lookup, "ROWKEEP_RETRY_BASE_MS", &mut config.retry.base_ms)?;
        override_parsed(&lookup, "ROWKEEP_RETRY_CAP_MS", &mut config.retry.cap_ms)?;

        override_parsed(
            &lookup,
            "ROWKEEP_CIRCUIT_FAILURE_THRESHOLD",
            &mut config.circuit.failure_threshold,
        )?;
        override_parsed(&lookup, "ROWKEEP_CIRCUIT_COOL_DOWN_MS", &mut config.circuit.cool_down_ms)?;
        override_parsed(&lookup, "ROWKEEP_CIRCUIT_STATE_TTL_MS", &mut config.circuit.state_ttl_ms)?;

        override_parsed(&lookup, "ROWKEEP_CACHE_RECORD_TTL_MS", &mut config.cache.record_ttl_ms)?;
        override_parsed(&lookup, "ROWKEEP_CACHE_INDEX_TTL_MS", &mut config.cache.index_ttl_ms)?;
        override_parsed(&lookup, "ROWKEEP_CACHE_NEGATIVE_TTL_MS", &mut config.cache.negative_ttl_ms)?;
        override_parsed(
            &lookup,
            "ROWKEEP_CACHE_MAX_ENTRY_BYTES",
            &mut config.cache.max_entry_bytes,
        )?;

        override_parsed(&lookup, "ROWKEEP_LOCK_RECORD_WAIT_MS", &mut config.locks.record_wait_ms)?;
        override_parsed(
            &lookup,
            "ROWKEEP_LOCK_CREATION_WAIT_MS",
            &mut config.locks.creation_wait_ms,
        )?;
        override_parsed(&lookup, "ROWKEEP_LOCK_LEASE_MS", &mut config.locks.lease_ms)?;

        if let Some(policy) = lookup("ROWKEEP_CONFLICT_POLICY") {
            config.conflict_policy = policy.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: StoreConfig = toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            reason: format!("{}: {}", path.display(), e),
        })?;
        Self::from_toml_str(&contents)
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - the sheet name is non-empty
    /// - at least one attempt, and `cap_ms >= base_ms`
    /// - breaker threshold, cool-down, and state TTL are positive
    /// - negative TTL is positive and shorter than positive TTLs
    /// - lock waits and lease are positive
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.table.sheet.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "table.sheet".to_string(),
            });
        }
        positive("table.request_timeout_ms", self.table.request_timeout_ms)?;

        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", 0, "must be at least 1"));
        }
        if self.retry.cap_ms < self.retry.base_ms {
            return Err(invalid(
                "retry.cap_ms",
                self.retry.cap_ms,
                "must be >= retry.base_ms",
            ));
        }

        if self.circuit.failure_threshold == 0 {
            return Err(invalid("circuit.failure_threshold", 0, "must be at least 1"));
        }
        positive("circuit.cool_down_ms", self.circuit.cool_down_ms)?;
        positive("circuit.state_ttl_ms", self.circuit.state_ttl_ms)?;

        positive("cache.record_ttl_ms", self.cache.record_ttl_ms)?;
        positive("cache.index_ttl_ms", self.cache.index_ttl_ms)?;
        positive("cache.negative_ttl_ms", self.cache.negative_ttl_ms)?;
        if self.cache.negative_ttl_ms >= self.cache.record_ttl_ms
            || self.cache.negative_ttl_ms >= self.cache.index_ttl_ms
        {
            return Err(invalid(
                "cache.negative_ttl_ms",
                self.cache.negative_ttl_ms,
                "must be shorter than record and index TTLs",
            ));
        }
        if self.cache.max_entry_bytes == 0 {
            return Err(invalid("cache.max_entry_bytes", 0, "must be > 0"));
        }

        positive("locks.record_wait_ms", self.locks.record_wait_ms)?;
        positive("locks.creation_wait_ms", self.locks.creation_wait_ms)?;
        positive("locks.lease_ms", self.locks.lease_ms)?;

        Ok(())
    }
}

fn override_parsed<F, T>(lookup: &F, name: &str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(name) {
        *target = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            field: name.to_string(),
            value: raw.clone(),
            reason: "not a valid number".to_string(),
        })?;
    }
    Ok(())
}

fn positive(field: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(invalid(field, value, "must be > 0"));
    }
    Ok(())
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
