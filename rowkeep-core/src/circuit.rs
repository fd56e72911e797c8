//! Shared circuit-breaker state.
//!
//! The state is a pair `(consecutive_errors, open_until)` persisted where
//! every concurrent execution can see it. The error count is bumped with an
//! atomic increment by the storage crate; this module only decides when the
//! resulting count opens the breaker.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_CIRCUIT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_CIRCUIT_COOL_DOWN_SECS: u64 = 60;
pub const DEFAULT_CIRCUIT_STATE_TTL_SECS: u64 = 60;

/// Observable phase of the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitPhase {
    /// Calls flow normally
    Closed,
    /// Calls fail fast until the window elapses
    Open,
}

impl CircuitPhase {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Closed => "Closed",
            Self::Open => "Open",
        }
    }
}

impl fmt::Display for CircuitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// Persisted breaker state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitState {
    pub consecutive_errors: u32,
    /// Epoch millis; 0 when closed.
    pub open_until_ms: i64,
}

impl CircuitState {
    pub fn closed() -> Self {
        Self::default()
    }

    pub fn phase(&self, now_ms: i64) -> CircuitPhase {
        if now_ms < self.open_until_ms {
            CircuitPhase::Open
        } else {
            CircuitPhase::Closed
        }
    }

    pub fn is_open(&self, now_ms: i64) -> bool {
        self.phase(now_ms) == CircuitPhase::Open
    }

    /// Milliseconds until the breaker closes, or 0.
    pub fn retry_after_ms(&self, now_ms: i64) -> i64 {
        (self.open_until_ms - now_ms).max(0)
    }

    /// Open the breaker if `consecutive_errors` has reached `threshold` and
    /// it is not already open. Returns true when this call opened it.
    pub fn trip_if_due(&mut self, now_ms: i64, threshold: u32, cool_down: Duration) -> bool {
        if self.consecutive_errors >= threshold && !self.is_open(now_ms) {
            self.open_until_ms = now_ms + cool_down.as_millis() as i64;
            return true;
        }
        false
    }

    pub fn is_clean(&self) -> bool {
        self.consecutive_errors == 0 && self.open_until_ms == 0
    }
}
