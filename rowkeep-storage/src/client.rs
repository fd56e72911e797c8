//! Rate-limited remote calls.
//!
//! [`BackoffClient`] is the only component that talks to the remote table.
//! Every call goes through [`execute_with_policy`] with a shared
//! [`SharedCircuitBreaker`] consulted before each attempt.

use crate::services::{AppendResult, PropertyStore, RemoteStatus, TableApi, ValueRange};
use rowkeep_core::{
    A1Range, CircuitConfig, CircuitPhase, CircuitState, Clock, RemoteError, RetryPolicy,
};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Property key holding the end of the open window, in epoch millis.
pub const CIRCUIT_STATE_KEY: &str = "rowkeep:circuit";
/// Property key holding the consecutive rate-limit count.
pub const CIRCUIT_ERRORS_KEY: &str = "rowkeep:circuit:errors";

// ============================================================================
// RETRY HELPER
// ============================================================================

/// Outcome of one attempt as seen by [`execute_with_policy`].
#[derive(Debug)]
pub enum Attempt<E> {
    /// Transient failure; retry if the policy allows.
    Retry(E),
    /// Stop now and surface this error.
    Fail(E),
}

/// Why [`execute_with_policy`] gave up.
#[derive(Debug, PartialEq, Eq)]
pub enum PolicyError<E> {
    /// Every allowed attempt returned [`Attempt::Retry`].
    Exhausted { last: E, attempts: u32 },
    /// An attempt returned [`Attempt::Fail`].
    Failed(E),
}

/// Run `op` until it succeeds, fails permanently, or the policy runs out.
///
/// `op` receives the zero-based attempt number. Between attempts the
/// helper sleeps for `policy.backoff(retry_index)`.
pub async fn execute_with_policy<T, E, F, Fut>(
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, PolicyError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Attempt<E>>>,
{
    let mut attempt = 0u32;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(Attempt::Fail(e)) => return Err(PolicyError::Failed(e)),
            Err(Attempt::Retry(e)) => {
                attempt += 1;
                if !policy.allows_another(attempt) {
                    return Err(PolicyError::Exhausted {
                        last: e,
                        attempts: attempt,
                    });
                }
                let backoff = policy.backoff(attempt - 1);
                if !backoff.is_zero() {
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

// ============================================================================
// SHARED CIRCUIT BREAKER
// ============================================================================

/// Circuit breaker whose state lives in the property store, so every
/// process sharing that store sees the same breaker.
///
/// The error count and the open window are separate properties. The count
/// only ever moves through [`PropertyStore::increment_with_ttl`], so
/// concurrent callers never lose a rate-limit signal. Both properties carry
/// the configured state TTL.
///
/// Property store failures never block calls: an unreadable state is
/// treated as closed and an unwritable one is logged.
#[derive(Clone)]
pub struct SharedCircuitBreaker {
    properties: Arc<dyn PropertyStore>,
    clock: Arc<dyn Clock>,
    config: CircuitConfig,
}

impl std::fmt::Debug for SharedCircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedCircuitBreaker")
            .field("config", &self.config)
            .finish()
    }
}

impl SharedCircuitBreaker {
    pub fn new(
        properties: Arc<dyn PropertyStore>,
        clock: Arc<dyn Clock>,
        config: CircuitConfig,
    ) -> Self {
        Self {
            properties,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Current persisted state.
    pub fn state(&self) -> CircuitState {
        let consecutive_errors = self
            .read_number(CIRCUIT_ERRORS_KEY)
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
            .unwrap_or(0);
        CircuitState {
            consecutive_errors,
            open_until_ms: self.read_number(CIRCUIT_STATE_KEY).unwrap_or(0),
        }
    }

    pub fn phase(&self) -> CircuitPhase {
        self.state().phase(self.clock.now_ms())
    }

    /// Fail fast while the breaker is open.
    pub fn check(&self) -> Result<(), RemoteError> {
        let now = self.clock.now_ms();
        let state = self.state();
        if state.is_open(now) {
            return Err(RemoteError::CircuitOpen {
                retry_after_ms: state.retry_after_ms(now),
            });
        }
        Ok(())
    }

    /// Count a rate-limit response. Returns true if this one tripped the
    /// breaker.
    pub fn record_rate_limit(&self) -> bool {
        let now = self.clock.now_ms();
        let counted = self
            .properties
            .increment_with_ttl(CIRCUIT_ERRORS_KEY, Some(self.config.state_ttl()));
        let consecutive_errors = match counted {
            Ok(n) => u32::try_from(n).unwrap_or(u32::MAX),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to count rate limit");
                return false;
            }
        };

        let mut state = CircuitState {
            consecutive_errors,
            open_until_ms: self.read_number(CIRCUIT_STATE_KEY).unwrap_or(0),
        };
        let tripped =
            state.trip_if_due(now, self.config.failure_threshold, self.config.cool_down());
        if tripped {
            self.store(CIRCUIT_STATE_KEY, state.open_until_ms);
            tracing::error!(
                consecutive_errors,
                open_for_ms = self.config.cool_down_ms,
                "Circuit breaker opened"
            );
        }
        tripped
    }

    /// Reset after a successful call. Skips the writes when already clean.
    pub fn record_success(&self) {
        if !self.state().is_clean() {
            self.reset();
            tracing::info!("Circuit breaker reset");
        }
    }

    /// Force the breaker closed.
    pub fn reset(&self) {
        for key in [CIRCUIT_ERRORS_KEY, CIRCUIT_STATE_KEY] {
            if let Err(e) = self.properties.delete(key) {
                tracing::warn!(key, error = %e, "Failed to clear circuit state");
            }
        }
    }

    fn read_number(&self, key: &str) -> Option<i64> {
        match self.properties.get(key) {
            Ok(Some(raw)) => match raw.trim().parse::<i64>() {
                Ok(n) => Some(n),
                Err(e) => {
                    tracing::warn!(key, error = %e, "Discarding unreadable circuit state");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key, error = %e, "Circuit state unavailable, assuming closed");
                None
            }
        }
    }

    fn store(&self, key: &str, value: i64) {
        if let Err(e) = self
            .properties
            .set(key, &value.to_string(), Some(self.config.state_ttl()))
        {
            tracing::warn!(key, error = %e, "Failed to persist circuit state");
        }
    }
}

// ============================================================================
// BACKOFF CLIENT
// ============================================================================

/// Retrying, circuit-breaking wrapper around a [`TableApi`].
#[derive(Clone)]
pub struct BackoffClient {
    table: Arc<dyn TableApi>,
    breaker: SharedCircuitBreaker,
    policy: RetryPolicy,
}

impl std::fmt::Debug for BackoffClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackoffClient")
            .field("breaker", &self.breaker)
            .field("policy", &self.policy)
            .finish()
    }
}

impl BackoffClient {
    pub fn new(table: Arc<dyn TableApi>, breaker: SharedCircuitBreaker, policy: RetryPolicy) -> Self {
        Self {
            table,
            breaker,
            policy,
        }
    }

    pub fn breaker(&self) -> &SharedCircuitBreaker {
        &self.breaker
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run one logical remote call.
    ///
    /// - breaker open: `CircuitOpen`, no network call
    /// - rate limited: back off and retry; `QuotaExceeded` when the policy
    ///   is spent or the breaker trips mid-call
    /// - any other failure: `Upstream` immediately
    pub async fn call<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T, RemoteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteStatus>>,
    {
        let breaker = &self.breaker;
        let result = execute_with_policy(&self.policy, |attempt| {
            let dispatched = breaker.check().map(|()| op());
            async move {
                let pending = match dispatched {
                    Ok(pending) => pending,
                    Err(open) => return Err(Attempt::Fail(open)),
                };
                match pending.await {
                    Ok(value) => {
                        breaker.record_success();
                        Ok(value)
                    }
                    Err(status) if status.is_rate_limited() => {
                        let tripped = breaker.record_rate_limit();
                        tracing::warn!(
                            operation,
                            attempt = attempt + 1,
                            status = status.code,
                            tripped,
                            "Rate limited by upstream"
                        );
                        let quota = RemoteError::QuotaExceeded {
                            operation: operation.to_string(),
                            attempts: attempt + 1,
                        };
                        if tripped {
                            Err(Attempt::Fail(quota))
                        } else {
                            Err(Attempt::Retry(quota))
                        }
                    }
                    Err(status) => Err(Attempt::Fail(RemoteError::Upstream {
                        operation: operation.to_string(),
                        status: status.code,
                        detail: status.message,
                    })),
                }
            }
        })
        .await;

        match result {
            Ok(value) => Ok(value),
            Err(PolicyError::Failed(e)) => {
                if matches!(e, RemoteError::CircuitOpen { .. }) {
                    tracing::debug!(operation, error = %e, "Call rejected by open circuit");
                }
                Err(e)
            }
            Err(PolicyError::Exhausted { last, attempts }) => {
                tracing::warn!(operation, attempts, "Retry budget exhausted");
                Err(last)
            }
        }
    }

    pub async fn get(&self, range: &A1Range) -> Result<ValueRange, RemoteError> {
        self.call("get", || self.table.get(range)).await
    }

    pub async fn batch_get(&self, ranges: &[A1Range]) -> Result<Vec<ValueRange>, RemoteError> {
        self.call("batch_get", || self.table.batch_get(ranges)).await
    }

    pub async fn append(
        &self,
        range: &A1Range,
        rows: &[Vec<Value>],
    ) -> Result<AppendResult, RemoteError> {
        self.call("append", || self.table.append(range, rows)).await
    }

    pub async fn batch_update(&self, updates: &[ValueRange]) -> Result<u32, RemoteError> {
        self.call("batch_update", || self.table.batch_update(updates))
            .await
    }
}
