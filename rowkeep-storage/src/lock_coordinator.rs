//! Named distributed mutexes with bounded waits and guaranteed release.
//!
//! A [`LockGuard`] owns a typestate [`Lease`]. Releasing consumes it;
//! dropping an unreleased guard (early return, error, panic) schedules the
//! release on the current runtime. Release failures are logged and never
//! returned, since the lease expires on its own.

use crate::services::LockService;
use rowkeep_core::{
    Acquired, Clock, Lease, LeaseData, LockConfig, LockError, LockName, LockScope, Released,
    RowkeepResult,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Acquires leases from a [`LockService`].
pub struct LockCoordinator {
    service: Arc<dyn LockService>,
    clock: Arc<dyn Clock>,
    config: LockConfig,
}

impl std::fmt::Debug for LockCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockCoordinator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl LockCoordinator {
    pub fn new(service: Arc<dyn LockService>, clock: Arc<dyn Clock>, config: LockConfig) -> Self {
        Self {
            service,
            clock,
            config,
        }
    }

    /// Default wait for a lock of this name's scope.
    pub fn default_wait(&self, name: &LockName) -> Duration {
        match name.scope() {
            LockScope::Record => self.config.record_wait(),
            LockScope::Creation => self.config.creation_wait(),
        }
    }

    /// Wait up to `max_wait` for `name`.
    pub async fn acquire(&self, name: LockName, max_wait: Duration) -> Result<LockGuard, LockError> {
        let key = name.to_string();
        let holder = Uuid::now_v7();
        let lease = self.config.lease();
        let started = tokio::time::Instant::now();

        if !self.service.try_acquire(&key, holder, max_wait, lease).await? {
            tracing::warn!(
                lock = %key,
                waited_ms = started.elapsed().as_millis() as u64,
                "Lock wait timed out"
            );
            return Err(LockError::Timeout {
                name: key,
                waited: max_wait,
            });
        }

        let now = self.clock.now();
        let expires_at = chrono::Duration::from_std(lease)
            .map(|d| now + d)
            .unwrap_or(now);
        tracing::debug!(
            lock = %key,
            holder = %holder,
            waited_ms = started.elapsed().as_millis() as u64,
            "Lock acquired"
        );
        Ok(LockGuard {
            lease: Some(Lease::new(LeaseData {
                name,
                holder,
                acquired_at: now,
                expires_at,
            })),
            service: self.service.clone(),
            clock: self.clock.clone(),
        })
    }

    /// Run `f` while holding `name`, releasing on every exit path.
    pub async fn with_lock<T, F, Fut>(
        &self,
        name: LockName,
        max_wait: Duration,
        f: F,
    ) -> RowkeepResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RowkeepResult<T>>,
    {
        let guard = self.acquire(name, max_wait).await?;
        let result = f().await;
        guard.release().await;
        result
    }
}

/// A held lock. Release with [`release`](Self::release); dropping releases
/// in the background.
pub struct LockGuard {
    lease: Option<Lease<Acquired>>,
    service: Arc<dyn LockService>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

impl LockGuard {
    pub fn lease(&self) -> Option<&Lease<Acquired>> {
        self.lease.as_ref()
    }

    pub fn name(&self) -> Option<&LockName> {
        self.lease.as_ref().map(|l| l.name())
    }

    /// Hand the lease back. `None` if it was already released.
    pub async fn release(mut self) -> Option<Lease<Released>> {
        let lease = self.lease.take()?;
        Some(release_lease(self.service.as_ref(), self.clock.as_ref(), lease).await)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let service = self.service.clone();
                let clock = self.clock.clone();
                handle.spawn(async move {
                    release_lease(service.as_ref(), clock.as_ref(), lease).await;
                });
            }
            Err(_) => {
                tracing::error!(
                    lock = %lease.name(),
                    "Lock guard dropped outside a runtime, lease left to expire"
                );
            }
        }
    }
}

async fn release_lease(
    service: &dyn LockService,
    clock: &dyn Clock,
    lease: Lease<Acquired>,
) -> Lease<Released> {
    let name = lease.name().to_string();
    let outcome = service.release(&name, lease.holder()).await;
    let released = lease.release();
    match outcome {
        Ok(()) => tracing::debug!(
            lock = %name,
            held_ms = released.held_for(clock.now()).as_millis() as u64,
            "Lock released"
        ),
        Err(e) => tracing::error!(lock = %name, error = %e, "Failed to release lock"),
    }
    released
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryLockService;
    use async_trait::async_trait;
    use rowkeep_core::{ManualClock, RecordId, RowkeepError, StorageError};

    fn coordinator() -> (LockCoordinator, Arc<InMemoryLockService>) {
        let clock = Arc::new(ManualClock::default());
        let service = Arc::new(InMemoryLockService::new(clock.clone()));
        (
            LockCoordinator::new(service.clone(), clock, LockConfig::default()),
            service,
        )
    }

    fn name() -> LockName {
        LockName::record(&RecordId::from("u1"))
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let (locks, service) = coordinator();
        let guard = locks.acquire(name(), Duration::from_millis(50)).await.unwrap();
        assert!(service.is_held("record:u1"));
        assert_eq!(guard.name(), Some(&name()));

        let released = guard.release().await.unwrap();
        assert_eq!(released.name(), &name());
        assert_eq!(released.held_for(released.data().acquired_at), Duration::ZERO);
        assert!(!service.is_held("record:u1"));
    }

    #[tokio::test]
    async fn test_contended_lock_times_out() {
        let (locks, _service) = coordinator();
        let _held = locks.acquire(name(), Duration::from_millis(50)).await.unwrap();

        let err = locks
            .acquire(name(), Duration::from_millis(30))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            LockError::Timeout {
                name: "record:u1".to_string(),
                waited: Duration::from_millis(30),
            }
        );
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_error() {
        let (locks, service) = coordinator();
        let result: RowkeepResult<()> = locks
            .with_lock(name(), Duration::from_millis(50), || async {
                Err(StorageError::NotFound {
                    id: RecordId::from("u1"),
                }
                .into())
            })
            .await;

        assert!(matches!(result, Err(RowkeepError::Storage(_))));
        assert!(!service.is_held("record:u1"));
    }

    #[tokio::test]
    async fn test_dropped_guard_releases() {
        let (locks, _service) = coordinator();
        let guard = locks.acquire(name(), Duration::from_millis(50)).await.unwrap();
        drop(guard);

        let again = locks.acquire(name(), Duration::from_secs(1)).await;
        assert!(again.is_ok());
    }

    #[derive(Debug)]
    struct BrokenRelease;

    #[async_trait]
    impl LockService for BrokenRelease {
        async fn try_acquire(
            &self,
            _name: &str,
            _holder: Uuid,
            _wait: Duration,
            _lease: Duration,
        ) -> Result<bool, LockError> {
            Ok(true)
        }

        async fn release(&self, name: &str, _holder: Uuid) -> Result<(), LockError> {
            Err(LockError::Service {
                name: name.to_string(),
                reason: "unavailable".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_release_failure_is_not_an_error() {
        let locks = LockCoordinator::new(
            Arc::new(BrokenRelease),
            Arc::new(ManualClock::default()),
            LockConfig::default(),
        );
        let value = locks
            .with_lock(name(), Duration::from_millis(10), || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_default_wait_by_scope() {
        let (locks, _) = coordinator();
        assert_eq!(locks.default_wait(&name()), Duration::from_secs(5));
        let creation = LockName::creation(&rowkeep_core::OwnerKey::from("a@x.com"));
        assert_eq!(locks.default_wait(&creation), Duration::from_secs(15));
    }
}
