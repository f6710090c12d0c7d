use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::distributed_lock::DistributedLock;
use crate::error::LockError;
use crate::handle::ScopedLockHandle;

/// RAII-flavoured convenience wrapper over [`DistributedLock`] that
/// guarantees release on every exit path of a scope -- success, early
/// return, error propagation via `?`, or task cancellation.
///
/// Async `Drop` does not exist, so the guarantee on the *cancellation* path
/// is best-effort: dropping a still-acquired [`ScopedGuard`] spawns a
/// detached release task and logs a warning. The synchronous paths (calling
/// [`ScopedLock::with_lock`] to completion, or explicit
/// [`ScopedGuard::release`]) always await the real release and do not rely
/// on `Drop` at all.
pub struct ScopedLock {
    lock: Arc<DistributedLock>,
}

impl ScopedLock {
    #[must_use]
    pub fn new(lock: Arc<DistributedLock>) -> Self {
        Self { lock }
    }

    /// Run `body` while holding `resource_id`, releasing unconditionally
    /// afterwards regardless of whether `body` returned `Ok` or `Err`.
    /// Returns `Err(ScopedLockError::NotAcquired)` if the lock could not be
    /// acquired within `wait_budget`, surfacing contention as an error rather
    /// than silently skipping `body`.
    pub async fn with_lock<T, E, F, Fut>(
        &self,
        resource_id: &str,
        lease_ttl: Duration,
        wait_budget: Duration,
        poll_base: Duration,
        body: F,
    ) -> Result<T, ScopedLockError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let handle = self
            .lock
            .acquire(resource_id, lease_ttl, wait_budget, poll_base)
            .await
            .map_err(ScopedLockError::Lock)?;

        if !handle.acquired {
            return Err(ScopedLockError::NotAcquired(resource_id.to_owned()));
        }

        let result = body().await;

        if let Err(release_err) = self.lock.release(handle).await {
            warn!(resource_id, error = %release_err, "release after with_lock body failed");
        }

        result.map_err(ScopedLockError::Body)
    }

    /// Acquire without running a caller-supplied body, returning a guard
    /// whose `Drop` makes a best-effort release attempt if the caller never
    /// calls [`ScopedGuard::release`] explicitly.
    pub async fn acquire_guarded(
        &self,
        resource_id: &str,
        lease_ttl: Duration,
        wait_budget: Duration,
        poll_base: Duration,
    ) -> Result<ScopedGuard, LockError> {
        let handle = self
            .lock
            .acquire(resource_id, lease_ttl, wait_budget, poll_base)
            .await?;
        Ok(ScopedGuard {
            lock: Arc::clone(&self.lock),
            handle: Some(handle),
        })
    }
}

/// Error returned from [`ScopedLock::with_lock`]: either the lock layer
/// failed, contention prevented acquisition within `wait_budget`, or `body`
/// returned its own error after the lock was already held.
///
/// `NotAcquired` is kept distinct from [`LockError::Invariant`] -- a timed
/// out acquisition is an ordinary contention outcome, not a programmer
/// error.
#[derive(Debug, thiserror::Error)]
pub enum ScopedLockError<E> {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("lock for resource {0:?} was not acquired within the wait budget")]
    NotAcquired(String),
    #[error(transparent)]
    Body(E),
}

/// A held (or not-held) lock whose release is guaranteed best-effort even
/// if the caller forgets to call [`Self::release`] explicitly.
pub struct ScopedGuard {
    lock: Arc<DistributedLock>,
    handle: Option<ScopedLockHandle>,
}

impl ScopedGuard {
    #[must_use]
    pub fn acquired(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| h.acquired)
    }

    /// Explicit, awaited release. Idempotent -- calling this twice, or
    /// calling it on a handle that was never acquired, is always safe.
    pub async fn release(mut self) -> Result<bool, LockError> {
        match self.handle.take() {
            Some(handle) => self.lock.release(handle).await,
            None => Ok(false),
        }
    }
}

impl Drop for ScopedGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if !handle.acquired {
            return;
        }
        warn!(
            resource_id = handle.resource_id(),
            "ScopedGuard dropped while still holding a lock; spawning detached release"
        );
        let lock = Arc::clone(&self.lock);
        tokio::spawn(async move {
            if let Err(err) = lock.release(handle).await {
                warn!(error = %err, "detached release on drop failed");
            }
        });
    }
}
