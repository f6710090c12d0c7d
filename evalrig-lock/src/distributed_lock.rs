use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, warn};

use evalrig_core::random_token;

use crate::backoff::{PollBackoff, StoreRetryPolicy};
use crate::error::LockError;
use crate::handle::ScopedLockHandle;
use crate::store::LockStore;

/// Mutual exclusion over opaque string `resource_id`s, backed by a
/// [`LockStore`] shared across independent worker processes.
///
/// No fairness guarantee is made under contention; the only guarantee is at
/// most one holder with a valid (non-expired) token at any instant.
/// Reentrancy is intentionally absent -- a second `try_acquire` for a
/// `resource_id` already held by the *same* caller fails exactly like any
/// other contender.
pub struct DistributedLock {
    store: Arc<dyn LockStore>,
    store_retry: StoreRetryPolicy,
    poll: PollBackoff,
}

impl DistributedLock {
    #[must_use]
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self {
            store,
            store_retry: StoreRetryPolicy::default(),
            poll: PollBackoff::new(Duration::from_millis(100)),
        }
    }

    #[must_use]
    pub fn with_store_retry(mut self, retry: StoreRetryPolicy) -> Self {
        self.store_retry = retry;
        self
    }

    #[must_use]
    pub fn with_poll_cap(mut self, poll_cap: Duration) -> Self {
        self.poll.poll_cap = poll_cap;
        self
    }

    /// `true` iff the store contains a non-expired record for `resource_id`.
    /// Non-blocking; no side effects except an opportunistic expired-sweep.
    pub async fn peek(&self, resource_id: &str) -> Result<bool, LockError> {
        self.sweep_opportunistically().await;
        let record = self.call_store(resource_id, || self.store.read(resource_id)).await?;
        Ok(record.is_some())
    }

    /// Single acquisition attempt. On success returns an acquired handle. On
    /// conflict, if the existing record is expired, sweeps and retries
    /// exactly once; otherwise returns a non-acquired handle.
    pub async fn try_acquire(
        &self,
        resource_id: &str,
        lease_ttl: Duration,
    ) -> Result<ScopedLockHandle, LockError> {
        self.try_acquire_inner(resource_id, lease_ttl, true).await
    }

    async fn try_acquire_inner(
        &self,
        resource_id: &str,
        lease_ttl: Duration,
        retry_on_expired: bool,
    ) -> Result<ScopedLockHandle, LockError> {
        let owner_token = random_token();
        let outcome = self
            .try_insert_compensating_on_cancel(resource_id, &owner_token, lease_ttl)
            .await?;

        if outcome.inserted {
            debug!(resource_id, owner_token = %owner_token, "lock acquired");
            return Ok(ScopedLockHandle::acquired(resource_id, owner_token));
        }

        let existing = outcome
            .existing_record
            .expect("try_insert conflict must report the existing record");

        if retry_on_expired && !existing.is_live(Utc::now()) {
            self.call_store(resource_id, || self.store.sweep_expired(Utc::now()))
                .await?;
            return Box::pin(self.try_acquire_inner(resource_id, lease_ttl, false)).await;
        }

        Ok(ScopedLockHandle::not_acquired(resource_id))
    }

    /// Blocking acquisition with a timeout. If `wait_budget` is zero, this is
    /// equivalent to [`Self::try_acquire`]. Otherwise polls with randomised
    /// exponential backoff until acquired or `wait_budget` elapses. Never
    /// raises on contention -- only on store errors after the configured
    /// bounded retry count.
    pub async fn acquire(
        &self,
        resource_id: &str,
        lease_ttl: Duration,
        wait_budget: Duration,
        poll_base: Duration,
    ) -> Result<ScopedLockHandle, LockError> {
        if wait_budget.is_zero() {
            return self.try_acquire(resource_id, lease_ttl).await;
        }

        let backoff = PollBackoff::with_cap(poll_base, self.poll.poll_cap);
        let deadline = Instant::now() + wait_budget;
        let mut attempt = 0u32;

        loop {
            let handle = self.try_acquire(resource_id, lease_ttl).await?;
            if handle.acquired {
                return Ok(handle);
            }

            if Instant::now() >= deadline {
                return Ok(handle);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let sleep_for = backoff.delay_for(attempt).min(remaining);
            tokio::time::sleep(sleep_for).await;
            attempt = attempt.saturating_add(1);
        }
    }

    /// Release the lock backing `handle`. Returns `true` on deletion,
    /// `false` if the token no longer owns the record (expired, swept, or
    /// never acquired). Idempotent.
    pub async fn release(&self, handle: ScopedLockHandle) -> Result<bool, LockError> {
        let Some(owner_token) = handle.owner_token else {
            return Ok(false);
        };
        let resource_id = handle.resource_id;
        let deleted = self
            .call_store(&resource_id, || {
                self.store.delete_if_owner(&resource_id, &owner_token)
            })
            .await?;
        Ok(deleted)
    }

    async fn sweep_opportunistically(&self) {
        if let Err(err) = self.store.sweep_expired(Utc::now()).await {
            warn!(error = %err, "opportunistic sweep failed; continuing");
        }
    }

    /// `try_insert` with cancellation compensation.
    ///
    /// The insert itself runs on a detached task so it survives the caller
    /// dropping this future mid-flight (e.g. raced against a timeout in a
    /// `tokio::select!`). A `oneshot` channel hands the result back; if the
    /// receiver is gone by the time the insert completes, the caller was
    /// cancelled after the record had already landed, so the task
    /// immediately issues the compensating `delete_if_owner` instead of
    /// leaving the orphaned record for the lease TTL to clean up.
    async fn try_insert_compensating_on_cancel(
        &self,
        resource_id: &str,
        owner_token: &str,
        lease_ttl: Duration,
    ) -> Result<crate::record::TryInsertOutcome, LockError> {
        let store = Arc::clone(&self.store);
        let retry = self.store_retry;
        let resource_id_owned = resource_id.to_owned();
        let owner_token_owned = owner_token.to_owned();
        let (tx, rx) = tokio::sync::oneshot::channel();

        let task_resource_id = resource_id_owned.clone();
        tokio::spawn(async move {
            let result = Self::retry_store_call(&retry, &task_resource_id, || {
                store.try_insert(&task_resource_id, &owner_token_owned, lease_ttl)
            })
            .await;

            if tx.is_closed() {
                if matches!(&result, Ok(outcome) if outcome.inserted) {
                    let cancelled = LockError::Cancelled(task_resource_id.clone());
                    warn!(owner_token = %owner_token_owned, error = %cancelled, "compensating delete after cancellation");
                    if let Err(err) = store.delete_if_owner(&task_resource_id, &owner_token_owned).await {
                        warn!(resource_id = %task_resource_id, error = %err, "compensating delete_if_owner failed");
                    }
                }
                return;
            }

            let _ = tx.send(result);
        });

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(LockError::Permanent {
                resource_id: resource_id_owned,
                message: "lock insertion task ended without a result".into(),
            }),
        }
    }

    /// Retry a store call up to `store_retry.max_attempts` times on
    /// [`LockError::Transient`], then propagate.
    async fn call_store<'a, T, F, Fut>(&'a self, resource_id: &str, f: F) -> Result<T, LockError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, LockError>> + 'a,
    {
        Self::retry_store_call(&self.store_retry, resource_id, f).await
    }

    async fn retry_store_call<T, F, Fut>(
        retry: &StoreRetryPolicy,
        resource_id: &str,
        f: F,
    ) -> Result<T, LockError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, LockError>>,
    {
        let mut attempt = 0u32;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < retry.max_attempts => {
                    warn!(resource_id, attempt, error = %err, "retrying transient store error");
                    tokio::time::sleep(retry.delay_for(attempt)).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{LockRecord, TryInsertOutcome};
    use async_trait::async_trait;
    use evalrig_core::StoreTimestamp;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStore {
        records: Mutex<std::collections::HashMap<String, LockRecord>>,
    }

    #[async_trait]
    impl LockStore for FakeStore {
        async fn try_insert(
            &self,
            resource_id: &str,
            owner_token: &str,
            lease_ttl: Duration,
        ) -> Result<TryInsertOutcome, LockError> {
            let mut records = self.records.lock().unwrap();
            let now = Utc::now();
            if let Some(existing) = records.get(resource_id) {
                if existing.is_live(now) {
                    return Ok(TryInsertOutcome::conflict(existing.clone()));
                }
            }
            let record = LockRecord {
                resource_id: resource_id.to_owned(),
                owner_token: owner_token.to_owned(),
                acquired_at: now,
                expires_at: now
                    + chrono::Duration::from_std(lease_ttl).unwrap_or(chrono::Duration::zero()),
                holder_hint: None,
            };
            records.insert(resource_id.to_owned(), record);
            Ok(TryInsertOutcome::inserted())
        }

        async fn delete_if_owner(
            &self,
            resource_id: &str,
            owner_token: &str,
        ) -> Result<bool, LockError> {
            let mut records = self.records.lock().unwrap();
            if let Some(existing) = records.get(resource_id) {
                if existing.owner_token == owner_token {
                    records.remove(resource_id);
                    return Ok(true);
                }
            }
            Ok(false)
        }

        async fn read(&self, resource_id: &str) -> Result<Option<LockRecord>, LockError> {
            let records = self.records.lock().unwrap();
            Ok(records
                .get(resource_id)
                .filter(|r| r.is_live(Utc::now()))
                .cloned())
        }

        async fn sweep_expired(&self, now: StoreTimestamp) -> Result<u64, LockError> {
            let mut records = self.records.lock().unwrap();
            let before = records.len();
            records.retain(|_, r| r.is_live(now));
            Ok((before - records.len()) as u64)
        }
    }

    fn fake_lock() -> DistributedLock {
        DistributedLock::new(Arc::new(FakeStore::default()))
    }

    /// Wraps [`FakeStore`] with an artificial delay before `try_insert`
    /// completes, so a test can race a cancellation against an insert still
    /// in flight.
    #[derive(Default)]
    struct DelayedStore {
        inner: FakeStore,
        insert_delay: Duration,
    }

    #[async_trait]
    impl LockStore for DelayedStore {
        async fn try_insert(
            &self,
            resource_id: &str,
            owner_token: &str,
            lease_ttl: Duration,
        ) -> Result<TryInsertOutcome, LockError> {
            tokio::time::sleep(self.insert_delay).await;
            self.inner.try_insert(resource_id, owner_token, lease_ttl).await
        }

        async fn delete_if_owner(&self, resource_id: &str, owner_token: &str) -> Result<bool, LockError> {
            self.inner.delete_if_owner(resource_id, owner_token).await
        }

        async fn read(&self, resource_id: &str) -> Result<Option<LockRecord>, LockError> {
            self.inner.read(resource_id).await
        }

        async fn sweep_expired(&self, now: StoreTimestamp) -> Result<u64, LockError> {
            self.inner.sweep_expired(now).await
        }
    }

    // S1 -- basic lock lifecycle.
    #[tokio::test]
    async fn s1_basic_lock_lifecycle() {
        let lock = fake_lock();
        assert!(!lock.peek("r1").await.unwrap());

        let handle = lock.try_acquire("r1", Duration::from_secs(30)).await.unwrap();
        assert!(handle.acquired);
        assert!(lock.peek("r1").await.unwrap());

        assert!(lock.release(handle).await.unwrap());
        assert!(!lock.peek("r1").await.unwrap());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let lock = fake_lock();
        let handle = lock.try_acquire("r1", Duration::from_secs(30)).await.unwrap();
        let token = handle.owner_token.clone();

        assert!(lock.release(handle).await.unwrap());

        // Second release with the same token: record is gone, so false.
        let replay = ScopedLockHandle {
            resource_id: "r1".into(),
            owner_token: token,
            acquired: true,
        };
        assert!(!lock.release(replay).await.unwrap());
    }

    // S4 -- immediate non-block.
    #[tokio::test]
    async fn try_acquire_on_held_lock_is_non_blocking() {
        let lock = fake_lock();
        let _held = lock.try_acquire("r4", Duration::from_secs(30)).await.unwrap();

        let start = Instant::now();
        let second = lock.try_acquire("r4", Duration::from_secs(30)).await.unwrap();
        assert!(!second.acquired);
        assert!(Instant::now() - start < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn no_reentrancy_for_same_caller() {
        let lock = fake_lock();
        let first = lock.try_acquire("r1", Duration::from_secs(30)).await.unwrap();
        assert!(first.acquired);

        let second = lock.try_acquire("r1", Duration::from_secs(30)).await.unwrap();
        assert!(!second.acquired, "second acquire by same instance must fail");
    }

    #[tokio::test]
    async fn release_of_never_acquired_resource_returns_false() {
        let lock = fake_lock();
        let handle = ScopedLockHandle::not_acquired("ghost");
        assert!(!lock.release(handle).await.unwrap());
    }

    // S3-style -- timeout accuracy on a held lock.
    #[tokio::test]
    async fn acquire_times_out_when_never_released() {
        let lock = fake_lock();
        let _held = lock.try_acquire("r3", Duration::from_secs(60)).await.unwrap();

        let start = Instant::now();
        let handle = lock
            .acquire(
                "r3",
                Duration::from_secs(60),
                Duration::from_millis(300),
                Duration::from_millis(50),
            )
            .await
            .unwrap();
        assert!(!handle.acquired);
        let elapsed = Instant::now() - start;
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(300) + DEFAULT_TEST_POLL_CAP_MARGIN);
    }

    const DEFAULT_TEST_POLL_CAP_MARGIN: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn acquire_zero_wait_budget_behaves_like_try_acquire() {
        let lock = fake_lock();
        let _held = lock.try_acquire("r1", Duration::from_secs(30)).await.unwrap();

        let handle = lock
            .acquire("r1", Duration::from_secs(30), Duration::ZERO, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(!handle.acquired);
    }

    // S2-style -- mutual exclusion under contention across concurrent callers.
    #[tokio::test]
    async fn mutual_exclusion_under_contention() {
        let store: Arc<dyn LockStore> = Arc::new(FakeStore::default());
        let lock = Arc::new(DistributedLock::new(store));
        let active = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let max_concurrent = Arc::new(std::sync::atomic::AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let lock = Arc::clone(&lock);
            let active = Arc::clone(&active);
            let max_concurrent = Arc::clone(&max_concurrent);
            handles.push(tokio::spawn(async move {
                let handle = lock
                    .acquire(
                        "r2",
                        Duration::from_secs(5),
                        Duration::from_secs(5),
                        Duration::from_millis(20),
                    )
                    .await
                    .unwrap();
                assert!(handle.acquired);

                let now_active = active.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                max_concurrent.fetch_max(now_active, std::sync::atomic::Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                active.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);

                lock.release(handle).await.unwrap();
            }));
        }

        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(max_concurrent.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    // S5 -- expiry reclaim.
    #[tokio::test]
    async fn expired_lock_is_reclaimed_on_retry() {
        let lock = fake_lock();
        let _abandoned = lock.try_acquire("r5", Duration::from_millis(50)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;

        let handle = lock.try_acquire("r5", Duration::from_secs(30)).await.unwrap();
        assert!(handle.acquired, "try_acquire should reclaim an expired lock");
    }

    // Cancellation mid-acquire must not leave an orphaned record once the
    // in-flight insert lands.
    #[tokio::test]
    async fn cancelled_acquire_compensates_with_delete_if_owner() {
        let store: Arc<dyn LockStore> = Arc::new(DelayedStore {
            inner: FakeStore::default(),
            insert_delay: Duration::from_millis(80),
        });
        let lock = Arc::new(DistributedLock::new(store));

        {
            let fut = lock.try_acquire("r-cancel", Duration::from_secs(30));
            tokio::pin!(fut);
            tokio::select! {
                _ = &mut fut => panic!("insert must not win the race against the short timeout"),
                () = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
            // `fut` is dropped here, cancelling the acquire while the
            // detached insert is still running.
        }

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(
            !lock.peek("r-cancel").await.unwrap(),
            "cancelled acquire must not leave an orphaned record"
        );
    }
}
