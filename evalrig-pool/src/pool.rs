use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use evalrig_lock::{DistributedLock, ScopedLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::orchestrator::{DeploymentSpec, OrchestratorClient, OrchestratorError};
use crate::record::{DeploymentRecord, DeploymentState};
use crate::store::PoolStore;

/// A deployment handed out by [`DeploymentPool::allocate`]. Callers run
/// their agent against `deployment_name`/`deployment_id`, then return it via
/// [`DeploymentPool::release`].
#[derive(Debug, Clone)]
pub struct DeploymentHandle {
    pub deployment_id: String,
    pub deployment_name: String,
    pub allocator_token: String,
}

/// A capacity slot reserved against `pool_hard_cap` while still holding the
/// pool lock, so the slow `orchestrator.create` call in
/// [`DeploymentPool::provision_now`] can run after the lock is released
/// without a second caller racing past the cap in the meantime.
///
/// Reserved via a placeholder [`DeploymentRecord`] in `Waking` state --
/// placeholders count toward the hard cap like any other in-flight record.
/// `Drop` retires the placeholder if the reservation is never finalized
/// (e.g. the caller's future is cancelled between reserving and calling
/// `provision_now`), so a cancelled `allocate` does not leak a permanently
/// reserved slot.
struct ProvisionReservation {
    store: Arc<dyn PoolStore>,
    placeholder_id: Option<String>,
}

impl ProvisionReservation {
    /// Disarm the drop-time cleanup and hand back the placeholder id for
    /// `provision_now` to finalize (by retiring it and upserting the real
    /// record under the orchestrator-assigned id).
    fn take(mut self) -> String {
        self.placeholder_id.take().expect("reservation already finalized")
    }
}

impl Drop for ProvisionReservation {
    fn drop(&mut self) {
        let Some(placeholder_id) = self.placeholder_id.take() else {
            return;
        };
        let cancelled = PoolError::Cancelled(placeholder_id.clone());
        warn!(error = %cancelled, "allocate cancelled mid-reservation; retiring placeholder");
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(err) = store.retire(&placeholder_id).await {
                warn!(placeholder_id, error = %err, "failed to retire orphaned placeholder after cancellation");
            }
        });
    }
}

/// Outcome of deciding, under the pool lock, what the caller should do next.
enum AllocationAttempt {
    Claimed(DeploymentRecord),
    Reserved(ProvisionReservation),
    NoCapacity,
}

/// Allocates pre-created, hibernated deployments from a shared pool to
/// concurrent callers, provisioning new ones on starvation up to
/// `pool_hard_cap`, under a pool-level [`DistributedLock`].
///
/// Orchestrator calls (`wake`/`hibernate`/`create`) are always made outside
/// the lock to keep the critical section short -- provisioning decisions
/// reserve capacity under the lock via [`ProvisionReservation`], then
/// finalize after the lock is released.
pub struct DeploymentPool {
    config: PoolConfig,
    store: Arc<dyn PoolStore>,
    orchestrator: Arc<dyn OrchestratorClient>,
    lock: ScopedLock,
}

impl DeploymentPool {
    #[must_use]
    pub fn new(
        config: PoolConfig,
        store: Arc<dyn PoolStore>,
        orchestrator: Arc<dyn OrchestratorClient>,
        lock: Arc<DistributedLock>,
    ) -> Self {
        Self {
            config,
            store,
            orchestrator,
            lock: ScopedLock::new(lock),
        }
    }

    fn pool_lock_name(&self) -> String {
        format!("pool:{}", self.config.pool_name)
    }

    /// Allocate a deployment, provisioning a new one if the pool is
    /// starved and under `pool_hard_cap`. Fails with [`PoolError::PoolBusy`]
    /// if nothing becomes available within `max_wait`.
    ///
    /// `required_fingerprint`, when set, restricts reuse to hibernated
    /// records last deployed with a matching `build_fingerprint` (see
    /// DESIGN.md for the rationale -- opt-in, off by default).
    pub async fn allocate(
        &self,
        allocator_token: &str,
        max_wait: Duration,
        required_fingerprint: Option<&str>,
    ) -> Result<DeploymentHandle, PoolError> {
        let deadline = Instant::now() + max_wait;
        let mut attempt = 0u32;

        loop {
            match self
                .allocate_once(allocator_token, max_wait, required_fingerprint)
                .await?
            {
                Some(handle) => return Ok(handle),
                None => {
                    if Instant::now() >= deadline {
                        return Err(PoolError::PoolBusy {
                            pool_name: self.config.pool_name.clone(),
                        });
                    }
                    let backoff = Duration::from_millis(100 * 2u64.pow(attempt.min(4)))
                        .min(Duration::from_secs(2));
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    tokio::time::sleep(backoff.min(remaining)).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// One pass of the allocate procedure. Returns
    /// `Ok(None)` when the caller should back off and retry (lock not
    /// acquired, or hard cap reached with nothing free).
    ///
    /// The pool lock is held only long enough to decide whether to reuse a
    /// hibernated record or reserve a provisioning slot -- the slow
    /// `wake`/`create` orchestrator calls always happen after the guard is
    /// released below.
    async fn allocate_once(
        &self,
        allocator_token: &str,
        remaining_wait: Duration,
        required_fingerprint: Option<&str>,
    ) -> Result<Option<DeploymentHandle>, PoolError> {
        let lock_name = self.pool_lock_name();
        let guard = self
            .lock
            .acquire_guarded(
                &lock_name,
                self.config.pool_lock_ttl,
                remaining_wait,
                Duration::from_millis(50),
            )
            .await
            .map_err(|err| PoolError::from_lock_error(&self.config.pool_name, &err))?;

        if !guard.acquired() {
            return Ok(None);
        }

        if let Err(err) = self.store.reclaim_overdue(Utc::now()).await {
            warn!(pool_name = %self.config.pool_name, error = %err, "reclaim_overdue failed");
        }

        let deadline = Utc::now()
            + chrono::Duration::from_std(self.config.allocation_ttl)
                .unwrap_or(chrono::Duration::zero());

        let attempt = self
            .claim_or_reserve(allocator_token, deadline, required_fingerprint)
            .await;
        guard.release().await.ok();
        let attempt = attempt?;

        match attempt {
            AllocationAttempt::Claimed(record) => {
                self.wake_claimed(record, allocator_token).await.map(Some)
            }
            AllocationAttempt::Reserved(reservation) => self
                .provision_now(allocator_token, deadline, reservation)
                .await
                .map(Some),
            AllocationAttempt::NoCapacity => Ok(None),
        }
    }

    /// Try to claim a hibernated record; if none is free, reserve a
    /// provisioning slot against the hard cap. Must be called while holding
    /// the pool lock.
    async fn claim_or_reserve(
        &self,
        allocator_token: &str,
        deadline: chrono::DateTime<Utc>,
        required_fingerprint: Option<&str>,
    ) -> Result<AllocationAttempt, PoolError> {
        let claimed = self
            .store
            .claim_one_hibernated(&self.config.pool_name, allocator_token, deadline, required_fingerprint)
            .await?;

        if let Some(record) = claimed {
            return Ok(AllocationAttempt::Claimed(record));
        }

        match self.reserve_provision_slot().await? {
            Some(reservation) => Ok(AllocationAttempt::Reserved(reservation)),
            None => Ok(AllocationAttempt::NoCapacity),
        }
    }

    /// Count in-flight records against `pool_hard_cap` and, if there is
    /// room, upsert a placeholder record to reserve a slot. Must be called
    /// while holding the pool lock.
    async fn reserve_provision_slot(&self) -> Result<Option<ProvisionReservation>, PoolError> {
        let mut in_flight = 0u32;
        for state in [
            DeploymentState::Hibernated,
            DeploymentState::Allocated,
            DeploymentState::Waking,
            DeploymentState::Hibernating,
        ] {
            in_flight += self
                .store
                .list_by_state(&self.config.pool_name, state)
                .await?
                .len() as u32;
        }

        if in_flight >= self.config.pool_hard_cap {
            debug!(
                pool_name = %self.config.pool_name,
                in_flight,
                hard_cap = self.config.pool_hard_cap,
                "hard cap reached, not provisioning"
            );
            return Ok(None);
        }

        let placeholder_id = format!("{}-reserve-{}", self.config.pool_name, evalrig_core::random_token());
        let placeholder = DeploymentRecord::new_waking(
            placeholder_id.clone(),
            self.config.pool_name.clone(),
            format!("{}-pending", self.config.pool_name),
            Utc::now(),
            None,
        );
        self.store.upsert(placeholder).await?;

        Ok(Some(ProvisionReservation {
            store: Arc::clone(&self.store),
            placeholder_id: Some(placeholder_id),
        }))
    }

    /// Wake a freshly claimed record, retrying the
    /// whole allocate-from-claim procedure up to `allocate_retry` times on
    /// wake failure before propagating. Each individual `wake` call is
    /// itself retried up to `orchestrator_retry` times on a transient
    /// orchestrator error before being counted as a failed attempt.
    async fn wake_claimed(
        &self,
        record: DeploymentRecord,
        allocator_token: &str,
    ) -> Result<DeploymentHandle, PoolError> {
        let mut record = record;
        for attempt in 0..=self.config.allocate_retry {
            let deployment_id = record.deployment_id.clone();
            match self
                .retry_orchestrator_call(&deployment_id, "wake", || self.orchestrator.wake(&deployment_id))
                .await
            {
                Ok(()) => {
                    info!(
                        deployment_id = %record.deployment_id,
                        pool_name = %self.config.pool_name,
                        "deployment woken"
                    );
                    return Ok(DeploymentHandle {
                        deployment_id: record.deployment_id,
                        deployment_name: record.deployment_name,
                        allocator_token: allocator_token.to_owned(),
                    });
                }
                Err(err) => {
                    warn!(
                        deployment_id = %record.deployment_id,
                        attempt,
                        error = %err,
                        "wake failed after exhausting orchestrator retries"
                    );
                    self.fail_record(&record.deployment_id).await;

                    if attempt >= self.config.allocate_retry {
                        return Err(PoolError::OrchestratorPermanent {
                            deployment_id: record.deployment_id,
                            message: err.to_string(),
                        });
                    }

                    let lock_name = self.pool_lock_name();
                    let guard = self
                        .lock
                        .acquire_guarded(
                            &lock_name,
                            self.config.pool_lock_ttl,
                            self.config.pool_lock_ttl,
                            Duration::from_millis(50),
                        )
                        .await
                        .map_err(|err| PoolError::from_lock_error(&self.config.pool_name, &err))?;
                    if !guard.acquired() {
                        return Err(PoolError::PoolBusy {
                            pool_name: self.config.pool_name.clone(),
                        });
                    }

                    let deadline = Utc::now()
                        + chrono::Duration::from_std(self.config.allocation_ttl)
                            .unwrap_or(chrono::Duration::zero());
                    let attempt_result = self.claim_or_reserve(allocator_token, deadline, None).await;
                    guard.release().await.ok();
                    let claim_attempt = attempt_result?;

                    record = match claim_attempt {
                        AllocationAttempt::Claimed(next) => next,
                        AllocationAttempt::Reserved(reservation) => {
                            return self.provision_now(allocator_token, deadline, reservation).await;
                        }
                        AllocationAttempt::NoCapacity => {
                            return Err(PoolError::PoolBusy {
                                pool_name: self.config.pool_name.clone(),
                            });
                        }
                    };
                }
            }
        }
        unreachable!("loop always returns before exhausting retries")
    }

    /// Retry a single orchestrator call up to `orchestrator_retry` times on
    /// a retryable [`OrchestratorError`], then propagate.
    async fn retry_orchestrator_call<F, Fut>(
        &self,
        deployment_id: &str,
        op: &str,
        f: F,
    ) -> Result<(), OrchestratorError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<(), OrchestratorError>>,
    {
        let mut attempt = 0u32;
        loop {
            match f().await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() && attempt < self.config.orchestrator_retry => {
                    warn!(deployment_id, op, attempt, error = %err, "retrying transient orchestrator error");
                    tokio::time::sleep(Duration::from_millis(100 * 2u64.pow(attempt.min(4)))).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Mark a record `Failed` and, once it has accumulated more than
    /// `max_consecutive_failures`, retire it instead of leaving it to be
    /// retried again by a future claim.
    async fn fail_record(&self, deployment_id: &str) {
        if let Err(err) = self.store.set_state(deployment_id, DeploymentState::Failed).await {
            warn!(deployment_id, error = %err, "failed to mark record FAILED");
            return;
        }

        let failure_count = match self
            .store
            .list_by_state(&self.config.pool_name, DeploymentState::Failed)
            .await
        {
            Ok(records) => records
                .into_iter()
                .find(|r| r.deployment_id == deployment_id)
                .map(|r| r.failure_count),
            Err(err) => {
                warn!(deployment_id, error = %err, "failed to read back failure count");
                None
            }
        };

        if let Some(failure_count) = failure_count {
            if failure_count >= self.config.max_consecutive_failures {
                if let Err(err) = self.store.retire(deployment_id).await {
                    warn!(deployment_id, error = %err, "failed to retire record after repeated failures");
                } else {
                    info!(deployment_id, failure_count, "record retired after repeated failures");
                }
            }
        }
    }

    /// Finalize a [`ProvisionReservation`]: call the orchestrator outside
    /// any lock, then retire the placeholder either way -- on success it is
    /// superseded by the real record under the orchestrator-assigned id, on
    /// failure its reserved slot is simply freed.
    async fn provision_now(
        &self,
        allocator_token: &str,
        deadline: chrono::DateTime<Utc>,
        reservation: ProvisionReservation,
    ) -> Result<DeploymentHandle, PoolError> {
        let placeholder_id = reservation.take();
        let deployment_name = format!("{}-{}", self.config.pool_name, evalrig_core::random_token());
        let spec = DeploymentSpec {
            pool_name: self.config.pool_name.clone(),
            deployment_name: deployment_name.clone(),
            build_fingerprint: None,
        };

        let deployment_id = match self.orchestrator.create(&spec).await {
            Ok(id) => id,
            Err(err) => {
                if let Err(retire_err) = self.store.retire(&placeholder_id).await {
                    warn!(placeholder_id, error = %retire_err, "failed to retire placeholder after create failure");
                }
                return Err(PoolError::OrchestratorPermanent {
                    deployment_id: deployment_name,
                    message: err.to_string(),
                });
            }
        };

        if let Err(err) = self.store.retire(&placeholder_id).await {
            warn!(placeholder_id, error = %err, "failed to retire placeholder after successful create");
        }

        let record = DeploymentRecord::new_waking(
            deployment_id.clone(),
            self.config.pool_name.clone(),
            deployment_name.clone(),
            Utc::now(),
            None,
        );
        self.store.upsert(record).await?;

        self.store
            .set_state(&deployment_id, DeploymentState::Allocated)
            .await?;
        let mut record = self
            .store
            .list_by_state(&self.config.pool_name, DeploymentState::Allocated)
            .await?
            .into_iter()
            .find(|r| r.deployment_id == deployment_id)
            .ok_or_else(|| {
                PoolError::Invariant(deployment_id.clone(), "record vanished after upsert".into())
            })?;
        record.allocation_deadline = Some(deadline);
        record.allocated_to = Some(allocator_token.to_owned());
        self.store.upsert(record).await?;

        info!(deployment_id = %deployment_id, pool_name = %self.config.pool_name, "deployment provisioned");

        Ok(DeploymentHandle {
            deployment_id,
            deployment_name,
            allocator_token: allocator_token.to_owned(),
        })
    }

    /// Return a deployment to the pool: hibernate
    /// through the orchestrator, then mark `Hibernated` in the store, under
    /// the pool lock throughout.
    pub async fn release(&self, handle: DeploymentHandle) -> Result<(), PoolError> {
        let lock_name = self.pool_lock_name();
        let guard = self
            .lock
            .acquire_guarded(
                &lock_name,
                self.config.pool_lock_ttl,
                self.config.pool_lock_ttl,
                Duration::from_millis(50),
            )
            .await
            .map_err(|err| PoolError::from_lock_error(&self.config.pool_name, &err))?;

        if !guard.acquired() {
            return Err(PoolError::PoolBusy {
                pool_name: self.config.pool_name.clone(),
            });
        }

        let deployment_id = handle.deployment_id.clone();
        let result = match self
            .retry_orchestrator_call(&deployment_id, "hibernate", || {
                self.orchestrator.hibernate(&deployment_id)
            })
            .await
        {
            Ok(()) => self
                .store
                .release(&handle.deployment_id, &handle.allocator_token)
                .await
                .map(|_| ()),
            Err(err) => {
                warn!(deployment_id = %handle.deployment_id, error = %err, "hibernate failed after exhausting orchestrator retries");
                self.fail_record(&handle.deployment_id).await;
                Err(PoolError::OrchestratorTransient {
                    deployment_id: handle.deployment_id.clone(),
                    message: err.to_string(),
                })
            }
        };

        guard.release().await.ok();
        result
    }

    /// End-of-run teardown: retires every record past `idle_keepalive` and
    /// asks the orchestrator to destroy it.
    pub async fn drain(&self) -> Result<(), PoolError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.idle_keepalive).unwrap_or(chrono::Duration::zero());

        let mut idle = Vec::new();
        for state in [
            DeploymentState::Hibernated,
            DeploymentState::Failed,
        ] {
            idle.extend(self.store.list_by_state(&self.config.pool_name, state).await?);
        }

        for record in idle {
            if record.last_used_at > cutoff {
                continue;
            }
            self.store.retire(&record.deployment_id).await?;
            if let Err(err) = self.orchestrator.destroy(&record.deployment_id).await {
                warn!(deployment_id = %record.deployment_id, error = %err, "destroy during drain failed");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{InMemoryPoolStore, MockOrchestrator};
    use evalrig_lock_memory::MemoryLockStore;
    use async_trait::async_trait;

    /// Wraps [`InMemoryPoolStore`] with an artificial delay before
    /// `claim_one_hibernated` completes, so a test can cancel an in-flight
    /// `allocate` while the pool lock is still held inside it.
    struct SlowPoolStore {
        inner: InMemoryPoolStore,
        delay: Duration,
    }

    #[async_trait]
    impl PoolStore for SlowPoolStore {
        async fn list_by_state(
            &self,
            pool_name: &str,
            state: DeploymentState,
        ) -> Result<Vec<DeploymentRecord>, PoolError> {
            self.inner.list_by_state(pool_name, state).await
        }

        async fn claim_one_hibernated(
            &self,
            pool_name: &str,
            allocator_token: &str,
            deadline: chrono::DateTime<Utc>,
            required_fingerprint: Option<&str>,
        ) -> Result<Option<DeploymentRecord>, PoolError> {
            tokio::time::sleep(self.delay).await;
            self.inner
                .claim_one_hibernated(pool_name, allocator_token, deadline, required_fingerprint)
                .await
        }

        async fn release(&self, deployment_id: &str, allocator_token: &str) -> Result<bool, PoolError> {
            self.inner.release(deployment_id, allocator_token).await
        }

        async fn upsert(&self, record: DeploymentRecord) -> Result<(), PoolError> {
            self.inner.upsert(record).await
        }

        async fn set_state(&self, deployment_id: &str, state: DeploymentState) -> Result<(), PoolError> {
            self.inner.set_state(deployment_id, state).await
        }

        async fn retire(&self, deployment_id: &str) -> Result<(), PoolError> {
            self.inner.retire(deployment_id).await
        }

        async fn reclaim_overdue(&self, now: chrono::DateTime<Utc>) -> Result<Vec<DeploymentRecord>, PoolError> {
            self.inner.reclaim_overdue(now).await
        }
    }

    fn test_pool(config: PoolConfig) -> (DeploymentPool, Arc<InMemoryPoolStore>, Arc<MockOrchestrator>) {
        let store = Arc::new(InMemoryPoolStore::new());
        let orchestrator = Arc::new(MockOrchestrator::new());
        let lock = Arc::new(DistributedLock::new(Arc::new(MemoryLockStore::new())));
        let pool = DeploymentPool::new(config, Arc::clone(&store) as Arc<dyn PoolStore>, Arc::clone(&orchestrator) as Arc<dyn OrchestratorClient>, lock);
        (pool, store, orchestrator)
    }

    // S6 -- pool allocation reuse.
    #[tokio::test]
    async fn reuses_hibernated_records_before_provisioning() {
        let config = PoolConfig {
            pool_name: "p".into(),
            pool_hard_cap: 2,
            ..PoolConfig::default()
        };
        let (pool, store, orchestrator) = test_pool(config);
        store.seed_hibernated("p", 2).await;

        let h1 = pool.allocate("tok-1", Duration::from_secs(5), None).await.unwrap();
        let h2 = pool.allocate("tok-2", Duration::from_secs(5), None).await.unwrap();
        assert_ne!(h1.deployment_id, h2.deployment_id);
        assert_eq!(orchestrator.create_calls(), 0);

        let busy = pool.allocate("tok-3", Duration::from_millis(100), None).await;
        assert!(matches!(busy, Err(PoolError::PoolBusy { .. })));
    }

    // S7 -- pool starvation provisions.
    #[tokio::test]
    async fn provisions_new_deployments_up_to_hard_cap() {
        let config = PoolConfig {
            pool_name: "p".into(),
            pool_hard_cap: 3,
            ..PoolConfig::default()
        };
        let (pool, _store, orchestrator) = test_pool(config);

        let mut handles = Vec::new();
        for i in 0..3 {
            handles.push(
                pool.allocate(&format!("tok-{i}"), Duration::from_secs(5), None)
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(orchestrator.create_calls(), 3);

        let busy = pool.allocate("tok-over", Duration::from_millis(100), None).await;
        assert!(matches!(busy, Err(PoolError::PoolBusy { .. })));

        pool.release(handles.pop().unwrap()).await.unwrap();
        let reused = pool.allocate("tok-reuse", Duration::from_secs(5), None).await;
        assert!(reused.is_ok());
    }

    #[tokio::test]
    async fn allocate_then_release_is_invariant_preserving() {
        let config = PoolConfig {
            pool_name: "p".into(),
            pool_hard_cap: 2,
            ..PoolConfig::default()
        };
        let (pool, store, _orchestrator) = test_pool(config);
        store.seed_hibernated("p", 1).await;

        let before = store.list_by_state("p", DeploymentState::Hibernated).await.unwrap();
        assert_eq!(before.len(), 1);

        let handle = pool.allocate("tok-1", Duration::from_secs(5), None).await.unwrap();
        pool.release(handle).await.unwrap();

        let after = store.list_by_state("p", DeploymentState::Hibernated).await.unwrap();
        assert_eq!(after.len(), 1);
        assert!(after[0].invariants_hold());
    }

    // S8 -- orphan reclamation.
    #[tokio::test(start_paused = true)]
    async fn reclaims_overdue_allocation_before_next_allocate() {
        let config = PoolConfig {
            pool_name: "p".into(),
            pool_hard_cap: 1,
            allocation_ttl: Duration::from_secs(1),
            ..PoolConfig::default()
        };
        let (pool, store, orchestrator) = test_pool(config);
        store.seed_hibernated("p", 1).await;

        let _orphaned = pool.allocate("tok-1", Duration::from_secs(5), None).await.unwrap();
        // Worker disappears without releasing.

        tokio::time::advance(Duration::from_secs(2)).await;

        let recovered = pool.allocate("tok-2", Duration::from_secs(5), None).await.unwrap();
        assert_eq!(orchestrator.wake_calls(), 2, "reclaimed record must be woken again before reuse");
        assert!(!recovered.deployment_id.is_empty());
    }

    /// `wake_claimed` exhausts `orchestrator_retry` transient wake failures
    /// before counting the attempt as failed, instead of giving up on the
    /// first error.
    #[tokio::test]
    async fn wake_retries_transient_failures_before_failing_record() {
        let config = PoolConfig {
            pool_name: "p".into(),
            pool_hard_cap: 1,
            orchestrator_retry: 2,
            ..PoolConfig::default()
        };
        let (pool, store, orchestrator) = test_pool(config);
        store.seed_hibernated("p", 1).await;

        orchestrator.fail_next_wake();
        let handle = pool.allocate("tok-1", Duration::from_secs(5), None).await.unwrap();
        assert!(!handle.deployment_id.is_empty());
        assert!(orchestrator.wake_calls() >= 2, "a single transient wake failure must be retried, not failed immediately");

        let failed = store.list_by_state("p", DeploymentState::Failed).await.unwrap();
        assert!(failed.is_empty(), "a wake that eventually succeeds must not mark the record failed");
    }

    /// A record that fails `max_consecutive_failures` times in a row is
    /// retired rather than left `Failed` for another claim to retry.
    #[tokio::test]
    async fn record_is_retired_after_max_consecutive_failures() {
        let config = PoolConfig {
            pool_name: "p".into(),
            pool_hard_cap: 1,
            orchestrator_retry: 0,
            allocate_retry: 0,
            max_consecutive_failures: 1,
            ..PoolConfig::default()
        };
        let (pool, store, orchestrator) = test_pool(config);
        store.seed_hibernated("p", 1).await;

        orchestrator.fail_next_wake();
        let result = pool.allocate("tok-1", Duration::from_secs(5), None).await;
        assert!(result.is_err(), "wake failure with allocate_retry=0 must propagate");

        let retired = store.list_by_state("p", DeploymentState::Retired).await.unwrap();
        assert_eq!(retired.len(), 1, "the record must be retired once its failure_count exceeds the threshold");
    }

    // Concurrent contention over the pool lock and hard cap -- exercises the
    // same race the sequential S6/S7 tests cannot: two callers racing
    // `allocate` at once must never both reuse the same hibernated record,
    // and must never jointly exceed `pool_hard_cap`.
    #[tokio::test]
    async fn concurrent_allocate_respects_hard_cap_and_exclusivity() {
        let config = PoolConfig {
            pool_name: "p".into(),
            pool_hard_cap: 2,
            ..PoolConfig::default()
        };
        let (pool, store, orchestrator) = test_pool(config);
        store.seed_hibernated("p", 1).await;
        let pool = Arc::new(pool);

        let mut handles = Vec::new();
        for i in 0..4 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move {
                pool.allocate(&format!("tok-{i}"), Duration::from_secs(1), None).await
            }));
        }

        let mut deployment_ids = std::collections::HashSet::new();
        let mut successes = 0;
        for h in handles {
            if let Ok(handle) = h.await.unwrap() {
                assert!(deployment_ids.insert(handle.deployment_id), "the same deployment must never be handed to two concurrent callers");
                successes += 1;
            }
        }

        assert_eq!(successes, 2, "exactly pool_hard_cap allocations should succeed concurrently");
        assert!(orchestrator.create_calls() <= 1, "at most one new deployment should be provisioned beyond the seeded hibernated record");

        let allocated = store.list_by_state("p", DeploymentState::Allocated).await.unwrap();
        assert_eq!(allocated.len(), 2, "exactly hard_cap records should end up allocated");
    }

    // Cancelling `allocate` while the pool lock is held inside the critical
    // section must not leave the lock (or a reserved capacity slot) stuck
    // until TTL expiry.
    #[tokio::test]
    async fn cancelled_allocate_releases_pool_lock_promptly() {
        let config = PoolConfig {
            pool_name: "p".into(),
            pool_hard_cap: 1,
            pool_lock_ttl: Duration::from_secs(30),
            ..PoolConfig::default()
        };
        let slow_store = Arc::new(SlowPoolStore {
            inner: InMemoryPoolStore::new(),
            delay: Duration::from_millis(80),
        });
        slow_store.inner.seed_hibernated("p", 1).await;
        let orchestrator = Arc::new(MockOrchestrator::new());
        let lock = Arc::new(DistributedLock::new(Arc::new(MemoryLockStore::new())));
        let pool = Arc::new(DeploymentPool::new(
            config,
            Arc::clone(&slow_store) as Arc<dyn PoolStore>,
            orchestrator,
            lock,
        ));

        {
            let fut = pool.allocate("tok-cancel", Duration::from_secs(5), None);
            tokio::pin!(fut);
            tokio::select! {
                _ = &mut fut => panic!("allocate must not finish before the claim completes"),
                () = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
            // `fut` dropped here, cancelling `allocate` while `claim_one_hibernated`
            // is still in flight inside the pool-lock critical section.
        }

        // The detached claim may still land after cancellation; give it time
        // to finish, then confirm a fresh allocate isn't blocked by a stuck
        // lock or an orphaned placeholder/claim.
        tokio::time::sleep(Duration::from_millis(150)).await;

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            pool.allocate("tok-after-cancel", Duration::from_secs(2), None),
        )
        .await;
        assert!(
            result.is_ok(),
            "a cancelled allocate must not leave the pool lock held past its own cancellation"
        );
    }
}
