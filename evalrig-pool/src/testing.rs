//! Backend-agnostic conformance tests for [`crate::PoolStore`], plus
//! in-memory test doubles (`InMemoryPoolStore`, `MockOrchestrator`) used by
//! this crate's own unit tests and available to downstream crates writing
//! their own pool tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use evalrig_core::StoreTimestamp;

use crate::error::PoolError;
use crate::orchestrator::{DeploymentSpec, DeploymentStatus, OrchestratorClient, OrchestratorError};
use crate::record::{DeploymentRecord, DeploymentState};
use crate::store::PoolStore;

/// In-memory [`PoolStore`], single-process only -- intended for tests.
#[derive(Default)]
pub struct InMemoryPoolStore {
    records: Mutex<HashMap<String, DeploymentRecord>>,
}

impl InMemoryPoolStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Test convenience: seed `count` fresh `Hibernated` records in
    /// `pool_name`.
    pub async fn seed_hibernated(&self, pool_name: &str, count: u32) {
        let mut records = self.records.lock().unwrap();
        for _ in 0..count {
            let id = evalrig_core::random_token();
            records.insert(
                id.clone(),
                DeploymentRecord {
                    deployment_id: id.clone(),
                    pool_name: pool_name.to_owned(),
                    deployment_name: format!("{pool_name}-{id}"),
                    state: DeploymentState::Hibernated,
                    allocated_to: None,
                    allocation_deadline: None,
                    created_at: Utc::now(),
                    last_used_at: Utc::now(),
                    build_fingerprint: None,
                    failure_count: 0,
                },
            );
        }
    }
}

#[async_trait]
impl PoolStore for InMemoryPoolStore {
    async fn list_by_state(
        &self,
        pool_name: &str,
        state: DeploymentState,
    ) -> Result<Vec<DeploymentRecord>, PoolError> {
        let records = self.records.lock().unwrap();
        Ok(records
            .values()
            .filter(|r| r.pool_name == pool_name && r.state == state)
            .cloned()
            .collect())
    }

    async fn claim_one_hibernated(
        &self,
        pool_name: &str,
        allocator_token: &str,
        deadline: StoreTimestamp,
        required_fingerprint: Option<&str>,
    ) -> Result<Option<DeploymentRecord>, PoolError> {
        let mut records = self.records.lock().unwrap();
        let candidate_id = records
            .values()
            .find(|r| {
                r.pool_name == pool_name
                    && r.state == DeploymentState::Hibernated
                    && required_fingerprint
                        .is_none_or(|fp| r.build_fingerprint.as_deref() == Some(fp))
            })
            .map(|r| r.deployment_id.clone());

        let Some(id) = candidate_id else {
            return Ok(None);
        };

        let record = records.get_mut(&id).expect("just found by id");
        record.state = DeploymentState::Allocated;
        record.allocated_to = Some(allocator_token.to_owned());
        record.allocation_deadline = Some(deadline);
        record.last_used_at = Utc::now();
        Ok(Some(record.clone()))
    }

    async fn release(&self, deployment_id: &str, allocator_token: &str) -> Result<bool, PoolError> {
        let mut records = self.records.lock().unwrap();
        let Some(record) = records.get_mut(deployment_id) else {
            return Ok(false);
        };
        if record.allocated_to.as_deref() != Some(allocator_token) {
            return Ok(false);
        }
        record.state = DeploymentState::Hibernated;
        record.allocated_to = None;
        record.allocation_deadline = None;
        record.last_used_at = Utc::now();
        Ok(true)
    }

    async fn upsert(&self, record: DeploymentRecord) -> Result<(), PoolError> {
        self.records
            .lock()
            .unwrap()
            .insert(record.deployment_id.clone(), record);
        Ok(())
    }

    async fn set_state(
        &self,
        deployment_id: &str,
        state: DeploymentState,
    ) -> Result<(), PoolError> {
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(deployment_id).ok_or_else(|| {
            PoolError::Invariant(deployment_id.to_owned(), "set_state on unknown record".into())
        })?;
        if state == DeploymentState::Failed {
            record.failure_count += 1;
        }
        record.state = state;
        Ok(())
    }

    async fn retire(&self, deployment_id: &str) -> Result<(), PoolError> {
        let mut records = self.records.lock().unwrap();
        let record = records.get_mut(deployment_id).ok_or_else(|| {
            PoolError::Invariant(deployment_id.to_owned(), "retire on unknown record".into())
        })?;
        record.state = DeploymentState::Retired;
        Ok(())
    }

    async fn reclaim_overdue(&self, now: StoreTimestamp) -> Result<Vec<DeploymentRecord>, PoolError> {
        let mut records = self.records.lock().unwrap();
        let mut reclaimed = Vec::new();
        for record in records.values_mut() {
            if record.state == DeploymentState::Allocated
                && record.allocation_deadline.is_some_and(|deadline| deadline <= now)
            {
                record.state = DeploymentState::Hibernated;
                record.allocated_to = None;
                record.allocation_deadline = None;
                reclaimed.push(record.clone());
            }
        }
        Ok(reclaimed)
    }
}

/// A scriptable [`OrchestratorClient`] test double. By default every call
/// succeeds immediately; `fail_next_wake`/`fail_next_create` inject a single
/// failure for the next matching call.
#[derive(Default)]
pub struct MockOrchestrator {
    create_calls: AtomicU32,
    wake_calls: AtomicU32,
    hibernate_calls: AtomicU32,
    destroy_calls: AtomicU32,
    fail_next_wake: Mutex<bool>,
    fail_next_create: Mutex<bool>,
}

impl MockOrchestrator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_wake(&self) {
        *self.fail_next_wake.lock().unwrap() = true;
    }

    pub fn fail_next_create(&self) {
        *self.fail_next_create.lock().unwrap() = true;
    }

    #[must_use]
    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn wake_calls(&self) -> u32 {
        self.wake_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn hibernate_calls(&self) -> u32 {
        self.hibernate_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn destroy_calls(&self) -> u32 {
        self.destroy_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OrchestratorClient for MockOrchestrator {
    async fn create(&self, _spec: &DeploymentSpec) -> Result<String, OrchestratorError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if std::mem::take(&mut *self.fail_next_create.lock().unwrap()) {
            return Err(OrchestratorError::Connection("mock create failure".into()));
        }
        Ok(evalrig_core::random_token())
    }

    async fn wake(&self, _deployment_id: &str) -> Result<(), OrchestratorError> {
        self.wake_calls.fetch_add(1, Ordering::SeqCst);
        if std::mem::take(&mut *self.fail_next_wake.lock().unwrap()) {
            return Err(OrchestratorError::Timeout(std::time::Duration::from_secs(1)));
        }
        Ok(())
    }

    async fn hibernate(&self, _deployment_id: &str) -> Result<(), OrchestratorError> {
        self.hibernate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn destroy(&self, _deployment_id: &str) -> Result<(), OrchestratorError> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn status(&self, _deployment_id: &str) -> Result<DeploymentStatus, OrchestratorError> {
        Ok(DeploymentStatus::Running)
    }
}

/// Runs the full [`PoolStore`] conformance suite against `store`, panicking
/// on the first failing assertion. Pass a freshly constructed, empty store
/// scoped to its own `pool_name` namespace.
///
/// # Panics
/// Panics if any conformance assertion fails.
pub async fn run_pool_conformance_tests(store: Arc<dyn PoolStore>) {
    claim_one_hibernated_returns_none_on_empty_pool(Arc::clone(&store)).await;
    claim_one_hibernated_transitions_state(Arc::clone(&store)).await;
    claim_is_exclusive_across_concurrent_callers(Arc::clone(&store)).await;
    claim_one_hibernated_is_exclusive_under_real_concurrency(Arc::clone(&store)).await;
    release_requires_matching_token(Arc::clone(&store)).await;
    reclaim_overdue_only_affects_expired_allocations(Arc::clone(&store)).await;
    set_state_to_failed_increments_failure_count(store).await;
}

async fn claim_one_hibernated_returns_none_on_empty_pool(store: Arc<dyn PoolStore>) {
    let claimed = store
        .claim_one_hibernated("conformance-empty", "alloc-a", Utc::now(), None)
        .await
        .unwrap();
    assert!(claimed.is_none());
}

async fn claim_one_hibernated_transitions_state(store: Arc<dyn PoolStore>) {
    let pool_name = "conformance-transition";
    store
        .upsert(DeploymentRecord::new_waking(
            "d1",
            pool_name,
            "d1-name",
            Utc::now(),
            None,
        ))
        .await
        .unwrap();
    store.set_state("d1", DeploymentState::Hibernated).await.unwrap();

    let deadline = Utc::now() + chrono::Duration::seconds(60);
    let claimed = store
        .claim_one_hibernated(pool_name, "alloc-a", deadline, None)
        .await
        .unwrap()
        .expect("a hibernated record must be claimable");
    assert_eq!(claimed.state, DeploymentState::Allocated);
    assert_eq!(claimed.allocated_to.as_deref(), Some("alloc-a"));
    assert!(claimed.invariants_hold());
}

async fn claim_is_exclusive_across_concurrent_callers(store: Arc<dyn PoolStore>) {
    let pool_name = "conformance-exclusive";
    store
        .upsert(DeploymentRecord {
            state: DeploymentState::Hibernated,
            ..DeploymentRecord::new_waking("d2", pool_name, "d2-name", Utc::now(), None)
        })
        .await
        .unwrap();

    let deadline = Utc::now() + chrono::Duration::seconds(60);
    let first = store
        .claim_one_hibernated(pool_name, "alloc-a", deadline, None)
        .await
        .unwrap();
    let second = store
        .claim_one_hibernated(pool_name, "alloc-b", deadline, None)
        .await
        .unwrap();
    assert!(first.is_some());
    assert!(second.is_none(), "the same record must not be claimable twice");
}

/// Unlike [`claim_is_exclusive_across_concurrent_callers`], which calls
/// `claim_one_hibernated` sequentially, this spawns real concurrent callers
/// racing the same hibernated record through `tokio::spawn` -- the only way
/// to exercise a backend's actual row-locking rather than just its
/// single-threaded bookkeeping.
async fn claim_one_hibernated_is_exclusive_under_real_concurrency(store: Arc<dyn PoolStore>) {
    let pool_name = "conformance-concurrent-exclusive";
    store
        .upsert(DeploymentRecord {
            state: DeploymentState::Hibernated,
            ..DeploymentRecord::new_waking("d-concurrent", pool_name, "d-concurrent-name", Utc::now(), None)
        })
        .await
        .unwrap();

    let deadline = Utc::now() + chrono::Duration::seconds(60);
    let mut tasks = Vec::new();
    for i in 0..8 {
        let store = Arc::clone(&store);
        let pool_name = pool_name.to_owned();
        tasks.push(tokio::spawn(async move {
            store
                .claim_one_hibernated(&pool_name, &format!("alloc-{i}"), deadline, None)
                .await
                .unwrap()
        }));
    }

    let mut claims = 0;
    for task in tasks {
        if task.await.unwrap().is_some() {
            claims += 1;
        }
    }
    assert_eq!(claims, 1, "exactly one concurrent caller may claim the single hibernated record");
}

async fn set_state_to_failed_increments_failure_count(store: Arc<dyn PoolStore>) {
    let pool_name = "conformance-failure-count";
    store
        .upsert(DeploymentRecord::new_waking(
            "d-fail",
            pool_name,
            "d-fail-name",
            Utc::now(),
            None,
        ))
        .await
        .unwrap();

    store.set_state("d-fail", DeploymentState::Failed).await.unwrap();
    let once = store
        .list_by_state(pool_name, DeploymentState::Failed)
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.deployment_id == "d-fail")
        .expect("record must be listed as Failed");
    assert_eq!(once.failure_count, 1);

    store.set_state("d-fail", DeploymentState::Hibernated).await.unwrap();
    store.set_state("d-fail", DeploymentState::Failed).await.unwrap();
    let twice = store
        .list_by_state(pool_name, DeploymentState::Failed)
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.deployment_id == "d-fail")
        .expect("record must be listed as Failed");
    assert_eq!(twice.failure_count, 2, "failure_count must accumulate across repeated Failed transitions");
}

async fn release_requires_matching_token(store: Arc<dyn PoolStore>) {
    let pool_name = "conformance-release";
    store
        .upsert(DeploymentRecord {
            state: DeploymentState::Hibernated,
            ..DeploymentRecord::new_waking("d3", pool_name, "d3-name", Utc::now(), None)
        })
        .await
        .unwrap();
    let deadline = Utc::now() + chrono::Duration::seconds(60);
    store
        .claim_one_hibernated(pool_name, "alloc-a", deadline, None)
        .await
        .unwrap();

    assert!(!store.release("d3", "alloc-b").await.unwrap());
    assert!(store.release("d3", "alloc-a").await.unwrap());
}

async fn reclaim_overdue_only_affects_expired_allocations(store: Arc<dyn PoolStore>) {
    let pool_name = "conformance-reclaim";
    store
        .upsert(DeploymentRecord {
            state: DeploymentState::Hibernated,
            ..DeploymentRecord::new_waking("d4", pool_name, "d4-name", Utc::now(), None)
        })
        .await
        .unwrap();
    store
        .upsert(DeploymentRecord {
            state: DeploymentState::Hibernated,
            ..DeploymentRecord::new_waking("d5", pool_name, "d5-name", Utc::now(), None)
        })
        .await
        .unwrap();

    let expired_deadline = Utc::now() - chrono::Duration::seconds(1);
    let live_deadline = Utc::now() + chrono::Duration::seconds(600);
    store
        .claim_one_hibernated(pool_name, "alloc-expired", expired_deadline, None)
        .await
        .unwrap();
    store
        .claim_one_hibernated(pool_name, "alloc-live", live_deadline, None)
        .await
        .unwrap();

    let reclaimed = store.reclaim_overdue(Utc::now()).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].deployment_id, "d4");

    let hibernated = store.list_by_state(pool_name, DeploymentState::Hibernated).await.unwrap();
    assert_eq!(hibernated.len(), 1);
    assert_eq!(hibernated[0].deployment_id, "d4");

    let still_allocated = store.list_by_state(pool_name, DeploymentState::Allocated).await.unwrap();
    assert_eq!(still_allocated.len(), 1);
    assert_eq!(still_allocated[0].deployment_id, "d5");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_store_passes_conformance_suite() {
        let store: Arc<dyn PoolStore> = Arc::new(InMemoryPoolStore::new());
        run_pool_conformance_tests(store).await;
    }
}
