//! Backend-agnostic conformance tests for [`crate::LockStore`] implementors:
//! a single async fn any backend crate (`evalrig-lock-memory`,
//! `evalrig-lock-postgres`) calls from its own `#[tokio::test]` against a
//! freshly constructed, empty store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::store::LockStore;

/// Runs the full suite against `store`, panicking on the first failing
/// assertion. Callers should pass a store scoped to a single, empty
/// namespace -- each sub-test uses distinct `resource_id`s but concurrent
/// runs against a shared table would still collide.
///
/// # Panics
/// Panics if any conformance assertion fails, surfacing the backend defect
/// directly as a test failure in the calling crate.
pub async fn run_lock_conformance_tests(store: Arc<dyn LockStore>) {
    try_insert_succeeds_on_empty_key(Arc::clone(&store)).await;
    try_insert_conflicts_on_live_record(Arc::clone(&store)).await;
    try_insert_reports_existing_record_on_conflict(Arc::clone(&store)).await;
    delete_if_owner_requires_matching_token(Arc::clone(&store)).await;
    delete_if_owner_is_idempotent(Arc::clone(&store)).await;
    read_returns_none_for_missing_key(Arc::clone(&store)).await;
    read_omits_expired_records(Arc::clone(&store)).await;
    sweep_expired_removes_only_expired(store).await;
}

async fn try_insert_succeeds_on_empty_key(store: Arc<dyn LockStore>) {
    let outcome = store
        .try_insert("conformance:fresh", "owner-a", Duration::from_secs(30))
        .await
        .expect("try_insert must succeed on an empty key");
    assert!(outcome.inserted, "try_insert on an empty key must insert");
}

async fn try_insert_conflicts_on_live_record(store: Arc<dyn LockStore>) {
    let resource_id = "conformance:live-conflict";
    store
        .try_insert(resource_id, "owner-a", Duration::from_secs(30))
        .await
        .unwrap();

    let outcome = store
        .try_insert(resource_id, "owner-b", Duration::from_secs(30))
        .await
        .unwrap();
    assert!(!outcome.inserted, "a live record must block a second try_insert");
}

async fn try_insert_reports_existing_record_on_conflict(store: Arc<dyn LockStore>) {
    let resource_id = "conformance:report-existing";
    store
        .try_insert(resource_id, "owner-a", Duration::from_secs(30))
        .await
        .unwrap();

    let outcome = store
        .try_insert(resource_id, "owner-b", Duration::from_secs(30))
        .await
        .unwrap();
    let existing = outcome
        .existing_record
        .expect("conflict must report the existing record");
    assert_eq!(existing.owner_token, "owner-a");
}

async fn delete_if_owner_requires_matching_token(store: Arc<dyn LockStore>) {
    let resource_id = "conformance:owner-mismatch";
    store
        .try_insert(resource_id, "owner-a", Duration::from_secs(30))
        .await
        .unwrap();

    let deleted = store.delete_if_owner(resource_id, "owner-b").await.unwrap();
    assert!(!deleted, "delete_if_owner must refuse a non-matching token");

    let deleted = store.delete_if_owner(resource_id, "owner-a").await.unwrap();
    assert!(deleted, "delete_if_owner must succeed for the true owner");
}

async fn delete_if_owner_is_idempotent(store: Arc<dyn LockStore>) {
    let resource_id = "conformance:idempotent-delete";
    store
        .try_insert(resource_id, "owner-a", Duration::from_secs(30))
        .await
        .unwrap();
    assert!(store.delete_if_owner(resource_id, "owner-a").await.unwrap());
    assert!(
        !store.delete_if_owner(resource_id, "owner-a").await.unwrap(),
        "second delete_if_owner on an already-deleted key must return false, not error"
    );
}

async fn read_returns_none_for_missing_key(store: Arc<dyn LockStore>) {
    let record = store.read("conformance:never-inserted").await.unwrap();
    assert!(record.is_none());
}

async fn read_omits_expired_records(store: Arc<dyn LockStore>) {
    let resource_id = "conformance:read-expired";
    store
        .try_insert(resource_id, "owner-a", Duration::from_millis(10))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    let record = store.read(resource_id).await.unwrap();
    assert!(record.is_none(), "read must not surface an expired record as live");
}

async fn sweep_expired_removes_only_expired(store: Arc<dyn LockStore>) {
    let expiring = "conformance:sweep-expiring";
    let surviving = "conformance:sweep-surviving";

    store
        .try_insert(expiring, "owner-a", Duration::from_millis(10))
        .await
        .unwrap();
    store
        .try_insert(surviving, "owner-b", Duration::from_secs(60))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;

    let swept = store.sweep_expired(Utc::now()).await.unwrap();
    assert!(swept >= 1, "sweep_expired must report at least the one expired record");

    // The expired slot is free again; a fresh owner can claim it.
    let outcome = store
        .try_insert(expiring, "owner-c", Duration::from_secs(30))
        .await
        .unwrap();
    assert!(outcome.inserted, "sweep_expired must actually remove the expired record");

    // The surviving (still-live) record must be untouched.
    let still_there = store.read(surviving).await.unwrap();
    assert!(still_there.is_some(), "sweep_expired must not remove live records");
}
