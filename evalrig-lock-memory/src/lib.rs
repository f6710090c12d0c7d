//! In-memory [`evalrig_lock::LockStore`] backed by a `DashMap` keyed by
//! resource, guarded per-entry so `try_insert` stays atomic under
//! concurrent callers within one process.
//!
//! Intended for tests and single-process deployments; records do not
//! survive past the process and are never shared across machines.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use evalrig_core::StoreTimestamp;
use evalrig_lock::{LockError, LockRecord, LockStore, TryInsertOutcome};

#[derive(Debug, Default)]
pub struct MemoryLockStore {
    records: DashMap<String, LockRecord>,
}

impl MemoryLockStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn try_insert(
        &self,
        resource_id: &str,
        owner_token: &str,
        lease_ttl: Duration,
    ) -> Result<TryInsertOutcome, LockError> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(lease_ttl).map_err(|err| LockError::Invariant(
            resource_id.to_owned(),
            format!("lease_ttl out of range: {err}"),
        ))?;

        match self.records.entry(resource_id.to_owned()) {
            Entry::Vacant(slot) => {
                slot.insert(LockRecord {
                    resource_id: resource_id.to_owned(),
                    owner_token: owner_token.to_owned(),
                    acquired_at: now,
                    expires_at: now + ttl,
                    holder_hint: None,
                });
                Ok(TryInsertOutcome::inserted())
            }
            Entry::Occupied(mut slot) => {
                if slot.get().is_live(now) {
                    Ok(TryInsertOutcome::conflict(slot.get().clone()))
                } else {
                    let record = LockRecord {
                        resource_id: resource_id.to_owned(),
                        owner_token: owner_token.to_owned(),
                        acquired_at: now,
                        expires_at: now + ttl,
                        holder_hint: None,
                    };
                    slot.insert(record);
                    Ok(TryInsertOutcome::inserted())
                }
            }
        }
    }

    async fn delete_if_owner(
        &self,
        resource_id: &str,
        owner_token: &str,
    ) -> Result<bool, LockError> {
        let Entry::Occupied(slot) = self.records.entry(resource_id.to_owned()) else {
            return Ok(false);
        };
        if slot.get().owner_token == owner_token {
            slot.remove();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn read(&self, resource_id: &str) -> Result<Option<LockRecord>, LockError> {
        let now = Utc::now();
        Ok(self
            .records
            .get(resource_id)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.clone()))
    }

    async fn sweep_expired(&self, now: StoreTimestamp) -> Result<u64, LockError> {
        let before = self.records.len();
        self.records.retain(|_, record| record.is_live(now));
        Ok((before - self.records.len()) as u64)
    }
}
