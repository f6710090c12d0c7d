use std::time::Duration;

use async_trait::async_trait;
use evalrig_core::StoreTimestamp;

use crate::error::LockError;
use crate::record::{LockRecord, TryInsertOutcome};

/// Persistence contract for named locks.
///
/// Any backing store providing conditional insert and conditional delete on
/// a primary key suffices -- a relational table with `UNIQUE(resource_id)`
/// is the reference implementation ([`evalrig_lock_postgres`]).
///
/// Implementations must be `Send + Sync` and safe for concurrent access from
/// many independent worker processes that share nothing but this store.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Attempt to create a [`LockRecord`]. On a uniqueness conflict, reads
    /// the existing record and returns it without modification.
    ///
    /// Atomic: no interleaving can observe two records with the same
    /// `resource_id`.
    async fn try_insert(
        &self,
        resource_id: &str,
        owner_token: &str,
        lease_ttl: Duration,
    ) -> Result<TryInsertOutcome, LockError>;

    /// Delete the record for `resource_id` only if its stored `owner_token`
    /// matches. Returns `false` when no record exists or the tokens differ.
    async fn delete_if_owner(
        &self,
        resource_id: &str,
        owner_token: &str,
    ) -> Result<bool, LockError>;

    /// Non-locking read, used by `peek`.
    async fn read(&self, resource_id: &str) -> Result<Option<LockRecord>, LockError>;

    /// Delete all records with `expires_at <= now`. Idempotent; may be
    /// called opportunistically by any process at any time.
    async fn sweep_expired(&self, now: StoreTimestamp) -> Result<u64, LockError>;
}
