use async_trait::async_trait;
use evalrig_core::StoreTimestamp;

use crate::error::PoolError;
use crate::record::{DeploymentRecord, DeploymentState};

/// Persistence contract for [`DeploymentRecord`]s.
///
/// `claim_one_hibernated` and `release` must be linearisable with respect to
/// concurrent callers over a given `pool_name` -- a relational table with
/// `FOR UPDATE SKIP LOCKED`-style row selection is the reference
/// implementation ([`evalrig_pool_postgres`]).
#[async_trait]
pub trait PoolStore: Send + Sync {
    async fn list_by_state(
        &self,
        pool_name: &str,
        state: DeploymentState,
    ) -> Result<Vec<DeploymentRecord>, PoolError>;

    /// Atomically select one `Hibernated` record in `pool_name`, transition
    /// it to `Allocated`, and stamp `allocated_to`/`allocation_deadline`.
    /// Returns `None` if no hibernated record is available.
    ///
    /// When `required_fingerprint` is `Some`, only records whose
    /// `build_fingerprint` equals it are eligible.
    async fn claim_one_hibernated(
        &self,
        pool_name: &str,
        allocator_token: &str,
        deadline: StoreTimestamp,
        required_fingerprint: Option<&str>,
    ) -> Result<Option<DeploymentRecord>, PoolError>;

    /// Transition `Allocated -> Hibernated` only when `allocator_token`
    /// matches the stored `allocated_to`. Returns `false` otherwise.
    async fn release(&self, deployment_id: &str, allocator_token: &str) -> Result<bool, PoolError>;

    async fn upsert(&self, record: DeploymentRecord) -> Result<(), PoolError>;

    async fn set_state(
        &self,
        deployment_id: &str,
        state: DeploymentState,
    ) -> Result<(), PoolError>;

    /// Transition to `Retired`. Terminal -- no further state transitions are
    /// valid afterwards.
    async fn retire(&self, deployment_id: &str) -> Result<(), PoolError>;

    /// Transition any `Allocated` record whose `allocation_deadline <= now`
    /// back to `Hibernated` with `allocated_to` cleared. Returns the
    /// reclaimed records for logging.
    async fn reclaim_overdue(&self, now: StoreTimestamp) -> Result<Vec<DeploymentRecord>, PoolError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn _assert_object_safe(_: &dyn PoolStore) {}
}
