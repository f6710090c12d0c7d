use thiserror::Error;

/// Errors from [`crate::PoolStore`], [`crate::OrchestratorClient`], and
/// [`crate::DeploymentPool`] operations.
///
/// Mirrors `evalrig_lock::LockError`'s retryable/permanent split, extended
/// with pool-specific outcomes for allocation (`PoolBusy`) and orchestrator
/// calls (`OrchestratorTransient`/`OrchestratorPermanent`).
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("transient store error for deployment {deployment_id:?}: {message}")]
    TransientStore {
        deployment_id: String,
        message: String,
    },

    #[error("permanent store error for deployment {deployment_id:?}: {message}")]
    PermanentStore {
        deployment_id: String,
        message: String,
    },

    /// No deployment became available within the caller's wait budget.
    #[error("pool {pool_name:?} has no available deployment within the wait budget")]
    PoolBusy { pool_name: String },

    #[error("transient orchestrator error for deployment {deployment_id:?}: {message}")]
    OrchestratorTransient {
        deployment_id: String,
        message: String,
    },

    #[error("permanent orchestrator error for deployment {deployment_id:?}: {message}")]
    OrchestratorPermanent {
        deployment_id: String,
        message: String,
    },

    #[error("cancelled while operating on deployment {0:?}")]
    Cancelled(String),

    /// A programmer error: a detected violation of a documented invariant.
    #[error("invariant violated for deployment {0:?}: {1}")]
    Invariant(String, String),
}

impl PoolError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientStore { .. } | Self::OrchestratorTransient { .. }
        )
    }

    /// The lock-layer error this pool error is reporting as a propagated
    /// failure, when applicable (used when `DistributedLock::acquire`
    /// itself surfaces a store error rather than a plain non-acquisition).
    #[must_use]
    pub fn from_lock_error(pool_name: &str, err: &evalrig_lock::LockError) -> Self {
        match err {
            evalrig_lock::LockError::Transient { message, .. } => Self::TransientStore {
                deployment_id: pool_name.to_owned(),
                message: message.clone(),
            },
            evalrig_lock::LockError::Permanent { message, .. } => Self::PermanentStore {
                deployment_id: pool_name.to_owned(),
                message: message.clone(),
            },
            evalrig_lock::LockError::Cancelled(id) => Self::Cancelled(id.clone()),
            evalrig_lock::LockError::Invariant(id, message) => {
                Self::Invariant(id.clone(), message.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_kinds_are_retryable() {
        assert!(
            PoolError::TransientStore {
                deployment_id: "d".into(),
                message: "timeout".into()
            }
            .is_retryable()
        );
        assert!(
            PoolError::OrchestratorTransient {
                deployment_id: "d".into(),
                message: "timeout".into()
            }
            .is_retryable()
        );
        assert!(!PoolError::PoolBusy { pool_name: "p".into() }.is_retryable());
        assert!(
            !PoolError::OrchestratorPermanent {
                deployment_id: "d".into(),
                message: "not found".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn display_never_mentions_owner_token_field_name() {
        let err = PoolError::PermanentStore {
            deployment_id: "d1".into(),
            message: "claimed by someone else".into(),
        };
        assert!(!format!("{err}").contains("owner_token"));
    }
}
