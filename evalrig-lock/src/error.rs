use thiserror::Error;

/// Errors from [`crate::LockStore`] and [`crate::DistributedLock`] operations.
///
/// Store failures split into two kinds: `Transient` (retryable) and
/// `Permanent` (a schema or constraint bug, never retried).
#[derive(Debug, Error)]
pub enum LockError {
    /// The store was reachable but returned a retryable failure (network,
    /// timeout). Callers may retry.
    #[error("transient store error for resource {resource_id:?}: {message}")]
    Transient {
        resource_id: String,
        message: String,
    },

    /// The store rejected the operation with a non-retryable condition.
    #[error("permanent store error for resource {resource_id:?}: {message}")]
    Permanent {
        resource_id: String,
        message: String,
    },

    /// A deadline elapsed or an external cancellation was observed while an
    /// acquire was in flight.
    #[error("cancelled while acquiring resource {0:?}")]
    Cancelled(String),

    /// A programmer error: a detected violation of a documented invariant.
    /// Surfaced, never recovered from.
    #[error("invariant violated for resource {0:?}: {1}")]
    Invariant(String, String),
}

impl LockError {
    /// Returns `true` if the operation that produced this error may succeed
    /// if retried unchanged.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// The `resource_id` this error concerns, for logging/correlation.
    #[must_use]
    pub fn resource_id(&self) -> &str {
        match self {
            Self::Transient { resource_id, .. } | Self::Permanent { resource_id, .. } => {
                resource_id
            }
            Self::Cancelled(id) | Self::Invariant(id, _) => id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(
            LockError::Transient {
                resource_id: "r".into(),
                message: "timeout".into()
            }
            .is_retryable()
        );
        assert!(
            !LockError::Permanent {
                resource_id: "r".into(),
                message: "bad schema".into()
            }
            .is_retryable()
        );
        assert!(!LockError::Cancelled("r".into()).is_retryable());
        assert!(!LockError::Invariant("r".into(), "double release".into()).is_retryable());
    }

    #[test]
    fn resource_id_never_leaks_owner_token() {
        let err = LockError::Permanent {
            resource_id: "r1".into(),
            message: "owned by someone else".into(),
        };
        assert_eq!(err.resource_id(), "r1");
        assert!(!format!("{err}").contains("owner_token"));
    }
}
