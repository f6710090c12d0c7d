/// A transient, per-acquisition handle returned by [`crate::DistributedLock`].
///
/// References a `resource_id` and the `owner_token` returned by acquire (if
/// any). `acquired` is `false` when the attempt did not win the lock --
/// releasing such a handle is always a safe no-op.
#[derive(Debug, Clone)]
pub struct ScopedLockHandle {
    pub(crate) resource_id: String,
    pub(crate) owner_token: Option<String>,
    pub acquired: bool,
}

impl ScopedLockHandle {
    pub(crate) fn acquired(resource_id: impl Into<String>, owner_token: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            owner_token: Some(owner_token.into()),
            acquired: true,
        }
    }

    pub(crate) fn not_acquired(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            owner_token: None,
            acquired: false,
        }
    }

    #[must_use]
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    #[must_use]
    pub fn owner_token(&self) -> Option<&str> {
        self.owner_token.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_acquired_handle_has_no_token() {
        let handle = ScopedLockHandle::not_acquired("r1");
        assert!(!handle.acquired);
        assert!(handle.owner_token().is_none());
    }
}
