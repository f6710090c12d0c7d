use evalrig_core::StoreTimestamp;

/// One row per named resource currently locked.
///
/// A record with `expires_at <= now` is indistinguishable from no record at
/// all -- it may be reaped lazily by [`crate::LockStore::sweep_expired`], but
/// its mere presence past expiry is never treated as "locked" by any caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub resource_id: String,
    pub owner_token: String,
    pub acquired_at: StoreTimestamp,
    pub expires_at: StoreTimestamp,
    pub holder_hint: Option<String>,
}

impl LockRecord {
    /// Whether this record is still valid at `now` -- i.e. not yet expired.
    #[must_use]
    pub fn is_live(&self, now: StoreTimestamp) -> bool {
        self.expires_at > now
    }
}

/// Outcome of [`crate::LockStore::try_insert`].
#[derive(Debug, Clone)]
pub struct TryInsertOutcome {
    /// `true` if a new [`LockRecord`] was created by this call.
    pub inserted: bool,
    /// The record that already occupied `resource_id`, when `inserted` is
    /// `false`. `None` when `inserted` is `true`.
    pub existing_record: Option<LockRecord>,
}

impl TryInsertOutcome {
    #[must_use]
    pub fn inserted() -> Self {
        Self {
            inserted: true,
            existing_record: None,
        }
    }

    #[must_use]
    pub fn conflict(existing: LockRecord) -> Self {
        Self {
            inserted: false,
            existing_record: Some(existing),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn is_live_respects_expiry() {
        let now = Utc::now();
        let record = LockRecord {
            resource_id: "r".into(),
            owner_token: "o".into(),
            acquired_at: now - chrono::Duration::seconds(10),
            expires_at: now - chrono::Duration::seconds(1),
            holder_hint: None,
        };
        assert!(!record.is_live(now));

        let record = LockRecord {
            expires_at: now + chrono::Duration::seconds(30),
            ..record
        };
        assert!(record.is_live(now));
    }
}
