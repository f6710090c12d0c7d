//! Shared helpers used across the lock and pool crates: a store-timestamp
//! alias and random token generation. `resource_id`, `owner_token`,
//! `deployment_id`, and `pool_name` are kept as plain `String`/`&str`
//! throughout this workspace rather than wrapped in newtypes -- they are
//! opaque, structurally meaningless strings as far as this core is
//! concerned, so a newtype would buy no invariant it actually enforces.

use chrono::{DateTime, Utc};

/// Generate a fresh random owner/allocator token.
#[must_use]
pub fn random_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A point in time as assigned by a store. Clients never construct these
/// themselves for comparison purposes -- all expiry comparisons happen in
/// the store, never in the client, so store clock skew cannot split two
/// callers' view of whether a record has expired.
pub type StoreTimestamp = DateTime<Utc>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_token_is_unique() {
        let a = random_token();
        let b = random_token();
        assert_ne!(a, b);
    }
}
