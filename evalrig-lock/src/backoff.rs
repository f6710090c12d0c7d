use std::time::Duration;

use rand::Rng;

/// Upper bound on a single polling sleep during [`crate::DistributedLock::acquire`].
pub const DEFAULT_POLL_CAP: Duration = Duration::from_secs(2);

/// Randomised exponential backoff for polling acquisition: an exponential
/// curve `min(poll_base * 2^attempt, poll_cap)` scaled by a genuine uniform
/// jitter factor `(1 + U[-0.2, +0.2])`, an actual random variable per
/// attempt so concurrent workers racing for the same lock do not retry in
/// lockstep.
#[derive(Debug, Clone, Copy)]
pub struct PollBackoff {
    pub poll_base: Duration,
    pub poll_cap: Duration,
}

impl PollBackoff {
    #[must_use]
    pub fn new(poll_base: Duration) -> Self {
        Self {
            poll_base,
            poll_cap: DEFAULT_POLL_CAP,
        }
    }

    #[must_use]
    pub fn with_cap(poll_base: Duration, poll_cap: Duration) -> Self {
        Self {
            poll_base,
            poll_cap,
        }
    }

    /// Sleep duration for the `attempt`'th (zero-based) retry:
    /// `min(poll_base * 2^attempt, poll_cap) * (1 + U[-0.2, +0.2])`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.poll_base.as_secs_f64();
        let raw = base * 2f64.powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        let clamped = raw.min(self.poll_cap.as_secs_f64());

        let jitter: f64 = rand::thread_rng().gen_range(-0.2..=0.2);
        let jittered = (clamped * (1.0 + jitter)).max(0.0);
        Duration::from_secs_f64(jittered)
    }
}

/// Bounded exponential backoff for store-error retries inside a single
/// [`crate::DistributedLock`] call. Deterministic, no jitter -- these
/// retries are against the store itself, not contending peers, so there
/// is no thundering-herd concern to smear out.
#[derive(Debug, Clone, Copy)]
pub struct StoreRetryPolicy {
    pub max_attempts: u32,
    base: Duration,
    max: Duration,
    multiplier: f64,
}

impl StoreRetryPolicy {
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base: Duration::from_millis(50),
            max: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }

    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let raw = self.base.as_secs_f64() * self.multiplier.powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        Duration::from_secs_f64(raw.min(self.max.as_secs_f64()))
    }
}

impl Default for StoreRetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_backoff_clamps_to_cap() {
        let backoff = PollBackoff::with_cap(Duration::from_millis(500), Duration::from_secs(2));
        // attempt 10 would be enormous unclamped; jitter is at most +/-20%.
        let delay = backoff.delay_for(10);
        assert!(delay <= Duration::from_secs(2) + Duration::from_millis(400));
    }

    #[test]
    fn poll_backoff_grows_with_attempt() {
        let backoff = PollBackoff::with_cap(Duration::from_millis(100), Duration::from_secs(10));
        // Compare midpoints since jitter makes exact equality flaky.
        let d0 = backoff.delay_for(0).as_secs_f64();
        let d3 = backoff.delay_for(3).as_secs_f64();
        assert!(d3 > d0);
    }

    #[test]
    fn store_retry_policy_default_has_three_attempts() {
        assert_eq!(StoreRetryPolicy::default().max_attempts, 3);
    }

    #[test]
    fn store_retry_policy_clamps() {
        let policy = StoreRetryPolicy::new(5);
        assert!(policy.delay_for(20) <= Duration::from_secs(2));
    }
}
