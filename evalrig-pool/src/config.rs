use std::time::Duration;

use serde::Deserialize;

/// Configuration for a [`crate::DeploymentPool`], loaded via
/// `toml::from_str` and overlaid with `Default` fallbacks.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Logical identifier partitioning the deployment set.
    pub pool_name: String,

    /// Lower bound on provisioned records this pool tries to keep warm.
    /// Not independently enforced by `allocate` (which only checks
    /// `pool_hard_cap`) -- intended for an external warming job, out of
    /// scope for the core.
    pub pool_target_size: u32,

    /// Upper bound on provisioned records; `allocate` refuses to provision
    /// past this.
    pub pool_hard_cap: u32,

    /// `allocation_deadline - now` stamped when a deployment is allocated.
    #[serde(with = "duration_secs")]
    pub allocation_ttl: Duration,

    /// Lease TTL used for `pool:<name>` locks.
    #[serde(with = "duration_secs")]
    pub pool_lock_ttl: Duration,

    /// Max retries for each orchestrator call before marking a record
    /// `Failed`.
    pub orchestrator_retry: u32,

    /// Max end-to-end retries of the whole allocate procedure on wake
    /// failure (default 2).
    pub allocate_retry: u32,

    /// Records above this many consecutive failures are retired rather than
    /// retried again.
    pub max_consecutive_failures: u32,

    /// Records not used within this window are retired by `drain`.
    #[serde(with = "duration_secs")]
    pub idle_keepalive: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_name: String::from("default"),
            pool_target_size: 2,
            pool_hard_cap: 4,
            allocation_ttl: Duration::from_secs(900),
            pool_lock_ttl: Duration::from_secs(30),
            orchestrator_retry: 3,
            allocate_retry: 2,
            max_consecutive_failures: 2,
            idle_keepalive: Duration::from_secs(3600),
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let cfg = PoolConfig::default();
        assert_eq!(cfg.pool_hard_cap, 4);
        assert_eq!(cfg.allocate_retry, 2);
    }

    #[test]
    fn parses_from_toml_with_partial_overrides() {
        let toml_str = r#"
            pool_name = "ci"
            pool_hard_cap = 10
        "#;
        let cfg: PoolConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.pool_name, "ci");
        assert_eq!(cfg.pool_hard_cap, 10);
        assert_eq!(cfg.pool_target_size, 2, "unset fields keep Default values");
    }
}
