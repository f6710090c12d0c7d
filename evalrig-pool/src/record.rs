use evalrig_core::StoreTimestamp;

/// Lifecycle state of a [`DeploymentRecord`]. `Retired` is terminal;
/// nothing transitions out of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeploymentState {
    Hibernated,
    Allocated,
    Waking,
    Hibernating,
    Failed,
    Retired,
}

impl DeploymentState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hibernated => "HIBERNATED",
            Self::Allocated => "ALLOCATED",
            Self::Waking => "WAKING",
            Self::Hibernating => "HIBERNATING",
            Self::Failed => "FAILED",
            Self::Retired => "RETIRED",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "HIBERNATED" => Some(Self::Hibernated),
            "ALLOCATED" => Some(Self::Allocated),
            "WAKING" => Some(Self::Waking),
            "HIBERNATING" => Some(Self::Hibernating),
            "FAILED" => Some(Self::Failed),
            "RETIRED" => Some(Self::Retired),
            _ => None,
        }
    }

    /// States counted against `pool_hard_cap` when deciding whether to
    /// provision a new deployment.
    #[must_use]
    pub fn counts_toward_hard_cap(self) -> bool {
        matches!(
            self,
            Self::Hibernated | Self::Allocated | Self::Waking | Self::Hibernating
        )
    }
}

/// One record per managed deployment in the pool.
///
/// Invariants: `state = Allocated` implies `allocated_to` and
/// `allocation_deadline` are both set; `state = Hibernated` implies
/// `allocated_to` is `None`. Callers must only mutate a record while
/// holding `pool:<pool_name>`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentRecord {
    pub deployment_id: String,
    pub pool_name: String,
    pub deployment_name: String,
    pub state: DeploymentState,
    pub allocated_to: Option<String>,
    pub allocation_deadline: Option<StoreTimestamp>,
    pub created_at: StoreTimestamp,
    pub last_used_at: StoreTimestamp,
    pub build_fingerprint: Option<String>,
    pub failure_count: u32,
}

impl DeploymentRecord {
    /// Construct a fresh record in `Waking` state, as created at the start
    /// of `orchestrator.create(...)`.
    #[must_use]
    pub fn new_waking(
        deployment_id: impl Into<String>,
        pool_name: impl Into<String>,
        deployment_name: impl Into<String>,
        now: StoreTimestamp,
        build_fingerprint: Option<String>,
    ) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            pool_name: pool_name.into(),
            deployment_name: deployment_name.into(),
            state: DeploymentState::Waking,
            allocated_to: None,
            allocation_deadline: None,
            created_at: now,
            last_used_at: now,
            build_fingerprint,
            failure_count: 0,
        }
    }

    /// Whether this record's invariants hold.
    #[must_use]
    pub fn invariants_hold(&self) -> bool {
        match self.state {
            DeploymentState::Allocated => {
                self.allocated_to.is_some() && self.allocation_deadline.is_some()
            }
            DeploymentState::Hibernated => self.allocated_to.is_none(),
            _ => true,
        }
    }
}
