use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// A new deployment request for [`OrchestratorClient::create`].
#[derive(Debug, Clone)]
pub struct DeploymentSpec {
    pub pool_name: String,
    pub deployment_name: String,
    pub build_fingerprint: Option<String>,
}

/// Live status of a deployment as reported by the orchestrator control
/// plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentStatus {
    Running,
    Hibernated,
    Unknown,
    Error,
}

/// Errors raised by calls against the remote orchestrator control plane.
///
/// Transport/timeout failures are retryable; "not found"/configuration
/// failures are not and trigger retirement of the record.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("orchestrator timeout after {0:?}")]
    Timeout(Duration),

    #[error("orchestrator connection error: {0}")]
    Connection(String),

    #[error("deployment not found: {0}")]
    NotFound(String),

    #[error("orchestrator rejected request: {0}")]
    Rejected(String),
}

impl OrchestratorError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Connection(_))
    }
}

/// Consumed interface to a remote deployment control plane. Implemented
/// externally (Astronomer/Airflow-style orchestrators in the source
/// material); the core only depends on this trait.
///
/// Object-safe `async_trait`. No static-dispatch fast path is needed here --
/// orchestrator calls are I/O-bound and infrequent relative to a hot
/// in-process dispatch loop.
#[async_trait]
pub trait OrchestratorClient: Send + Sync {
    /// Provision a new deployment. Returns its orchestrator-assigned id.
    async fn create(&self, spec: &DeploymentSpec) -> Result<String, OrchestratorError>;

    /// Resume a deployment. Idempotent -- a no-op if already running.
    async fn wake(&self, deployment_id: &str) -> Result<(), OrchestratorError>;

    /// Suspend a deployment cheaply, without destroying it. Idempotent.
    async fn hibernate(&self, deployment_id: &str) -> Result<(), OrchestratorError>;

    /// Permanently tear down a deployment. Idempotent.
    async fn destroy(&self, deployment_id: &str) -> Result<(), OrchestratorError>;

    async fn status(&self, deployment_id: &str) -> Result<DeploymentStatus, OrchestratorError>;
}
