//! The thin evaluation driver that ties a
//! [`DeploymentPool`] to a single test run: allocate, run the agent (out of
//! scope), release under a scoped-release discipline whether or not the
//! agent succeeded.

mod telemetry;

pub use telemetry::init_tracing;

use std::time::Duration;

use evalrig_pool::{DeploymentHandle, DeploymentPool, PoolError};
use tokio::time::Instant;
use tracing::{info, warn};

/// Outcome of one test run, as recorded in [`TestRunResult`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    Success,
    Failure(String),
    Cancelled,
}

/// Structured result of one `EvaluationDriver::run_test` invocation: what
/// ran, against which deployment, and how it turned out.
#[derive(Debug, Clone)]
pub struct TestRunResult {
    pub test_id: String,
    pub deployment_id: Option<String>,
    pub outcome: TestOutcome,
    pub duration: Duration,
}

/// Ties a [`DeploymentPool`] to the per-test allocate/run/release sequence.
/// Holds no state of its own beyond the pool handle -- the only mutable
/// shared state is the pool's own stores.
pub struct EvaluationDriver {
    pool: DeploymentPool,
}

impl EvaluationDriver {
    #[must_use]
    pub fn new(pool: DeploymentPool) -> Self {
        Self { pool }
    }

    /// Run one test: allocate a deployment, run `body` against its
    /// [`DeploymentHandle`], then release the deployment regardless of
    /// whether `body` succeeded, failed, or `cancel` fired first.
    ///
    /// `cancel` lets a caller abort a hung `body` without leaking the
    /// deployment -- the release still runs (and `TestOutcome::Cancelled` is
    /// recorded) even though `body`'s own future is dropped mid-flight.
    ///
    /// `body`'s error type is converted to a `String` for the result record
    /// rather than propagated, matching the driver's status as a thin,
    /// infallible-from-the-caller's-perspective layer -- allocate failures
    /// (`PoolBusy`, store/orchestrator errors) are the only way this
    /// function returns `Err`.
    pub async fn run_test<T, E, F, Fut>(
        &self,
        test_id: &str,
        allocator_token: &str,
        max_wait: Duration,
        cancel: tokio::sync::oneshot::Receiver<()>,
        body: F,
    ) -> Result<TestRunResult, PoolError>
    where
        F: FnOnce(DeploymentHandle) -> Fut,
        E: std::fmt::Display,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let start = Instant::now();
        let handle = self.pool.allocate(allocator_token, max_wait, None).await?;
        let deployment_id = handle.deployment_id.clone();

        info!(test_id, deployment_id = %deployment_id, "test run starting");

        let body_fut = body(handle.clone());
        tokio::pin!(body_fut);
        tokio::pin!(cancel);
        let outcome = tokio::select! {
            result = &mut body_fut => Ok(result),
            _ = &mut cancel => Err(()),
        };

        if let Err(err) = self.pool.release(handle).await {
            warn!(test_id, deployment_id = %deployment_id, error = %err, "release after test run failed");
        }

        let duration = start.elapsed();
        let (outcome, log_outcome) = match outcome {
            Ok(Ok(_)) => (TestOutcome::Success, "success"),
            Ok(Err(err)) => (TestOutcome::Failure(err.to_string()), "failure"),
            Err(()) => (TestOutcome::Cancelled, "cancelled"),
        };

        info!(test_id, deployment_id = %deployment_id, outcome = log_outcome, ?duration, "test run finished");

        Ok(TestRunResult {
            test_id: test_id.to_owned(),
            deployment_id: Some(deployment_id),
            outcome,
            duration,
        })
    }

    /// End-of-evaluation teardown, delegating to [`DeploymentPool::drain`].
    pub async fn drain(&self) -> Result<(), PoolError> {
        self.pool.drain().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evalrig_lock::DistributedLock;
    use evalrig_lock_memory::MemoryLockStore;
    use evalrig_pool::{PoolConfig, PoolStore};
    use evalrig_pool_memory::{InMemoryPoolStore, MockOrchestrator};
    use std::sync::Arc;

    fn test_driver(hard_cap: u32) -> EvaluationDriver {
        let store = Arc::new(InMemoryPoolStore::new());
        let orchestrator = Arc::new(MockOrchestrator::new());
        let lock = Arc::new(DistributedLock::new(Arc::new(MemoryLockStore::new())));
        let config = PoolConfig {
            pool_name: "driver-test".into(),
            pool_hard_cap: hard_cap,
            ..PoolConfig::default()
        };
        let pool = DeploymentPool::new(
            config,
            store as Arc<dyn PoolStore>,
            orchestrator,
            lock,
        );
        EvaluationDriver::new(pool)
    }

    /// A receiver that never fires, for tests not exercising cancellation.
    fn no_cancel() -> tokio::sync::oneshot::Receiver<()> {
        let (_tx, rx) = tokio::sync::oneshot::channel();
        std::mem::forget(_tx);
        rx
    }

    #[tokio::test]
    async fn run_test_releases_on_success_and_on_failure() {
        let driver = test_driver(2);

        let result = driver
            .run_test::<(), String, _, _>("t1", "tok-1", Duration::from_secs(5), no_cancel(), |_handle| async {
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(result.outcome, TestOutcome::Success);

        let result = driver
            .run_test::<(), String, _, _>("t2", "tok-2", Duration::from_secs(5), no_cancel(), |_handle| async {
                Err("agent crashed".to_owned())
            })
            .await
            .unwrap();
        assert!(matches!(result.outcome, TestOutcome::Failure(ref msg) if msg == "agent crashed"));

        // Both deployments were released -- a pool with hard_cap=2 should
        // accept two more allocations without creating a third.
        let h1 = driver
            .run_test::<(), String, _, _>("t3", "tok-3", Duration::from_secs(5), no_cancel(), |_handle| async {
                Ok(())
            })
            .await;
        assert!(h1.is_ok());
    }

    #[tokio::test]
    async fn run_test_releases_and_records_cancelled_outcome() {
        let driver = test_driver(1);
        let (tx, rx) = tokio::sync::oneshot::channel();

        let run = driver.run_test::<(), String, _, _>(
            "t-cancel",
            "tok-cancel",
            Duration::from_secs(5),
            rx,
            |_handle| async {
                // A body that never resolves on its own -- only `cancel` ends the run.
                std::future::pending::<Result<(), String>>().await
            },
        );
        tokio::pin!(run);

        tokio::select! {
            _ = &mut run => panic!("run_test must not finish before cancel fires"),
            () = tokio::time::sleep(Duration::from_millis(20)) => {}
        }
        tx.send(()).unwrap();

        let result = run.await.unwrap();
        assert_eq!(result.outcome, TestOutcome::Cancelled);

        // The deployment must have been released despite the cancellation --
        // a fresh allocate against a hard_cap=1 pool must not be PoolBusy.
        let reused = driver
            .run_test::<(), String, _, _>("t-reuse", "tok-reuse", Duration::from_secs(5), no_cancel(), |_handle| async {
                Ok(())
            })
            .await;
        assert!(reused.is_ok(), "deployment must be released back to the pool after a cancelled run");
    }
}
