//! Runnable demonstration of the evaluation driver against in-memory
//! backends: seeds a small pool, runs a handful of "tests" concurrently,
//! then drains the pool. No network or database access required.

use std::sync::Arc;
use std::time::Duration;

use evalrig_driver::{init_tracing, EvaluationDriver};
use evalrig_lock::DistributedLock;
use evalrig_lock_memory::MemoryLockStore;
use evalrig_pool::{DeploymentPool, PoolConfig, PoolStore};
use evalrig_pool_memory::{InMemoryPoolStore, MockOrchestrator};

#[tokio::main]
async fn main() {
    init_tracing();

    let store = Arc::new(InMemoryPoolStore::new());
    store.seed_hibernated("demo-pool", 2).await;

    let orchestrator = Arc::new(MockOrchestrator::new());
    let lock = Arc::new(DistributedLock::new(Arc::new(MemoryLockStore::new())));

    let config = PoolConfig {
        pool_name: "demo-pool".into(),
        pool_target_size: 2,
        pool_hard_cap: 3,
        ..PoolConfig::default()
    };

    let pool = DeploymentPool::new(config, store as Arc<dyn PoolStore>, orchestrator, lock);
    let driver = Arc::new(EvaluationDriver::new(pool));

    let mut handles = Vec::new();
    for i in 0..3 {
        let driver = Arc::clone(&driver);
        handles.push(tokio::spawn(async move {
            let (_tx, cancel) = tokio::sync::oneshot::channel();
            driver
                .run_test::<(), String, _, _>(
                    &format!("test-{i}"),
                    &format!("worker-{i}"),
                    Duration::from_secs(10),
                    cancel,
                    |handle| async move {
                        println!("running test-{i} against {}", handle.deployment_name);
                        Ok(())
                    },
                )
                .await
        }));
    }

    for handle in handles {
        match handle.await.expect("task panicked") {
            Ok(result) => println!("{} -> {:?} in {:?}", result.test_id, result.outcome, result.duration),
            Err(err) => eprintln!("allocation failed: {err}"),
        }
    }

    driver.drain().await.expect("drain should succeed");
}
