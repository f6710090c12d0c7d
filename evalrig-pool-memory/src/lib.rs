//! In-memory [`evalrig_pool::PoolStore`] and [`evalrig_pool::OrchestratorClient`]
//! for tests and single-process development.
//!
//! The concrete implementations live in `evalrig_pool::testing`, shared with
//! that crate's own unit tests; this crate re-exports them under the
//! workspace's backend-crate naming convention so callers depend on
//! `evalrig-pool-memory` the same way they'd depend on
//! `evalrig-pool-postgres`.

pub use evalrig_pool::testing::{InMemoryPoolStore, MockOrchestrator};
