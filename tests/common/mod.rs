//! Helpers shared by the integration tests.
#![allow(dead_code)]

use futures::executor::LocalPool;
use optimist::{BoxError, TransactionConfig, TransactionContext};
use tracing_subscriber::EnvFilter;

/// Routes `tracing` output to the test harness. Set `RUST_LOG=optimist=debug` to see it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn setup() -> (LocalPool, TransactionContext) {
    init_tracing();
    let pool = LocalPool::new();
    let context = TransactionContext::new(pool.spawner());
    (pool, context)
}

/// A transaction config whose commit function always succeeds.
pub fn accepting() -> TransactionConfig {
    TransactionConfig::new(|_| async { Ok::<_, BoxError>(()) })
}

/// Like [`accepting`], without auto-commit.
pub fn manual() -> TransactionConfig {
    accepting().auto_commit(false)
}
