// crates/test-utils/src/lib.rs

//! Shared helpers for the `taskgov` test suites.

pub mod builders;
pub mod harness;
pub mod recording_backend;

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use tracing_subscriber::{EnvFilter, fmt};

/// Upper bound for any single awaited step in an async test.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

static TRACING: Once = Once::new();

/// Route `tracing` output through the test writer, filtered by `RUST_LOG`
/// (for example `RUST_LOG=taskgov::engine=debug`). Output shows up only for
/// failing tests unless `--nocapture` is passed.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("taskgov=info,warn"));
        let _ = fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .try_init();
    });
}

/// Await `f`, panicking if it takes longer than [`TEST_TIMEOUT`].
pub async fn with_timeout<F: Future>(f: F) -> F::Output {
    match tokio::time::timeout(TEST_TIMEOUT, f).await {
        Ok(output) => output,
        Err(_) => panic!("test step timed out after {TEST_TIMEOUT:?}"),
    }
}
