//! Shared helpers for unit tests.

/// Route log output of a test to the test harness
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}
