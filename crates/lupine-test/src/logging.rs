//! Test log output.

use tracing_subscriber::EnvFilter;

/// Route `tracing` output to the test writer.
///
/// Honors `RUST_LOG`, defaulting to `info` with `lupine_gpu` at `debug`.
/// Safe to call from every test; only the first call installs a subscriber.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,lupine_gpu=debug")),
        )
        .with_test_writer()
        .try_init();
}
