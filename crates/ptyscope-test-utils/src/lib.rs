pub mod capture;

pub use capture::{BrokenSink, CaptureSink};

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("ptyscope=debug,ptyscope_pty=debug")),
            )
            .with_test_writer()
            .init();
    });
}

/// Default time to wait for output in tests
pub const OUTPUT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
