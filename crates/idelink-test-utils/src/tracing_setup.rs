//! Tracing helpers for tests.
//!
//! [`init_test_tracing`] routes ordinary log output through the test
//! harness. [`capture_telemetry`] installs a thread-scoped subscriber that
//! records lifecycle telemetry so a test can assert on it.

use idelink_core::{TelemetryCollector, TelemetryReader};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const TELEMETRY_CAPACITY: usize = 64;

/// Install a global subscriber writing to the test harness, filtered by
/// `RUST_LOG` (default `info`). Later calls are silently ignored.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

/// Record telemetry emitted on this thread until the guard is dropped.
///
/// Only sees events from tasks polled on the current thread, so use it
/// with the default current-thread `#[tokio::test]` runtime.
///
/// ```ignore
/// let (telemetry, _guard) = capture_telemetry();
/// service.stop("t", StopReason::Testing).await;
/// assert!(telemetry.contains(events::SHUTDOWN_COMPLETE));
/// ```
pub fn capture_telemetry() -> (TelemetryReader, DefaultGuard) {
    let collector = TelemetryCollector::new(TELEMETRY_CAPACITY);
    let reader = collector.reader();
    let guard = tracing_subscriber::registry().with(collector).set_default();
    (reader, guard)
}
