#![deny(unsafe_code)]

//! Shared test utilities for the idelink workspace.
//!
//! Provides a scripted in-process daemon, config builders, and tracing
//! helpers so that individual crate tests stay concise and consistent.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! idelink-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod daemon;
pub mod tracing_setup;

pub use daemon::{InitBehavior, MockDaemon, MockDaemonHandle, ShutdownBehavior};
pub use tracing_setup::{capture_telemetry, init_test_tracing};
