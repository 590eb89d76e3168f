#![deny(unsafe_code)]

//! idelink core: client-side controller for an out-of-process IDE
//! analysis daemon.
//!
//! A [`ServiceHandle`] owns one daemon subprocess and its stdin/stdout
//! pipes. It performs the initialization handshake, runs a single serve
//! loop that multiplexes outbound requests with inbound responses and
//! notifications, exposes a request/response facade, and tears the daemon
//! down with a bounded shutdown race.

use std::future::Future;
use std::pin::Pin;

/// A type-erased, `Send`-safe, boxed future, used where a trait method must
/// stay object-safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub mod build_info;
/// Length-prefixed JSON framing over byte streams.
pub mod codec;
/// Subprocess handle and stream ownership.
pub mod process;
/// Wire messages and the request catalog.
pub mod protocol;
/// Closable FIFO queue.
pub mod queue;
/// Handshake, serve loop, RPC facade, and shutdown protocol.
pub mod service;
/// Lifecycle state machine and status projection.
pub mod state;
/// Telemetry events and an in-memory collector.
pub mod telemetry;

pub use build_info::BuildInfo;
pub use process::{DaemonProcess, Transport};
pub use protocol::{Message, Notification, Request};
pub use queue::ClosableQueue;
pub use service::{ServiceError, ServiceHandle, ServiceOptions};
pub use state::{LifecycleState, Status, StopReason};
pub use telemetry::{TelemetryCollector, TelemetryReader};
