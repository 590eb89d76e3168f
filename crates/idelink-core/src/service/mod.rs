//! Controller for one analysis-daemon connection.
//!
//! ## Architecture
//!
//! ```text
//! callers ──rpc / push_message──▶ outbound queue ──┐
//!                                                 ▼
//!                                      ┌────────────────────┐  stdin   ┌────────┐
//!                                      │  serve loop        │─────────▶│ daemon │
//!                                      │  (select: pop/read)│◀─────────│        │
//!                                      └────────────────────┘  stdout  └────────┘
//!                                        │               │
//!                              response queue      notification queue
//!                                        │               │
//! callers ◀──────── rpc resumes ─────────┘               └──▶ notification observers
//! ```
//!
//! The handshake runs before the serve loop and talks to the streams
//! directly. After that, only the serve loop touches the streams. State is
//! changed exclusively through [`StateCell`].

mod handshake;
mod rpc;
mod serve;
mod shutdown;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, watch};

use idelink_config::DaemonConfig;

use crate::codec::{CodecError, FrameReader, FrameWriter};
use crate::process::{BoxedReader, BoxedWriter, DaemonProcess, Transport, spawn_daemon};
use crate::protocol::{Notification, TrackedRequest};
use crate::queue::ClosableQueue;
use crate::state::{LifecycleState, StateCell, Status, StopReason};

pub use handshake::{NOTIFICATION_BEFORE_INIT, SAVED_STATE_LOAD_FAILED};

/// Default bound on the graceful-shutdown race.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors surfaced to callers of a [`ServiceHandle`].
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("not yet initialized")]
    NotInitialized,

    #[error("failed to initialize: {0}")]
    FailedToInitialize(String),

    #[error("stopped: {0}")]
    Stopped(StopReason),

    #[error("already initialized")]
    AlreadyInitialized,

    #[error("{0} queue was closed")]
    QueueClosed(QueueKind),

    /// Error text reported by the daemon itself.
    #[error("{0}")]
    Daemon(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("response for request #{got:?} arrived while waiting for #{expected}")]
    MisattributedResponse { expected: u64, got: Option<u64> },

    #[error("waited for initialization on a connection that was stopped ({0})")]
    WaitedOnStopped(StopReason),

    #[error("failed to spawn daemon {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        source: std::io::Error,
    },

    #[error("transport error: {0}")]
    Codec(#[from] CodecError),

    #[error("payload serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Which queue reported closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Outbound,
    Response,
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueKind::Outbound => f.write_str("outbound"),
            QueueKind::Response => f.write_str("response"),
        }
    }
}

/// An outbound request waiting for the serve loop.
#[derive(Debug, Clone)]
pub(crate) struct QueuedRequest {
    pub request: TrackedRequest,
    /// Set for requests that expect a reply; echoed on the matching
    /// [`ResponseEnvelope`].
    pub ticket: Option<u64>,
}

/// A daemon response on its way to the waiting caller.
#[derive(Debug, Clone)]
pub(crate) struct ResponseEnvelope {
    /// Ticket of the oldest request that was awaiting a reply when this
    /// response was read.
    pub ticket: Option<u64>,
    pub result: Result<Value, String>,
}

/// Tunables for a [`ServiceHandle`].
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub shutdown_timeout: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl From<&DaemonConfig> for ServiceOptions {
    fn from(config: &DaemonConfig) -> Self {
        Self {
            shutdown_timeout: config.shutdown_timeout(),
        }
    }
}

struct Inner {
    init_id: String,
    state: StateCell,
    process: Box<dyn DaemonProcess>,
    reader: Mutex<FrameReader<BoxedReader>>,
    writer: Mutex<FrameWriter<BoxedWriter>>,
    outbound: ClosableQueue<QueuedRequest>,
    responses: ClosableQueue<ResponseEnvelope>,
    notifications: Arc<ClosableQueue<Notification>>,
    /// Serializes RPCs so at most one awaits a response at a time.
    rpc_lock: Mutex<()>,
    /// Serializes `stop` calls.
    stop_lock: Mutex<()>,
    stop_requested: AtomicBool,
    /// Set once `destroy` starts killing the daemon.
    tearing_down: AtomicBool,
    next_ticket: AtomicU64,
    shutdown_timeout: Duration,
}

/// Handle to one daemon connection. Cheap to clone; all clones share the
/// same connection.
#[derive(Clone)]
pub struct ServiceHandle {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("init_id", &self.inner.init_id)
            .field("pid", &self.inner.process.pid())
            .field("state", &self.inner.state.get())
            .finish()
    }
}

impl ServiceHandle {
    /// Spawn the configured daemon and wrap it in an uninitialized handle.
    pub fn make(init_id: &str, config: &DaemonConfig) -> Result<Self, ServiceError> {
        let transport = spawn_daemon(config)?;
        Ok(Self::from_transport(
            init_id,
            transport,
            ServiceOptions::from(config),
        ))
    }

    /// Wrap an existing transport in an uninitialized handle.
    pub fn from_transport(init_id: &str, transport: Transport, options: ServiceOptions) -> Self {
        let Transport {
            process,
            reader,
            writer,
        } = transport;
        Self {
            inner: Arc::new(Inner {
                init_id: init_id.to_string(),
                state: StateCell::new(LifecycleState::Uninitialized {
                    wait_for_init: false,
                }),
                process,
                reader: Mutex::new(FrameReader::new(reader)),
                writer: Mutex::new(FrameWriter::new(writer)),
                outbound: ClosableQueue::new(),
                responses: ClosableQueue::new(),
                notifications: Arc::new(ClosableQueue::new()),
                rpc_lock: Mutex::new(()),
                stop_lock: Mutex::new(()),
                stop_requested: AtomicBool::new(false),
                tearing_down: AtomicBool::new(false),
                next_ticket: AtomicU64::new(1),
                shutdown_timeout: options.shutdown_timeout,
            }),
        }
    }

    /// Id this connection was created with, used in logs.
    pub fn init_id(&self) -> &str {
        &self.inner.init_id
    }

    /// OS process id of the daemon, if any.
    pub fn pid(&self) -> Option<u32> {
        self.inner.process.pid()
    }

    /// Externally meaningful status of the connection.
    pub fn status(&self) -> Status {
        self.inner.state.status()
    }

    /// Snapshot of the internal lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.inner.state.get()
    }

    /// Observe lifecycle changes.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.inner.state.subscribe()
    }

    /// Queue of notifications received from the daemon. Closed when the
    /// connection is destroyed.
    pub fn notifications(&self) -> Arc<ClosableQueue<Notification>> {
        Arc::clone(&self.inner.notifications)
    }

    /// Block until the connection is initialized. See
    /// [`StateCell::wait_for_initialization`].
    pub async fn wait_for_initialization(&self) -> Result<(), ServiceError> {
        self.inner.state.wait_for_initialization().await
    }

    /// Number of requests waiting for the serve loop.
    pub fn pending_outbound(&self) -> usize {
        self.inner.outbound.len()
    }

    fn stop_requested(&self) -> bool {
        self.inner.stop_requested.load(Ordering::SeqCst)
    }

    fn tearing_down(&self) -> bool {
        self.inner.tearing_down.load(Ordering::SeqCst)
    }

    fn next_ticket(&self) -> u64 {
        self.inner.next_ticket.fetch_add(1, Ordering::Relaxed)
    }
}
