//! Lifecycle state of a daemon connection.
//!
//! ```text
//!   Uninitialized ──▶ Initialized{status} ──▶ Stopped{reason}
//!        │                  ▲     │                ▲
//!        │                  └─────┘ status cycles  │
//!        ▼                                         │
//!   FailedToInitialize ────────────────────────────┘
//! ```
//!
//! [`StateCell`] is the only writer of the state and the only broadcaster
//! of change notifications. Observers subscribe through a `watch` receiver
//! and must re-check their predicate after every wake.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::service::ServiceError;

/// Progress reported while the daemon indexes files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingFilesProgress {
    pub total: usize,
    pub processed: usize,
}

/// Externally visible status of the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Initializing,
    ProcessingFiles(ProcessingFilesProgress),
    Ready,
    /// Only produced by [`LifecycleState::status`] for terminal states.
    Stopped(String),
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Initializing => write!(f, "initializing"),
            Status::ProcessingFiles(p) => {
                write!(f, "processing files ({}/{})", p.processed, p.total)
            }
            Status::Ready => write!(f, "ready"),
            Status::Stopped(message) => write!(f, "stopped: {message}"),
        }
    }
}

/// Why a connection was stopped. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Crashed,
    EditorExited,
    Restarting,
    Testing,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::Crashed => "crashed",
            StopReason::EditorExited => "editor exited",
            StopReason::Restarting => "restarting",
            StopReason::Testing => "testing",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a single daemon connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    /// Handshake not yet complete. With `wait_for_init`, requests block
    /// until initialization instead of failing.
    Uninitialized { wait_for_init: bool },
    /// Handshake failed. Only `Stopped` may follow.
    FailedToInitialize { reason: String },
    /// Serve loop active.
    Initialized { status: Status },
    /// Terminal.
    Stopped { reason: StopReason },
}

impl LifecycleState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: &LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, next) {
            (Stopped { .. }, _) => false,
            (FailedToInitialize { .. }, Stopped { .. }) => true,
            (FailedToInitialize { .. }, _) => false,
            (Initialized { .. }, Initialized { .. } | Stopped { .. }) => true,
            (Initialized { .. }, _) => false,
            (Uninitialized { .. }, _) => true,
        }
    }

    /// Project the internal state to an externally meaningful status.
    pub fn status(&self) -> Status {
        match self {
            LifecycleState::Uninitialized { .. } => Status::Initializing,
            LifecycleState::FailedToInitialize { reason } => Status::Stopped(reason.clone()),
            LifecycleState::Stopped { reason } => Status::Stopped(reason.to_string()),
            LifecycleState::Initialized { status } => status.clone(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, LifecycleState::Stopped { .. })
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self, LifecycleState::Initialized { .. })
    }
}

/// Single-writer state cell with change broadcast.
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<LifecycleState>,
}

impl StateCell {
    pub fn new(initial: LifecycleState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// Snapshot of the current state.
    pub fn get(&self) -> LifecycleState {
        self.tx.borrow().clone()
    }

    /// Replace the state and wake every observer. Illegal transitions are
    /// refused; returns whether the state was replaced.
    pub fn set(&self, next: LifecycleState) -> bool {
        let mut refused_from = None;
        let applied = self.tx.send_if_modified(|current| {
            if current.can_transition_to(&next) {
                debug!(from = ?current, to = ?next, "lifecycle transition");
                *current = next.clone();
                true
            } else {
                refused_from = Some(current.clone());
                false
            }
        });
        if let Some(from) = refused_from {
            warn!(from = ?from, to = ?next, "refusing illegal lifecycle transition");
        }
        applied
    }

    /// Replace the status of an initialized connection. No-op in any
    /// other state.
    pub fn set_status(&self, status: Status) -> bool {
        self.tx.send_if_modified(|current| match current {
            LifecycleState::Initialized { status: slot } => {
                *slot = status;
                true
            }
            _ => false,
        })
    }

    /// External status projection of the current state.
    pub fn status(&self) -> Status {
        self.tx.borrow().status()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.tx.subscribe()
    }

    /// Wait until the connection is initialized.
    ///
    /// Keeps waiting while uninitialized or failed. Waiting on a stopped
    /// connection is a caller bug and is reported as
    /// [`ServiceError::WaitedOnStopped`].
    pub async fn wait_for_initialization(&self) -> Result<(), ServiceError> {
        let mut rx = self.tx.subscribe();
        loop {
            let stopped = match &*rx.borrow_and_update() {
                LifecycleState::Initialized { .. } => return Ok(()),
                LifecycleState::Stopped { reason } => Some(*reason),
                _ => None,
            };
            if let Some(reason) = stopped {
                error!(%reason, "waited for initialization on a stopped connection");
                return Err(ServiceError::WaitedOnStopped(reason));
            }
            // The sender lives as long as `self`, so this only fails if the
            // cell itself is gone.
            if rx.changed().await.is_err() {
                return Err(ServiceError::NotInitialized);
            }
        }
    }
}
