//! Wire messages exchanged with the analysis daemon.
//!
//! Client → daemon traffic is a stream of [`TrackedRequest`] frames.
//! Daemon → client traffic is a stream of [`DaemonMessage`] frames: either
//! a response to the oldest request still awaiting one, or an unsolicited
//! [`Notification`]. Responses carry no correlation id on the wire; they
//! pair with requests strictly by send order.

use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::{ProcessingFilesProgress, Status};

/// A typed request that expects exactly one response.
pub trait Request: Serialize + Send + Sync {
    /// Method name written on the wire.
    const METHOD: &'static str;
    /// Type the daemon's response payload decodes into.
    type Response: DeserializeOwned + Send;
}

/// A typed one-way message. The daemon never answers these.
pub trait Message: Serialize + Send + Sync {
    const METHOD: &'static str;
}

/// Request envelope as written to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedRequest {
    /// Caller-supplied id for log and telemetry correlation.
    pub tracking_id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    /// Whether the daemon will write a response for this request.
    pub expects_reply: bool,
}

impl TrackedRequest {
    pub fn request<R: Request>(tracking_id: &str, request: &R) -> Result<Self, serde_json::Error> {
        Ok(Self {
            tracking_id: tracking_id.to_string(),
            method: R::METHOD.to_string(),
            params: serde_json::to_value(request)?,
            expects_reply: true,
        })
    }

    pub fn message<M: Message>(tracking_id: &str, message: &M) -> Result<Self, serde_json::Error> {
        Ok(Self {
            tracking_id: tracking_id.to_string(),
            method: M::METHOD.to_string(),
            params: serde_json::to_value(message)?,
            expects_reply: false,
        })
    }
}

/// Anything the daemon writes to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum DaemonMessage {
    Response(Result<Value, String>),
    Notification(Notification),
}

/// Unsolicited daemon → client message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    Initializing,
    ProcessingFiles(ProcessingFilesProgress),
    DoneProcessing,
    Diagnostics { path: PathBuf, errors: Vec<String> },
}

impl Notification {
    /// The status this notification moves the connection to, if any.
    pub fn status(&self) -> Option<Status> {
        match self {
            Notification::Initializing => Some(Status::Initializing),
            Notification::ProcessingFiles(progress) => Some(Status::ProcessingFiles(*progress)),
            Notification::DoneProcessing => Some(Status::Ready),
            Notification::Diagnostics { .. } => None,
        }
    }
}

// ── Request catalog ─────────────────────────────────────────────────

/// Handshake: load the project, optionally from a saved-state snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitializeFromSavedState {
    pub root: PathBuf,
    pub saved_state_path: Option<PathBuf>,
    pub use_ranked_autocomplete: bool,
}

impl Request for InitializeFromSavedState {
    const METHOD: &'static str = "initialize_from_saved_state";
    type Response = ();
}

/// Ask the daemon to tear down its state before it is killed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Shutdown;

impl Request for Shutdown {
    const METHOD: &'static str = "shutdown";
    type Response = ();
}

/// Hover information at a position. Lines and columns are 1-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hover {
    pub path: PathBuf,
    pub line: u32,
    pub column: u32,
}

impl Request for Hover {
    const METHOD: &'static str = "hover";
    type Response = Option<String>;
}

/// A file changed on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChanged {
    pub path: PathBuf,
}

impl Message for FileChanged {
    const METHOD: &'static str = "file_changed";
}
