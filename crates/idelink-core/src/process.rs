//! Ownership of the daemon subprocess and its two byte streams.
//!
//! The daemon is reached through a [`Transport`]: a killable process handle
//! plus the read half (daemon stdout) and write half (daemon stdin). The
//! process handle sits behind the [`DaemonProcess`] trait so tests can drive
//! the controller against an in-process daemon over `tokio::io::duplex`.

use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info};

use idelink_config::DaemonConfig;

use crate::BoxFuture;
use crate::build_info::BuildInfo;
use crate::service::ServiceError;

/// Read half of the daemon connection.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Write half of the daemon connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A daemon process that can be forcibly terminated.
///
/// `kill` must be idempotent: it is called from the graceful-shutdown path,
/// the timeout path, and error paths, possibly more than once.
pub trait DaemonProcess: Send + Sync {
    /// OS process id, if there is one.
    fn pid(&self) -> Option<u32>;

    /// Forcibly terminate the process.
    fn kill(&self) -> BoxFuture<'_, std::io::Result<()>>;
}

/// A daemon running as a real child process.
pub struct ChildProcess {
    child: Mutex<Child>,
    pid: Option<u32>,
}

impl ChildProcess {
    pub fn new(child: Child) -> Self {
        let pid = child.id();
        Self {
            child: Mutex::new(child),
            pid,
        }
    }
}

impl DaemonProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn kill(&self) -> BoxFuture<'_, std::io::Result<()>> {
        Box::pin(async move {
            let mut child = self.child.lock().await;
            if let Some(status) = child.try_wait()? {
                debug!(pid = ?self.pid, %status, "daemon already exited");
                return Ok(());
            }
            info!(pid = ?self.pid, "killing daemon");
            child.kill().await
        })
    }
}

/// Exclusive ownership of a daemon process and its streams.
pub struct Transport {
    pub process: Box<dyn DaemonProcess>,
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

impl Transport {
    pub fn new(
        process: impl DaemonProcess + 'static,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            process: Box::new(process),
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

/// Spawn the configured daemon with piped stdin/stdout.
///
/// The daemon's stderr is inherited so its own logs reach the terminal.
pub fn spawn_daemon(config: &DaemonConfig) -> Result<Transport, ServiceError> {
    let mut child = Command::new(&config.binary)
        .args(&config.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ServiceError::Spawn {
            binary: config.binary.clone(),
            source,
        })?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| ServiceError::Protocol("daemon stdin was not piped".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ServiceError::Protocol("daemon stdout was not piped".to_string()))?;

    let process = ChildProcess::new(child);
    info!(
        binary = %config.binary.display(),
        pid = ?process.pid(),
        client = %BuildInfo::current(),
        "spawned daemon"
    );

    Ok(Transport::new(process, stdout, stdin))
}
