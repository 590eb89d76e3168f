//! One-time initialization exchange, run before the serve loop.

use std::path::PathBuf;

use tracing::{error, info, warn};

use crate::protocol::{DaemonMessage, InitializeFromSavedState, TrackedRequest};
use crate::state::{LifecycleState, Status};
use crate::telemetry::{self, events};

use super::{ServiceError, ServiceHandle};

/// Failure reason when the daemon speaks before answering the handshake.
pub const NOTIFICATION_BEFORE_INIT: &str =
    "received a notification before the initialization response";

/// Failure reason when the daemon rejects the handshake.
pub const SAVED_STATE_LOAD_FAILED: &str = "could not load saved-state";

impl ServiceHandle {
    /// Perform the initialization handshake.
    ///
    /// Writes the init request straight to the daemon and reads exactly one
    /// message back, bypassing the queues (the serve loop is not running
    /// yet). On success the connection becomes `Initialized{Ready}` and
    /// [`serve`](Self::serve) may be started. Any failure is terminal: only
    /// an `Uninitialized` connection accepts the handshake, and later calls
    /// are refused without touching the daemon.
    pub async fn initialize_from_saved_state(
        &self,
        root: PathBuf,
        saved_state_path: Option<PathBuf>,
        wait_for_init: bool,
        use_ranked_autocomplete: bool,
    ) -> Result<(), ServiceError> {
        let inner = &self.inner;
        self.ensure_uninitialized()?;
        inner
            .state
            .set(LifecycleState::Uninitialized { wait_for_init });

        let request = InitializeFromSavedState {
            root,
            saved_state_path,
            use_ranked_autocomplete,
        };
        let tracked = TrackedRequest::request(&inner.init_id, &request)?;

        let reply = {
            let mut reader = inner.reader.lock().await;
            let mut writer = inner.writer.lock().await;
            // A concurrent handshake may have finished while we waited.
            self.ensure_uninitialized()?;
            match writer.write(&tracked).await {
                Ok(_) => reader.read::<DaemonMessage>().await,
                Err(e) => Err(e),
            }
        };

        match reply {
            Ok(DaemonMessage::Response(Ok(_))) => {
                let ready = inner.state.set(LifecycleState::Initialized {
                    status: Status::Ready,
                });
                if !ready {
                    // Stopped while the daemon was answering.
                    return Err(refusal(inner.state.get()));
                }
                info!(
                    target: telemetry::TARGET,
                    event = events::INIT_SUCCEEDED,
                    tracking_id = %inner.init_id,
                    "daemon initialized"
                );
                Ok(())
            }
            Ok(DaemonMessage::Notification(notification)) => {
                error!(
                    target: telemetry::TARGET,
                    event = events::INIT_FAILED,
                    tracking_id = %inner.init_id,
                    ?notification,
                    "{NOTIFICATION_BEFORE_INIT}"
                );
                self.fail_initialization(NOTIFICATION_BEFORE_INIT);
                Err(ServiceError::Protocol(NOTIFICATION_BEFORE_INIT.to_string()))
            }
            Ok(DaemonMessage::Response(Err(message))) => {
                error!(
                    target: telemetry::TARGET,
                    event = events::INIT_FAILED,
                    tracking_id = %inner.init_id,
                    error = %message,
                    "{SAVED_STATE_LOAD_FAILED}"
                );
                self.fail_initialization(SAVED_STATE_LOAD_FAILED);
                Err(ServiceError::Daemon(message))
            }
            Err(e) => {
                error!(
                    target: telemetry::TARGET,
                    event = events::INIT_FAILED,
                    tracking_id = %inner.init_id,
                    error = %e,
                    "could not reach daemon during initialization"
                );
                self.fail_initialization(&format!("could not reach daemon: {e}"));
                Err(e.into())
            }
        }
    }

    fn ensure_uninitialized(&self) -> Result<(), ServiceError> {
        match self.inner.state.get() {
            LifecycleState::Uninitialized { .. } => Ok(()),
            other => {
                warn!(init_id = %self.inner.init_id, state = ?other, "handshake refused");
                Err(refusal(other))
            }
        }
    }

    fn fail_initialization(&self, reason: &str) {
        self.inner.state.set(LifecycleState::FailedToInitialize {
            reason: reason.to_string(),
        });
    }
}

/// Error for a handshake attempted on a connection in `state`.
fn refusal(state: LifecycleState) -> ServiceError {
    match state {
        LifecycleState::Uninitialized { .. } => ServiceError::NotInitialized,
        LifecycleState::Initialized { .. } => ServiceError::AlreadyInitialized,
        LifecycleState::FailedToInitialize { reason } => ServiceError::FailedToInitialize(reason),
        LifecycleState::Stopped { reason } => ServiceError::Stopped(reason),
    }
}
