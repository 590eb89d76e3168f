//! Controlled teardown: shutdown request raced against a fixed timeout.

use std::sync::atomic::Ordering;

use tracing::{debug, error, info, warn};

use crate::protocol::Shutdown;
use crate::state::{LifecycleState, StopReason};
use crate::telemetry::{self, events};

use super::ServiceHandle;

impl ServiceHandle {
    /// Tear down the daemon and close all queues.
    ///
    /// On an initialized connection this races a shutdown request against
    /// the shutdown timeout; whichever finishes first kills the daemon and
    /// the other is abandoned. A connection that never initialized has no
    /// serve loop to carry the request, so the daemon is killed directly.
    /// Faults are logged, never returned. Safe to call in any state and
    /// more than once.
    pub async fn destroy(&self, tracking_id: &str) {
        let inner = &self.inner;
        inner.tearing_down.store(true, Ordering::SeqCst);
        match inner.state.get() {
            LifecycleState::Initialized { .. } => {
                let graceful = async {
                    if let Err(e) = self.rpc(tracking_id, Shutdown).await {
                        warn!(tracking_id, error = %e, "shutdown request failed");
                    }
                    self.kill_daemon(tracking_id).await;
                    info!(
                        target: telemetry::TARGET,
                        event = events::SHUTDOWN_COMPLETE,
                        tracking_id,
                        "daemon shut down"
                    );
                };
                let deadline = async {
                    tokio::time::sleep(inner.shutdown_timeout).await;
                    self.kill_daemon(tracking_id).await;
                    warn!(
                        target: telemetry::TARGET,
                        event = events::SHUTDOWN_TIMEOUT,
                        tracking_id,
                        timeout_ms = inner.shutdown_timeout.as_millis() as u64,
                        "daemon did not acknowledge shutdown in time, killed it"
                    );
                };
                tokio::select! {
                    () = graceful => {}
                    () = deadline => {}
                }
            }
            LifecycleState::Uninitialized { .. } | LifecycleState::FailedToInitialize { .. } => {
                self.kill_daemon(tracking_id).await;
            }
            LifecycleState::Stopped { .. } => {
                debug!(tracking_id, "destroy on stopped connection");
            }
        }

        inner.outbound.close();
        inner.responses.close();
        inner.notifications.close();
    }

    /// [`destroy`](Self::destroy) the connection and mark it stopped.
    ///
    /// Callers must stop issuing requests once this has been called: the
    /// daemon may already be tearing down while the state still reads
    /// `Initialized`.
    pub async fn stop(&self, tracking_id: &str, reason: StopReason) {
        let inner = &self.inner;
        inner.stop_requested.store(true, Ordering::SeqCst);
        let _stopping = inner.stop_lock.lock().await;

        self.destroy(tracking_id).await;
        if !inner.state.get().is_stopped() {
            info!(tracking_id, %reason, "connection stopped");
            inner.state.set(LifecycleState::Stopped { reason });
        }
    }

    async fn kill_daemon(&self, tracking_id: &str) {
        if let Err(e) = self.inner.process.kill().await {
            error!(
                target: telemetry::TARGET,
                event = events::SHUTDOWN_FAULT,
                tracking_id,
                error = %e,
                "failed to kill daemon"
            );
        }
    }
}
