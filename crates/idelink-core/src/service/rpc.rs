//! Request/response facade and fire-and-forget messages.

use std::backtrace::Backtrace;
use std::path::PathBuf;

use tracing::{debug, error, warn};

use crate::protocol::{FileChanged, Message, Request, TrackedRequest};
use crate::state::LifecycleState;

use super::{QueueKind, QueuedRequest, ServiceError, ServiceHandle};

impl ServiceHandle {
    /// Send `request` to the daemon and wait for its response.
    ///
    /// Fails immediately when the connection is not usable: uninitialized
    /// (unless the handshake was started with `wait_for_init`, in which case
    /// this waits for it), failed to initialize, or stopped.
    ///
    /// Calls are serialized internally, so at most one request is ever
    /// awaiting a response; concurrent callers queue up behind each other.
    /// Errors never escape as panics: every failure comes back as a
    /// [`ServiceError`].
    pub async fn rpc<R: Request>(
        &self,
        tracking_id: &str,
        request: R,
    ) -> Result<R::Response, ServiceError> {
        match self.inner.state.get() {
            LifecycleState::Uninitialized {
                wait_for_init: false,
            } => return Err(ServiceError::NotInitialized),
            LifecycleState::FailedToInitialize { reason } => {
                return Err(ServiceError::FailedToInitialize(reason));
            }
            LifecycleState::Stopped { reason } => return Err(ServiceError::Stopped(reason)),
            LifecycleState::Uninitialized {
                wait_for_init: true,
            }
            | LifecycleState::Initialized { .. } => {}
        }

        let result = self.exchange(tracking_id, &request).await;
        if let Err(e) = &result {
            if matches!(e, ServiceError::Daemon(_)) {
                debug!(tracking_id, method = R::METHOD, error = %e, "daemon returned an error");
            } else {
                error!(
                    tracking_id,
                    method = R::METHOD,
                    error = %e,
                    backtrace = %Backtrace::capture(),
                    "rpc failed"
                );
            }
        }
        result
    }

    /// Wait for initialization if needed, enqueue the request, and pop its
    /// response.
    async fn exchange<R: Request>(
        &self,
        tracking_id: &str,
        request: &R,
    ) -> Result<R::Response, ServiceError> {
        let inner = &self.inner;
        if !inner.state.get().is_initialized() {
            inner.state.wait_for_initialization().await?;
        }

        let request = TrackedRequest::request(tracking_id, request)?;

        let _in_flight = inner.rpc_lock.lock().await;
        // Issued under the lock so tickets rise in the order requests are
        // enqueued.
        let ticket = self.next_ticket();
        if !inner.outbound.push(QueuedRequest {
            request,
            ticket: Some(ticket),
        }) {
            return Err(ServiceError::QueueClosed(QueueKind::Outbound));
        }

        loop {
            let envelope = inner
                .responses
                .pop()
                .await
                .ok_or(ServiceError::QueueClosed(QueueKind::Response))?;
            match envelope.ticket {
                Some(t) if t == ticket => {
                    let value = envelope.result.map_err(ServiceError::Daemon)?;
                    return Ok(serde_json::from_value(value)?);
                }
                // Left behind by a caller that gave up waiting.
                Some(t) if t < ticket => {
                    warn!(tracking_id, stale = t, "discarding stale response");
                }
                got => {
                    return Err(ServiceError::MisattributedResponse {
                        expected: ticket,
                        got,
                    });
                }
            }
        }
    }

    /// Enqueue a message that expects no response.
    ///
    /// Dropped silently once the connection has failed or stopped, since
    /// nothing would ever drain the queue.
    pub fn push_message<M: Message>(&self, tracking_id: &str, message: &M) {
        match self.inner.state.get() {
            LifecycleState::FailedToInitialize { .. } | LifecycleState::Stopped { .. } => {
                debug!(tracking_id, method = M::METHOD, "dropping message for dead connection");
                return;
            }
            LifecycleState::Uninitialized { .. } | LifecycleState::Initialized { .. } => {}
        }

        let request = match TrackedRequest::message(tracking_id, message) {
            Ok(request) => request,
            Err(e) => {
                warn!(tracking_id, method = M::METHOD, error = %e, "could not encode message");
                return;
            }
        };
        if !self.inner.outbound.push(QueuedRequest {
            request,
            ticket: None,
        }) {
            debug!(tracking_id, method = M::METHOD, "outbound queue closed, message dropped");
        }
    }

    /// Tell the daemon a file changed on disk.
    pub fn notify_file_changed(&self, tracking_id: &str, path: impl Into<PathBuf>) {
        self.push_message(tracking_id, &FileChanged { path: path.into() });
    }
}
