//! The event-multiplexing loop.

use std::collections::VecDeque;

use tracing::{debug, error, warn};

use crate::codec::CodecError;
use crate::protocol::DaemonMessage;
use crate::state::StopReason;
use crate::telemetry::{self, events};

use super::{QueuedRequest, ResponseEnvelope, ServiceError, ServiceHandle};

/// Whether the loop should run another iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Whichever side of the race finished first.
enum Step {
    Outbound(Option<QueuedRequest>),
    Inbound(Result<DaemonMessage, CodecError>),
}

impl ServiceHandle {
    /// Run the serve loop until the connection stops.
    ///
    /// Each iteration races popping the outbound queue against reading the
    /// next message from the daemon. Both operations are cancel-safe, so the
    /// loser of the race is dropped without losing data. When the loop ends
    /// for any reason other than a requested stop, the connection is
    /// stopped with [`StopReason::Crashed`].
    ///
    /// Start this as its own task once
    /// [`initialize_from_saved_state`](Self::initialize_from_saved_state)
    /// has succeeded.
    pub async fn serve(&self) {
        let inner = &self.inner;
        {
            let mut reader = inner.reader.lock().await;
            let mut writer = inner.writer.lock().await;
            // Tickets of written requests still awaiting a reply, oldest first.
            let mut awaiting: VecDeque<Option<u64>> = VecDeque::new();

            loop {
                let step = tokio::select! {
                    item = inner.outbound.pop() => Step::Outbound(item),
                    message = reader.read::<DaemonMessage>() => Step::Inbound(message),
                };

                let flow = match step {
                    Step::Outbound(None) => Ok(Flow::Stop),
                    Step::Outbound(Some(queued)) => {
                        match writer.write(&queued.request).await {
                            Ok(bytes) => {
                                debug!(
                                    tracking_id = %queued.request.tracking_id,
                                    method = %queued.request.method,
                                    bytes,
                                    "sent request"
                                );
                                if queued.request.expects_reply {
                                    awaiting.push_back(queued.ticket);
                                }
                                Ok(Flow::Continue)
                            }
                            Err(e) => Err(ServiceError::from(e)),
                        }
                    }
                    Step::Inbound(Ok(message)) => Ok(self.dispatch(message, &mut awaiting)),
                    Step::Inbound(Err(e)) => Err(ServiceError::from(e)),
                };

                match flow {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Stop) => {
                        debug!(init_id = %inner.init_id, "serve loop stopping");
                        break;
                    }
                    Err(e) if self.stop_requested() || self.tearing_down() => {
                        debug!(init_id = %inner.init_id, error = %e, "serve loop ended during teardown");
                        break;
                    }
                    Err(e) => {
                        error!(
                            target: telemetry::TARGET,
                            event = events::SERVE_FAULT,
                            tracking_id = %inner.init_id,
                            error = %e,
                            "serve loop fault"
                        );
                        break;
                    }
                }
            }
        }

        // Nothing drains the outbound queue any more; make pushes fail fast.
        inner.outbound.close();

        if !inner.state.get().is_stopped() && !self.stop_requested() {
            if self.tearing_down() {
                debug!(init_id = %inner.init_id, "daemon destroyed under the serve loop, stopping connection");
            } else {
                warn!(init_id = %inner.init_id, "serve loop ended unexpectedly, stopping connection");
            }
            // No reply can arrive now. Release any caller holding the rpc
            // slot so the shutdown request below is not stuck behind it.
            inner.responses.close();
            self.stop(&inner.init_id, StopReason::Crashed).await;
        }
    }

    /// Route one inbound message to the status cell and the right queue.
    fn dispatch(&self, message: DaemonMessage, awaiting: &mut VecDeque<Option<u64>>) -> Flow {
        let inner = &self.inner;
        let delivered = match message {
            DaemonMessage::Notification(notification) => {
                if let Some(status) = notification.status() {
                    inner.state.set_status(status);
                }
                inner.notifications.push(notification)
            }
            DaemonMessage::Response(result) => {
                let ticket = awaiting.pop_front().flatten();
                if ticket.is_none() {
                    warn!(init_id = %inner.init_id, "response arrived with no request awaiting one");
                }
                inner.responses.push(ResponseEnvelope { ticket, result })
            }
        };
        if delivered { Flow::Continue } else { Flow::Stop }
    }
}
