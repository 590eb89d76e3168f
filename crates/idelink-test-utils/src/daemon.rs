//! A scripted in-process daemon for driving a [`ServiceHandle`] in tests.
//!
//! The daemon speaks the real wire format over a pair of
//! `tokio::io::duplex` pipes, so everything from the frame codec up is
//! exercised. Behaviour is scripted with the [`MockDaemon`] builder:
//!
//! ```ignore
//! let (service, daemon) = MockDaemon::new()
//!     .reject_init("no saved state")
//!     .spawn("init-1");
//! ```
//!
//! Killing the connection (through [`DaemonProcess::kill`]) aborts the
//! daemon task, which drops its pipe ends exactly as a dead child process
//! closes its stdio.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};

use idelink_core::BoxFuture;
use idelink_core::codec::{FrameReader, FrameWriter};
use idelink_core::protocol::{DaemonMessage, Notification, TrackedRequest};
use idelink_core::{DaemonProcess, ServiceHandle, ServiceOptions, Transport};

const PIPE_CAPACITY: usize = 64 * 1024;

/// How the daemon answers the initialization request.
#[derive(Debug, Clone)]
pub enum InitBehavior {
    Accept,
    Reject(String),
    /// Reject the first attempt, then accept the next one.
    RejectOnce(String),
    /// Emit this notification instead of a response.
    NotifyFirst(Notification),
}

/// How the daemon answers a shutdown request.
#[derive(Debug, Clone, Copy)]
pub enum ShutdownBehavior {
    AckAfter(Duration),
    Never,
}

/// Computes the reply for an ordinary request. `None` means the daemon
/// never replies.
pub type Handler = Arc<dyn Fn(&TrackedRequest) -> Option<Result<Value, String>> + Send + Sync>;

/// Builder for a scripted daemon.
pub struct MockDaemon {
    init: InitBehavior,
    shutdown: ShutdownBehavior,
    handler: Handler,
    after_init: Vec<Notification>,
    reply_delay: Duration,
    kill_fails: bool,
    options: ServiceOptions,
}

impl MockDaemon {
    /// A daemon that accepts the handshake, echoes request params back as
    /// the result, and acknowledges shutdown immediately.
    pub fn new() -> Self {
        Self {
            init: InitBehavior::Accept,
            shutdown: ShutdownBehavior::AckAfter(Duration::ZERO),
            handler: Arc::new(|req: &TrackedRequest| Some(Ok(req.params.clone()))),
            after_init: Vec::new(),
            reply_delay: Duration::ZERO,
            kill_fails: false,
            options: ServiceOptions::default(),
        }
    }

    pub fn reject_init(mut self, message: &str) -> Self {
        self.init = InitBehavior::Reject(message.to_string());
        self
    }

    /// Reject the first handshake but stay alive and accept a second.
    pub fn reject_init_once(mut self, message: &str) -> Self {
        self.init = InitBehavior::RejectOnce(message.to_string());
        self
    }

    pub fn notify_before_init(mut self, notification: Notification) -> Self {
        self.init = InitBehavior::NotifyFirst(notification);
        self
    }

    /// Send `notification` right after a successful handshake.
    pub fn notify_after_init(mut self, notification: Notification) -> Self {
        self.after_init.push(notification);
        self
    }

    pub fn shutdown_ack_after(mut self, delay: Duration) -> Self {
        self.shutdown = ShutdownBehavior::AckAfter(delay);
        self
    }

    pub fn never_ack_shutdown(mut self) -> Self {
        self.shutdown = ShutdownBehavior::Never;
        self
    }

    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&TrackedRequest) -> Option<Result<Value, String>> + Send + Sync + 'static,
    {
        self.handler = Arc::new(handler);
        self
    }

    /// Delay every ordinary reply. Requests are still handled one at a
    /// time, in order.
    pub fn reply_after(mut self, delay: Duration) -> Self {
        self.reply_delay = delay;
        self
    }

    /// Make [`DaemonProcess::kill`] fail (the daemon still dies).
    pub fn kill_fails(mut self) -> Self {
        self.kill_fails = true;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.options.shutdown_timeout = timeout;
        self
    }

    /// Start the daemon task and wrap it in an uninitialized service.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(self, init_id: &str) -> (ServiceHandle, MockDaemonHandle) {
        let (client_read, daemon_write) = tokio::io::duplex(PIPE_CAPACITY);
        let (daemon_read, client_write) = tokio::io::duplex(PIPE_CAPACITY);

        let received = Arc::new(Mutex::new(Vec::new()));
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let script = Script {
            init: self.init,
            shutdown: self.shutdown,
            handler: self.handler,
            after_init: self.after_init,
            reply_delay: self.reply_delay,
        };
        let task = tokio::spawn(run_daemon(
            FrameReader::new(daemon_read),
            FrameWriter::new(daemon_write),
            script,
            Arc::clone(&received),
            notify_rx,
        ));

        let killed = Arc::new(AtomicBool::new(false));
        let kills = Arc::new(AtomicUsize::new(0));
        let process = MockProcess {
            abort: task.abort_handle(),
            killed: Arc::clone(&killed),
            kills: Arc::clone(&kills),
            fail: self.kill_fails,
        };
        let service = ServiceHandle::from_transport(
            init_id,
            Transport::new(process, client_read, client_write),
            self.options,
        );
        let handle = MockDaemonHandle {
            received,
            notify_tx,
            killed,
            kills,
            task,
        };
        (service, handle)
    }

    /// [`spawn`](Self::spawn), complete the handshake, and start the serve
    /// loop on its own task.
    ///
    /// Panics if the handshake fails.
    pub async fn start(self, init_id: &str) -> (ServiceHandle, MockDaemonHandle, JoinHandle<()>) {
        let (service, daemon) = self.spawn(init_id);
        service
            .initialize_from_saved_state(".".into(), None, false, false)
            .await
            .expect("mock daemon handshake failed");
        let serving = service.clone();
        let serve = tokio::spawn(async move { serving.serve().await });
        (service, daemon, serve)
    }
}

impl Default for MockDaemon {
    fn default() -> Self {
        Self::new()
    }
}

/// Test-side view of a running mock daemon.
pub struct MockDaemonHandle {
    received: Arc<Mutex<Vec<TrackedRequest>>>,
    notify_tx: mpsc::UnboundedSender<Notification>,
    killed: Arc<AtomicBool>,
    kills: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl MockDaemonHandle {
    /// Push a notification to the client. Delivered once the handshake has
    /// completed.
    pub fn notify(&self, notification: Notification) {
        let _ = self.notify_tx.send(notification);
    }

    /// Every request the daemon has read, in order, including the handshake.
    pub fn received(&self) -> Vec<TrackedRequest> {
        self.received.lock().expect("received lock poisoned").clone()
    }

    pub fn methods(&self) -> Vec<String> {
        self.received().into_iter().map(|r| r.method).collect()
    }

    /// Poll until a request with `method` has been read.
    pub async fn wait_for_method(&self, method: &str) {
        while !self.methods().iter().any(|m| m == method) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Whether the controller killed the daemon.
    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    /// Die without being asked, closing both pipes.
    pub fn crash(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

struct MockProcess {
    abort: AbortHandle,
    killed: Arc<AtomicBool>,
    kills: Arc<AtomicUsize>,
    fail: bool,
}

impl DaemonProcess for MockProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn kill(&self) -> BoxFuture<'_, std::io::Result<()>> {
        Box::pin(async move {
            self.killed.store(true, Ordering::SeqCst);
            self.kills.fetch_add(1, Ordering::SeqCst);
            self.abort.abort();
            if self.fail {
                return Err(std::io::Error::other("kill refused"));
            }
            Ok(())
        })
    }
}

struct Script {
    init: InitBehavior,
    shutdown: ShutdownBehavior,
    handler: Handler,
    after_init: Vec<Notification>,
    reply_delay: Duration,
}

async fn run_daemon(
    mut reader: FrameReader<DuplexStream>,
    mut writer: FrameWriter<DuplexStream>,
    script: Script,
    received: Arc<Mutex<Vec<TrackedRequest>>>,
    mut notify_rx: mpsc::UnboundedReceiver<Notification>,
) {
    let record = |request: &TrackedRequest| {
        received
            .lock()
            .expect("received lock poisoned")
            .push(request.clone());
    };

    let mut init = Some(script.init);
    while let Some(behavior) = init.take() {
        let Ok(request) = reader.read::<TrackedRequest>().await else {
            return;
        };
        record(&request);
        let reply = match behavior {
            InitBehavior::Accept => DaemonMessage::Response(Ok(Value::Null)),
            InitBehavior::Reject(message) => DaemonMessage::Response(Err(message)),
            InitBehavior::RejectOnce(message) => {
                init = Some(InitBehavior::Accept);
                DaemonMessage::Response(Err(message))
            }
            InitBehavior::NotifyFirst(notification) => DaemonMessage::Notification(notification),
        };
        let accepted = matches!(reply, DaemonMessage::Response(Ok(_)));
        if writer.write(&reply).await.is_err() {
            return;
        }
        if !accepted && init.is_none() {
            return;
        }
    }
    for notification in script.after_init {
        if writer
            .write(&DaemonMessage::Notification(notification))
            .await
            .is_err()
        {
            return;
        }
    }

    loop {
        tokio::select! {
            request = reader.read::<TrackedRequest>() => {
                let Ok(request) = request else { return };
                record(&request);
                let reply = if request.method == "shutdown" {
                    match script.shutdown {
                        ShutdownBehavior::AckAfter(delay) => {
                            tokio::time::sleep(delay).await;
                            Some(Ok(Value::Null))
                        }
                        ShutdownBehavior::Never => None,
                    }
                } else if request.expects_reply {
                    tokio::time::sleep(script.reply_delay).await;
                    (script.handler)(&request)
                } else {
                    None
                };
                if let Some(result) = reply {
                    if writer.write(&DaemonMessage::Response(result)).await.is_err() {
                        return;
                    }
                }
            }
            Some(notification) = notify_rx.recv() => {
                if writer.write(&DaemonMessage::Notification(notification)).await.is_err() {
                    return;
                }
            }
        }
    }
}
