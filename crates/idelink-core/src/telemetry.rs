//! Telemetry events and an in-memory collector for them.
//!
//! Lifecycle milestones (handshake outcome, serve-loop faults, shutdown
//! outcome) are emitted as ordinary `tracing` events under the
//! [`TARGET`] target with an `event` field naming the milestone. A
//! [`TelemetryCollector`] layer captures just those events into a bounded
//! ring buffer, read back through a [`TelemetryReader`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

/// Target every telemetry event is emitted under.
pub const TARGET: &str = "idelink::telemetry";

/// Values of the `event` field.
pub mod events {
    pub const INIT_SUCCEEDED: &str = "init_succeeded";
    pub const INIT_FAILED: &str = "init_failed";
    pub const SERVE_FAULT: &str = "serve_fault";
    pub const SHUTDOWN_COMPLETE: &str = "shutdown_complete";
    pub const SHUTDOWN_TIMEOUT: &str = "shutdown_timeout";
    pub const SHUTDOWN_FAULT: &str = "shutdown_fault";
}

/// A single captured telemetry event.
#[derive(Debug, Clone)]
pub struct TelemetryEvent {
    /// Seconds since the collector was created.
    pub elapsed_secs: f64,
    pub level: Level,
    /// Milestone name, one of [`events`].
    pub event: String,
    pub tracking_id: Option<String>,
    pub error: Option<String>,
    pub message: String,
}

#[derive(Debug)]
struct EventBuffer {
    entries: VecDeque<TelemetryEvent>,
    capacity: usize,
    start_time: Instant,
}

impl EventBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            start_time: Instant::now(),
        }
    }

    fn push(&mut self, level: Level, fields: EventFields) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(TelemetryEvent {
            elapsed_secs: self.start_time.elapsed().as_secs_f64(),
            level,
            event: fields.event,
            tracking_id: fields.tracking_id,
            error: fields.error,
            message: fields.message,
        });
    }
}

/// A `tracing` layer that keeps the most recent telemetry events.
#[derive(Debug, Clone)]
pub struct TelemetryCollector {
    buffer: Arc<Mutex<EventBuffer>>,
}

impl TelemetryCollector {
    /// Create a collector keeping at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(EventBuffer::new(capacity.max(1)))),
        }
    }

    pub fn reader(&self) -> TelemetryReader {
        TelemetryReader {
            buffer: Arc::clone(&self.buffer),
        }
    }
}

impl<S: Subscriber> Layer<S> for TelemetryCollector {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if metadata.target() != TARGET {
            return;
        }

        let mut fields = EventFields::default();
        event.record(&mut fields);

        if let Ok(mut buf) = self.buffer.lock() {
            buf.push(*metadata.level(), fields);
        }
    }
}

/// Read handle for captured telemetry.
#[derive(Debug, Clone)]
pub struct TelemetryReader {
    buffer: Arc<Mutex<EventBuffer>>,
}

impl TelemetryReader {
    /// Snapshot of all captured events, oldest first.
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.buffer
            .lock()
            .map(|buf| buf.entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether an event with the given name has been captured.
    pub fn contains(&self, event: &str) -> bool {
        self.buffer
            .lock()
            .map(|buf| buf.entries.iter().any(|e| e.event == event))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().map(|buf| buf.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
struct EventFields {
    event: String,
    tracking_id: Option<String>,
    error: Option<String>,
    message: String,
}

impl EventFields {
    fn set(&mut self, field: &Field, value: String) {
        match field.name() {
            "event" => self.event = value,
            "tracking_id" => self.tracking_id = Some(value),
            "error" => self.error = Some(value),
            "message" => self.message = value,
            _ => {}
        }
    }
}

impl Visit for EventFields {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.set(field, format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.set(field, value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    #[test]
    fn test_collector_captures_only_telemetry_target() {
        let collector = TelemetryCollector::new(16);
        let reader = collector.reader();
        let _guard = tracing_subscriber::registry().with(collector).set_default();

        tracing::info!("ordinary log line");
        tracing::info!(
            target: TARGET,
            event = events::INIT_SUCCEEDED,
            tracking_id = "init-1",
            "daemon initialized"
        );

        let captured = reader.events();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].event, events::INIT_SUCCEEDED);
        assert_eq!(captured[0].tracking_id.as_deref(), Some("init-1"));
        assert_eq!(captured[0].message, "daemon initialized");
        assert_eq!(captured[0].level, Level::INFO);
        assert!(reader.contains(events::INIT_SUCCEEDED));
    }

    #[test]
    fn test_collector_records_display_errors() {
        let collector = TelemetryCollector::new(16);
        let reader = collector.reader();
        let _guard = tracing_subscriber::registry().with(collector).set_default();

        let err = std::io::Error::other("pipe burst");
        tracing::error!(
            target: TARGET,
            event = events::SERVE_FAULT,
            error = %err,
            "serve loop fault"
        );

        let captured = reader.events();
        assert_eq!(captured[0].error.as_deref(), Some("pipe burst"));
        assert_eq!(captured[0].level, Level::ERROR);
    }

    #[test]
    fn test_collector_ring_buffer() {
        let collector = TelemetryCollector::new(2);
        let reader = collector.reader();
        let _guard = tracing_subscriber::registry().with(collector).set_default();

        tracing::info!(target: TARGET, event = "one", "first");
        tracing::info!(target: TARGET, event = "two", "second");
        tracing::info!(target: TARGET, event = "three", "third");

        let captured = reader.events();
        assert_eq!(captured.len(), 2);
        assert_eq!(captured[0].event, "two");
        assert!(!reader.contains("one"));
    }

    #[test]
    fn test_reader_is_empty() {
        let reader = TelemetryCollector::new(4).reader();
        assert!(reader.is_empty());
        assert_eq!(reader.len(), 0);
    }
}
