//! Logging sink.
//!
//! Spec section 6 describes an abstract "logging sink" external
//! collaborator that the supervisor, pool, and harness all write through.
//! Rather than stub that out, it is realized for real here as a
//! `tracing_subscriber` setup plus a small `tracing::Layer` that mirrors
//! every event onto an `mpsc::Sender<LogRecord>` — the same shape the
//! teacher crate uses `tracing-subscriber`'s `EnvFilter` for, with stderr as
//! the default destination so stdout stays free for a harness's own
//! stdout/stderr streaming.

use std::sync::mpsc::{Receiver, Sender};
use std::sync::Mutex;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::{EnvFilter, Registry};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// A single captured log event, forwarded to anything holding the receiving
/// end of a [`LoggingQueue`].
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: Level,
    pub target: String,
    pub message: String,
}

/// The receiving half of the logging sink. Clone and hand the sending half
/// ([`LoggingQueue::sender`]) to anything that should observe log traffic —
/// a test harness asserting on supervisor behavior, for instance.
pub struct LoggingQueue {
    sender: Sender<LogRecord>,
}

impl LoggingQueue {
    /// Build a fresh queue, returning the handle used to install the
    /// forwarding layer and the receiver to read records from.
    pub fn channel() -> (LoggingQueue, Receiver<LogRecord>) {
        let (tx, rx) = std::sync::mpsc::channel();
        (LoggingQueue { sender: tx }, rx)
    }

    /// A clone of the sending half, for anything that wants to forward its
    /// own records into this queue (see `supervisor`'s log-level
    /// propagation notes in DESIGN.md for why this stays in-process only).
    pub fn sender(&self) -> Sender<LogRecord> {
        self.sender.clone()
    }
}

struct ForwardingLayer {
    sender: Mutex<Sender<LogRecord>>,
}

struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

impl<S: Subscriber> Layer<S> for ForwardingLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor {
            message: String::new(),
        };
        event.record(&mut visitor);
        let record = LogRecord {
            level: *event.metadata().level(),
            target: event.metadata().target().to_string(),
            message: visitor.message,
        };
        if let Ok(sender) = self.sender.lock() {
            // A full/disconnected receiver must never slow down or abort
            // the process that is trying to log; drop silently.
            let _ = sender.send(record);
        }
    }
}

/// Install the process-wide `tracing` subscriber: an `EnvFilter`-gated
/// human-readable layer writing to stderr (mirroring the teacher's choice to
/// keep stdout clean for a harness's own output), plus the forwarding layer
/// backing `queue`.
///
/// Call once, early, from a binary's `main`. Returns an error if a global
/// subscriber is already installed.
pub fn setup_logging(queue: &LoggingQueue) -> Result<(), tracing_subscriber::util::TryInitError> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let forwarding = ForwardingLayer {
        sender: Mutex::new(queue.sender()),
    };

    Registry::default()
        .with(filter)
        .with(fmt_layer)
        .with(forwarding)
        .try_init()
}

/// Install a minimal subscriber (`EnvFilter` + stderr formatting only, no
/// forwarding queue) for binaries that don't need to observe their own log
/// stream programmatically — the harness child process, for instance.
pub fn setup_from_env() -> Result<(), tracing_subscriber::util::TryInitError> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    Registry::default().with(filter).with(fmt_layer).try_init()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn record_round_trips_through_layer() {
        let (queue, rx) = LoggingQueue::channel();
        let forwarding = ForwardingLayer {
            sender: Mutex::new(queue.sender()),
        };
        let subscriber = Registry::default().with(forwarding);

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "proc_supervisor::test", "hello from a test");
        });

        let record = rx
            .recv_timeout(Duration::from_secs(1))
            .expect("a record should have been forwarded");
        assert_eq!(record.level, Level::INFO);
        assert_eq!(record.target, "proc_supervisor::test");
        assert!(record.message.contains("hello from a test"));
    }
}
