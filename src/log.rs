//! User-visible running log.
//!
//! Every line carries an `HH:MM:SS` prefix. Diagnostics go through `tracing`;
//! this log is what the operator watches while a device is being provisioned.

use chrono::{DateTime, Local};
use colored::Colorize;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// A single line of the running log.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub timestamp: DateTime<Local>,
    pub message: String,
}

impl LogLine {
    pub fn now(message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            message: message.into(),
        }
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.timestamp.format("%H:%M:%S"), self.message)
    }
}

/// Destination for log lines. Implementations must be cheap and non-blocking,
/// they are called from reader threads while a remote command streams output.
pub trait LogSink: Send + Sync {
    fn append(&self, line: LogLine);
}

pub type SharedLog = Arc<dyn LogSink>;

/// Extension helper so callers can write `log.line("...")`.
pub trait LogExt {
    fn line(&self, message: impl Into<String>);
}

impl<T: LogSink + ?Sized> LogExt for T {
    fn line(&self, message: impl Into<String>) {
        self.append(LogLine::now(message));
    }
}

/// Prints to stdout with a dimmed timestamp.
#[derive(Debug, Default)]
pub struct ConsoleLog;

impl LogSink for ConsoleLog {
    fn append(&self, line: LogLine) {
        println!(
            "{} {}",
            line.timestamp.format("%H:%M:%S").to_string().dimmed(),
            line.message
        );
    }
}

/// Forwards lines to a UI boundary over an unbounded channel.
/// Lines are dropped once the receiving side is gone.
pub struct ChannelLog {
    tx: mpsc::UnboundedSender<LogLine>,
}

impl ChannelLog {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LogLine>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl LogSink for ChannelLog {
    fn append(&self, line: LogLine) {
        if self.tx.send(line).is_err() {
            tracing::trace!("log receiver dropped");
        }
    }
}

/// Keeps every line in memory.
#[derive(Debug, Default)]
pub struct MemoryLog {
    lines: Mutex<Vec<LogLine>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages without timestamps, in append order.
    pub fn messages(&self) -> Vec<String> {
        self.lock().iter().map(|l| l.message.clone()).collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lock().iter().any(|l| l.message.contains(needle))
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<LogLine>> {
        // A panic while holding the lock leaves the Vec intact.
        self.lines.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl LogSink for MemoryLog {
    fn append(&self, line: LogLine) {
        self.lock().push(line);
    }
}
