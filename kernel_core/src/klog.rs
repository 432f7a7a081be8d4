//! Kernel log
//!
//! Structured, inspectable log sink. The `log` syscall appends at info
//! level; kernel subsystems append when they have to drop work on the floor
//! (for example an undeliverable completion). Tests read the entries back.

use std::fmt;
use std::sync::Mutex;

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One log entry.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.level, self.message)
    }
}

/// The kernel log sink.
#[derive(Default)]
pub struct KernelLog {
    entries: Mutex<Vec<LogEntry>>,
}

impl KernelLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry.
    pub fn append(&self, level: LogLevel, message: impl Into<String>) {
        let mut entries = self.entries.lock().expect("kernel log lock");
        entries.push(LogEntry {
            level,
            message: message.into(),
        });
    }

    /// Returns a snapshot of all entries.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().expect("kernel log lock").clone()
    }

    /// Returns true if any entry matches the predicate.
    pub fn has_entry<F>(&self, predicate: F) -> bool
    where
        F: Fn(&LogEntry) -> bool,
    {
        self.entries
            .lock()
            .expect("kernel log lock")
            .iter()
            .any(predicate)
    }

    /// Clears the log.
    pub fn clear(&self) {
        self.entries.lock().expect("kernel log lock").clear();
    }
}
