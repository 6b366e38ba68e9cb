//! Bounded in-memory event log for operator-visible agent events.
//!
//! Cloud connectivity, command execution, and property sync append entries
//! here so an embedding UI layer can render them; everything is mirrored to
//! the `log` facade as well.

use chrono::{DateTime, Utc};
use log::{error, info};
use parking_lot::Mutex;
use std::collections::VecDeque;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    Info,
    Error,
}

#[derive(Debug, Clone)]
pub struct EventEntry {
    pub severity: EventSeverity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Ring buffer of recent agent events. Oldest entries are evicted first.
pub struct EventLog {
    entries: Mutex<VecDeque<EventEntry>>,
    capacity: usize,
}

impl EventLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append an informational entry.
    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        info!("[Event] {}", message);
        self.push(EventSeverity::Info, message);
    }

    /// Append an error entry.
    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        error!("[Event] {}", message);
        self.push(EventSeverity::Error, message);
    }

    fn push(&self, severity: EventSeverity, message: String) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(EventEntry {
            severity,
            message,
            timestamp: Utc::now(),
        });
    }

    /// Snapshot of current entries, oldest first.
    pub fn snapshot(&self) -> Vec<EventEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}
