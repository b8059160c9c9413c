//! Replication log: a bounded diagnostic trail shown to the operator.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of entries kept; the oldest is evicted first.
pub const LOG_CAPACITY: usize = 100;

/// Severity of a log entry (also used for notifications).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Success,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Success => "success",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicationLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Append-only ring buffer of log entries.
#[derive(Debug, Clone)]
pub struct ReplicationLog {
    entries: VecDeque<ReplicationLogEntry>,
    capacity: usize,
}

impl Default for ReplicationLog {
    fn default() -> Self {
        Self::with_capacity(LOG_CAPACITY)
    }
}

impl ReplicationLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Append an entry, evicting the oldest when full.
    pub fn push(&mut self, level: LogLevel, message: impl Into<String>) -> &ReplicationLogEntry {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(ReplicationLogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        });
        // Just pushed, so back() is always present
        &self.entries[self.entries.len() - 1]
    }

    /// Entries oldest first.
    pub fn entries(&self) -> Vec<ReplicationLogEntry> {
        self.entries.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let mut log = ReplicationLog::default();
        for i in 0..(LOG_CAPACITY + 5) {
            log.push(LogLevel::Info, format!("entry {}", i));
        }

        assert_eq!(log.entries().len(), LOG_CAPACITY);
        let entries = log.entries();
        assert_eq!(entries[0].message, "entry 5");
        assert_eq!(entries[LOG_CAPACITY - 1].message, format!("entry {}", LOG_CAPACITY + 4));
    }

    #[test]
    fn test_push_returns_entry() {
        let mut log = ReplicationLog::with_capacity(2);
        let entry = log.push(LogLevel::Error, "boom");
        assert_eq!(entry.level, LogLevel::Error);
        assert_eq!(entry.message, "boom");
    }
}
