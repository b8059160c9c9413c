//! Operator-facing reporting: log ring buffer, notifications and status lines.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::api::NotificationSink;
use crate::models::{LogLevel, ReplicationLog, ReplicationLogEntry};

/// Status of one of the two health indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Inactive,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusLine {
    pub status: CheckStatus,
    pub message: String,
}

impl StatusLine {
    pub fn new(status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

pub struct Reporter {
    log: ReplicationLog,
    notifier: Arc<dyn NotificationSink>,
    unflushed: Vec<ReplicationLogEntry>,
    margin_check: StatusLine,
    circuit_breaker: StatusLine,
}

impl Reporter {
    pub fn new(notifier: Arc<dyn NotificationSink>) -> Self {
        Self {
            log: ReplicationLog::default(),
            notifier,
            unflushed: Vec::new(),
            margin_check: StatusLine::new(CheckStatus::Inactive, "Waiting for trade..."),
            circuit_breaker: StatusLine::new(CheckStatus::Inactive, "System ready"),
        }
    }

    /// Append a log entry, mirror it to tracing and notify the operator.
    pub fn record(&mut self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info | LogLevel::Success => info!(level = %level, "{}", message),
            LogLevel::Warning => warn!("{}", message),
            LogLevel::Error => error!("{}", message),
        }

        self.notifier.notify(&message, level);
        let entry = self.log.push(level, message).clone();
        self.unflushed.push(entry);
    }

    pub fn log(&self) -> &ReplicationLog {
        &self.log
    }

    /// Entries recorded since the last call, for the journal.
    pub fn take_unflushed(&mut self) -> Vec<ReplicationLogEntry> {
        std::mem::take(&mut self.unflushed)
    }

    pub fn set_margin_check(&mut self, status: CheckStatus, message: impl Into<String>) {
        self.margin_check = StatusLine::new(status, message);
    }

    pub fn set_circuit_breaker(&mut self, status: CheckStatus, message: impl Into<String>) {
        self.circuit_breaker = StatusLine::new(status, message);
    }

    pub fn margin_check(&self) -> &StatusLine {
        &self.margin_check
    }

    pub fn circuit_breaker(&self) -> &StatusLine {
        &self.circuit_breaker
    }
}
