//! Notification sinks.

use chrono::Local;

use crate::models::LogLevel;

use super::NotificationSink;

/// Prints notifications to the operator's terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleNotifier;

impl NotificationSink for ConsoleNotifier {
    fn notify(&self, message: &str, severity: LogLevel) {
        let tag = match severity {
            LogLevel::Info => "INFO",
            LogLevel::Success => " OK ",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "FAIL",
        };
        println!("[{}] [{}] {}", Local::now().format("%H:%M:%S"), tag, message);
    }
}

/// Discards notifications.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

impl NotificationSink for NullNotifier {
    fn notify(&self, _message: &str, _severity: LogLevel) {}
}
