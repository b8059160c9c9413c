//! Error types for the replication engine.

use rust_decimal::Decimal;
use thiserror::Error;

/// Result type alias using [`ReplicationError`].
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors returned by controller operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    /// A configuration value is out of range; the config is left unchanged
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A loss or balance threshold blocks replication
    #[error("Threshold breached: {0}")]
    ThresholdBreached(String),

    /// The target balance has not been fetched yet
    #[error("Account balances are not known yet")]
    AccountsUnknown,

    /// Enabling needs an acknowledged confirmation
    #[error("Replication requires confirmation before it can be enabled")]
    ConfirmationRequired,

    #[error("Replication is already enabled")]
    AlreadyEnabled,

    #[error("No pending trade with id {0}")]
    PendingTradeNotFound(String),

    #[error("No executed trade with id {0}")]
    ExecutedTradeNotFound(String),

    /// The margin check failed for an approved trade
    #[error("Insufficient margin: balance {balance} below required {required}")]
    InsufficientMargin { balance: Decimal, required: Decimal },

    /// Order placement failed or timed out
    #[error("Execution failed: {0}")]
    Execution(String),

    /// The balance provider could not be reached
    #[error("Balance unavailable: {0}")]
    BalanceUnavailable(String),

    /// Subscribing to the source feed failed
    #[error("Source feed error: {0}")]
    Feed(String),

    /// The controller task has shut down
    #[error("Replication controller is not running")]
    ControllerStopped,
}
