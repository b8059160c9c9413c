//! Data models for accounts, replicated trades, and the replication log.

mod account;
mod log;
mod trade;

pub use account::{Account, AccountPair, BalanceSnapshot};
pub use log::{LogLevel, ReplicationLog, ReplicationLogEntry, LOG_CAPACITY};
pub use trade::{ExecutedTrade, PendingTrade, SourceTradeEvent, TradeOutcome};
