//! Collaborator interfaces the replication engine consumes.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::models::{LogLevel, SourceTradeEvent};

/// Handle returned by [`SourceEventFeed::subscribe`]. Delivery stops when it
/// is unsubscribed or dropped.
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

/// Trades executed on the source account.
///
/// Implementations deliver each trade exactly once per subscriber, in the
/// order the trades occurred.
#[async_trait]
pub trait SourceEventFeed: Send + Sync {
    /// Start forwarding trades of `account_id` into `sink`.
    async fn subscribe(
        &self,
        account_id: &str,
        sink: mpsc::Sender<SourceTradeEvent>,
    ) -> Result<Subscription>;
}

/// Authoritative account balances.
#[async_trait]
pub trait BalanceProvider: Send + Sync {
    async fn get_balance(&self, account_id: &str) -> Result<Decimal>;
}

/// Order request against the target account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderRequest {
    pub account_id: String,
    pub contract_type: String,
    pub symbol: String,
    pub size: Decimal,
}

/// Broker acknowledgement of a placed order.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OrderReceipt {
    pub trade_id: String,
}

#[async_trait]
pub trait OrderPlacement: Send + Sync {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderReceipt>;
}

/// Operator-facing notifications. Fire-and-forget.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, message: &str, severity: LogLevel);
}

/// Source of the current time, for day boundaries and pending-trade expiry.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_subscription_unsubscribes_once() {
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let sub = Subscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        sub.unsubscribe();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let counter = calls.clone();
        {
            let _sub = Subscription::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
