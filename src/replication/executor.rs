//! Execution adapter: places a scaled trade on the target account.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::time::timeout;
use tracing::debug;

use crate::api::{OrderPlacement, OrderRequest};
use crate::error::{ReplicationError, Result};
use crate::models::{BalanceSnapshot, ExecutedTrade, LogLevel, SourceTradeEvent};

use super::reporter::Reporter;

pub struct ExecutionAdapter {
    orders: Arc<dyn OrderPlacement>,
    target_account: String,
    timeout: Duration,
}

impl ExecutionAdapter {
    pub fn new(orders: Arc<dyn OrderPlacement>, target_account: String, timeout: Duration) -> Self {
        Self {
            orders,
            target_account,
            timeout,
        }
    }

    /// Place the order, bounded by the timeout.
    ///
    /// On success the target balance is debited by `scaled_size` until the next
    /// balance sync. On failure nothing is mutated. There is no retry: a failed
    /// replication is final for its source trade.
    pub async fn execute(
        &self,
        event: &SourceTradeEvent,
        scaled_size: Decimal,
        balance: &mut BalanceSnapshot,
        reporter: &mut Reporter,
    ) -> Result<ExecutedTrade> {
        let request = OrderRequest {
            account_id: self.target_account.clone(),
            contract_type: event.contract_type.clone(),
            symbol: event.symbol.clone(),
            size: scaled_size,
        };

        debug!(
            source_trade = %event.trade_id,
            size = %scaled_size,
            timeout_ms = self.timeout.as_millis() as u64,
            "Placing replicated order"
        );

        let outcome = match timeout(self.timeout, self.orders.place_order(&request)).await {
            Ok(Ok(receipt)) => Ok(receipt),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("order timed out after {}s", self.timeout.as_secs_f64())),
        };

        match outcome {
            Ok(receipt) => {
                balance.apply_local_debit(scaled_size);

                debug!(
                    source_trade = %event.trade_id,
                    target_trade = %receipt.trade_id,
                    "Order accepted"
                );
                reporter.record(
                    LogLevel::Success,
                    format!(
                        "Replicated {} {} on {}: stake {:.2} (trade {})",
                        event.contract_type,
                        event.symbol,
                        self.target_account,
                        scaled_size,
                        receipt.trade_id
                    ),
                );

                Ok(ExecutedTrade::new(
                    event.trade_id.clone(),
                    receipt.trade_id,
                    scaled_size,
                ))
            }
            Err(reason) => {
                reporter.record(
                    LogLevel::Error,
                    format!("Trade execution failed for {}: {}", event.trade_id, reason),
                );
                Err(ReplicationError::Execution(reason))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{NullNotifier, PaperBroker};
    use crate::models::Account;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn setup() -> (PaperBroker, Reporter) {
        let broker = PaperBroker::new();
        broker.add_account(Account {
            id: "CR1".to_string(),
            is_virtual: false,
            currency: "USD".to_string(),
            balance: dec!(100),
        });
        (broker, Reporter::new(Arc::new(NullNotifier)))
    }

    fn event() -> SourceTradeEvent {
        SourceTradeEvent {
            trade_id: "demo-7".to_string(),
            symbol: "R_100".to_string(),
            contract_type: "CALL".to_string(),
            source_size: dec!(25),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_success_debits_local_balance() {
        let (broker, mut reporter) = setup();
        let adapter = ExecutionAdapter::new(Arc::new(broker.clone()), "CR1".to_string(), Duration::from_secs(1));
        let mut balance = BalanceSnapshot::unknown();
        balance.sync(dec!(100));

        let trade = adapter.execute(&event(), dec!(20), &mut balance, &mut reporter).await.unwrap();

        assert_eq!(trade.source_trade_id, "demo-7");
        assert_eq!(trade.target_trade_id, "PAPER-1");
        assert_eq!(balance.balance, dec!(80));
        assert!(balance.optimistic);
        assert_eq!(reporter.log().entries().last().map(|e| e.level), Some(LogLevel::Success));
    }

    #[tokio::test]
    async fn test_failure_leaves_balance() {
        let (broker, mut reporter) = setup();
        broker.reject_orders(Some("Trading is disabled"));
        let adapter = ExecutionAdapter::new(Arc::new(broker), "CR1".to_string(), Duration::from_secs(1));
        let mut balance = BalanceSnapshot::unknown();
        balance.sync(dec!(100));

        let err = adapter.execute(&event(), dec!(20), &mut balance, &mut reporter).await.unwrap_err();

        assert!(matches!(err, ReplicationError::Execution(_)));
        assert_eq!(balance.balance, dec!(100));
        assert_eq!(balance.version, 1);
        assert_eq!(reporter.log().entries().last().map(|e| e.level), Some(LogLevel::Error));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_failure() {
        let (broker, mut reporter) = setup();
        broker.set_order_latency(Some(Duration::from_secs(60)));
        let adapter = ExecutionAdapter::new(Arc::new(broker), "CR1".to_string(), Duration::from_secs(5));
        let mut balance = BalanceSnapshot::unknown();
        balance.sync(dec!(100));

        let err = adapter.execute(&event(), dec!(20), &mut balance, &mut reporter).await.unwrap_err();

        assert!(matches!(err, ReplicationError::Execution(ref msg) if msg.contains("timed out")));
        assert_eq!(balance.balance, dec!(100));
    }
}
