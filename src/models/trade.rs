//! Trade models: observed source trades, trades awaiting approval, and
//! trades replicated into the target account.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// A trade observed on the source (demo) account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTradeEvent {
    /// Broker trade/contract id on the source account
    pub trade_id: String,

    /// Underlying symbol (e.g. "R_100")
    pub symbol: String,

    /// Contract type (e.g. "CALL", "PUT")
    pub contract_type: String,

    /// Stake of the source trade
    pub source_size: Decimal,

    /// When the trade happened on the source account
    pub timestamp: DateTime<Utc>,
}

/// A scaled trade held until a human approves or rejects it.
#[derive(Debug, Clone, Serialize)]
pub struct PendingTrade {
    pub source_trade_id: String,
    pub scaled_size: Decimal,
    pub required_margin: Decimal,
    pub queued_at: DateTime<Utc>,

    /// Source trade the approval will replicate
    pub event: SourceTradeEvent,

    /// Share of the target balance this trade stakes, in percent
    pub risk_percentage: Decimal,
}

impl PendingTrade {
    pub fn new(
        event: SourceTradeEvent,
        scaled_size: Decimal,
        required_margin: Decimal,
        target_balance: Decimal,
    ) -> Self {
        let risk_percentage = if target_balance > Decimal::ZERO {
            (scaled_size / target_balance * dec!(100)).round_dp(2)
        } else {
            Decimal::ZERO
        };

        Self {
            source_trade_id: event.trade_id.clone(),
            scaled_size,
            required_margin,
            queued_at: Utc::now(),
            event,
            risk_percentage,
        }
    }
}

/// A trade successfully placed on the target account.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutedTrade {
    pub source_trade_id: String,
    pub target_trade_id: String,
    pub scaled_size: Decimal,
    pub executed_at: DateTime<Utc>,
    result_profit: Option<Decimal>,
}

impl ExecutedTrade {
    pub fn new(source_trade_id: String, target_trade_id: String, scaled_size: Decimal) -> Self {
        Self {
            source_trade_id,
            target_trade_id,
            scaled_size,
            executed_at: Utc::now(),
            result_profit: None,
        }
    }

    pub fn result_profit(&self) -> Option<Decimal> {
        self.result_profit
    }

    /// Attach the realized profit. Returns false if one was already attached.
    pub fn settle(&mut self, profit: Decimal) -> bool {
        if self.result_profit.is_some() {
            return false;
        }
        self.result_profit = Some(profit);
        true
    }

    pub fn is_settled(&self) -> bool {
        self.result_profit.is_some()
    }
}

/// Final outcome recorded for a source trade id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeOutcome {
    /// Waiting in the approval queue
    Pending,
    /// Placed on the target account
    Executed,
    /// Rejected by the operator
    Rejected,
    /// Discarded because replication was disabled while pending
    Cancelled,
    /// Dropped before execution (insufficient margin, breaker tripped)
    Dropped,
    /// Order placement failed or timed out
    Failed,
    /// Pending for longer than the configured TTL
    Expired,
}

impl TradeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeOutcome::Pending => "pending",
            TradeOutcome::Executed => "executed",
            TradeOutcome::Rejected => "rejected",
            TradeOutcome::Cancelled => "cancelled",
            TradeOutcome::Dropped => "dropped",
            TradeOutcome::Failed => "failed",
            TradeOutcome::Expired => "expired",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> SourceTradeEvent {
        SourceTradeEvent {
            trade_id: "demo-1".to_string(),
            symbol: "R_100".to_string(),
            contract_type: "CALL".to_string(),
            source_size: dec!(50),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_pending_risk_percentage() {
        let pending = PendingTrade::new(event(), dec!(20), dec!(6), dec!(1000));
        assert_eq!(pending.source_trade_id, "demo-1");
        assert_eq!(pending.risk_percentage, dec!(2));

        let broke = PendingTrade::new(event(), dec!(20), dec!(6), Decimal::ZERO);
        assert_eq!(broke.risk_percentage, Decimal::ZERO);
    }

    #[test]
    fn test_settle_once() {
        let mut trade = ExecutedTrade::new("demo-1".to_string(), "real-9".to_string(), dec!(20));
        assert!(!trade.is_settled());
        assert!(trade.settle(dec!(-20)));
        assert!(!trade.settle(dec!(15)));
        assert_eq!(trade.result_profit(), Some(dec!(-20)));
    }
}
