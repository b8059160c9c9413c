//! Circuit breaker: daily loss accrual and minimum balance floor.
//!
//! A tripped breaker stays tripped until the operator re-enables replication
//! and both thresholds pass again. Accrual resets when the local calendar day
//! changes or on an explicit manual reset; neither re-enables replication.

use chrono::{DateTime, Local, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

use super::ReplicationConfig;

/// Why the breaker tripped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TripReason {
    /// Accrued loss reached the daily limit
    DailyLossLimit { accrued: Decimal, limit: Decimal },
    /// Target balance is below the configured floor
    MinBalance { balance: Decimal, threshold: Decimal },
}

impl std::fmt::Display for TripReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TripReason::DailyLossLimit { accrued, limit } => write!(
                f,
                "Daily loss limit reached: lost {:.2} of allowed {:.2}",
                accrued, limit
            ),
            TripReason::MinBalance { balance, threshold } => write!(
                f,
                "Balance below minimum threshold: {:.2} < {:.2}",
                balance, threshold
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    daily_loss_accrued: Decimal,
    last_reset_at: DateTime<Utc>,
    trading_day: NaiveDate,
    tripped: Option<TripReason>,
}

impl CircuitBreaker {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            daily_loss_accrued: Decimal::ZERO,
            last_reset_at: now,
            trading_day: local_day(now),
            tripped: None,
        }
    }

    /// Restore persisted accrual.
    pub fn restore(daily_loss_accrued: Decimal, last_reset_at: DateTime<Utc>) -> Self {
        Self {
            daily_loss_accrued: daily_loss_accrued.max(Decimal::ZERO),
            last_reset_at,
            trading_day: local_day(last_reset_at),
            tripped: None,
        }
    }

    pub fn daily_loss_accrued(&self) -> Decimal {
        self.daily_loss_accrued
    }

    pub fn last_reset_at(&self) -> DateTime<Utc> {
        self.last_reset_at
    }

    pub fn tripped(&self) -> Option<&TripReason> {
        self.tripped.as_ref()
    }

    /// Record a realized result; only losses accrue.
    pub fn record_result(&mut self, profit: Decimal) {
        if profit < Decimal::ZERO {
            self.daily_loss_accrued += profit.abs();
        }
    }

    /// Reset accrual if the local calendar day has changed. Returns true on reset.
    pub fn roll_day(&mut self, now: DateTime<Utc>) -> bool {
        let today = local_day(now);
        if today == self.trading_day {
            return false;
        }
        self.reset(now);
        true
    }

    /// Manually clear the accrued loss.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.daily_loss_accrued = Decimal::ZERO;
        self.last_reset_at = now;
        self.trading_day = local_day(now);
    }

    /// Daily loss allowance for the given balance.
    pub fn loss_limit(config: &ReplicationConfig, balance: Decimal) -> Decimal {
        balance * config.daily_loss_limit_percentage / dec!(100)
    }

    /// Check both thresholds without changing state.
    pub fn check(&self, config: &ReplicationConfig, balance: Decimal) -> Option<TripReason> {
        if balance < config.min_balance_threshold {
            return Some(TripReason::MinBalance {
                balance,
                threshold: config.min_balance_threshold,
            });
        }

        let limit = Self::loss_limit(config, balance);
        if self.daily_loss_accrued > Decimal::ZERO && self.daily_loss_accrued >= limit {
            return Some(TripReason::DailyLossLimit {
                accrued: self.daily_loss_accrued,
                limit,
            });
        }

        None
    }

    /// Evaluate thresholds and latch a trip. Returns the reason only when it
    /// newly tripped.
    pub fn evaluate(&mut self, config: &ReplicationConfig, balance: Decimal) -> Option<TripReason> {
        if self.tripped.is_some() {
            return None;
        }
        let reason = self.check(config, balance)?;
        self.tripped = Some(reason.clone());
        Some(reason)
    }

    /// Clear the latch if both thresholds pass.
    pub fn try_rearm(&mut self, config: &ReplicationConfig, balance: Decimal) -> Result<(), TripReason> {
        if let Some(reason) = self.check(config, balance) {
            return Err(reason);
        }
        self.tripped = None;
        Ok(())
    }
}

fn local_day(at: DateTime<Utc>) -> NaiveDate {
    at.with_timezone(&Local).date_naive()
}
