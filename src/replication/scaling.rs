//! Scaling policy: maps a source trade size onto the target account.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::margin::MIN_TRADE_SIZE;
use super::{ReplicationConfig, ScalingMode};

/// Calculator for target trade sizes.
#[derive(Debug, Clone)]
pub struct ScalingPolicy {
    config: ReplicationConfig,
}

impl ScalingPolicy {
    pub fn new(config: ReplicationConfig) -> Self {
        Self { config }
    }

    /// Calculate the target trade size.
    ///
    /// The mode-specific size is always clamped to `max_trade_size` last, so
    /// the configured ceiling wins regardless of mode.
    ///
    /// # Arguments
    /// * `source_size` - Stake of the trade on the source account
    /// * `target_balance` - Latest known balance of the target account
    pub fn scaled_size(&self, source_size: Decimal, target_balance: Decimal) -> Decimal {
        let sized = match self.config.scaling_mode {
            ScalingMode::Auto => self.auto_size(source_size, target_balance),
            ScalingMode::FixedRisk => self.fixed_risk_size(target_balance),
        };

        sized.min(self.config.max_trade_size)
    }

    /// Largest size the target balance can margin, never above the source size.
    ///
    /// max_possible = balance / (asset_risk / 100 + buffer / size)
    ///
    /// A quotient too large to represent means the balance margins any size.
    fn auto_size(&self, source_size: Decimal, target_balance: Decimal) -> Decimal {
        let effective = source_size.max(MIN_TRADE_SIZE);
        let denominator = self
            .config
            .margin_buffer_absolute
            .checked_div(effective)
            .and_then(|buffer_share| {
                (self.config.asset_risk_percentage / dec!(100)).checked_add(buffer_share)
            });

        // No margin requirement at all: the account is unconstrained
        let Some(denominator) = denominator.filter(|d| *d > Decimal::ZERO) else {
            return effective;
        };
        let Some(max_possible) = target_balance.checked_div(denominator) else {
            return effective;
        };

        let ratio = (max_possible / effective).min(Decimal::ONE);

        (effective * ratio).max(MIN_TRADE_SIZE)
    }

    /// Fixed percentage of the target balance.
    fn fixed_risk_size(&self, target_balance: Decimal) -> Decimal {
        target_balance
            .checked_mul(self.config.risk_percentage)
            .map_or(self.config.max_trade_size, |v| v / dec!(100))
            .max(Decimal::ZERO)
    }
}
