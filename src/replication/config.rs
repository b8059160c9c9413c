//! Replication configuration and controller runtime settings.

use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{ReplicationError, Result};

use super::margin::MIN_TRADE_SIZE;

/// How a source trade size is mapped onto the target account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingMode {
    /// Largest size the target balance can safely margin, capped at the source size
    Auto,
    /// Fixed percentage of the target balance, independent of source size
    FixedRisk,
}

impl std::str::FromStr for ScalingMode {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "fixed" | "fixed_risk" | "fixedrisk" => Ok(Self::FixedRisk),
            other => Err(ReplicationError::InvalidConfig(format!(
                "unknown scaling mode '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for ScalingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScalingMode::Auto => f.write_str("auto"),
            ScalingMode::FixedRisk => f.write_str("fixed_risk"),
        }
    }
}

/// Configuration for scaling and risk control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Which scaling formula to use
    pub scaling_mode: ScalingMode,

    /// Percent of target balance staked per trade in FixedRisk mode
    pub risk_percentage: Decimal,

    /// Margin requirement of the traded asset, in percent of trade size
    pub asset_risk_percentage: Decimal,

    /// Absolute margin buffer added on top of the asset margin
    pub margin_buffer_absolute: Decimal,

    /// Hard ceiling on any replicated trade
    pub max_trade_size: Decimal,

    /// Replication stops when the target balance falls below this
    pub min_balance_threshold: Decimal,

    /// Daily loss limit as percent of target balance
    pub daily_loss_limit_percentage: Decimal,

    /// Hold scaled trades for manual approval
    pub require_approval: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            scaling_mode: ScalingMode::Auto,
            risk_percentage: dec!(2),
            asset_risk_percentage: dec!(5),
            margin_buffer_absolute: dec!(5),
            max_trade_size: dec!(1000),
            min_balance_threshold: dec!(50),
            daily_loss_limit_percentage: dec!(10),
            require_approval: true,
        }
    }
}

impl ReplicationConfig {
    /// Check every threshold is in range.
    pub fn validate(&self) -> Result<()> {
        let hundred = dec!(100);

        if self.risk_percentage <= Decimal::ZERO || self.risk_percentage > hundred {
            return Err(invalid("risk_percentage must be in (0, 100]"));
        }
        if self.asset_risk_percentage < Decimal::ZERO || self.asset_risk_percentage > hundred {
            return Err(invalid("asset_risk_percentage must be in [0, 100]"));
        }
        if self.margin_buffer_absolute < Decimal::ZERO {
            return Err(invalid("margin_buffer_absolute must not be negative"));
        }
        if self.max_trade_size < MIN_TRADE_SIZE {
            return Err(invalid(&format!(
                "max_trade_size must be at least {}",
                MIN_TRADE_SIZE
            )));
        }
        if self.min_balance_threshold < Decimal::ZERO {
            return Err(invalid("min_balance_threshold must not be negative"));
        }
        if self.daily_loss_limit_percentage <= Decimal::ZERO
            || self.daily_loss_limit_percentage > hundred
        {
            return Err(invalid("daily_loss_limit_percentage must be in (0, 100]"));
        }

        Ok(())
    }

    /// Return a copy with the update applied and validated.
    pub fn merged(&self, update: &ConfigUpdate) -> Result<Self> {
        let mut next = self.clone();

        if let Some(v) = update.scaling_mode {
            next.scaling_mode = v;
        }
        if let Some(v) = update.risk_percentage {
            next.risk_percentage = v;
        }
        if let Some(v) = update.asset_risk_percentage {
            next.asset_risk_percentage = v;
        }
        if let Some(v) = update.margin_buffer_absolute {
            next.margin_buffer_absolute = v;
        }
        if let Some(v) = update.max_trade_size {
            next.max_trade_size = v;
        }
        if let Some(v) = update.min_balance_threshold {
            next.min_balance_threshold = v;
        }
        if let Some(v) = update.daily_loss_limit_percentage {
            next.daily_loss_limit_percentage = v;
        }
        if let Some(v) = update.require_approval {
            next.require_approval = v;
        }

        next.validate()?;
        Ok(next)
    }
}

fn invalid(msg: &str) -> ReplicationError {
    ReplicationError::InvalidConfig(msg.to_string())
}

/// Partial configuration update; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigUpdate {
    pub scaling_mode: Option<ScalingMode>,
    pub risk_percentage: Option<Decimal>,
    pub asset_risk_percentage: Option<Decimal>,
    pub margin_buffer_absolute: Option<Decimal>,
    pub max_trade_size: Option<Decimal>,
    pub min_balance_threshold: Option<Decimal>,
    pub daily_loss_limit_percentage: Option<Decimal>,
    pub require_approval: Option<bool>,
}

impl ConfigUpdate {
    /// Build a single-field update from a `key value` pair.
    pub fn from_key_value(key: &str, value: &str) -> Result<Self> {
        let mut update = Self::default();
        let decimal = || {
            value
                .parse::<Decimal>()
                .map_err(|_| invalid(&format!("'{}' is not a number", value)))
        };

        match key {
            "scaling_mode" => update.scaling_mode = Some(value.parse()?),
            "risk_percentage" => update.risk_percentage = Some(decimal()?),
            "asset_risk_percentage" => update.asset_risk_percentage = Some(decimal()?),
            "margin_buffer_absolute" => update.margin_buffer_absolute = Some(decimal()?),
            "max_trade_size" => update.max_trade_size = Some(decimal()?),
            "min_balance_threshold" => update.min_balance_threshold = Some(decimal()?),
            "daily_loss_limit_percentage" => {
                update.daily_loss_limit_percentage = Some(decimal()?)
            }
            "require_approval" => {
                update.require_approval = Some(
                    value
                        .parse()
                        .map_err(|_| invalid(&format!("'{}' is not true/false", value)))?,
                )
            }
            other => return Err(invalid(&format!("unknown setting '{}'", other))),
        }

        Ok(update)
    }
}

/// Runtime settings for the controller task.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Upper bound on a single order placement call
    pub order_timeout: Duration,

    /// How often the target balance is refreshed from the broker
    pub balance_poll_interval: Duration,

    /// Capacity of the source event channel
    pub feed_channel_capacity: usize,

    /// Pending trades older than this are expired; `None` keeps them forever
    pub pending_ttl: Option<Duration>,

    /// Enabling requires an acknowledged confirmation
    pub require_enable_confirmation: bool,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            order_timeout: Duration::from_secs(10),
            balance_poll_interval: Duration::from_secs(30),
            feed_channel_capacity: 256,
            pending_ttl: None,
            require_enable_confirmation: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(ReplicationConfig::default().validate().is_ok());
    }

    #[test]
    fn test_merge_rejects_invalid_and_keeps_original() {
        let config = ReplicationConfig::default();
        let update = ConfigUpdate {
            max_trade_size: Some(dec!(300)),
            daily_loss_limit_percentage: Some(dec!(150)),
            ..Default::default()
        };

        let err = config.merged(&update).unwrap_err();
        assert!(matches!(err, ReplicationError::InvalidConfig(_)));
        assert_eq!(config.max_trade_size, dec!(1000));
    }

    #[test]
    fn test_merge_applies_fields() {
        let config = ReplicationConfig::default();
        let update = ConfigUpdate {
            scaling_mode: Some(ScalingMode::FixedRisk),
            risk_percentage: Some(dec!(3)),
            require_approval: Some(false),
            ..Default::default()
        };

        let next = config.merged(&update).unwrap();
        assert_eq!(next.scaling_mode, ScalingMode::FixedRisk);
        assert_eq!(next.risk_percentage, dec!(3));
        assert!(!next.require_approval);
        assert_eq!(next.max_trade_size, config.max_trade_size);
    }

    #[test]
    fn test_key_value_parsing() {
        let update = ConfigUpdate::from_key_value("scaling_mode", "fixed").unwrap();
        assert_eq!(update.scaling_mode, Some(ScalingMode::FixedRisk));

        let update = ConfigUpdate::from_key_value("max_trade_size", "200").unwrap();
        assert_eq!(update.max_trade_size, Some(dec!(200)));

        assert!(ConfigUpdate::from_key_value("max_trade_size", "lots").is_err());
        assert!(ConfigUpdate::from_key_value("leverage", "10").is_err());
    }

    #[test]
    fn test_deserialize_partial_json() {
        let config: ReplicationConfig =
            serde_json::from_str(r#"{"scaling_mode":"fixed_risk","max_trade_size":"250"}"#).unwrap();
        assert_eq!(config.scaling_mode, ScalingMode::FixedRisk);
        assert_eq!(config.max_trade_size, dec!(250));
        assert_eq!(config.min_balance_threshold, dec!(50));
    }
}
