//! Margin model.
//!
//! required = max(size, MIN_TRADE_SIZE) * asset_risk_pct / 100 + buffer

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Floor applied to trade sizes so margin is never computed on a degenerate size.
pub const MIN_TRADE_SIZE: Decimal = dec!(1);

/// Margin the target account must hold to place a trade of `trade_size`.
///
/// Saturates at `Decimal::MAX`, which no balance can cover.
pub fn required_margin(trade_size: Decimal, asset_risk_pct: Decimal, margin_buffer: Decimal) -> Decimal {
    trade_size
        .max(MIN_TRADE_SIZE)
        .checked_mul(asset_risk_pct)
        .and_then(|v| (v / dec!(100)).checked_add(margin_buffer))
        .unwrap_or(Decimal::MAX)
}

/// Whether `balance` covers the required margin for `trade_size`.
pub fn has_sufficient_margin(
    balance: Decimal,
    trade_size: Decimal,
    asset_risk_pct: Decimal,
    margin_buffer: Decimal,
) -> bool {
    balance >= required_margin(trade_size, asset_risk_pct, margin_buffer)
}
