//! Request and response types for the broker gateway HTTP API.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Entry of `GET /accounts`.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountResponse {
    pub loginid: String,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub balance: Decimal,
    pub is_virtual: bool,
}

/// Response of `GET /accounts/{id}/balance`.
#[derive(Debug, Clone, Deserialize)]
pub struct BalanceResponse {
    pub balance: Decimal,
    #[serde(default)]
    pub currency: String,
}

/// Entry of `GET /accounts/{id}/trades`, newest first.
#[derive(Debug, Clone, Deserialize)]
pub struct TradeResponse {
    pub transaction_id: String,
    pub symbol: String,
    pub contract_type: String,
    pub buy_price: Decimal,
    /// Unix seconds
    pub purchase_time: i64,
}

/// Body of `POST /accounts/{id}/orders`.
#[derive(Debug, Clone, Serialize)]
pub struct BuyRequest<'a> {
    pub contract_type: &'a str,
    pub symbol: &'a str,
    pub amount: Decimal,
}

/// Response of `POST /accounts/{id}/orders`.
#[derive(Debug, Clone, Deserialize)]
pub struct BuyResponse {
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub error: Option<ApiError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: String,
    pub message: String,
}

/// Entry of `GET /accounts/{id}/settlements`.
#[derive(Debug, Clone, Deserialize)]
pub struct SettlementResponse {
    pub transaction_id: String,
    pub profit: Decimal,
}
