//! Broker gateway client: JSON over HTTP with bearer-token auth.
//!
//! Serves every external role the engine needs:
//! - account discovery and balances (reads retried with exponential backoff)
//! - order placement on the target account (never retried)
//! - a polling feed of trades executed on the source account
//! - settlement results of replicated trades

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::models::{Account, SourceTradeEvent};

use super::types::*;
use super::{
    BalanceProvider, OrderPlacement, OrderReceipt, OrderRequest, SourceEventFeed, Subscription,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const READ_RETRY_WINDOW: Duration = Duration::from_secs(10);
const TRADE_PAGE_SIZE: u32 = 50;
const MAX_CATCHUP_PAGES: u32 = 20;

/// HTTP client for the broker gateway.
pub struct GatewayClient {
    client: Client,
    base_url: String,
    api_token: String,
}

impl GatewayClient {
    pub fn new(base_url: impl Into<String>, api_token: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token: api_token.into(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        debug!(url = %url, "GET");

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Request to {} failed: {} - {}", url, status, body);
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {}", url))
    }

    /// GET with exponential backoff. Only idempotent reads go through here.
    async fn get_json_with_retry<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let policy = ExponentialBackoffBuilder::new()
            .with_max_elapsed_time(Some(READ_RETRY_WINDOW))
            .build();

        backoff::future::retry(policy, move || async move {
            self.get_json(url).await.map_err(|e| {
                warn!(url = %url, error = %e, "Gateway read failed, retrying");
                backoff::Error::transient(e)
            })
        })
        .await
    }

    /// All accounts of the logged-in client.
    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        let url = format!("{}/accounts", self.base_url);
        let items: Vec<AccountResponse> = self.get_json_with_retry(&url).await?;

        Ok(items
            .into_iter()
            .map(|a| Account {
                id: a.loginid,
                is_virtual: a.is_virtual,
                currency: a.currency,
                balance: a.balance,
            })
            .collect())
    }

    /// Recent trades of an account, newest first, skipping the newest `offset`.
    pub async fn get_trades(
        &self,
        account_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<SourceTradeEvent>> {
        let url = format!(
            "{}/accounts/{}/trades?limit={}&offset={}",
            self.base_url,
            account_id,
            limit.min(500),
            offset
        );
        let items: Vec<TradeResponse> = self.get_json(&url).await?;

        Ok(items
            .into_iter()
            .filter_map(|t| {
                let timestamp = Utc.timestamp_opt(t.purchase_time, 0).single()?;
                Some(SourceTradeEvent {
                    trade_id: t.transaction_id,
                    symbol: t.symbol,
                    contract_type: t.contract_type,
                    source_size: t.buy_price,
                    timestamp,
                })
            })
            .collect())
    }

    /// Settled results of trades placed on an account.
    pub async fn get_settlements(&self, account_id: &str) -> Result<Vec<SettlementResponse>> {
        let url = format!("{}/accounts/{}/settlements", self.base_url, account_id);
        self.get_json(&url).await
    }
}

#[async_trait]
impl BalanceProvider for GatewayClient {
    async fn get_balance(&self, account_id: &str) -> Result<Decimal> {
        let url = format!("{}/accounts/{}/balance", self.base_url, account_id);
        let response: BalanceResponse = self.get_json_with_retry(&url).await?;
        Ok(response.balance)
    }
}

#[async_trait]
impl OrderPlacement for GatewayClient {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderReceipt> {
        let url = format!("{}/accounts/{}/orders", self.base_url, request.account_id);
        let body = BuyRequest {
            contract_type: &request.contract_type,
            symbol: &request.symbol,
            amount: request.size,
        };

        debug!(url = %url, size = %request.size, "Placing order");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await
            .context("Failed to send order")?;

        let status = response.status();
        let result: BuyResponse = response
            .json()
            .await
            .with_context(|| format!("Failed to parse order response ({})", status))?;

        if let Some(err) = result.error {
            anyhow::bail!("Order rejected: {} ({})", err.message, err.code);
        }
        if !status.is_success() {
            anyhow::bail!("Order request failed: {}", status);
        }

        let trade_id = result
            .transaction_id
            .context("Order response missing transaction_id")?;
        Ok(OrderReceipt { trade_id })
    }
}

/// Source feed that polls the gateway for new trades.
///
/// The newest trade seen at subscription time is the baseline; only trades
/// after it are delivered, oldest first.
pub struct GatewayFeed {
    client: Arc<GatewayClient>,
    poll_interval: Duration,
}

impl GatewayFeed {
    pub fn new(client: Arc<GatewayClient>, poll_interval: Duration) -> Self {
        Self {
            client,
            poll_interval,
        }
    }
}

#[async_trait]
impl SourceEventFeed for GatewayFeed {
    async fn subscribe(
        &self,
        account_id: &str,
        sink: mpsc::Sender<SourceTradeEvent>,
    ) -> Result<Subscription> {
        let baseline = self.client.get_trades(account_id, 1, 0).await?;
        let mut last_seen = baseline.first().map(|t| t.trade_id.clone());

        let client = self.client.clone();
        let account_id = account_id.to_string();
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(account = %account_id, baseline = ?last_seen, "Polling source trades");

        let task = tokio::spawn(async move {
            loop {
                ticker.tick().await;

                let fetch = |offset| client.get_trades(&account_id, TRADE_PAGE_SIZE, offset);
                let catchup = match collect_new_trades(
                    last_seen.as_deref(),
                    TRADE_PAGE_SIZE,
                    MAX_CATCHUP_PAGES,
                    fetch,
                )
                .await
                {
                    Ok(catchup) => catchup,
                    Err(e) => {
                        warn!(account = %account_id, error = %e, "Failed to poll source trades");
                        continue;
                    }
                };

                if catchup.gap {
                    warn!(
                        account = %account_id,
                        last_seen = ?last_seen,
                        delivered = catchup.trades.len(),
                        "Last seen trade not found in recent history, older trades may be missed"
                    );
                }

                let new_trades = catchup.trades;
                if let Some(newest) = new_trades.last() {
                    last_seen = Some(newest.trade_id.clone());
                }

                for trade in new_trades {
                    if sink.send(trade).await.is_err() {
                        debug!(account = %account_id, "Feed receiver dropped");
                        return;
                    }
                }
            }
        });

        Ok(Subscription::new(move || task.abort()))
    }
}

/// Trades newer than the last delivered one, oldest first.
struct Catchup {
    trades: Vec<SourceTradeEvent>,
    /// The last delivered trade was not found within the scanned pages
    gap: bool,
}

/// Page back through the newest-first history until `last_seen` shows up,
/// the history runs out, or `max_pages` pages were read.
async fn collect_new_trades<F, Fut>(
    last_seen: Option<&str>,
    page_size: u32,
    max_pages: u32,
    mut fetch_page: F,
) -> Result<Catchup>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Vec<SourceTradeEvent>>>,
{
    let mut trades = Vec::new();
    let mut ids = HashSet::new();

    for page in 0..max_pages {
        let batch = fetch_page(page * page_size).await?;
        if batch.is_empty() {
            // History exhausted; only a gap if the last trade vanished from it
            trades.reverse();
            return Ok(Catchup {
                trades,
                gap: last_seen.is_some(),
            });
        }

        for trade in batch {
            if Some(trade.trade_id.as_str()) == last_seen {
                trades.reverse();
                return Ok(Catchup { trades, gap: false });
            }
            // Pages shift when trades land mid-scan
            if ids.insert(trade.trade_id.clone()) {
                trades.push(trade);
            }
        }
    }

    trades.reverse();
    Ok(Catchup { trades, gap: true })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    /// History of `count` trades, newest first: t{count} .. t1.
    fn history(count: u32) -> Vec<SourceTradeEvent> {
        (1..=count)
            .rev()
            .map(|n| SourceTradeEvent {
                trade_id: format!("t{}", n),
                symbol: "R_100".to_string(),
                contract_type: "CALL".to_string(),
                source_size: dec!(10),
                timestamp: Utc::now(),
            })
            .collect()
    }

    fn pages(
        history: &[SourceTradeEvent],
        page_size: u32,
    ) -> impl FnMut(u32) -> std::future::Ready<Result<Vec<SourceTradeEvent>>> + '_ {
        move |offset| {
            let page = history
                .iter()
                .skip(offset as usize)
                .take(page_size as usize)
                .cloned()
                .collect();
            std::future::ready(Ok(page))
        }
    }

    fn ids(catchup: &Catchup) -> Vec<String> {
        catchup.trades.iter().map(|t| t.trade_id.clone()).collect()
    }

    #[tokio::test]
    async fn test_catchup_pages_back_to_last_seen() {
        let history = history(120);

        let catchup = collect_new_trades(Some("t10"), 50, 20, pages(&history, 50))
            .await
            .unwrap();

        assert!(!catchup.gap);
        assert_eq!(catchup.trades.len(), 110);
        assert_eq!(catchup.trades[0].trade_id, "t11");
        assert_eq!(catchup.trades[109].trade_id, "t120");
    }

    #[tokio::test]
    async fn test_catchup_within_first_page() {
        let history = history(30);

        let catchup = collect_new_trades(Some("t28"), 50, 20, pages(&history, 50))
            .await
            .unwrap();

        assert!(!catchup.gap);
        assert_eq!(ids(&catchup), vec!["t29", "t30"]);
    }

    #[tokio::test]
    async fn test_catchup_reports_unclosed_gap() {
        let history = history(100);

        let catchup = collect_new_trades(Some("t1"), 10, 3, pages(&history, 10))
            .await
            .unwrap();

        assert!(catchup.gap);
        assert_eq!(catchup.trades.len(), 30);
        assert_eq!(catchup.trades[0].trade_id, "t71");
        assert_eq!(catchup.trades[29].trade_id, "t100");
    }

    #[tokio::test]
    async fn test_catchup_without_baseline_takes_history() {
        let history = history(3);

        let catchup = collect_new_trades(None, 2, 20, pages(&history, 2)).await.unwrap();

        assert!(!catchup.gap);
        assert_eq!(ids(&catchup), vec!["t1", "t2", "t3"]);
    }

    #[test]
    fn test_base_url_normalised() {
        let client = GatewayClient::new("https://gateway.example.com/", "token").unwrap();
        assert_eq!(client.base_url, "https://gateway.example.com");
    }

    #[test]
    fn test_trade_response_parses() {
        let body = r#"[{"transaction_id":"123","symbol":"R_100","contract_type":"CALL","buy_price":"10.5","purchase_time":1700000000}]"#;
        let items: Vec<TradeResponse> = serde_json::from_str(body).unwrap();
        assert_eq!(items[0].transaction_id, "123");
        assert_eq!(items[0].buy_price, Decimal::new(105, 1));
    }

    #[test]
    fn test_buy_error_parses() {
        let body = r#"{"error":{"code":"InsufficientBalance","message":"Your account balance is insufficient"}}"#;
        let response: BuyResponse = serde_json::from_str(body).unwrap();
        assert!(response.transaction_id.is_none());
        assert_eq!(response.error.map(|e| e.code), Some("InsufficientBalance".to_string()));
    }
}
