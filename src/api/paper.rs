//! In-memory broker for simulation and tests.
//!
//! Holds account balances, forwards published source trades to subscribers,
//! places orders by debiting the stake, and credits payouts on settlement.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::debug;

use crate::models::{Account, SourceTradeEvent};

use super::{
    BalanceProvider, OrderPlacement, OrderReceipt, OrderRequest, SourceEventFeed, Subscription,
};

/// An order the paper broker accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaperOrder {
    pub trade_id: String,
    pub request: OrderRequest,
    pub settled: bool,
}

#[derive(Default)]
struct PaperState {
    accounts: Vec<Account>,
    balances: HashMap<String, Decimal>,
    subscribers: HashMap<u64, (String, mpsc::Sender<SourceTradeEvent>)>,
    next_subscriber: u64,
    next_trade: u64,
    orders: Vec<PaperOrder>,
    reject_orders: Option<String>,
    order_latency: Option<Duration>,
}

/// Simulated broker shared between the feed, balance and order roles.
#[derive(Clone, Default)]
pub struct PaperBroker {
    state: Arc<Mutex<PaperState>>,
}

impl PaperBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register an account with its opening balance.
    pub fn add_account(&self, account: Account) {
        let mut state = self.state();
        state.balances.insert(account.id.clone(), account.balance);
        state.accounts.push(account);
    }

    /// Accounts with their current balances.
    pub fn list_accounts(&self) -> Vec<Account> {
        let state = self.state();
        state
            .accounts
            .iter()
            .map(|a| Account {
                balance: state.balances.get(&a.id).copied().unwrap_or(a.balance),
                ..a.clone()
            })
            .collect()
    }

    pub fn set_balance(&self, account_id: &str, balance: Decimal) {
        self.state().balances.insert(account_id.to_string(), balance);
    }

    pub fn balance(&self, account_id: &str) -> Option<Decimal> {
        self.state().balances.get(account_id).copied()
    }

    /// Make every following order fail with `reason`; `None` restores normal fills.
    pub fn reject_orders(&self, reason: Option<&str>) {
        self.state().reject_orders = reason.map(str::to_string);
    }

    /// Delay every order placement by `latency`.
    pub fn set_order_latency(&self, latency: Option<Duration>) {
        self.state().order_latency = latency;
    }

    pub fn orders(&self) -> Vec<PaperOrder> {
        self.state().orders.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state().subscribers.len()
    }

    /// Deliver a source trade to every subscriber of `account_id`.
    /// Returns how many subscribers received it.
    pub async fn publish(&self, account_id: &str, event: SourceTradeEvent) -> usize {
        let sinks: Vec<_> = self
            .state()
            .subscribers
            .values()
            .filter(|(acc, _)| acc == account_id)
            .map(|(_, tx)| tx.clone())
            .collect();

        let mut delivered = 0;
        for tx in sinks {
            if tx.send(event.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Settle a placed order: the stake plus `profit` is paid back, floored at zero.
    pub fn settle(&self, trade_id: &str, profit: Decimal) -> Result<()> {
        let mut state = self.state();
        let order = state
            .orders
            .iter_mut()
            .find(|o| o.trade_id == trade_id)
            .ok_or_else(|| anyhow!("Unknown paper trade {}", trade_id))?;

        if order.settled {
            bail!("Paper trade {} already settled", trade_id);
        }
        order.settled = true;

        let payout = (order.request.size + profit).max(Decimal::ZERO);
        let account_id = order.request.account_id.clone();
        *state.balances.entry(account_id).or_insert(Decimal::ZERO) += payout;

        Ok(())
    }
}

#[async_trait]
impl SourceEventFeed for PaperBroker {
    async fn subscribe(
        &self,
        account_id: &str,
        sink: mpsc::Sender<SourceTradeEvent>,
    ) -> Result<Subscription> {
        let id = {
            let mut state = self.state();
            let id = state.next_subscriber;
            state.next_subscriber += 1;
            state.subscribers.insert(id, (account_id.to_string(), sink));
            id
        };
        debug!(account = %account_id, subscriber = id, "Paper feed subscribed");

        let state = self.state.clone();
        Ok(Subscription::new(move || {
            state
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .subscribers
                .remove(&id);
        }))
    }
}

#[async_trait]
impl BalanceProvider for PaperBroker {
    async fn get_balance(&self, account_id: &str) -> Result<Decimal> {
        self.balance(account_id)
            .ok_or_else(|| anyhow!("Unknown paper account {}", account_id))
    }
}

#[async_trait]
impl OrderPlacement for PaperBroker {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderReceipt> {
        let latency = self.state().order_latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        if let Some(reason) = &state.reject_orders {
            bail!("{}", reason);
        }

        let balance = state
            .balances
            .get(&request.account_id)
            .copied()
            .ok_or_else(|| anyhow!("Unknown paper account {}", request.account_id))?;
        if balance < request.size {
            bail!("Insufficient balance: {} < {}", balance, request.size);
        }

        state.balances.insert(request.account_id.clone(), balance - request.size);
        state.next_trade += 1;
        let trade_id = format!("PAPER-{}", state.next_trade);
        state.orders.push(PaperOrder {
            trade_id: trade_id.clone(),
            request: request.clone(),
            settled: false,
        });

        Ok(OrderReceipt { trade_id })
    }
}
