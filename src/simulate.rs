//! Offline simulation: replay a list of source trades through the full
//! replication pipeline against the paper broker.
//!
//! Each trade may carry a settlement profit, applied right after it executes,
//! and an approval decision used when the config requires approval.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::api::{NullNotifier, PaperBroker, SystemClock};
use crate::db::Database;
use crate::models::{Account, AccountPair, SourceTradeEvent};
use crate::replication::{
    ControllerSettings, ReplicationConfig, ReplicationController, ReplicationDeps,
    ReplicationHandle, ReplicationState,
};

const SOURCE_ACCOUNT: &str = "VRTC-SIM";
const TARGET_ACCOUNT: &str = "CR-SIM";
const DECISION_POLL: Duration = Duration::from_millis(2);
const DECISION_ATTEMPTS: usize = 5000;

/// One source trade in a simulation file.
#[derive(Debug, Clone, Deserialize)]
pub struct SimulatedTrade {
    pub trade_id: String,
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_contract_type")]
    pub contract_type: String,
    pub size: Decimal,
    /// Realized result once the replicated trade settles
    #[serde(default)]
    pub profit: Option<Decimal>,
    /// Operator decision when approval is required; approves when absent
    #[serde(default)]
    pub approve: Option<bool>,
}

fn default_symbol() -> String {
    "R_100".to_string()
}

fn default_contract_type() -> String {
    "CALL".to_string()
}

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub source_balance: Decimal,
    pub target_balance: Decimal,
    pub replication: ReplicationConfig,
    pub settings: ControllerSettings,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            source_balance: dec!(10000),
            target_balance: dec!(1000),
            replication: ReplicationConfig::default(),
            settings: ControllerSettings {
                require_enable_confirmation: false,
                ..Default::default()
            },
        }
    }
}

/// Simulation results summary.
#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub initial_balance: Decimal,
    pub final_balance: Decimal,
    /// Trades published while replication was disabled
    pub undelivered: usize,
    /// Trade count per recorded outcome
    pub outcomes: Vec<(String, i64)>,
    pub state: ReplicationState,
}

impl std::fmt::Display for SimulationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n{:=^60}", " SIMULATION RESULTS ")?;
        writeln!(f)?;
        writeln!(f, "--- Target Account ---")?;
        writeln!(f, "Initial:       ${:.2}", self.initial_balance)?;
        writeln!(f, "Final:         ${:.2}", self.final_balance)?;
        writeln!(f, "Realized P/L:  ${:.2}", self.state.realized_pnl)?;
        writeln!(f, "Daily Loss:    ${:.2}", self.state.daily_loss_accrued)?;
        writeln!(f)?;
        writeln!(f, "--- Trades ---")?;
        for (status, count) in &self.outcomes {
            writeln!(f, "{:<14} {}", format!("{}:", status), count)?;
        }
        writeln!(f, "{:<14} {}", "undelivered:", self.undelivered)?;
        writeln!(f)?;
        writeln!(f, "--- Status ---")?;
        writeln!(f, "Replication:   {}", if self.state.enabled { "enabled" } else { "disabled" })?;
        writeln!(f, "Margin Check:  {}", self.state.margin_check.message)?;
        writeln!(f, "Breaker:       {}", self.state.circuit_breaker.message)?;
        writeln!(f)?;
        writeln!(f, "--- Log ---")?;
        for entry in &self.state.logs {
            writeln!(
                f,
                "[{}] {:<7} {}",
                entry.timestamp.format("%H:%M:%S"),
                entry.level,
                entry.message
            )?;
        }
        writeln!(f, "{:=^60}", "")?;
        Ok(())
    }
}

/// Load simulated trades from a JSON array.
pub fn load_trades(path: &Path) -> Result<Vec<SimulatedTrade>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

pub struct Simulator {
    config: SimulationConfig,
}

impl Simulator {
    pub fn new(config: SimulationConfig) -> Self {
        Self { config }
    }

    pub async fn run(&self, trades: &[SimulatedTrade]) -> Result<SimulationReport> {
        let broker = PaperBroker::new();
        broker.add_account(Account {
            id: SOURCE_ACCOUNT.to_string(),
            is_virtual: true,
            currency: "USD".to_string(),
            balance: self.config.source_balance,
        });
        broker.add_account(Account {
            id: TARGET_ACCOUNT.to_string(),
            is_virtual: false,
            currency: "USD".to_string(),
            balance: self.config.target_balance,
        });

        let journal = Database::new("sqlite::memory:").await?;
        let accounts = AccountPair::resolve(&broker.list_accounts())?;
        let deps = ReplicationDeps {
            feed: Arc::new(broker.clone()),
            balances: Arc::new(broker.clone()),
            orders: Arc::new(broker.clone()),
            notifier: Arc::new(NullNotifier),
            clock: Arc::new(SystemClock),
        };

        let (handle, task) = ReplicationController::new(
            accounts,
            self.config.replication.clone(),
            self.config.settings.clone(),
            deps,
        )?
        .with_journal(journal.clone())
        .spawn();

        if let Err(e) = handle.enable(true).await {
            warn!(error = %e, "Replication could not be enabled");
        }

        info!(count = trades.len(), "Replaying source trades");

        let mut undelivered = 0;
        let mut replayed = HashSet::new();
        for trade in trades {
            let event = SourceTradeEvent {
                trade_id: trade.trade_id.clone(),
                symbol: trade.symbol.clone(),
                contract_type: trade.contract_type.clone(),
                source_size: trade.size,
                timestamp: Utc::now(),
            };

            if broker.publish(SOURCE_ACCOUNT, event).await == 0 {
                debug!(trade_id = %trade.trade_id, "Replication disabled, trade not delivered");
                undelivered += 1;
                continue;
            }

            // Repeated ids are still published so the controller can ignore them
            if !replayed.insert(trade.trade_id.clone()) {
                continue;
            }
            self.resolve(&handle, &broker, &journal, trade).await?;
        }

        let state = handle.get_state().await?;
        let outcomes = journal.outcome_counts().await?;
        let final_balance = broker.balance(TARGET_ACCOUNT).unwrap_or_default();

        handle.shutdown().await?;
        task.await.context("Replication controller panicked")?;

        Ok(SimulationReport {
            initial_balance: self.config.target_balance,
            final_balance,
            undelivered,
            outcomes,
            state,
        })
    }

    /// Wait for the controller's decision on `trade`, then apply the
    /// operator decision and settlement it carries.
    async fn resolve(
        &self,
        handle: &ReplicationHandle,
        broker: &PaperBroker,
        journal: &Database,
        trade: &SimulatedTrade,
    ) -> Result<()> {
        let mut decided = None;
        for _ in 0..DECISION_ATTEMPTS {
            if let Some(row) = journal.get_trade(&trade.trade_id).await? {
                decided = Some(row);
                break;
            }
            tokio::time::sleep(DECISION_POLL).await;
        }
        let Some(row) = decided else {
            bail!("Timed out waiting for a decision on trade {}", trade.trade_id);
        };

        let target_trade_id = match row.status.as_str() {
            "pending" if trade.approve.unwrap_or(true) => match handle.approve(&trade.trade_id).await {
                Ok(executed) => Some(executed.target_trade_id),
                Err(e) => {
                    debug!(trade_id = %trade.trade_id, error = %e, "Approved trade not executed");
                    None
                }
            },
            "pending" => {
                handle.reject(&trade.trade_id).await?;
                None
            }
            "executed" => row.target_trade_id,
            _ => None,
        };

        if let (Some(target_trade_id), Some(profit)) = (target_trade_id, trade.profit) {
            broker.settle(&target_trade_id, profit)?;
            handle.settle(&target_trade_id, profit).await?;
        }

        Ok(())
    }
}
