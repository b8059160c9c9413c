//! Replication controller.
//!
//! One task owns all replication state for an account pair. Operator commands
//! and source trade events arrive on channels and are handled one at a time,
//! so config updates and enable/disable never race the trade pipeline.
//!
//! Pipeline per source trade:
//! 1. Ignore ids already decided (idempotence)
//! 2. Refresh the target balance and check the circuit breaker
//! 3. Scale the size and check margin; insufficient margin drops the trade
//! 4. Queue for approval, or execute directly

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::{BalanceProvider, Clock, NotificationSink, OrderPlacement, SourceEventFeed, Subscription};
use crate::db::{Database, OutcomeDetail, StoredState};
use crate::error::{ReplicationError, Result};
use crate::models::{
    AccountPair, BalanceSnapshot, ExecutedTrade, LogLevel, PendingTrade, ReplicationLogEntry,
    SourceTradeEvent, TradeOutcome,
};

use super::margin::{has_sufficient_margin, required_margin};
use super::reporter::{CheckStatus, Reporter, StatusLine};
use super::{
    ApprovalGate, CircuitBreaker, ConfigUpdate, ControllerSettings, ExecutionAdapter,
    ReplicationConfig, ScalingPolicy, TripReason,
};

const COMMAND_CAPACITY: usize = 32;
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

/// External collaborators of a controller.
#[derive(Clone)]
pub struct ReplicationDeps {
    pub feed: Arc<dyn SourceEventFeed>,
    pub balances: Arc<dyn BalanceProvider>,
    pub orders: Arc<dyn OrderPlacement>,
    pub notifier: Arc<dyn NotificationSink>,
    pub clock: Arc<dyn Clock>,
}

/// Point-in-time view of the controller, returned by `get_state`.
#[derive(Debug, Clone, Serialize)]
pub struct ReplicationState {
    pub enabled: bool,
    pub source_account: String,
    pub target_account: String,
    pub config: ReplicationConfig,
    pub pending_trades: Vec<PendingTrade>,
    pub logs: Vec<ReplicationLogEntry>,
    pub daily_loss_accrued: Decimal,
    pub daily_loss_limit: Decimal,
    pub last_reset_at: DateTime<Utc>,
    pub target_balance: BalanceSnapshot,
    pub executed_trades: Vec<ExecutedTrade>,
    pub realized_pnl: Decimal,
    pub margin_check: StatusLine,
    pub circuit_breaker: StatusLine,
    pub trip_reason: Option<TripReason>,
}

enum Command {
    Enable {
        confirmed: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Disable {
        reply: oneshot::Sender<()>,
    },
    UpdateConfig {
        update: ConfigUpdate,
        reply: oneshot::Sender<Result<ReplicationConfig>>,
    },
    Approve {
        trade_id: String,
        reply: oneshot::Sender<Result<ExecutedTrade>>,
    },
    Reject {
        trade_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    SyncBalance {
        reply: oneshot::Sender<Result<Decimal>>,
    },
    Settle {
        target_trade_id: String,
        profit: Decimal,
        reply: oneshot::Sender<Result<()>>,
    },
    ResetDailyLoss {
        reply: oneshot::Sender<()>,
    },
    GetState {
        reply: oneshot::Sender<ReplicationState>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Feed subscription plus the receiving end of its channel. Exists only while
/// replication is enabled.
struct Session {
    subscription: Subscription,
    events: mpsc::Receiver<SourceTradeEvent>,
}

pub struct ReplicationController {
    accounts: AccountPair,
    config: ReplicationConfig,
    settings: ControllerSettings,
    scaling: ScalingPolicy,
    breaker: CircuitBreaker,
    gate: ApprovalGate,
    executor: ExecutionAdapter,
    feed: Arc<dyn SourceEventFeed>,
    balances: Arc<dyn BalanceProvider>,
    clock: Arc<dyn Clock>,
    reporter: Reporter,
    journal: Option<Database>,
    balance: BalanceSnapshot,
    enabled: bool,
    session: Option<Session>,
    seen: HashSet<String>,
    executed: Vec<ExecutedTrade>,
    realized_pnl: Decimal,
}

impl ReplicationController {
    pub fn new(
        accounts: AccountPair,
        config: ReplicationConfig,
        settings: ControllerSettings,
        deps: ReplicationDeps,
    ) -> Result<Self> {
        config.validate()?;

        let executor = ExecutionAdapter::new(
            deps.orders,
            accounts.target.id.clone(),
            settings.order_timeout,
        );
        let now = deps.clock.now();

        Ok(Self {
            scaling: ScalingPolicy::new(config.clone()),
            breaker: CircuitBreaker::new(now),
            gate: ApprovalGate::new(),
            executor,
            feed: deps.feed,
            balances: deps.balances,
            clock: deps.clock,
            reporter: Reporter::new(deps.notifier),
            journal: None,
            balance: BalanceSnapshot::unknown(),
            enabled: false,
            session: None,
            seen: HashSet::new(),
            executed: Vec::new(),
            realized_pnl: Decimal::ZERO,
            accounts,
            config,
            settings,
        })
    }

    /// Persist decisions, state and log entries to `journal`.
    pub fn with_journal(mut self, journal: Database) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Load decided trade ids, executed trades and breaker state from the
    /// journal. Replication always starts disabled; trades left pending by a
    /// previous run are cancelled.
    pub async fn restore(&mut self) -> anyhow::Result<()> {
        let Some(db) = &self.journal else {
            return Ok(());
        };

        let stale = db.cancel_stale_pending().await?;
        self.seen = db.seen_trade_ids().await?;
        self.executed = db.executed_trades().await?;
        self.realized_pnl = self.executed.iter().filter_map(|t| t.result_profit()).sum();

        let was_enabled = match db.load_state().await? {
            Some(state) => {
                self.breaker = CircuitBreaker::restore(state.daily_loss_accrued, state.last_reset_at);
                state.enabled
            }
            None => false,
        };

        info!(
            seen = self.seen.len(),
            executed = self.executed.len(),
            daily_loss = %self.breaker.daily_loss_accrued(),
            "Restored replication journal"
        );

        if stale > 0 {
            self.reporter.record(
                LogLevel::Warning,
                format!("{} pending trade(s) from the previous session were cancelled", stale),
            );
        }
        if was_enabled {
            self.reporter.record(
                LogLevel::Warning,
                "Replication was enabled before restart; enable it again to resume",
            );
        }

        Ok(())
    }

    /// Start the controller task.
    pub fn spawn(self) -> (ReplicationHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let task = tokio::spawn(self.run(rx));
        (ReplicationHandle { tx }, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut balance_tick = interval(self.settings.balance_poll_interval);
        balance_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut housekeeping = interval(HOUSEKEEPING_INTERVAL);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            source = %self.accounts.source.id,
            target = %self.accounts.target.id,
            "Replication controller started"
        );

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        debug!("All replication handles dropped");
                        self.stop().await;
                        break;
                    };
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                event = next_event(&mut self.session) => {
                    match event {
                        Some(event) => self.process_event(event).await,
                        None => self.feed_closed().await,
                    }
                }
                _ = balance_tick.tick() => {
                    self.refresh_balance().await;
                    if self.enabled {
                        self.trip_if_breached().await;
                    }
                }
                _ = housekeeping.tick() => self.housekeeping().await,
            }

            self.flush_log().await;
        }

        info!("Replication controller stopped");
    }

    /// Returns false when the controller should stop.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Enable { confirmed, reply } => {
                let _ = reply.send(self.enable(confirmed).await);
            }
            Command::Disable { reply } => {
                self.disable("stopped by operator").await;
                let _ = reply.send(());
            }
            Command::UpdateConfig { update, reply } => {
                let _ = reply.send(self.update_config(update).await);
            }
            Command::Approve { trade_id, reply } => {
                let _ = reply.send(self.approve(&trade_id).await);
            }
            Command::Reject { trade_id, reply } => {
                let _ = reply.send(self.reject(&trade_id).await);
            }
            Command::SyncBalance { reply } => {
                let _ = reply.send(self.sync_balance().await);
            }
            Command::Settle {
                target_trade_id,
                profit,
                reply,
            } => {
                let _ = reply.send(self.settle(&target_trade_id, profit).await);
            }
            Command::ResetDailyLoss { reply } => {
                self.reset_daily_loss().await;
                let _ = reply.send(());
            }
            Command::GetState { reply } => {
                let _ = reply.send(self.state());
            }
            Command::Shutdown { reply } => {
                self.stop().await;
                self.flush_log().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    // ==================== Operations ====================

    async fn enable(&mut self, confirmed: bool) -> Result<()> {
        if self.enabled {
            return Err(ReplicationError::AlreadyEnabled);
        }
        if self.settings.require_enable_confirmation && !confirmed {
            return Err(ReplicationError::ConfirmationRequired);
        }

        self.refresh_balance().await;
        if !self.balance.is_known() {
            return Err(ReplicationError::AccountsUnknown);
        }

        self.roll_day_if_needed().await;

        if let Err(reason) = self.breaker.try_rearm(&self.config, self.balance.balance) {
            self.reporter
                .set_circuit_breaker(CheckStatus::Error, reason.to_string());
            self.reporter.record(
                LogLevel::Error,
                format!("Cannot enable replication: {}", reason),
            );
            return Err(ReplicationError::ThresholdBreached(reason.to_string()));
        }

        let (tx, rx) = mpsc::channel(self.settings.feed_channel_capacity);
        let subscription = match self.feed.subscribe(&self.accounts.source.id, tx).await {
            Ok(subscription) => subscription,
            Err(e) => {
                self.reporter.record(
                    LogLevel::Error,
                    format!("Failed to subscribe to source trades: {}", e),
                );
                return Err(ReplicationError::Feed(e.to_string()));
            }
        };

        self.session = Some(Session {
            subscription,
            events: rx,
        });
        self.enabled = true;

        let limit = CircuitBreaker::loss_limit(&self.config, self.balance.balance);
        self.reporter.set_circuit_breaker(
            CheckStatus::Success,
            format!(
                "Limits OK: daily loss {:.2} of {:.2}",
                self.breaker.daily_loss_accrued(),
                limit
            ),
        );
        self.reporter.record(
            LogLevel::Success,
            format!(
                "Replication enabled: {} -> {} (balance {:.2})",
                self.accounts.source.id, self.accounts.target.id, self.balance.balance
            ),
        );
        self.persist_state().await;

        Ok(())
    }

    async fn disable(&mut self, reason: &str) {
        let was_enabled = self.enabled;
        self.enabled = false;
        self.teardown_session().await;

        if was_enabled {
            self.reporter
                .record(LogLevel::Info, format!("Replication disabled: {}", reason));
        }
        self.persist_state().await;
    }

    /// Unsubscribe from the feed and cancel every pending trade.
    async fn teardown_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.subscription.unsubscribe();
        }

        for trade in self.gate.drain() {
            self.reporter.record(
                LogLevel::Warning,
                format!("Pending trade {} cancelled", trade.source_trade_id),
            );
            self.journal_outcome(
                &trade.event,
                TradeOutcome::Cancelled,
                OutcomeDetail {
                    detail: Some("Replication disabled"),
                    ..Default::default()
                },
            )
            .await;
        }
    }

    async fn stop(&mut self) {
        self.teardown_session().await;
        self.persist_state().await;
    }

    async fn update_config(&mut self, update: ConfigUpdate) -> Result<ReplicationConfig> {
        let next = self.config.merged(&update)?;

        self.scaling = ScalingPolicy::new(next.clone());
        self.config = next;
        self.reporter
            .record(LogLevel::Info, "Replication configuration updated");

        if self.enabled {
            self.trip_if_breached().await;
        }

        Ok(self.config.clone())
    }

    async fn approve(&mut self, trade_id: &str) -> Result<ExecutedTrade> {
        let trade = self
            .gate
            .approve(trade_id)
            .ok_or_else(|| ReplicationError::PendingTradeNotFound(trade_id.to_string()))?;

        self.reporter
            .record(LogLevel::Info, format!("Trade {} approved", trade_id));

        // Conditions may have changed while the trade was queued
        self.refresh_balance().await;
        if let Some(reason) = self.trip_if_breached().await {
            self.journal_outcome(
                &trade.event,
                TradeOutcome::Dropped,
                OutcomeDetail {
                    detail: Some(&reason.to_string()),
                    ..Default::default()
                },
            )
            .await;
            return Err(ReplicationError::ThresholdBreached(reason.to_string()));
        }

        // The cap may have been lowered while the trade was queued
        let scaled_size = trade.scaled_size.min(self.config.max_trade_size);
        if scaled_size < trade.scaled_size {
            self.reporter.record(
                LogLevel::Info,
                format!(
                    "Trade {} reduced from {:.2} to the {:.2} cap",
                    trade_id, trade.scaled_size, scaled_size
                ),
            );
        }

        let balance = self.balance.balance;
        let required = required_margin(
            scaled_size,
            self.config.asset_risk_percentage,
            self.config.margin_buffer_absolute,
        );
        if !has_sufficient_margin(
            balance,
            scaled_size,
            self.config.asset_risk_percentage,
            self.config.margin_buffer_absolute,
        ) {
            self.drop_for_margin(&trade.event, required, balance).await;
            return Err(ReplicationError::InsufficientMargin { balance, required });
        }

        self.execute(&trade.event, scaled_size).await
    }

    async fn reject(&mut self, trade_id: &str) -> Result<()> {
        let trade = self
            .gate
            .reject(trade_id)
            .ok_or_else(|| ReplicationError::PendingTradeNotFound(trade_id.to_string()))?;

        self.reporter
            .record(LogLevel::Info, format!("Trade {} rejected", trade_id));
        self.journal_outcome(&trade.event, TradeOutcome::Rejected, OutcomeDetail::default())
            .await;

        Ok(())
    }

    async fn sync_balance(&mut self) -> Result<Decimal> {
        let balance = self
            .balances
            .get_balance(&self.accounts.target.id)
            .await
            .map_err(|e| ReplicationError::BalanceUnavailable(e.to_string()))?;

        self.balance.sync(balance);
        if self.enabled {
            self.trip_if_breached().await;
        }

        Ok(balance)
    }

    /// Apply the realized result of an executed trade. Settling twice is a no-op.
    async fn settle(&mut self, target_trade_id: &str, profit: Decimal) -> Result<()> {
        let trade = self
            .executed
            .iter_mut()
            .find(|t| t.target_trade_id == target_trade_id)
            .ok_or_else(|| ReplicationError::ExecutedTradeNotFound(target_trade_id.to_string()))?;

        if !trade.settle(profit) {
            debug!(target_trade = %target_trade_id, "Trade already settled");
            return Ok(());
        }

        self.realized_pnl += profit;
        self.breaker.record_result(profit);

        let (level, sign) = if profit >= Decimal::ZERO {
            (LogLevel::Success, "+")
        } else {
            (LogLevel::Warning, "")
        };
        self.reporter.record(
            level,
            format!("Trade {} settled: {}{:.2}", target_trade_id, sign, profit),
        );

        if let Some(db) = &self.journal {
            if let Err(e) = db.settle_trade(target_trade_id, profit).await {
                warn!(error = %e, "Failed to journal settlement");
            }
        }
        self.persist_state().await;

        self.refresh_balance().await;
        if self.enabled {
            self.trip_if_breached().await;
        }

        Ok(())
    }

    async fn reset_daily_loss(&mut self) {
        self.breaker.reset(self.clock.now());
        self.reporter
            .record(LogLevel::Info, "Daily loss counter reset");
        self.persist_state().await;
    }

    fn state(&self) -> ReplicationState {
        ReplicationState {
            enabled: self.enabled,
            source_account: self.accounts.source.id.clone(),
            target_account: self.accounts.target.id.clone(),
            config: self.config.clone(),
            pending_trades: self.gate.pending(),
            logs: self.reporter.log().entries(),
            daily_loss_accrued: self.breaker.daily_loss_accrued(),
            daily_loss_limit: CircuitBreaker::loss_limit(&self.config, self.balance.balance),
            last_reset_at: self.breaker.last_reset_at(),
            target_balance: self.balance,
            executed_trades: self.executed.clone(),
            realized_pnl: self.realized_pnl,
            margin_check: self.reporter.margin_check().clone(),
            circuit_breaker: self.reporter.circuit_breaker().clone(),
            trip_reason: self.breaker.tripped().cloned(),
        }
    }

    // ==================== Pipeline ====================

    async fn process_event(&mut self, event: SourceTradeEvent) {
        if !self.enabled {
            return;
        }
        if !self.seen.insert(event.trade_id.clone()) {
            debug!(trade_id = %event.trade_id, "Duplicate source trade ignored");
            return;
        }

        self.reporter.record(
            LogLevel::Info,
            format!(
                "Source trade {}: {} {} stake {:.2}",
                event.trade_id, event.contract_type, event.symbol, event.source_size
            ),
        );

        self.refresh_balance().await;
        if let Some(reason) = self.trip_if_breached().await {
            self.journal_outcome(
                &event,
                TradeOutcome::Dropped,
                OutcomeDetail {
                    detail: Some(&reason.to_string()),
                    ..Default::default()
                },
            )
            .await;
            return;
        }

        let balance = self.balance.balance;
        let scaled = self.scaling.scaled_size(event.source_size, balance);
        let required = required_margin(
            scaled,
            self.config.asset_risk_percentage,
            self.config.margin_buffer_absolute,
        );

        if scaled <= Decimal::ZERO || balance < required {
            self.drop_for_margin(&event, required, balance).await;
            return;
        }

        self.reporter.set_margin_check(
            CheckStatus::Success,
            format!("Margin OK: required {:.2}, available {:.2}", required, balance),
        );
        debug!(
            trade_id = %event.trade_id,
            source_size = %event.source_size,
            scaled = %scaled,
            required = %required,
            "Trade sized"
        );

        if self.config.require_approval {
            let pending = PendingTrade::new(event.clone(), scaled, required, balance);
            self.reporter.record(
                LogLevel::Info,
                format!(
                    "Trade {} awaiting approval: stake {:.2} ({}% of balance)",
                    pending.source_trade_id, pending.scaled_size, pending.risk_percentage
                ),
            );
            self.journal_outcome(
                &event,
                TradeOutcome::Pending,
                OutcomeDetail {
                    scaled_size: Some(scaled),
                    ..Default::default()
                },
            )
            .await;
            self.gate.enqueue(pending);
        } else {
            // Failures are already logged and journaled
            let _ = self.execute(&event, scaled).await;
        }
    }

    async fn execute(&mut self, event: &SourceTradeEvent, scaled: Decimal) -> Result<ExecutedTrade> {
        let result = self
            .executor
            .execute(event, scaled, &mut self.balance, &mut self.reporter)
            .await;

        match &result {
            Ok(trade) => {
                self.executed.push(trade.clone());
                self.journal_outcome(
                    event,
                    TradeOutcome::Executed,
                    OutcomeDetail {
                        scaled_size: Some(scaled),
                        target_trade_id: Some(&trade.target_trade_id),
                        detail: None,
                    },
                )
                .await;

                // The debit may have pushed the balance under the floor
                if self.enabled {
                    self.trip_if_breached().await;
                }
            }
            Err(e) => {
                self.journal_outcome(
                    event,
                    TradeOutcome::Failed,
                    OutcomeDetail {
                        scaled_size: Some(scaled),
                        detail: Some(&e.to_string()),
                        ..Default::default()
                    },
                )
                .await;
            }
        }

        result
    }

    async fn drop_for_margin(&mut self, event: &SourceTradeEvent, required: Decimal, balance: Decimal) {
        let message = format!(
            "Insufficient margin for trade {}: required {:.2}, available {:.2}",
            event.trade_id, required, balance
        );
        self.reporter
            .set_margin_check(CheckStatus::Error, message.clone());
        self.reporter.record(LogLevel::Warning, message.clone());
        self.journal_outcome(
            event,
            TradeOutcome::Dropped,
            OutcomeDetail {
                detail: Some(&message),
                ..Default::default()
            },
        )
        .await;
    }

    /// Latch the breaker against the current balance. A new trip disables
    /// replication and is returned.
    async fn trip_if_breached(&mut self) -> Option<TripReason> {
        let reason = self.breaker.evaluate(&self.config, self.balance.balance)?;

        self.reporter
            .set_circuit_breaker(CheckStatus::Error, reason.to_string());
        self.reporter.record(
            LogLevel::Error,
            format!("Circuit breaker tripped: {}", reason),
        );
        self.disable("circuit breaker tripped").await;

        Some(reason)
    }

    async fn refresh_balance(&mut self) {
        match self.balances.get_balance(&self.accounts.target.id).await {
            Ok(balance) => self.balance.sync(balance),
            Err(e) => warn!(
                account = %self.accounts.target.id,
                error = %e,
                "Failed to refresh target balance"
            ),
        }
    }

    async fn feed_closed(&mut self) {
        self.reporter
            .record(LogLevel::Warning, "Source trade feed closed");
        self.disable("source feed closed").await;
    }

    async fn housekeeping(&mut self) {
        self.roll_day_if_needed().await;

        if let Some(ttl) = self.settings.pending_ttl {
            for trade in self.gate.expire(ttl, self.clock.now()) {
                self.reporter.record(
                    LogLevel::Warning,
                    format!("Pending trade {} expired", trade.source_trade_id),
                );
                self.journal_outcome(&trade.event, TradeOutcome::Expired, OutcomeDetail::default())
                    .await;
            }
        }
    }

    async fn roll_day_if_needed(&mut self) {
        if self.breaker.roll_day(self.clock.now()) {
            self.reporter
                .record(LogLevel::Info, "New trading day: daily loss counter reset");
            self.persist_state().await;
        }
    }

    // ==================== Journal ====================

    async fn journal_outcome(
        &mut self,
        event: &SourceTradeEvent,
        outcome: TradeOutcome,
        detail: OutcomeDetail<'_>,
    ) {
        if let Some(db) = &self.journal {
            if let Err(e) = db.record_outcome(event, outcome, detail).await {
                warn!(trade_id = %event.trade_id, error = %e, "Failed to journal trade outcome");
            }
        }
    }

    async fn persist_state(&mut self) {
        if let Some(db) = &self.journal {
            let state = StoredState {
                enabled: self.enabled,
                daily_loss_accrued: self.breaker.daily_loss_accrued(),
                last_reset_at: self.breaker.last_reset_at(),
            };
            if let Err(e) = db.save_state(&state).await {
                warn!(error = %e, "Failed to persist replication state");
            }
        }
    }

    async fn flush_log(&mut self) {
        let entries = self.reporter.take_unflushed();
        if let Some(db) = &self.journal {
            if let Err(e) = db.append_log(&entries).await {
                warn!(error = %e, "Failed to journal replication log");
            }
        }
    }
}

async fn next_event(session: &mut Option<Session>) -> Option<SourceTradeEvent> {
    match session {
        Some(session) => session.events.recv().await,
        None => std::future::pending().await,
    }
}

/// Cloneable handle to a running controller.
#[derive(Clone)]
pub struct ReplicationHandle {
    tx: mpsc::Sender<Command>,
}

impl ReplicationHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| ReplicationError::ControllerStopped)?;
        rx.await.map_err(|_| ReplicationError::ControllerStopped)
    }

    /// Start replicating. `confirmed` acknowledges that real trades will be placed.
    pub async fn enable(&self, confirmed: bool) -> Result<()> {
        self.request(|reply| Command::Enable { confirmed, reply }).await?
    }

    pub async fn disable(&self) -> Result<()> {
        self.request(|reply| Command::Disable { reply }).await
    }

    pub async fn update_config(&self, update: ConfigUpdate) -> Result<ReplicationConfig> {
        self.request(|reply| Command::UpdateConfig { update, reply })
            .await?
    }

    pub async fn approve(&self, trade_id: &str) -> Result<ExecutedTrade> {
        let trade_id = trade_id.to_string();
        self.request(|reply| Command::Approve { trade_id, reply })
            .await?
    }

    pub async fn reject(&self, trade_id: &str) -> Result<()> {
        let trade_id = trade_id.to_string();
        self.request(|reply| Command::Reject { trade_id, reply }).await?
    }

    /// Fetch the target balance from the broker.
    pub async fn sync_balance(&self) -> Result<Decimal> {
        self.request(|reply| Command::SyncBalance { reply }).await?
    }

    /// Report the realized profit (negative for a loss) of an executed trade.
    pub async fn settle(&self, target_trade_id: &str, profit: Decimal) -> Result<()> {
        let target_trade_id = target_trade_id.to_string();
        self.request(|reply| Command::Settle {
            target_trade_id,
            profit,
            reply,
        })
        .await?
    }

    pub async fn reset_daily_loss(&self) -> Result<()> {
        self.request(|reply| Command::ResetDailyLoss { reply }).await
    }

    pub async fn get_state(&self) -> Result<ReplicationState> {
        self.request(|reply| Command::GetState { reply }).await
    }

    /// Stop the controller. Pending trades are cancelled.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{NullNotifier, PaperBroker, SystemClock};
    use crate::models::Account;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    const SOURCE: &str = "VRTC1";
    const TARGET: &str = "CR1";

    struct ManualClock(Mutex<DateTime<Utc>>);

    impl ManualClock {
        fn advance(&self, by: chrono::Duration) {
            let mut now = self.0.lock().unwrap();
            *now += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    fn broker(target_balance: Decimal) -> PaperBroker {
        let broker = PaperBroker::new();
        broker.add_account(Account {
            id: SOURCE.to_string(),
            is_virtual: true,
            currency: "USD".to_string(),
            balance: dec!(10000),
        });
        broker.add_account(Account {
            id: TARGET.to_string(),
            is_virtual: false,
            currency: "USD".to_string(),
            balance: target_balance,
        });
        broker
    }

    fn deps(broker: &PaperBroker, clock: Arc<dyn Clock>) -> ReplicationDeps {
        ReplicationDeps {
            feed: Arc::new(broker.clone()),
            balances: Arc::new(broker.clone()),
            orders: Arc::new(broker.clone()),
            notifier: Arc::new(NullNotifier),
            clock,
        }
    }

    fn settings() -> ControllerSettings {
        ControllerSettings {
            require_enable_confirmation: false,
            ..Default::default()
        }
    }

    fn config(require_approval: bool) -> ReplicationConfig {
        ReplicationConfig {
            require_approval,
            ..Default::default()
        }
    }

    fn controller(
        broker: &PaperBroker,
        config: ReplicationConfig,
        settings: ControllerSettings,
    ) -> ReplicationController {
        let accounts = AccountPair::resolve(&broker.list_accounts()).unwrap();
        ReplicationController::new(accounts, config, settings, deps(broker, Arc::new(SystemClock)))
            .unwrap()
    }

    fn start(broker: &PaperBroker, config: ReplicationConfig) -> ReplicationHandle {
        controller(broker, config, settings()).spawn().0
    }

    fn event(id: &str, size: Decimal) -> SourceTradeEvent {
        SourceTradeEvent {
            trade_id: id.to_string(),
            symbol: "R_100".to_string(),
            contract_type: "CALL".to_string(),
            source_size: size,
            timestamp: Utc::now(),
        }
    }

    async fn wait_until(
        handle: &ReplicationHandle,
        condition: impl Fn(&ReplicationState) -> bool,
    ) -> ReplicationState {
        for _ in 0..1000 {
            let state = handle.get_state().await.unwrap();
            if condition(&state) {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("controller never reached the expected state");
    }

    fn has_log(state: &ReplicationState, level: LogLevel, needle: &str) -> bool {
        state
            .logs
            .iter()
            .any(|e| e.level == level && e.message.contains(needle))
    }

    #[tokio::test]
    async fn test_enable_rejected_below_min_balance() {
        let broker = broker(dec!(40));
        let handle = start(&broker, config(false));

        let err = handle.enable(true).await.unwrap_err();
        assert!(matches!(err, ReplicationError::ThresholdBreached(_)));

        let state = handle.get_state().await.unwrap();
        assert!(!state.enabled);
        assert_eq!(state.circuit_breaker.status, CheckStatus::Error);
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_enable_requires_confirmation() {
        let broker = broker(dec!(1000));
        let handle = controller(&broker, config(false), ControllerSettings::default())
            .spawn()
            .0;

        assert_eq!(
            handle.enable(false).await.unwrap_err(),
            ReplicationError::ConfirmationRequired
        );
        handle.enable(true).await.unwrap();
        assert_eq!(handle.enable(true).await.unwrap_err(), ReplicationError::AlreadyEnabled);
        assert_eq!(broker.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_approval_flow() {
        let broker = broker(dec!(1000));
        let handle = start(&broker, config(true));
        handle.enable(true).await.unwrap();

        broker.publish(SOURCE, event("d1", dec!(20))).await;
        let state = wait_until(&handle, |s| s.pending_trades.len() == 1).await;
        assert_eq!(state.pending_trades[0].scaled_size, dec!(20));
        assert_eq!(state.pending_trades[0].risk_percentage, dec!(2));
        assert!(broker.orders().is_empty());

        let trade = handle.approve("d1").await.unwrap();
        assert_eq!(trade.scaled_size, dec!(20));
        assert_eq!(broker.balance(TARGET), Some(dec!(980)));

        broker.publish(SOURCE, event("d2", dec!(20))).await;
        wait_until(&handle, |s| s.pending_trades.len() == 1).await;
        handle.reject("d2").await.unwrap();

        let state = handle.get_state().await.unwrap();
        assert!(state.pending_trades.is_empty());
        assert_eq!(state.executed_trades.len(), 1);
        assert_eq!(broker.balance(TARGET), Some(dec!(980)));
        assert_eq!(
            handle.reject("d2").await.unwrap_err(),
            ReplicationError::PendingTradeNotFound("d2".to_string())
        );
    }

    #[tokio::test]
    async fn test_duplicate_trade_ids_execute_once() {
        let broker = broker(dec!(1000));
        let handle = start(&broker, config(false));
        handle.enable(true).await.unwrap();

        broker.publish(SOURCE, event("d1", dec!(10))).await;
        broker.publish(SOURCE, event("d1", dec!(10))).await;
        broker.publish(SOURCE, event("d2", dec!(10))).await;

        let state = wait_until(&handle, |s| s.executed_trades.len() == 2).await;
        assert_eq!(state.executed_trades[0].source_trade_id, "d1");
        assert_eq!(state.executed_trades[1].source_trade_id, "d2");
        assert_eq!(broker.orders().len(), 2);
    }

    #[tokio::test]
    async fn test_insufficient_margin_drops_and_stays_enabled() {
        let broker = broker(dec!(100));
        let handle = start(
            &broker,
            ReplicationConfig {
                margin_buffer_absolute: dec!(200),
                require_approval: false,
                ..Default::default()
            },
        );
        handle.enable(true).await.unwrap();

        broker.publish(SOURCE, event("d1", dec!(50))).await;
        let state = wait_until(&handle, |s| s.margin_check.status == CheckStatus::Error).await;

        assert!(state.enabled);
        assert!(state.executed_trades.is_empty());
        assert!(has_log(&state, LogLevel::Warning, "Insufficient margin"));
        assert!(broker.orders().is_empty());
    }

    #[tokio::test]
    async fn test_loss_trips_breaker_until_reset() {
        let broker = broker(dec!(1000));
        let handle = start(&broker, config(false));
        handle.enable(true).await.unwrap();

        broker.publish(SOURCE, event("d1", dec!(200))).await;
        let state = wait_until(&handle, |s| s.executed_trades.len() == 1).await;
        let target_trade = state.executed_trades[0].target_trade_id.clone();
        assert_eq!(broker.balance(TARGET), Some(dec!(800)));

        // Lose the whole stake: 200 >= 10% of 800
        broker.settle(&target_trade, dec!(-200)).unwrap();
        handle.settle(&target_trade, dec!(-200)).await.unwrap();

        let state = handle.get_state().await.unwrap();
        assert!(!state.enabled);
        assert_eq!(state.daily_loss_accrued, dec!(200));
        assert!(matches!(state.trip_reason, Some(TripReason::DailyLossLimit { .. })));
        assert!(has_log(&state, LogLevel::Error, "Circuit breaker tripped"));
        assert_eq!(broker.subscriber_count(), 0);

        // Stays tripped until the accrual is cleared
        assert!(matches!(
            handle.enable(true).await,
            Err(ReplicationError::ThresholdBreached(_))
        ));

        handle.reset_daily_loss().await.unwrap();
        let state = handle.get_state().await.unwrap();
        assert!(!state.enabled);
        assert_eq!(state.daily_loss_accrued, Decimal::ZERO);

        handle.enable(true).await.unwrap();
        assert!(handle.get_state().await.unwrap().trip_reason.is_none());
    }

    #[tokio::test]
    async fn test_profit_does_not_accrue_loss() {
        let broker = broker(dec!(1000));
        let handle = start(&broker, config(false));
        handle.enable(true).await.unwrap();

        broker.publish(SOURCE, event("d1", dec!(20))).await;
        let state = wait_until(&handle, |s| s.executed_trades.len() == 1).await;
        let target_trade = state.executed_trades[0].target_trade_id.clone();

        handle.settle(&target_trade, dec!(17)).await.unwrap();
        handle.settle(&target_trade, dec!(17)).await.unwrap();

        let state = handle.get_state().await.unwrap();
        assert!(state.enabled);
        assert_eq!(state.realized_pnl, dec!(17));
        assert_eq!(state.daily_loss_accrued, Decimal::ZERO);
        assert_eq!(
            handle.settle("unknown", dec!(1)).await.unwrap_err(),
            ReplicationError::ExecutedTradeNotFound("unknown".to_string())
        );
    }

    #[tokio::test]
    async fn test_execution_failure_keeps_replication_enabled() {
        let broker = broker(dec!(1000));
        let handle = start(&broker, config(false));
        handle.enable(true).await.unwrap();

        broker.reject_orders(Some("Market is closed"));
        broker.publish(SOURCE, event("d1", dec!(20))).await;
        let state = wait_until(&handle, |s| has_log(s, LogLevel::Error, "Market is closed")).await;
        assert!(state.enabled);
        assert!(state.executed_trades.is_empty());
        assert_eq!(broker.balance(TARGET), Some(dec!(1000)));

        broker.reject_orders(None);
        broker.publish(SOURCE, event("d2", dec!(20))).await;
        wait_until(&handle, |s| s.executed_trades.len() == 1).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_order_timeout_is_a_failure() {
        let broker = broker(dec!(1000));
        broker.set_order_latency(Some(Duration::from_secs(60)));
        let handle = start(&broker, config(false));
        handle.enable(true).await.unwrap();

        broker.publish(SOURCE, event("d1", dec!(20))).await;
        let state = wait_until(&handle, |s| has_log(s, LogLevel::Error, "timed out")).await;

        assert!(state.enabled);
        assert!(state.executed_trades.is_empty());
        assert_eq!(state.target_balance.balance, dec!(1000));
    }

    #[tokio::test]
    async fn test_disable_cancels_pending_trades() {
        let broker = broker(dec!(1000));
        let handle = start(&broker, config(true));
        handle.enable(true).await.unwrap();

        broker.publish(SOURCE, event("d1", dec!(10))).await;
        broker.publish(SOURCE, event("d2", dec!(10))).await;
        wait_until(&handle, |s| s.pending_trades.len() == 2).await;

        handle.disable().await.unwrap();

        let state = handle.get_state().await.unwrap();
        assert!(!state.enabled);
        assert!(state.pending_trades.is_empty());
        assert!(has_log(&state, LogLevel::Warning, "d1 cancelled"));
        assert!(has_log(&state, LogLevel::Warning, "d2 cancelled"));
        assert_eq!(broker.subscriber_count(), 0);
        assert!(broker.orders().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_update_leaves_config() {
        let broker = broker(dec!(1000));
        let handle = start(&broker, config(true));

        let err = handle
            .update_config(ConfigUpdate {
                risk_percentage: Some(dec!(0)),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::InvalidConfig(_)));
        assert_eq!(handle.get_state().await.unwrap().config.risk_percentage, dec!(2));

        let updated = handle
            .update_config(ConfigUpdate {
                require_approval: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!updated.require_approval);
    }

    #[tokio::test]
    async fn test_approved_trade_respects_lowered_cap() {
        let broker = broker(dec!(1000));
        let handle = start(&broker, config(true));
        handle.enable(true).await.unwrap();

        broker.publish(SOURCE, event("d1", dec!(20))).await;
        wait_until(&handle, |s| s.pending_trades.len() == 1).await;

        handle
            .update_config(ConfigUpdate {
                max_trade_size: Some(dec!(5)),
                ..Default::default()
            })
            .await
            .unwrap();

        let trade = handle.approve("d1").await.unwrap();
        assert_eq!(trade.scaled_size, dec!(5));
        assert_eq!(broker.orders()[0].request.size, dec!(5));
        assert_eq!(broker.balance(TARGET), Some(dec!(995)));
    }

    #[tokio::test]
    async fn test_balance_sync_below_floor_trips() {
        let broker = broker(dec!(1000));
        let handle = start(&broker, config(false));
        handle.enable(true).await.unwrap();

        broker.set_balance(TARGET, dec!(30));
        assert_eq!(handle.sync_balance().await.unwrap(), dec!(30));

        let state = handle.get_state().await.unwrap();
        assert!(!state.enabled);
        assert!(matches!(state.trip_reason, Some(TripReason::MinBalance { .. })));
    }

    #[tokio::test]
    async fn test_breaker_trip_cancels_pending_trades() {
        let broker = broker(dec!(1000));
        let handle = start(&broker, config(true));
        handle.enable(true).await.unwrap();

        broker.publish(SOURCE, event("d1", dec!(10))).await;
        wait_until(&handle, |s| s.pending_trades.len() == 1).await;

        broker.set_balance(TARGET, dec!(30));
        handle.sync_balance().await.unwrap();

        let state = handle.get_state().await.unwrap();
        assert!(!state.enabled);
        assert!(state.pending_trades.is_empty());
        assert!(has_log(&state, LogLevel::Warning, "d1 cancelled"));
        assert_eq!(broker.subscriber_count(), 0);
        assert_eq!(
            handle.approve("d1").await.unwrap_err(),
            ReplicationError::PendingTradeNotFound("d1".to_string())
        );
        assert!(broker.orders().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_daily_loss_resets_on_new_day() {
        let broker = broker(dec!(1000));
        let clock = Arc::new(ManualClock(Mutex::new(Utc::now())));
        let accounts = AccountPair::resolve(&broker.list_accounts()).unwrap();
        let handle = ReplicationController::new(
            accounts,
            config(false),
            settings(),
            deps(&broker, clock.clone()),
        )
        .unwrap()
        .spawn()
        .0;
        handle.enable(true).await.unwrap();

        broker.publish(SOURCE, event("d1", dec!(20))).await;
        let state = wait_until(&handle, |s| s.executed_trades.len() == 1).await;
        let target_trade = state.executed_trades[0].target_trade_id.clone();
        broker.settle(&target_trade, dec!(-20)).unwrap();
        handle.settle(&target_trade, dec!(-20)).await.unwrap();

        let state = handle.get_state().await.unwrap();
        assert_eq!(state.daily_loss_accrued, dec!(20));
        let reset_before = state.last_reset_at;

        clock.advance(chrono::Duration::hours(25));
        let state = wait_until(&handle, |s| s.daily_loss_accrued.is_zero()).await;
        assert!(state.enabled);
        assert!(state.last_reset_at > reset_before);
        assert!(has_log(&state, LogLevel::Info, "New trading day"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_trades_expire_after_ttl() {
        let broker = broker(dec!(1000));
        let clock = Arc::new(ManualClock(Mutex::new(Utc::now())));
        let accounts = AccountPair::resolve(&broker.list_accounts()).unwrap();
        let handle = ReplicationController::new(
            accounts,
            config(true),
            ControllerSettings {
                pending_ttl: Some(Duration::from_secs(60)),
                ..settings()
            },
            deps(&broker, clock.clone()),
        )
        .unwrap()
        .spawn()
        .0;
        handle.enable(true).await.unwrap();

        broker.publish(SOURCE, event("d1", dec!(10))).await;
        wait_until(&handle, |s| s.pending_trades.len() == 1).await;

        clock.advance(chrono::Duration::seconds(120));
        let state = wait_until(&handle, |s| s.pending_trades.is_empty()).await;
        assert!(has_log(&state, LogLevel::Warning, "d1 expired"));
        assert!(state.enabled);
    }

    #[tokio::test]
    async fn test_journal_keeps_trades_idempotent_across_restarts() {
        let broker = broker(dec!(1000));
        let db = Database::new("sqlite::memory:").await.unwrap();

        let handle = controller(&broker, config(false), settings())
            .with_journal(db.clone())
            .spawn()
            .0;
        handle.enable(true).await.unwrap();
        broker.publish(SOURCE, event("d1", dec!(10))).await;
        wait_until(&handle, |s| s.executed_trades.len() == 1).await;
        handle.shutdown().await.unwrap();

        let mut restarted = controller(&broker, config(false), settings()).with_journal(db.clone());
        restarted.restore().await.unwrap();
        let handle = restarted.spawn().0;

        let state = handle.get_state().await.unwrap();
        assert!(!state.enabled);
        assert_eq!(state.executed_trades.len(), 1);

        handle.enable(true).await.unwrap();
        broker.publish(SOURCE, event("d1", dec!(10))).await;
        broker.publish(SOURCE, event("d2", dec!(10))).await;
        wait_until(&handle, |s| s.executed_trades.len() == 2).await;
        assert_eq!(broker.orders().len(), 2);

        let counts = db.outcome_counts().await.unwrap();
        assert_eq!(counts, vec![("executed".to_string(), 2)]);
    }
}
