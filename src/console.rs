//! Operator console: line commands read from stdin while replication runs.

use std::future::Future;

use anyhow::{bail, Result};
use rust_decimal_macros::dec;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::info;

use crate::replication::{ConfigUpdate, ReplicationHandle, ReplicationState};

pub const HELP: &str = "\
Commands:
  enable              start replicating (asks for confirmation)
  confirm             confirm a pending enable
  disable             stop replicating and cancel pending trades
  pending             list trades awaiting approval
  approve <id>        execute a pending trade
  reject <id>         discard a pending trade
  status              show replication state
  sync                refresh the target balance
  reset-loss          clear the daily loss counter
  set <key> <value>   change a config value (e.g. set risk_percentage 3)
  help                show this help
  quit                stop and exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    Enable,
    Confirm,
    Disable,
    Pending,
    Approve(String),
    Reject(String),
    Status,
    Sync,
    ResetLoss,
    Set(ConfigUpdate),
    Help,
    Quit,
}

impl OperatorCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let Some(verb) = parts.next() else {
            bail!("Empty command");
        };
        let args: Vec<&str> = parts.collect();

        let command = match (verb.to_lowercase().as_str(), args.as_slice()) {
            ("enable", []) => Self::Enable,
            ("confirm", []) => Self::Confirm,
            ("disable", []) => Self::Disable,
            ("pending", []) => Self::Pending,
            ("approve", [id]) => Self::Approve(id.to_string()),
            ("reject", [id]) => Self::Reject(id.to_string()),
            ("status", []) => Self::Status,
            ("sync", []) => Self::Sync,
            ("reset-loss", []) => Self::ResetLoss,
            ("set", [key, value]) => Self::Set(ConfigUpdate::from_key_value(key, value)?),
            ("help", []) => Self::Help,
            ("quit" | "exit", []) => Self::Quit,
            (verb, _) => bail!("Unknown command or wrong arguments: '{}' (type 'help')", verb),
        };

        Ok(command)
    }
}

/// Operator console bound to a running controller.
pub struct Console {
    handle: ReplicationHandle,
    awaiting_confirmation: bool,
}

impl Console {
    pub fn new(handle: ReplicationHandle) -> Self {
        Self {
            handle,
            awaiting_confirmation: false,
        }
    }

    /// Read operator lines until `quit` or until `shutdown` resolves.
    ///
    /// Closed input (a detached process) stops reading but keeps waiting on
    /// `shutdown`, so replication is not torn down with stdin.
    pub async fn run_until<R, F>(&mut self, input: R, shutdown: F) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        F: Future<Output = ()>,
    {
        let mut lines = input.lines();
        let mut input_open = true;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => return Ok(()),
                line = lines.next_line(), if input_open => match line? {
                    Some(line) => match self.handle_line(&line).await {
                        Ok(true) => {}
                        Ok(false) => return Ok(()),
                        Err(e) => println!("Error: {}", e),
                    },
                    None => {
                        info!("Operator input closed, running until Ctrl+C");
                        input_open = false;
                    }
                },
            }
        }
    }

    /// Run one input line. Returns false when the operator asked to quit.
    pub async fn handle_line(&mut self, line: &str) -> Result<bool> {
        if line.trim().is_empty() {
            return Ok(true);
        }

        let command = OperatorCommand::parse(line)?;
        if command != OperatorCommand::Confirm {
            self.awaiting_confirmation = false;
        }

        match command {
            OperatorCommand::Enable => {
                let state = self.handle.get_state().await?;
                println!(
                    "Replication will place REAL trades on {} (balance ${:.2}).",
                    state.target_account, state.target_balance.balance
                );
                println!("Type 'confirm' to proceed.");
                self.awaiting_confirmation = true;
            }
            OperatorCommand::Confirm => {
                if !self.awaiting_confirmation {
                    bail!("Nothing to confirm; type 'enable' first");
                }
                self.awaiting_confirmation = false;
                self.handle.enable(true).await?;
            }
            OperatorCommand::Disable => self.handle.disable().await?,
            OperatorCommand::Pending => {
                print_pending(&self.handle.get_state().await?);
            }
            OperatorCommand::Approve(id) => {
                let trade = self.handle.approve(&id).await?;
                println!("Executed {} as {}", trade.source_trade_id, trade.target_trade_id);
            }
            OperatorCommand::Reject(id) => self.handle.reject(&id).await?,
            OperatorCommand::Status => print_state(&self.handle.get_state().await?),
            OperatorCommand::Sync => {
                let balance = self.handle.sync_balance().await?;
                println!("Target balance: ${:.2}", balance);
            }
            OperatorCommand::ResetLoss => self.handle.reset_daily_loss().await?,
            OperatorCommand::Set(update) => {
                let config = self.handle.update_config(update).await?;
                print_config(&config);
            }
            OperatorCommand::Help => println!("{}", HELP),
            OperatorCommand::Quit => return Ok(false),
        }

        Ok(true)
    }
}

pub fn print_state(state: &ReplicationState) {
    println!("\n=== Replication Status ===");
    println!("Replication:      {}", if state.enabled { "ENABLED" } else { "disabled" });
    println!("Source (demo):    {}", state.source_account);
    println!("Target (real):    {}", state.target_account);
    println!(
        "Target Balance:   ${:.2}{}",
        state.target_balance.balance,
        if state.target_balance.optimistic { " (pending sync)" } else { "" }
    );

    println!("\n=== Risk ===");
    println!(
        "Daily Loss:       ${:.2} of ${:.2}",
        state.daily_loss_accrued, state.daily_loss_limit
    );
    println!("Last Reset:       {}", state.last_reset_at.format("%Y-%m-%d %H:%M"));
    println!("Margin Check:     {}", state.margin_check.message);
    println!("Circuit Breaker:  {}", state.circuit_breaker.message);

    println!("\n=== Trades ===");
    println!("Pending:          {}", state.pending_trades.len());
    println!("Executed:         {}", state.executed_trades.len());
    let sign = if state.realized_pnl >= dec!(0) { "+" } else { "" };
    println!("Realized P/L:     {}${:.2}", sign, state.realized_pnl);

    if let Some(last) = state.logs.last() {
        println!("\nLast event:       [{}] {}", last.level, last.message);
    }
}

pub fn print_pending(state: &ReplicationState) {
    if state.pending_trades.is_empty() {
        println!("No trades awaiting approval.");
        return;
    }

    println!(
        "\n{:<16} {:<10} {:<8} {:>10} {:>10} {:>7}",
        "TRADE", "SYMBOL", "TYPE", "SOURCE", "SCALED", "RISK%"
    );
    println!("{}", "-".repeat(66));
    for trade in &state.pending_trades {
        println!(
            "{:<16} {:<10} {:<8} {:>10.2} {:>10.2} {:>6.2}%",
            trade.source_trade_id,
            trade.event.symbol,
            trade.event.contract_type,
            trade.event.source_size,
            trade.scaled_size,
            trade.risk_percentage
        );
    }
}

pub fn print_config(config: &crate::replication::ReplicationConfig) {
    println!("\n=== Replication Configuration ===\n");
    println!("Scaling:");
    println!("  Mode:                 {}", config.scaling_mode);
    println!("  Risk Per Trade:       {}%", config.risk_percentage);
    println!("  Max Trade Size:       ${}", config.max_trade_size);

    println!("\nMargin:");
    println!("  Asset Risk:           {}%", config.asset_risk_percentage);
    println!("  Buffer:               ${}", config.margin_buffer_absolute);

    println!("\nCircuit Breaker:");
    println!("  Min Balance:          ${}", config.min_balance_threshold);
    println!("  Daily Loss Limit:     {}%", config.daily_loss_limit_percentage);

    println!("\nApproval:");
    println!("  Require Approval:     {}", config.require_approval);
}
