//! Trade Replicator
//!
//! Mirrors trades placed on a demo account onto a real-money account, with
//! balance-aware scaling, margin checks, a daily loss circuit breaker and
//! optional manual approval.

mod api;
mod console;
mod db;
mod error;
mod models;
mod replication;
mod simulate;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tokio::io::BufReader;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::{ConsoleNotifier, GatewayClient, GatewayFeed, SystemClock};
use crate::console::{print_config, print_state, Console, HELP};
use crate::db::Database;
use crate::models::AccountPair;
use crate::replication::{
    ControllerSettings, ReplicationConfig, ReplicationController, ReplicationDeps,
    ReplicationHandle,
};
use crate::simulate::{load_trades, SimulationConfig, Simulator};

/// Demo-to-real trade replicator CLI.
#[derive(Parser)]
#[command(name = "replicator")]
#[command(about = "Replicate trades from a demo account onto a real account", long_about = None)]
struct Cli {
    /// Journal database URL
    #[arg(short, long, env = "REPLICATOR_DATABASE", default_value = "sqlite:./replicator.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Replication config file (JSON); defaults apply to missing fields
    #[arg(short, long, env = "REPLICATOR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start replication against the broker gateway
    Run {
        /// Broker gateway base URL
        #[arg(long, env = "REPLICATOR_GATEWAY_URL")]
        gateway_url: String,

        /// Gateway API token
        #[arg(long, env = "REPLICATOR_API_TOKEN", hide_env_values = true)]
        api_token: String,

        /// Source trade polling interval in seconds
        #[arg(long, default_value = "5")]
        feed_interval: u64,

        /// Target balance refresh interval in seconds
        #[arg(long, default_value = "30")]
        balance_interval: u64,

        /// Order placement timeout in seconds
        #[arg(long, default_value = "10")]
        order_timeout: u64,

        /// Expire pending trades after this many seconds
        #[arg(long)]
        pending_ttl: Option<u64>,
    },

    /// Replay source trades from a JSON file against a paper broker
    Simulate {
        /// JSON array of trades: trade_id, size, optional symbol, contract_type, profit, approve
        #[arg(short, long)]
        trades: PathBuf,

        /// Starting balance of the simulated real account
        #[arg(short, long, default_value = "1000")]
        balance: Decimal,
    },

    /// Show the effective replication configuration
    Config,

    /// Show journal statistics
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            gateway_url,
            api_token,
            feed_interval,
            balance_interval,
            order_timeout,
            pending_ttl,
        } => {
            let client = Arc::new(GatewayClient::new(gateway_url, api_token)?);
            let accounts = client
                .list_accounts()
                .await
                .context("Failed to fetch accounts")?;
            let pair = AccountPair::resolve(&accounts)?;

            info!(
                source = %pair.source.id,
                target = %pair.target.id,
                "Resolved account pair"
            );

            let settings = ControllerSettings {
                order_timeout: Duration::from_secs(order_timeout),
                balance_poll_interval: Duration::from_secs(balance_interval),
                pending_ttl: pending_ttl.map(Duration::from_secs),
                ..Default::default()
            };
            let deps = ReplicationDeps {
                feed: Arc::new(GatewayFeed::new(
                    client.clone(),
                    Duration::from_secs(feed_interval),
                )),
                balances: client.clone(),
                orders: client.clone(),
                notifier: Arc::new(ConsoleNotifier),
                clock: Arc::new(SystemClock),
            };

            let db = Database::new(&cli.database).await?;
            let mut controller = ReplicationController::new(pair.clone(), config, settings, deps)?
                .with_journal(db);
            controller.restore().await?;
            let (handle, task) = controller.spawn();

            let settlements = tokio::spawn(poll_settlements(
                client.clone(),
                handle.clone(),
                pair.target.id.clone(),
                Duration::from_secs(balance_interval),
            ));

            println!("\n=== Trade Replicator ===");
            println!("Source (demo):  {} ({})", pair.source.id, pair.source.currency);
            println!("Target (real):  {} ({})", pair.target.id, pair.target.currency);
            println!("Replication starts disabled. Type 'enable' to begin.");
            println!("\n{}\n\nPress Ctrl+C to stop.\n", HELP);

            let mut console = Console::new(handle.clone());
            console
                .run_until(BufReader::new(tokio::io::stdin()), async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        warn!(error = %e, "Failed to listen for Ctrl+C");
                        std::future::pending::<()>().await;
                    }
                    println!("\nStopping replication...");
                })
                .await?;

            settlements.abort();
            if let Ok(state) = handle.get_state().await {
                print_state(&state);
            }
            handle.shutdown().await?;
            task.await.context("Replication controller panicked")?;
        }

        Commands::Simulate { trades, balance } => {
            let trades = load_trades(&trades)?;
            info!(count = trades.len(), balance = %balance, "Starting simulation");

            let simulator = Simulator::new(SimulationConfig {
                target_balance: balance,
                replication: config,
                ..Default::default()
            });
            let report = simulator.run(&trades).await?;
            println!("{}", report);
        }

        Commands::Config => {
            print_config(&config);
            println!("\n=== Runtime Defaults ===\n");
            let settings = ControllerSettings::default();
            println!("  Order Timeout:        {}s", settings.order_timeout.as_secs());
            println!("  Balance Refresh:      {}s", settings.balance_poll_interval.as_secs());
            println!("  Feed Channel:         {}", settings.feed_channel_capacity);
            println!(
                "  Pending Trade TTL:    {}",
                settings
                    .pending_ttl
                    .map(|t| format!("{}s", t.as_secs()))
                    .unwrap_or_else(|| "never".to_string())
            );
        }

        Commands::Status => {
            let db = Database::new(&cli.database).await?;

            let state = match db.load_state().await? {
                Some(state) => state,
                None => {
                    println!("No replication session found. Run 'replicator run' to start.");
                    return Ok(());
                }
            };
            let counts = db.outcome_counts().await?;
            let total_profit = db.total_profit().await?;
            let recent = db.recent_log(10).await?;

            println!("\n=== Replication Status ===");
            println!("Enabled at Exit:  {}", if state.enabled { "Yes" } else { "No" });
            println!("Daily Loss:       ${:.2}", state.daily_loss_accrued);
            println!("Last Reset:       {}", state.last_reset_at.format("%Y-%m-%d %H:%M"));

            println!("\n=== Trades ===");
            if counts.is_empty() {
                println!("No trades recorded.");
            }
            for (status, count) in &counts {
                println!("{:<17} {}", format!("{}:", capitalize(status)), count);
            }
            let sign = if total_profit >= Decimal::ZERO { "+" } else { "" };
            println!("Realized P/L:     {}${:.2}", sign, total_profit);

            if !recent.is_empty() {
                println!("\n=== Recent Log ===");
                for (timestamp, level, message) in recent.iter().rev() {
                    println!("  {} [{}] {}", timestamp.get(..19).unwrap_or(timestamp), level, message);
                }
            }
        }
    }

    Ok(())
}

/// Load the replication config from a JSON file, or defaults.
fn load_config(path: Option<&Path>) -> Result<ReplicationConfig> {
    let Some(path) = path else {
        return Ok(ReplicationConfig::default());
    };

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config: ReplicationConfig = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse config {}", path.display()))?;
    config.validate()?;

    Ok(config)
}

/// Feed realized results of replicated trades back into the controller.
async fn poll_settlements(
    client: Arc<GatewayClient>,
    handle: ReplicationHandle,
    account_id: String,
    every: Duration,
) {
    let mut ticker = tokio::time::interval(every);

    loop {
        ticker.tick().await;

        let Ok(state) = handle.get_state().await else {
            return;
        };
        if state.executed_trades.iter().all(|t| t.is_settled()) {
            continue;
        }

        let settlements = match client.get_settlements(&account_id).await {
            Ok(settlements) => settlements,
            Err(e) => {
                warn!(error = %e, "Failed to fetch settlements");
                continue;
            }
        };

        for trade in state.executed_trades.iter().filter(|t| !t.is_settled()) {
            let Some(settlement) = settlements
                .iter()
                .find(|s| s.transaction_id == trade.target_trade_id)
            else {
                continue;
            };

            if let Err(e) = handle.settle(&trade.target_trade_id, settlement.profit).await {
                debug!(trade = %trade.target_trade_id, error = %e, "Settlement not applied");
            }
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

