//! Replication journal.
//!
//! Stores what the engine needs to resume after restart:
//! - Every decision taken per source trade id (idempotence across restarts)
//! - Daily loss accrual and the last reset time
//! - A copy of the operator log

use std::collections::HashSet;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::{ExecutedTrade, ReplicationLogEntry, SourceTradeEvent, TradeOutcome};

/// Database connection pool for the journal.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Stored replicated trade record. Decimals are kept as TEXT.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredTrade {
    pub source_trade_id: String,
    pub status: String,
    pub symbol: String,
    pub contract_type: String,
    pub source_size: String,
    pub scaled_size: Option<String>,
    pub target_trade_id: Option<String>,
    pub profit: Option<String>,
    pub detail: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct StateRow {
    enabled: bool,
    daily_loss_accrued: String,
    last_reset_at: String,
}

/// Persisted controller state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredState {
    pub enabled: bool,
    pub daily_loss_accrued: Decimal,
    pub last_reset_at: DateTime<Utc>,
}

/// Outcome details written with a trade decision.
#[derive(Debug, Clone, Default)]
pub struct OutcomeDetail<'a> {
    pub scaled_size: Option<Decimal>,
    pub target_trade_id: Option<&'a str>,
    pub detail: Option<&'a str>,
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        // Every connection to ":memory:" is a separate database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replicated_trades (
                source_trade_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                symbol TEXT NOT NULL,
                contract_type TEXT NOT NULL,
                source_size TEXT NOT NULL,
                scaled_size TEXT,
                target_trade_id TEXT,
                profit TEXT,
                detail TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replication_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                enabled INTEGER NOT NULL DEFAULT 0,
                daily_loss_accrued TEXT NOT NULL DEFAULT '0',
                last_reset_at TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replication_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_replicated_trades_target ON replicated_trades(target_trade_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Trades ====================

    /// Record the latest decision for a source trade. Later decisions
    /// overwrite earlier ones (pending -> executed).
    pub async fn record_outcome(
        &self,
        event: &SourceTradeEvent,
        outcome: TradeOutcome,
        detail: OutcomeDetail<'_>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO replicated_trades (
                source_trade_id, status, symbol, contract_type, source_size,
                scaled_size, target_trade_id, detail
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_trade_id) DO UPDATE SET
                status = excluded.status,
                scaled_size = COALESCE(excluded.scaled_size, replicated_trades.scaled_size),
                target_trade_id = COALESCE(excluded.target_trade_id, replicated_trades.target_trade_id),
                detail = excluded.detail,
                updated_at = datetime('now')
            "#,
        )
        .bind(&event.trade_id)
        .bind(outcome.as_str())
        .bind(&event.symbol)
        .bind(&event.contract_type)
        .bind(event.source_size.to_string())
        .bind(detail.scaled_size.map(|d| d.to_string()))
        .bind(detail.target_trade_id)
        .bind(detail.detail)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to record outcome for {}", event.trade_id))?;

        Ok(())
    }

    /// Store the realized profit of an executed trade.
    pub async fn settle_trade(&self, target_trade_id: &str, profit: Decimal) -> Result<()> {
        sqlx::query(
            "UPDATE replicated_trades SET profit = ?, updated_at = datetime('now') WHERE target_trade_id = ?",
        )
        .bind(profit.to_string())
        .bind(target_trade_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Every source trade id a decision has been recorded for.
    pub async fn seen_trade_ids(&self) -> Result<HashSet<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT source_trade_id FROM replicated_trades")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn get_trade(&self, source_trade_id: &str) -> Result<Option<StoredTrade>> {
        sqlx::query_as::<_, StoredTrade>("SELECT * FROM replicated_trades WHERE source_trade_id = ?")
            .bind(source_trade_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch trade")
    }

    /// Executed trades, oldest first, with any recorded profit applied.
    pub async fn executed_trades(&self) -> Result<Vec<ExecutedTrade>> {
        let rows = sqlx::query_as::<_, StoredTrade>(
            "SELECT * FROM replicated_trades WHERE status = 'executed' ORDER BY created_at, rowid",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch executed trades")?;

        rows.into_iter()
            .map(|row| {
                let scaled_size = parse_decimal(row.scaled_size.as_deref().unwrap_or("0"))?;
                let mut trade = ExecutedTrade::new(
                    row.source_trade_id,
                    row.target_trade_id.unwrap_or_default(),
                    scaled_size,
                );
                if let Ok(at) = parse_sqlite_time(&row.created_at) {
                    trade.executed_at = at;
                }
                if let Some(profit) = row.profit.as_deref() {
                    trade.settle(parse_decimal(profit)?);
                }
                Ok(trade)
            })
            .collect()
    }

    /// Mark trades left pending by a previous run as cancelled.
    pub async fn cancel_stale_pending(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE replicated_trades SET
                status = 'cancelled',
                detail = 'Pending when the previous session ended',
                updated_at = datetime('now')
            WHERE status = 'pending'
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Trade count per status.
    pub async fn outcome_counts(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM replicated_trades GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Sum of realized profit over settled trades.
    pub async fn total_profit(&self) -> Result<Decimal> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT profit FROM replicated_trades WHERE profit IS NOT NULL")
                .fetch_all(&self.pool)
                .await?;

        rows.iter()
            .try_fold(Decimal::ZERO, |acc, (p,)| Ok(acc + parse_decimal(p)?))
    }

    // ==================== State ====================

    pub async fn load_state(&self) -> Result<Option<StoredState>> {
        let row = sqlx::query_as::<_, StateRow>(
            "SELECT enabled, daily_loss_accrued, last_reset_at FROM replication_state WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load replication state")?;

        row.map(|r| {
            Ok(StoredState {
                enabled: r.enabled,
                daily_loss_accrued: parse_decimal(&r.daily_loss_accrued)?,
                last_reset_at: DateTime::parse_from_rfc3339(&r.last_reset_at)
                    .context("Invalid last_reset_at")?
                    .with_timezone(&Utc),
            })
        })
        .transpose()
    }

    pub async fn save_state(&self, state: &StoredState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO replication_state (id, enabled, daily_loss_accrued, last_reset_at, updated_at)
            VALUES (1, ?, ?, ?, datetime('now'))
            ON CONFLICT(id) DO UPDATE SET
                enabled = excluded.enabled,
                daily_loss_accrued = excluded.daily_loss_accrued,
                last_reset_at = excluded.last_reset_at,
                updated_at = datetime('now')
            "#,
        )
        .bind(state.enabled)
        .bind(state.daily_loss_accrued.to_string())
        .bind(state.last_reset_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Log ====================

    pub async fn append_log(&self, entries: &[ReplicationLogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for entry in entries {
            sqlx::query("INSERT INTO replication_log (timestamp, level, message) VALUES (?, ?, ?)")
                .bind(entry.timestamp.to_rfc3339())
                .bind(entry.level.as_str())
                .bind(&entry.message)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(())
    }

    /// Most recent log lines, newest first, as (timestamp, level, message).
    pub async fn recent_log(&self, limit: i64) -> Result<Vec<(String, String, String)>> {
        sqlx::query_as("SELECT timestamp, level, message FROM replication_log ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch replication log")
    }
}

fn parse_decimal(value: &str) -> Result<Decimal> {
    Decimal::from_str(value).with_context(|| format!("Invalid decimal in journal: {}", value))
}

/// SQLite `CURRENT_TIMESTAMP` is "YYYY-MM-DD HH:MM:SS" in UTC.
fn parse_sqlite_time(value: &str) -> Result<DateTime<Utc>> {
    let naive = chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .with_context(|| format!("Invalid timestamp in journal: {}", value))?;
    Ok(naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LogLevel;
    use rust_decimal_macros::dec;
    use tokio_test::assert_ok;

    fn event(id: &str) -> SourceTradeEvent {
        SourceTradeEvent {
            trade_id: id.to_string(),
            symbol: "R_100".to_string(),
            contract_type: "CALL".to_string(),
            source_size: dec!(25),
            timestamp: Utc::now(),
        }
    }

    async fn db() -> Database {
        Database::new("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_outcome_upsert_and_settlement() {
        let db = db().await;
        let e = event("d1");

        db.record_outcome(&e, TradeOutcome::Pending, OutcomeDetail {
            scaled_size: Some(dec!(12.5)),
            ..Default::default()
        })
        .await
        .unwrap();
        db.record_outcome(&e, TradeOutcome::Executed, OutcomeDetail {
            target_trade_id: Some("T1"),
            ..Default::default()
        })
        .await
        .unwrap();
        db.settle_trade("T1", dec!(-12.5)).await.unwrap();

        let stored = db.get_trade("d1").await.unwrap().unwrap();
        assert_eq!(stored.status, "executed");
        assert_eq!(stored.scaled_size.as_deref(), Some("12.5"));

        let executed = db.executed_trades().await.unwrap();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].target_trade_id, "T1");
        assert_eq!(executed[0].result_profit(), Some(dec!(-12.5)));
        assert_eq!(db.total_profit().await.unwrap(), dec!(-12.5));
    }

    #[tokio::test]
    async fn test_seen_ids_and_stale_pending() {
        let db = db().await;
        db.record_outcome(&event("a"), TradeOutcome::Pending, OutcomeDetail::default())
            .await
            .unwrap();
        db.record_outcome(&event("b"), TradeOutcome::Dropped, OutcomeDetail::default())
            .await
            .unwrap();

        let seen = db.seen_trade_ids().await.unwrap();
        assert!(seen.contains("a") && seen.contains("b"));

        assert_eq!(db.cancel_stale_pending().await.unwrap(), 1);
        let counts = db.outcome_counts().await.unwrap();
        assert_eq!(counts, vec![("cancelled".to_string(), 1), ("dropped".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_state_round_trip() {
        let db = db().await;
        assert!(db.load_state().await.unwrap().is_none());

        let state = StoredState {
            enabled: true,
            daily_loss_accrued: dec!(7.25),
            last_reset_at: DateTime::parse_from_rfc3339("2026-03-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };
        assert_ok!(db.save_state(&state).await);
        assert_eq!(assert_ok!(db.load_state().await), Some(state));
    }

    #[tokio::test]
    async fn test_log_append() {
        let db = db().await;
        let entries = vec![
            ReplicationLogEntry {
                timestamp: Utc::now(),
                level: LogLevel::Info,
                message: "Replication enabled".to_string(),
            },
            ReplicationLogEntry {
                timestamp: Utc::now(),
                level: LogLevel::Error,
                message: "Trade execution failed".to_string(),
            },
        ];
        db.append_log(&entries).await.unwrap();

        let recent = db.recent_log(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].1, "error");
    }
}
