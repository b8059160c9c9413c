//! Account model and the source/target account pair.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A broker account taking part in replication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Broker login id
    pub id: String,

    /// Virtual (demo) accounts are replication sources
    pub is_virtual: bool,

    /// Account currency code (e.g. "USD")
    pub currency: String,

    /// Last known balance
    #[serde(default)]
    pub balance: Decimal,
}

/// The two accounts replication runs between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountPair {
    /// Virtual account whose trades are observed
    pub source: Account,

    /// Real-money account trades are replicated into
    pub target: Account,
}

impl AccountPair {
    /// Build a pair, checking that source is virtual and target is real.
    pub fn new(source: Account, target: Account) -> Result<Self> {
        if !source.is_virtual {
            bail!("Source account {} is not a demo account", source.id);
        }
        if target.is_virtual {
            bail!("Target account {} is not a real account", target.id);
        }
        Ok(Self { source, target })
    }

    /// Pick the first demo and the first real account from an account list.
    pub fn resolve(accounts: &[Account]) -> Result<Self> {
        let source = accounts.iter().find(|a| a.is_virtual);
        let target = accounts.iter().find(|a| !a.is_virtual);

        match (source, target) {
            (Some(s), Some(t)) => Self::new(s.clone(), t.clone()),
            (None, _) => bail!("No demo account found"),
            (_, None) => bail!("No real account found"),
        }
    }
}

/// Versioned view of the target balance.
///
/// Updated last-write-wins by balance syncs and optimistically by executions.
/// Every write bumps `version`; version 0 means no balance has been seen yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BalanceSnapshot {
    pub balance: Decimal,
    pub version: u64,
    pub as_of: DateTime<Utc>,
    /// True when the value comes from a local execution rather than the broker
    pub optimistic: bool,
}

impl BalanceSnapshot {
    pub fn unknown() -> Self {
        Self {
            balance: Decimal::ZERO,
            version: 0,
            as_of: Utc::now(),
            optimistic: false,
        }
    }

    pub fn is_known(&self) -> bool {
        self.version > 0
    }

    /// Apply an authoritative balance from the broker.
    pub fn sync(&mut self, balance: Decimal) {
        self.balance = balance;
        self.version += 1;
        self.as_of = Utc::now();
        self.optimistic = false;
    }

    /// Apply a local, not yet reconciled, balance change.
    pub fn apply_local_debit(&mut self, amount: Decimal) {
        self.balance -= amount;
        self.version += 1;
        self.as_of = Utc::now();
        self.optimistic = true;
    }
}
