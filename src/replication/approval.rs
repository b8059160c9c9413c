//! Approval gate: FIFO queue of scaled trades waiting for an operator decision.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::models::PendingTrade;

#[derive(Debug, Default)]
pub struct ApprovalGate {
    queue: VecDeque<PendingTrade>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a trade. Never blocks; the caller moves on to the next event.
    pub fn enqueue(&mut self, trade: PendingTrade) {
        self.queue.push_back(trade);
    }

    /// Remove a trade for execution.
    pub fn approve(&mut self, source_trade_id: &str) -> Option<PendingTrade> {
        self.take(source_trade_id)
    }

    /// Remove a trade without executing it.
    pub fn reject(&mut self, source_trade_id: &str) -> Option<PendingTrade> {
        self.take(source_trade_id)
    }

    fn take(&mut self, source_trade_id: &str) -> Option<PendingTrade> {
        let idx = self
            .queue
            .iter()
            .position(|t| t.source_trade_id == source_trade_id)?;
        self.queue.remove(idx)
    }

    /// Remove every queued trade, oldest first.
    pub fn drain(&mut self) -> Vec<PendingTrade> {
        self.queue.drain(..).collect()
    }

    /// Remove trades queued longer than `ttl` before `now`.
    pub fn expire(&mut self, ttl: Duration, now: DateTime<Utc>) -> Vec<PendingTrade> {
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return Vec::new();
        };

        let (expired, kept): (Vec<_>, Vec<_>) = self
            .queue
            .drain(..)
            .partition(|t| now - t.queued_at >= ttl);
        self.queue = kept.into();
        expired
    }

    /// Snapshot of the queue in arrival order.
    pub fn pending(&self) -> Vec<PendingTrade> {
        self.queue.iter().cloned().collect()
    }
}
