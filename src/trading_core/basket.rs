//! Basket session: profit-target trading cycles
//!
//! A basket is one trading cycle. Its profit is the floating profit of the
//! engine's open positions plus the realized profit of positions closed since
//! the basket started. Reaching the basket target closes the basket (after the
//! engine flattens) and immediately opens a fresh one.
//!
//! Closed baskets roll into a bounded history and into lifetime aggregates.
//! Daily aggregates reset at day rollover; lifetime ones never do.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Result;
use crate::execution::venue::ExecutionClient;
use crate::types::AccountState;

use super::history::HistoryRing;

/// Profit target for a single basket
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BasketTarget {
    /// Fixed amount in account currency
    Fixed { amount: f64 },
    /// Percentage of the balance at basket start
    PercentOfBalance { percent: f64 },
}

impl BasketTarget {
    pub fn resolve(&self, start_balance: f64) -> f64 {
        match self {
            Self::Fixed { amount } => *amount,
            Self::PercentOfBalance { percent } => start_balance * percent / 100.0,
        }
    }

    pub fn is_positive(&self) -> bool {
        match self {
            Self::Fixed { amount } => *amount > 0.0,
            Self::PercentOfBalance { percent } => *percent > 0.0,
        }
    }
}

impl Default for BasketTarget {
    fn default() -> Self {
        Self::Fixed { amount: 10.0 }
    }
}

/// State of the active basket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasketState {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub start_balance: f64,
    pub start_equity: f64,
    pub target_profit: f64,
    pub current_profit: f64,
    pub trade_count: u32,
    pub peak_profit: f64,
    pub max_drawdown_from_peak: f64,
    pub is_active: bool,
}

/// Final classification of a closed basket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BasketOutcome {
    Win,
    Loss,
}

/// Archived basket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasketRecord {
    pub basket: BasketState,
    pub closed_at: DateTime<Utc>,
    pub outcome: BasketOutcome,
}

impl BasketRecord {
    pub fn profit(&self) -> f64 {
        self.basket.current_profit
    }
}

/// Per-day aggregates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyState {
    pub day: NaiveDate,
    pub cumulative_profit: f64,
    pub baskets_completed: u32,
    /// Zero disables the daily target
    pub daily_target: f64,
}

impl DailyState {
    pub fn new(day: NaiveDate, daily_target: f64) -> Self {
        Self {
            day,
            cumulative_profit: 0.0,
            baskets_completed: 0,
            daily_target,
        }
    }

    /// True once closed-basket profit for the day reaches a positive target
    pub fn target_reached(&self) -> bool {
        self.daily_target > 0.0 && self.cumulative_profit >= self.daily_target
    }
}

/// Aggregates across every basket the engine has closed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LifetimeStats {
    pub total_baskets: u32,
    pub profitable_baskets: u32,
    pub total_profit: f64,
    /// Best basket profit
    pub max_profit: f64,
    /// Worst basket profit (negative for a loss)
    pub max_loss: f64,
}

impl LifetimeStats {
    pub fn average_profit(&self) -> f64 {
        if self.total_baskets == 0 {
            0.0
        } else {
            self.total_profit / self.total_baskets as f64
        }
    }

    pub fn win_rate(&self) -> f64 {
        if self.total_baskets == 0 {
            0.0
        } else {
            self.profitable_baskets as f64 / self.total_baskets as f64
        }
    }

    fn record(&mut self, profit: f64) {
        self.total_baskets += 1;
        if profit > 0.0 {
            self.profitable_baskets += 1;
        }
        self.total_profit += profit;
        if self.total_baskets == 1 {
            self.max_profit = profit;
            self.max_loss = profit.min(0.0);
        } else {
            self.max_profit = self.max_profit.max(profit);
            self.max_loss = self.max_loss.min(profit);
        }
    }
}

/// Basket cycle controller
#[derive(Debug)]
pub struct BasketSession {
    magic: u64,
    target: BasketTarget,
    current: BasketState,
    daily: DailyState,
    lifetime: LifetimeStats,
    history: HistoryRing<BasketRecord>,
    sequence: u64,
}

impl BasketSession {
    /// Create the session and open its first basket
    pub fn new(
        magic: u64,
        target: BasketTarget,
        daily_target: f64,
        history_capacity: usize,
        account: &AccountState,
        now: DateTime<Utc>,
        day: NaiveDate,
    ) -> Self {
        let mut session = Self::idle(magic, target, daily_target, history_capacity, now, day);
        session.start_new_basket(account, now);
        session
    }

    /// Session with no active basket yet; `start_new_basket` opens the first
    pub fn idle(
        magic: u64,
        target: BasketTarget,
        daily_target: f64,
        history_capacity: usize,
        now: DateTime<Utc>,
        day: NaiveDate,
    ) -> Self {
        Self {
            magic,
            target,
            current: BasketState {
                id: String::new(),
                started_at: now,
                start_balance: 0.0,
                start_equity: 0.0,
                target_profit: 0.0,
                current_profit: 0.0,
                trade_count: 0,
                peak_profit: 0.0,
                max_drawdown_from_peak: 0.0,
                is_active: false,
            },
            daily: DailyState::new(day, daily_target),
            lifetime: LifetimeStats::default(),
            history: HistoryRing::new(history_capacity),
            sequence: 0,
        }
    }

    /// Snapshot the account and open a fresh basket
    pub fn start_new_basket(&mut self, account: &AccountState, now: DateTime<Utc>) -> &BasketState {
        self.sequence += 1;
        let id = format!("{}-{:04}", now.format("%Y%m%d%H%M%S"), self.sequence);
        let target_profit = self.target.resolve(account.balance);

        self.current = BasketState {
            id,
            started_at: now,
            start_balance: account.balance,
            start_equity: account.equity,
            target_profit,
            current_profit: 0.0,
            trade_count: 0,
            peak_profit: 0.0,
            max_drawdown_from_peak: 0.0,
            is_active: true,
        };

        info!(
            "BASKET START: {} | Balance: ${:.2} | Equity: ${:.2} | Target: ${:.2}",
            self.current.id, account.balance, account.equity, target_profit
        );
        &self.current
    }

    /// Refresh current profit from the execution collaborator.
    ///
    /// On a failed query the previous value is kept and the error returned.
    pub fn update_profit<X: ExecutionClient>(&mut self, exec: &X) -> Result<f64> {
        let floating: f64 = exec
            .query_positions(self.magic)?
            .iter()
            .filter(|p| p.magic == self.magic)
            .map(|p| p.profit)
            .sum();
        let realized = exec.closed_profit_since(self.magic, self.current.started_at)?;
        Ok(self.apply_profit(floating + realized))
    }

    /// Set current profit and update the peak and drawdown trackers
    pub fn apply_profit(&mut self, profit: f64) -> f64 {
        let basket = &mut self.current;
        basket.current_profit = profit;
        basket.peak_profit = basket.peak_profit.max(profit);
        let drawdown = basket.peak_profit - profit;
        if drawdown > basket.max_drawdown_from_peak {
            basket.max_drawdown_from_peak = drawdown;
        }
        profit
    }

    /// True iff current profit has reached the basket target
    pub fn check_target(&self) -> bool {
        self.current.is_active && self.current.current_profit >= self.current.target_profit
    }

    /// Count a finished trade against the active basket
    pub fn record_trade(&mut self) {
        self.current.trade_count += 1;
    }

    /// Archive the active basket and fold it into the aggregates
    pub fn close_basket(&mut self, now: DateTime<Utc>) -> BasketRecord {
        self.current.is_active = false;
        let profit = self.current.current_profit;
        let outcome = if profit > 0.0 {
            BasketOutcome::Win
        } else {
            BasketOutcome::Loss
        };

        let record = BasketRecord {
            basket: self.current.clone(),
            closed_at: now,
            outcome,
        };

        if let Some(evicted) = self.history.push(record.clone()) {
            warn!("Basket history full, evicted {}", evicted.basket.id);
        }
        self.lifetime.record(profit);
        self.daily.cumulative_profit += profit;
        self.daily.baskets_completed += 1;

        info!(
            "BASKET CLOSE: {} | P&L: ${:+.2} | Trades: {} | Peak: ${:.2} | DD: ${:.2} | {:?}",
            record.basket.id,
            profit,
            record.basket.trade_count,
            record.basket.peak_profit,
            record.basket.max_drawdown_from_peak,
            outcome
        );

        record
    }

    /// Reset daily aggregates. Lifetime aggregates and the active basket are
    /// untouched.
    pub fn on_day_rollover(&mut self, day: NaiveDate) {
        info!(
            "Daily reset {} -> {} | Day P&L: ${:+.2} over {} basket(s)",
            self.daily.day, day, self.daily.cumulative_profit, self.daily.baskets_completed
        );
        self.daily = DailyState::new(day, self.daily.daily_target);
    }

    /// Move the basket start back so realized profit from earlier trades is
    /// attributed to it (restart recovery)
    pub fn backdate_start(&mut self, started_at: DateTime<Utc>) {
        if started_at < self.current.started_at {
            self.current.started_at = started_at;
        }
    }

    pub fn current(&self) -> &BasketState {
        &self.current
    }

    pub fn daily(&self) -> &DailyState {
        &self.daily
    }

    pub fn lifetime(&self) -> &LifetimeStats {
        &self.lifetime
    }

    pub fn history(&self) -> &HistoryRing<BasketRecord> {
        &self.history
    }
}
