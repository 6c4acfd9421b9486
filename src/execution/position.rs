//! Tracked position and break-even bookkeeping

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::trading_core::risk::{break_even_stop, unrealized_r};
use crate::types::{LivePosition, OrderSide, Ticket};

/// Where the break-even check reads the initial risk distance from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskDistanceSource {
    /// Distance captured when the position was first seen
    Cached,
    /// Distance between entry and the stop currently on the live position
    LiveScan,
}

impl Default for RiskDistanceSource {
    fn default() -> Self {
        Self::Cached
    }
}

/// The engine's view of its single open position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub ticket: Ticket,
    pub side: OrderSide,
    pub volume: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub opened_at: DateTime<Utc>,
    /// |entry - stop| when the position was first seen
    pub initial_risk_distance: f64,
    pub break_even_applied: bool,
}

impl Position {
    /// Capture a live position the first time the engine sees it
    pub fn from_live(live: &LivePosition) -> Self {
        let initial_risk_distance = if live.stop_loss > 0.0 {
            (live.entry_price - live.stop_loss).abs()
        } else {
            0.0
        };
        Self {
            ticket: live.ticket,
            side: live.side,
            volume: live.volume,
            entry_price: live.entry_price,
            stop_loss: live.stop_loss,
            take_profit: live.take_profit,
            opened_at: live.opened_at,
            initial_risk_distance,
            break_even_applied: false,
        }
    }

    /// Refresh the mutable fields from the venue
    pub fn sync(&mut self, live: &LivePosition) {
        self.stop_loss = live.stop_loss;
        self.take_profit = live.take_profit;
        self.volume = live.volume;
    }

    /// Risk distance the break-even rule should measure against
    pub fn risk_distance(&self, source: RiskDistanceSource) -> f64 {
        match source {
            RiskDistanceSource::Cached => self.initial_risk_distance,
            RiskDistanceSource::LiveScan => {
                if self.stop_loss > 0.0 {
                    (self.entry_price - self.stop_loss).abs()
                } else {
                    0.0
                }
            }
        }
    }

    /// Price the position would close at: bid for longs, ask for shorts
    pub fn exit_price(&self, bid: f64, ask: f64) -> f64 {
        match self.side {
            OrderSide::Buy => bid,
            OrderSide::Sell => ask,
        }
    }

    pub fn unrealized_r(&self, bid: f64, ask: f64, source: RiskDistanceSource) -> Option<f64> {
        unrealized_r(
            self.entry_price,
            self.exit_price(bid, ask),
            self.risk_distance(source),
            self.side,
        )
    }

    /// Break-even stop for this position, if not yet applied and it tightens
    pub fn break_even_candidate(&self) -> Option<f64> {
        if self.break_even_applied {
            return None;
        }
        break_even_stop(self.entry_price, self.stop_loss, self.side)
    }
}
