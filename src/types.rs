//! Shared market and account types exchanged with the collaborators

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Venue-assigned order or position ticket
pub type Ticket = u64;

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// +1.0 for buys, -1.0 for sells
    pub fn sign(&self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Pending order type used for breakout entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Stop,
    Limit,
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stop => write!(f, "STOP"),
            Self::Limit => write!(f, "LIMIT"),
        }
    }
}

/// OHLC price bar
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Account snapshot from the execution collaborator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    pub balance: f64,
    pub equity: f64,
    pub free_margin: f64,
}

/// Open position as reported by the venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivePosition {
    pub ticket: Ticket,
    /// Engine identifier the position is tagged with
    pub magic: u64,
    pub side: OrderSide,
    pub volume: f64,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Floating profit in account currency
    pub profit: f64,
    pub opened_at: DateTime<Utc>,
}

/// Working (untriggered) order as reported by the venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOrder {
    pub ticket: Ticket,
    pub magic: u64,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub price: f64,
    pub volume: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub placed_at: DateTime<Utc>,
}

/// Parameters for a new pending order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub side: OrderSide,
    pub volume: f64,
    pub price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub magic: u64,
    pub comment: String,
}

/// Instrument trading properties
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SymbolSpec {
    /// Price units per pip (EURUSD = 0.0001)
    pub pip_size: f64,
    /// Account currency value of one pip for one lot
    pub pip_value_per_lot: f64,
    pub lot_step: f64,
    pub min_lot: f64,
    pub max_lot: f64,
    /// Margin required per lot in account currency
    pub margin_per_lot: f64,
}

impl Default for SymbolSpec {
    fn default() -> Self {
        Self {
            pip_size: 0.0001,
            pip_value_per_lot: 10.0,
            lot_step: 0.01,
            min_lot: 0.01,
            max_lot: 100.0,
            margin_per_lot: 1_000.0, // 1:100 on a 100k contract
        }
    }
}

impl SymbolSpec {
    /// Convert a price distance to pips
    pub fn price_to_pips(&self, distance: f64) -> f64 {
        distance.abs() / self.pip_size
    }

    /// Convert pips to a price distance
    pub fn pips_to_price(&self, pips: f64) -> f64 {
        pips * self.pip_size
    }

    /// Round a volume down to the lot step. The small epsilon absorbs float
    /// noise such as 0.4999999 lots that should read 0.5.
    pub fn floor_to_step(&self, volume: f64) -> f64 {
        if self.lot_step <= 0.0 {
            return volume;
        }
        let steps = (volume / self.lot_step + 1e-6).floor();
        steps * self.lot_step
    }
}
