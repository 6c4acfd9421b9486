//! Collaborator contracts consumed by the engine
//!
//! The engine never talks to a broker, a price feed, or an indicator
//! directly. It goes through these traits, so the same engine runs against
//! the simulated venue in tests and replay and against a live adapter.
//!
//! All calls are synchronous. A failed call is reported through
//! [`BrokerError`] and retried by the engine on a later tick.

use chrono::{DateTime, Utc};

use crate::error::BrokerError;
use crate::types::{AccountState, Bar, LivePosition, OrderRequest, PendingOrder, SymbolSpec, Ticket};

pub type ExecResult<T> = std::result::Result<T, BrokerError>;

/// Raw time source (venue/server time, expressed in UTC)
pub trait TimeSource {
    fn now(&self) -> DateTime<Utc>;
}

/// System wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct WallClock;

impl TimeSource for WallClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Order placement, cancellation and position queries
pub trait ExecutionClient {
    fn place_stop_order(&mut self, request: &OrderRequest) -> ExecResult<Ticket>;

    fn place_limit_order(&mut self, request: &OrderRequest) -> ExecResult<Ticket>;

    fn cancel_order(&mut self, ticket: Ticket) -> ExecResult<()>;

    fn close_position(&mut self, ticket: Ticket) -> ExecResult<()>;

    /// Replace stop-loss and take-profit on an open position
    fn modify_position(
        &mut self,
        ticket: Ticket,
        stop_loss: f64,
        take_profit: f64,
    ) -> ExecResult<()>;

    /// Open positions tagged with `magic`
    fn query_positions(&self, magic: u64) -> ExecResult<Vec<LivePosition>>;

    /// Working orders tagged with `magic`
    fn query_pending_orders(&self, magic: u64) -> ExecResult<Vec<PendingOrder>>;

    fn query_account_state(&self) -> ExecResult<AccountState>;

    /// Realized profit of `magic` positions closed strictly after `since`
    fn closed_profit_since(&self, magic: u64, since: DateTime<Utc>) -> ExecResult<f64>;
}

/// Prices and bars for the traded instrument
pub trait MarketData {
    /// Bar `index` positions back from the newest (0 = current bar)
    fn bar(&self, index: usize) -> Option<Bar>;

    fn bid(&self) -> f64;

    fn ask(&self) -> f64;

    /// Ask minus bid, in price units
    fn spread(&self) -> f64 {
        self.ask() - self.bid()
    }

    fn symbol_spec(&self) -> SymbolSpec;
}

/// Pre-computed trend direction
pub trait DirectionalSignal {
    /// False until the underlying indicator has warmed up
    fn is_ready(&self) -> bool;

    fn is_bullish(&self) -> bool;

    fn is_bearish(&self) -> bool;
}

/// Directional signal with fixed answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticSignal {
    pub ready: bool,
    pub bullish: bool,
    pub bearish: bool,
}

impl StaticSignal {
    /// Ready, no directional opinion
    pub fn neutral() -> Self {
        Self {
            ready: true,
            bullish: false,
            bearish: false,
        }
    }

    pub fn bullish() -> Self {
        Self {
            ready: true,
            bullish: true,
            bearish: false,
        }
    }

    pub fn bearish() -> Self {
        Self {
            ready: true,
            bullish: false,
            bearish: true,
        }
    }

    /// Not yet warmed up
    pub fn warming_up() -> Self {
        Self {
            ready: false,
            bullish: false,
            bearish: false,
        }
    }
}

impl DirectionalSignal for StaticSignal {
    fn is_ready(&self) -> bool {
        self.ready
    }

    fn is_bullish(&self) -> bool {
        self.bullish
    }

    fn is_bearish(&self) -> bool {
        self.bearish
    }
}
