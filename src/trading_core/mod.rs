//! Trading Core - calculation components of the breakout engine
//!
//! This module contains the pieces that carry daily state:
//! - Session clock and phase partition
//! - Opening range measurement
//! - Risk sizing and break-even rules
//! - Profit-target basket cycling
//! - Bounded history buffer
//!
//! Nothing here places orders; the execution module drives these components.

pub mod clock;
pub mod range;
pub mod risk;
pub mod basket;
pub mod history;

// Re-export commonly used types
pub use clock::{SessionBoundaries, SessionPhase, TimeOfDay, TimezoneRule, TradingClock};
pub use range::{OpeningRange, RangeCalculator};
pub use risk::{RiskMethod, RiskParameters, RiskSizer, SizingResult};
pub use basket::{
    BasketOutcome, BasketRecord, BasketSession, BasketState, BasketTarget, DailyState,
    LifetimeStats,
};
pub use history::HistoryRing;
