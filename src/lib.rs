// Library crate - exports the breakout engine and its collaborators

pub mod error;
pub mod types;
pub mod trading_core;
pub mod execution;

// Re-export commonly used types
pub use error::{BrokerError, EngineError, Result};
pub use types::*;
pub use execution::{BreakoutEngine, EngineConfig, EngineEvent, TickOutcome};
