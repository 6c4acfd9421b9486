//! Execution module: order lifecycle and the per-tick engine
//!
//! The engine talks to the outside world only through the collaborator
//! traits in [`venue`]. [`simulated`] provides an in-memory implementation
//! used by tests and bar replay.

pub mod venue;
pub mod simulated;
mod config;
mod order;
mod position;
mod lifecycle;
mod engine;

pub use config::{EngineConfig, RestartPolicy};
pub use order::{LifecycleState, OrderLeg, OrderPair};
pub use position::{Position, RiskDistanceSource};
pub use lifecycle::{EntryPlan, FailureCounters, FlattenReport, LifecycleEvent, OrderLifecycle};
pub use engine::{BreakoutEngine, EngineEvent, EngineSnapshot, TickOutcome};
pub use venue::{
    DirectionalSignal, ExecutionClient, MarketData, StaticSignal, TimeSource, WallClock,
};
pub use simulated::SimVenue;
