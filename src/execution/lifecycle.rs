//! Order pair lifecycle
//!
//! ```text
//! Idle ── place_pair ──> PendingBothSides ── fill ──> OneSideTriggered
//!   ^                         │                           │
//!   │                     cutoff / flatten           position gone
//!   │                         v                           v
//!   └──── place_pair ───── Closed <─────────────────────────┘
//! ```
//!
//! Every venue call can fail. Failures are counted per action and logged;
//! the state is left so the same action is retried on the next tick.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::trading_core::risk::break_even_stop;
use crate::trading_core::{OpeningRange, RiskSizer};
use crate::types::{LivePosition, OrderKind, OrderRequest, OrderSide, PendingOrder, Ticket};

use super::order::{LifecycleState, OrderLeg, OrderPair};
use super::position::{Position, RiskDistanceSource};
use super::venue::{ExecutionClient, MarketData};

/// Venue call failures, per action kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCounters {
    pub placements: u32,
    pub cancels: u32,
    pub closes: u32,
    pub modifications: u32,
    pub queries: u32,
}

impl FailureCounters {
    pub fn total(&self) -> u32 {
        self.placements + self.cancels + self.closes + self.modifications + self.queries
    }
}

/// Entry levels and size for one pair. A side with no level is not placed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntryPlan {
    pub buy_level: Option<f64>,
    pub sell_level: Option<f64>,
    pub range_size: f64,
    pub size: f64,
}

impl EntryPlan {
    /// Both sides at the range edges pushed out by `offset` price units
    pub fn from_range(range: &OpeningRange, offset: f64, size: f64) -> Self {
        Self {
            buy_level: Some(range.high + offset),
            sell_level: Some(range.low - offset),
            range_size: range.size,
            size,
        }
    }
}

/// What changed during a lifecycle step
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// An entry filled and the engine now tracks the position
    Triggered {
        ticket: Ticket,
        side: OrderSide,
        entry_price: f64,
        stop_loss: f64,
    },
    /// The untriggered sibling was removed
    SiblingCancelled { ticket: Ticket },
    /// A position the engine tracked (or inferred) is gone
    TradeFinished { ticket: Option<Ticket> },
    /// Both entries disappeared without a position
    PairExpired,
}

/// Result of a flatten attempt
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlattenReport {
    /// Everything with the engine id is closed or cancelled
    pub flat: bool,
    pub closed_positions: Vec<Ticket>,
    pub cancelled_orders: Vec<Ticket>,
    /// No venue call was needed
    pub noop: bool,
}

/// Owns the engine's order pair and position
#[derive(Debug)]
pub struct OrderLifecycle {
    magic: u64,
    comment: String,
    state: LifecycleState,
    pair: Option<OrderPair>,
    position: Option<Position>,
    /// Orders that must still be cancelled (untriggered siblings)
    pending_cancels: Vec<Ticket>,
    failures: FailureCounters,
    pairs_placed: u32,
}

impl OrderLifecycle {
    pub fn new(magic: u64, comment: impl Into<String>) -> Self {
        Self {
            magic,
            comment: comment.into(),
            state: LifecycleState::Idle,
            pair: None,
            position: None,
            pending_cancels: Vec::new(),
            failures: FailureCounters::default(),
            pairs_placed: 0,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn pair(&self) -> Option<&OrderPair> {
        self.pair.as_ref()
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn failures(&self) -> &FailureCounters {
        &self.failures
    }

    pub fn pairs_placed(&self) -> u32 {
        self.pairs_placed
    }

    /// No order, position or cleanup outstanding
    pub fn is_flat(&self) -> bool {
        self.state.can_place()
            && self.pair.is_none()
            && self.position.is_none()
            && self.pending_cancels.is_empty()
    }

    /// Place the opposing breakout entries.
    ///
    /// Each side is a stop order while price still has to travel to the
    /// level, otherwise a limit order resting at the level. Returns false if
    /// nothing was placed; the lifecycle then stays where it was.
    pub fn place_pair<X: ExecutionClient, M: MarketData>(
        &mut self,
        exec: &mut X,
        market: &M,
        sizer: &RiskSizer,
        plan: &EntryPlan,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.is_flat() {
            debug!("place_pair ignored in state {}", self.state);
            return false;
        }

        let (bid, ask) = (market.bid(), market.ask());
        let mut pair = OrderPair::new(plan.size, now);

        let sides = [(OrderSide::Buy, plan.buy_level), (OrderSide::Sell, plan.sell_level)];
        for (side, level) in sides {
            let Some(level) = level else {
                continue;
            };
            let kind = match side {
                OrderSide::Buy if ask < level => OrderKind::Stop,
                OrderSide::Sell if bid > level => OrderKind::Stop,
                _ => OrderKind::Limit,
            };
            let stop_loss = sizer.stop_loss(level, plan.range_size, side);
            let take_profit = sizer.take_profit(level, stop_loss, side);
            let request = OrderRequest {
                side,
                volume: plan.size,
                price: level,
                stop_loss,
                take_profit,
                magic: self.magic,
                comment: self.comment.clone(),
            };

            let placed = match kind {
                OrderKind::Stop => exec.place_stop_order(&request),
                OrderKind::Limit => exec.place_limit_order(&request),
            };
            match placed {
                Ok(ticket) => {
                    info!(
                        "ORDER: {} {} #{} {:.2} lots @ {:.5} | Stop: {:.5} | Target: {:.5}",
                        side, kind, ticket, plan.size, level, stop_loss, take_profit
                    );
                    pair.set_leg(OrderLeg {
                        ticket,
                        side,
                        kind,
                        entry_price: level,
                        stop_loss,
                        take_profit,
                    });
                }
                Err(e) => {
                    self.failures.placements += 1;
                    warn!("{} {} placement @ {:.5} rejected: {}", side, kind, level, e);
                }
            }
        }

        if pair.is_empty() {
            return false;
        }
        self.pair = Some(pair);
        self.state = LifecycleState::PendingBothSides;
        self.pairs_placed += 1;
        true
    }

    /// Reconcile with the venue. Makes no mutating call when nothing changed.
    pub fn on_tick<X: ExecutionClient>(&mut self, exec: &mut X) -> Vec<LifecycleEvent> {
        let mut events = Vec::new();
        match self.state {
            LifecycleState::Idle | LifecycleState::Closed => {}
            LifecycleState::PendingBothSides => self.check_pending(exec, &mut events),
            LifecycleState::OneSideTriggered => self.check_triggered(exec, &mut events),
        }
        events
    }

    fn ours(&self, positions: Vec<LivePosition>) -> Vec<LivePosition> {
        positions.into_iter().filter(|p| p.magic == self.magic).collect()
    }

    fn query_positions<X: ExecutionClient>(&mut self, exec: &X) -> Option<Vec<LivePosition>> {
        match exec.query_positions(self.magic) {
            Ok(positions) => Some(self.ours(positions)),
            Err(e) => {
                self.failures.queries += 1;
                warn!("Position query failed: {}", e);
                None
            }
        }
    }

    fn query_orders<X: ExecutionClient>(&mut self, exec: &X) -> Option<Vec<PendingOrder>> {
        match exec.query_pending_orders(self.magic) {
            Ok(orders) => Some(orders.into_iter().filter(|o| o.magic == self.magic).collect()),
            Err(e) => {
                self.failures.queries += 1;
                warn!("Order query failed: {}", e);
                None
            }
        }
    }

    fn track(&mut self, live: &LivePosition, events: &mut Vec<LifecycleEvent>) {
        let position = Position::from_live(live);
        info!(
            "ENTRY: {} #{} {:.2} lots @ {:.5} | Stop: {:.5} | Target: {:.5}",
            position.side,
            position.ticket,
            position.volume,
            position.entry_price,
            position.stop_loss,
            position.take_profit
        );
        events.push(LifecycleEvent::Triggered {
            ticket: position.ticket,
            side: position.side,
            entry_price: position.entry_price,
            stop_loss: position.stop_loss,
        });
        self.position = Some(position);
        self.state = LifecycleState::OneSideTriggered;
    }

    /// A tagged position appeared: track it and cancel the other entry
    fn entry_filled<X: ExecutionClient>(
        &mut self,
        exec: &mut X,
        live: &LivePosition,
        events: &mut Vec<LifecycleEvent>,
    ) {
        self.track(live, events);
        let filled = live.ticket;
        let siblings: Vec<Ticket> = self
            .pair
            .iter()
            .flat_map(|p| p.tickets())
            .filter(|t| *t != filled)
            .collect();
        self.pending_cancels.extend(siblings);
        self.cancel_siblings(exec, events);
    }

    fn check_pending<X: ExecutionClient>(
        &mut self,
        exec: &mut X,
        events: &mut Vec<LifecycleEvent>,
    ) {
        let Some(positions) = self.query_positions(exec) else {
            return;
        };
        if let Some(live) = positions.first() {
            self.entry_filled(exec, live, events);
            return;
        }

        let Some(orders) = self.query_orders(exec) else {
            return;
        };
        let placed: Vec<Ticket> = self.pair.iter().flat_map(|p| p.tickets()).collect();
        let (working, missing): (Vec<Ticket>, Vec<Ticket>) =
            placed.into_iter().partition(|t| orders.iter().any(|o| o.ticket == *t));

        if missing.is_empty() {
            return;
        }

        // The entry may have filled after positions were read
        let Some(positions) = self.query_positions(exec) else {
            return;
        };
        if let Some(live) = positions.first() {
            self.entry_filled(exec, live, events);
            return;
        }

        if missing.len() == 1 {
            info!("Entry #{} filled and closed between ticks", missing[0]);
            events.push(LifecycleEvent::TradeFinished { ticket: None });
        } else {
            info!("Both entries gone without a position");
            events.push(LifecycleEvent::PairExpired);
        }
        self.pending_cancels.extend(working);
        self.state = LifecycleState::OneSideTriggered;
        self.cancel_siblings(exec, events);
        self.settle();
    }

    fn check_triggered<X: ExecutionClient>(
        &mut self,
        exec: &mut X,
        events: &mut Vec<LifecycleEvent>,
    ) {
        self.cancel_siblings(exec, events);

        let Some(positions) = self.query_positions(exec) else {
            return;
        };

        let tracked = self.position.as_ref().map(|p| p.ticket);
        match tracked.and_then(|t| positions.iter().find(|p| p.ticket == t)) {
            Some(live) => {
                if let Some(pos) = self.position.as_mut() {
                    pos.sync(live);
                }
            }
            None => {
                if let Some(old) = self.position.take() {
                    info!("EXIT: {} #{} closed", old.side, old.ticket);
                    events.push(LifecycleEvent::TradeFinished { ticket: Some(old.ticket) });
                }
                // A sibling that filled before its cancel went through
                if let Some(live) = positions.first() {
                    self.pending_cancels.retain(|t| *t != live.ticket);
                    self.track(live, events);
                }
            }
        }
        self.settle();
    }

    /// Try to cancel every outstanding sibling. A failed cancel whose order
    /// is no longer working counts as done.
    fn cancel_siblings<X: ExecutionClient>(
        &mut self,
        exec: &mut X,
        events: &mut Vec<LifecycleEvent>,
    ) {
        if self.pending_cancels.is_empty() {
            return;
        }
        let mut failed = Vec::new();
        for ticket in std::mem::take(&mut self.pending_cancels) {
            match exec.cancel_order(ticket) {
                Ok(()) => {
                    info!("Cancelled sibling #{}", ticket);
                    events.push(LifecycleEvent::SiblingCancelled { ticket });
                }
                Err(e) => {
                    self.failures.cancels += 1;
                    warn!("Cancel of sibling #{} failed: {}", ticket, e);
                    failed.push(ticket);
                }
            }
        }
        if failed.is_empty() {
            return;
        }
        if let Some(orders) = self.query_orders(exec) {
            failed.retain(|t| orders.iter().any(|o| o.ticket == *t));
        }
        self.pending_cancels = failed;
    }

    /// Move to Closed once nothing is outstanding
    fn settle(&mut self) {
        if self.state == LifecycleState::OneSideTriggered
            && self.position.is_none()
            && self.pending_cancels.is_empty()
        {
            self.state = LifecycleState::Closed;
            self.pair = None;
        }
    }

    /// Cancel untriggered entries (trading cutoff). An open position is left
    /// alone.
    pub fn cancel_pending<X: ExecutionClient>(&mut self, exec: &mut X) -> Vec<LifecycleEvent> {
        let mut events = Vec::new();
        match self.state {
            LifecycleState::PendingBothSides => {
                let Some(pair) = self.pair.as_mut() else {
                    return events;
                };
                let mut remaining = Vec::new();
                for leg in [pair.buy.take(), pair.sell.take()].into_iter().flatten() {
                    match exec.cancel_order(leg.ticket) {
                        Ok(()) => info!("Cancelled {} entry #{} at cutoff", leg.side, leg.ticket),
                        Err(e) => {
                            self.failures.cancels += 1;
                            warn!("Cutoff cancel of #{} failed: {}", leg.ticket, e);
                            remaining.push(leg);
                        }
                    }
                }
                for leg in remaining {
                    pair.set_leg(leg);
                }
                if pair.is_empty() {
                    self.pair = None;
                    self.state = LifecycleState::Closed;
                    events.push(LifecycleEvent::PairExpired);
                }
            }
            LifecycleState::OneSideTriggered => {
                self.cancel_siblings(exec, &mut events);
                self.settle();
            }
            LifecycleState::Idle | LifecycleState::Closed => {}
        }
        events
    }

    /// Close every position and cancel every order carrying the engine id.
    ///
    /// The venue is always queried, so positions the lifecycle lost track of
    /// are closed too. Makes no mutating call when nothing is open or
    /// working. If any call fails the lifecycle stays dirty and the next call
    /// retries.
    pub fn force_flatten<X: ExecutionClient>(&mut self, exec: &mut X) -> FlattenReport {
        let was_flat = self.is_flat();
        let mut report = FlattenReport::default();
        let mut clean = true;

        match self.query_positions(exec) {
            Some(positions) => {
                for live in positions {
                    match exec.close_position(live.ticket) {
                        Ok(()) => {
                            info!("FLATTEN: closed {} #{}", live.side, live.ticket);
                            report.closed_positions.push(live.ticket);
                            if self.position.as_ref().map(|p| p.ticket) == Some(live.ticket) {
                                self.position = None;
                            }
                        }
                        Err(e) => {
                            self.failures.closes += 1;
                            clean = false;
                            warn!("FLATTEN: close of #{} failed: {}", live.ticket, e);
                        }
                    }
                }
            }
            None => clean = false,
        }

        let mut uncancelled = Vec::new();
        match self.query_orders(exec) {
            Some(orders) => {
                for order in orders {
                    match exec.cancel_order(order.ticket) {
                        Ok(()) => {
                            info!(
                                "FLATTEN: cancelled {} {} #{}",
                                order.side, order.kind, order.ticket
                            );
                            report.cancelled_orders.push(order.ticket);
                        }
                        Err(e) => {
                            self.failures.cancels += 1;
                            clean = false;
                            warn!("FLATTEN: cancel of #{} failed: {}", order.ticket, e);
                            uncancelled.push(order.ticket);
                        }
                    }
                }
            }
            None => clean = false,
        }

        let touched = !report.closed_positions.is_empty() || !report.cancelled_orders.is_empty();
        if was_flat && touched {
            warn!(
                "FLATTEN: found {} untracked position(s) and {} order(s)",
                report.closed_positions.len(),
                report.cancelled_orders.len()
            );
        }

        if clean {
            if was_flat && !touched {
                report.flat = true;
                report.noop = true;
                return report;
            }
            self.state = LifecycleState::Closed;
            self.pair = None;
            self.position = None;
            self.pending_cancels.clear();
            report.flat = true;
        } else {
            // Stay dirty so on_tick and the next flatten keep working on it
            self.pending_cancels = uncancelled;
            self.state = LifecycleState::OneSideTriggered;
        }
        report
    }

    /// Ask the venue whether anything with the engine id is open or working.
    ///
    /// Returns true only when the lifecycle is flat and the venue agrees.
    /// Untracked positions or orders are adopted so the next ticks manage
    /// them; a failed query counts as not flat.
    pub fn confirm_flat<X: ExecutionClient>(&mut self, exec: &X) -> bool {
        if !self.is_flat() {
            return false;
        }
        let Some(positions) = self.query_positions(exec) else {
            return false;
        };
        let Some(orders) = self.query_orders(exec) else {
            return false;
        };
        if positions.is_empty() && orders.is_empty() {
            return true;
        }
        warn!(
            "Venue holds {} untracked position(s) and {} order(s) for id {}, adopting",
            positions.len(),
            orders.len(),
            self.magic
        );
        self.adopt(&positions, &orders);
        false
    }

    /// Move the stop to entry once unrealized R reaches the threshold.
    /// Returns the new stop when the venue accepted the change.
    pub fn apply_break_even<X: ExecutionClient, M: MarketData>(
        &mut self,
        exec: &mut X,
        market: &M,
        sizer: &RiskSizer,
        source: RiskDistanceSource,
    ) -> Option<f64> {
        let pos = self.position.as_ref()?;
        if pos.break_even_applied {
            return None;
        }
        let r = pos.unrealized_r(market.bid(), market.ask(), source)?;
        if !sizer.break_even_trigger(r) {
            return None;
        }
        let new_stop = pos.break_even_candidate()?;
        let (ticket, take_profit) = (pos.ticket, pos.take_profit);

        match exec.modify_position(ticket, new_stop, take_profit) {
            Ok(()) => {
                if let Some(pos) = self.position.as_mut() {
                    info!(
                        "BREAKEVEN: #{} stop {:.5} -> {:.5} at {:.2}R",
                        ticket, pos.stop_loss, new_stop, r
                    );
                    pos.stop_loss = new_stop;
                    pos.break_even_applied = true;
                }
                Some(new_stop)
            }
            Err(e) => {
                self.failures.modifications += 1;
                warn!("Break-even modify of #{} failed: {}", ticket, e);
                None
            }
        }
    }

    /// Rebuild state from live venue data after a restart
    pub fn adopt(&mut self, positions: &[LivePosition], orders: &[PendingOrder]) -> bool {
        let positions: Vec<&LivePosition> =
            positions.iter().filter(|p| p.magic == self.magic).collect();
        let orders: Vec<&PendingOrder> = orders.iter().filter(|o| o.magic == self.magic).collect();
        if positions.is_empty() && orders.is_empty() {
            return false;
        }

        if !orders.is_empty() {
            let mut pair = OrderPair::new(orders[0].volume, orders[0].placed_at);
            for order in &orders {
                if pair.leg(order.side).is_none() {
                    pair.set_leg(OrderLeg {
                        ticket: order.ticket,
                        side: order.side,
                        kind: order.kind,
                        entry_price: order.price,
                        stop_loss: order.stop_loss,
                        take_profit: order.take_profit,
                    });
                }
            }
            self.pair = Some(pair);
        }

        match positions.first() {
            Some(live) => {
                let mut position = Position::from_live(live);
                // Stop already at or through entry
                position.break_even_applied =
                    break_even_stop(live.entry_price, live.stop_loss, live.side).is_none();
                info!(
                    "ADOPT: {} #{} @ {:.5} | Stop: {:.5} | BE applied: {}",
                    position.side,
                    position.ticket,
                    position.entry_price,
                    position.stop_loss,
                    position.break_even_applied
                );
                self.position = Some(position);
                self.pending_cancels = orders.iter().map(|o| o.ticket).collect();
                self.state = LifecycleState::OneSideTriggered;
            }
            None => {
                info!("ADOPT: {} working order(s)", orders.len());
                self.state = LifecycleState::PendingBothSides;
            }
        }
        self.pairs_placed += 1;
        true
    }
}
