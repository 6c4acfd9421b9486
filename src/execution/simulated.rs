//! In-memory venue for tests and bar replay
//!
//! `SimVenue` is a cheap-to-clone handle over shared state. The engine owns
//! one clone as its execution client, market data and time source; the
//! driver (a test or the replay command) keeps another to push bars, move
//! quotes and inspect what the engine did.
//!
//! Fills are optimistic: stop and limit entries fill at their order price,
//! protective stops and targets close at their level. When a bar touches
//! both the stop and the target, the stop wins.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::BrokerError;
use crate::types::{
    AccountState, Bar, LivePosition, OrderKind, OrderRequest, OrderSide, PendingOrder, SymbolSpec,
    Ticket,
};

use super::venue::{ExecResult, ExecutionClient, MarketData, TimeSource};

/// Venue rejected the request
pub const RETCODE_REJECTED: i32 = 10006;
/// Request referenced an unknown ticket
pub const RETCODE_INVALID: i32 = 10013;

/// Kinds of collaborator call, for the call log and scripted failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallKind {
    PlaceStop,
    PlaceLimit,
    Cancel,
    Close,
    Modify,
    QueryPositions,
    QueryOrders,
    QueryAccount,
    ClosedProfit,
}

impl CallKind {
    /// Whether the call changes venue state
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Self::PlaceStop | Self::PlaceLimit | Self::Cancel | Self::Close | Self::Modify
        )
    }
}

/// One logged collaborator call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VenueCall {
    pub kind: CallKind,
    pub ticket: Option<Ticket>,
}

/// A position the venue has closed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub ticket: Ticket,
    pub magic: u64,
    pub side: OrderSide,
    pub volume: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub profit: f64,
    pub closed_at: DateTime<Utc>,
}

#[derive(Debug)]
struct SimState {
    now: DateTime<Utc>,
    /// Oldest first
    bars: Vec<Bar>,
    bid: f64,
    ask: f64,
    spread: f64,
    spec: SymbolSpec,
    balance: f64,
    next_ticket: Ticket,
    positions: Vec<LivePosition>,
    orders: Vec<PendingOrder>,
    closed: Vec<ClosedTrade>,
    calls: Vec<VenueCall>,
    scripted_failures: HashMap<CallKind, u32>,
    /// Order filled while the next order query is in flight
    fill_on_order_query: Option<Ticket>,
}

impl SimState {
    fn record(&mut self, kind: CallKind, ticket: Option<Ticket>) -> ExecResult<()> {
        self.calls.push(VenueCall { kind, ticket });
        if let Some(remaining) = self.scripted_failures.get_mut(&kind) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BrokerError::new(
                    RETCODE_REJECTED,
                    format!("simulated {kind:?} rejection"),
                ));
            }
        }
        Ok(())
    }

    fn profit_at(&self, side: OrderSide, entry: f64, exit: f64, volume: f64) -> f64 {
        side.sign() * self.spec.price_to_pips(exit - entry) * self.spec.pip_value_per_lot * volume
    }

    fn exit_price(&self, side: OrderSide) -> f64 {
        match side {
            OrderSide::Buy => self.bid,
            OrderSide::Sell => self.ask,
        }
    }

    fn mark_to_market(&mut self) {
        let (bid, ask) = (self.bid, self.ask);
        let spec = self.spec;
        for pos in &mut self.positions {
            let exit = match pos.side {
                OrderSide::Buy => bid,
                OrderSide::Sell => ask,
            };
            let pips = spec.price_to_pips(exit - pos.entry_price);
            pos.profit = pos.side.sign() * pips * spec.pip_value_per_lot * pos.volume;
        }
    }

    fn place(&mut self, kind: OrderKind, request: &OrderRequest) -> Ticket {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.orders.push(PendingOrder {
            ticket,
            magic: request.magic,
            side: request.side,
            kind,
            price: request.price,
            volume: request.volume,
            stop_loss: request.stop_loss,
            take_profit: request.take_profit,
            placed_at: self.now,
        });
        ticket
    }

    /// Convert a working order into a position at its order price
    fn fill(&mut self, ticket: Ticket) -> bool {
        let Some(idx) = self.orders.iter().position(|o| o.ticket == ticket) else {
            return false;
        };
        let order = self.orders.remove(idx);
        debug!("SIM FILL: {} {} #{} @ {:.5}", order.side, order.kind, ticket, order.price);
        self.positions.push(LivePosition {
            ticket,
            magic: order.magic,
            side: order.side,
            volume: order.volume,
            entry_price: order.price,
            stop_loss: order.stop_loss,
            take_profit: order.take_profit,
            profit: 0.0,
            opened_at: self.now,
        });
        true
    }

    fn close(&mut self, ticket: Ticket, price: f64) -> Option<ClosedTrade> {
        let idx = self.positions.iter().position(|p| p.ticket == ticket)?;
        let pos = self.positions.remove(idx);
        let profit = self.profit_at(pos.side, pos.entry_price, price, pos.volume);
        self.balance += profit;
        debug!("SIM CLOSE: {} #{} @ {:.5} | P&L: {:+.2}", pos.side, ticket, price, profit);
        let trade = ClosedTrade {
            ticket,
            magic: pos.magic,
            side: pos.side,
            volume: pos.volume,
            entry_price: pos.entry_price,
            exit_price: price,
            profit,
            closed_at: self.now,
        };
        self.closed.push(trade.clone());
        Some(trade)
    }

    /// Trigger orders and protective levels touched by prices in [low, high]
    fn sweep(&mut self, low: f64, high: f64) {
        let triggered: Vec<Ticket> = self
            .orders
            .iter()
            .filter(|o| match (o.side, o.kind) {
                (OrderSide::Buy, OrderKind::Stop) | (OrderSide::Sell, OrderKind::Limit) => {
                    high >= o.price
                }
                (OrderSide::Buy, OrderKind::Limit) | (OrderSide::Sell, OrderKind::Stop) => {
                    low <= o.price
                }
            })
            .map(|o| o.ticket)
            .collect();
        for ticket in triggered {
            self.fill(ticket);
        }

        let exits: Vec<(Ticket, f64)> = self
            .positions
            .iter()
            .filter_map(|p| {
                let stop_hit = p.stop_loss > 0.0
                    && match p.side {
                        OrderSide::Buy => low <= p.stop_loss,
                        OrderSide::Sell => high >= p.stop_loss,
                    };
                let target_hit = p.take_profit > 0.0
                    && match p.side {
                        OrderSide::Buy => high >= p.take_profit,
                        OrderSide::Sell => low <= p.take_profit,
                    };
                if stop_hit {
                    Some((p.ticket, p.stop_loss))
                } else if target_hit {
                    Some((p.ticket, p.take_profit))
                } else {
                    None
                }
            })
            .collect();
        for (ticket, price) in exits {
            self.close(ticket, price);
        }
    }
}

/// Shared handle to the simulated venue
#[derive(Debug, Clone)]
pub struct SimVenue {
    inner: Arc<Mutex<SimState>>,
}

impl SimVenue {
    pub fn new(start: DateTime<Utc>, spec: SymbolSpec, balance: f64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimState {
                now: start,
                bars: Vec::new(),
                bid: 0.0,
                ask: 0.0,
                spread: spec.pip_size,
                spec,
                balance,
                next_ticket: 1000,
                positions: Vec::new(),
                orders: Vec::new(),
                closed: Vec::new(),
                calls: Vec::new(),
                scripted_failures: HashMap::new(),
                fill_on_order_query: None,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_time(&self, now: DateTime<Utc>) {
        self.state().now = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut state = self.state();
        state.now += by;
    }

    /// Spread applied to bar closes when deriving the ask
    pub fn set_spread(&self, spread: f64) {
        self.state().spread = spread.max(0.0);
    }

    /// Move the quote. Orders and protective levels touched by the new
    /// quote are executed.
    pub fn set_quote(&self, bid: f64, ask: f64) {
        let mut state = self.state();
        state.bid = bid;
        state.ask = ask;
        // Buy side executes at the ask, sell side at the bid
        let triggered: Vec<Ticket> = state
            .orders
            .iter()
            .filter(|o| match (o.side, o.kind) {
                (OrderSide::Buy, OrderKind::Stop) => ask >= o.price,
                (OrderSide::Buy, OrderKind::Limit) => ask <= o.price,
                (OrderSide::Sell, OrderKind::Stop) => bid <= o.price,
                (OrderSide::Sell, OrderKind::Limit) => bid >= o.price,
            })
            .map(|o| o.ticket)
            .collect();
        for ticket in triggered {
            state.fill(ticket);
        }

        let exits: Vec<(Ticket, f64)> = state
            .positions
            .iter()
            .filter_map(|p| {
                let price = state.exit_price(p.side);
                let stop_hit = p.stop_loss > 0.0 && p.side.sign() * (price - p.stop_loss) <= 0.0;
                let target_hit =
                    p.take_profit > 0.0 && p.side.sign() * (price - p.take_profit) >= 0.0;
                if stop_hit {
                    Some((p.ticket, p.stop_loss))
                } else if target_hit {
                    Some((p.ticket, p.take_profit))
                } else {
                    None
                }
            })
            .collect();
        for (ticket, price) in exits {
            state.close(ticket, price);
        }
        state.mark_to_market();
    }

    /// Append a bar, move time to its open and execute everything its
    /// high/low touched. The quote ends at the bar close.
    pub fn push_bar(&self, bar: Bar) {
        let mut state = self.state();
        state.now = bar.open_time;
        state.sweep(bar.low, bar.high);
        state.bid = bar.close;
        state.ask = bar.close + state.spread;
        state.bars.push(bar);
        state.mark_to_market();
    }

    /// Reject the next `count` calls of `kind`
    pub fn fail_next(&self, kind: CallKind, count: u32) {
        self.state().scripted_failures.insert(kind, count);
    }

    pub fn clear_failures(&self) {
        self.state().scripted_failures.clear();
    }

    /// Fill `ticket` inside the next order query, after positions were read
    pub fn fill_during_next_order_query(&self, ticket: Ticket) {
        self.state().fill_on_order_query = Some(ticket);
    }

    /// Fill a working order immediately at its price
    pub fn fill_order(&self, ticket: Ticket) -> bool {
        let mut state = self.state();
        let filled = state.fill(ticket);
        state.mark_to_market();
        filled
    }

    /// Close a position outside the engine (stop-out, manual close)
    pub fn close_externally(&self, ticket: Ticket, price: f64) -> Option<ClosedTrade> {
        self.state().close(ticket, price)
    }

    /// Seed a working order, as if left over from an earlier run
    pub fn inject_order(&self, request: &OrderRequest, kind: OrderKind) -> Ticket {
        self.state().place(kind, request)
    }

    /// Seed an open position, as if left over from an earlier run
    pub fn inject_position(&self, request: &OrderRequest, opened_at: DateTime<Utc>) -> Ticket {
        let mut state = self.state();
        let ticket = state.place(OrderKind::Stop, request);
        state.fill(ticket);
        if let Some(pos) = state.positions.iter_mut().find(|p| p.ticket == ticket) {
            pos.opened_at = opened_at;
        }
        state.mark_to_market();
        ticket
    }

    pub fn positions(&self) -> Vec<LivePosition> {
        self.state().positions.clone()
    }

    pub fn orders(&self) -> Vec<PendingOrder> {
        self.state().orders.clone()
    }

    pub fn closed_trades(&self) -> Vec<ClosedTrade> {
        self.state().closed.clone()
    }

    pub fn balance(&self) -> f64 {
        self.state().balance
    }

    pub fn calls(&self) -> Vec<VenueCall> {
        self.state().calls.clone()
    }

    /// Number of state-changing calls made so far
    pub fn mutating_call_count(&self) -> usize {
        self.state().calls.iter().filter(|c| c.kind.is_mutating()).count()
    }

    pub fn call_count(&self, kind: CallKind) -> usize {
        self.state().calls.iter().filter(|c| c.kind == kind).count()
    }

    pub fn bar_count(&self) -> usize {
        self.state().bars.len()
    }
}

impl ExecutionClient for SimVenue {
    fn place_stop_order(&mut self, request: &OrderRequest) -> ExecResult<Ticket> {
        let mut state = self.state();
        state.record(CallKind::PlaceStop, None)?;
        Ok(state.place(OrderKind::Stop, request))
    }

    fn place_limit_order(&mut self, request: &OrderRequest) -> ExecResult<Ticket> {
        let mut state = self.state();
        state.record(CallKind::PlaceLimit, None)?;
        Ok(state.place(OrderKind::Limit, request))
    }

    fn cancel_order(&mut self, ticket: Ticket) -> ExecResult<()> {
        let mut state = self.state();
        state.record(CallKind::Cancel, Some(ticket))?;
        let idx = state
            .orders
            .iter()
            .position(|o| o.ticket == ticket)
            .ok_or_else(|| {
                BrokerError::new(RETCODE_INVALID, format!("order #{ticket} not found"))
            })?;
        state.orders.remove(idx);
        Ok(())
    }

    fn close_position(&mut self, ticket: Ticket) -> ExecResult<()> {
        let mut state = self.state();
        state.record(CallKind::Close, Some(ticket))?;
        let side = state
            .positions
            .iter()
            .find(|p| p.ticket == ticket)
            .map(|p| p.side)
            .ok_or_else(|| {
                BrokerError::new(RETCODE_INVALID, format!("position #{ticket} not found"))
            })?;
        let price = state.exit_price(side);
        state.close(ticket, price);
        Ok(())
    }

    fn modify_position(
        &mut self,
        ticket: Ticket,
        stop_loss: f64,
        take_profit: f64,
    ) -> ExecResult<()> {
        let mut state = self.state();
        state.record(CallKind::Modify, Some(ticket))?;
        let pos = state
            .positions
            .iter_mut()
            .find(|p| p.ticket == ticket)
            .ok_or_else(|| {
                BrokerError::new(RETCODE_INVALID, format!("position #{ticket} not found"))
            })?;
        pos.stop_loss = stop_loss;
        pos.take_profit = take_profit;
        Ok(())
    }

    fn query_positions(&self, magic: u64) -> ExecResult<Vec<LivePosition>> {
        let mut state = self.state();
        state.record(CallKind::QueryPositions, None)?;
        Ok(state.positions.iter().filter(|p| p.magic == magic).cloned().collect())
    }

    fn query_pending_orders(&self, magic: u64) -> ExecResult<Vec<PendingOrder>> {
        let mut state = self.state();
        state.record(CallKind::QueryOrders, None)?;
        if let Some(ticket) = state.fill_on_order_query.take() {
            state.fill(ticket);
            state.mark_to_market();
        }
        Ok(state.orders.iter().filter(|o| o.magic == magic).cloned().collect())
    }

    fn query_account_state(&self) -> ExecResult<AccountState> {
        let mut state = self.state();
        state.record(CallKind::QueryAccount, None)?;
        let floating: f64 = state.positions.iter().map(|p| p.profit).sum();
        let margin_per_lot = state.spec.margin_per_lot;
        let margin: f64 = state.positions.iter().map(|p| p.volume * margin_per_lot).sum();
        let equity = state.balance + floating;
        Ok(AccountState {
            balance: state.balance,
            equity,
            free_margin: equity - margin,
        })
    }

    fn closed_profit_since(&self, magic: u64, since: DateTime<Utc>) -> ExecResult<f64> {
        let mut state = self.state();
        state.record(CallKind::ClosedProfit, None)?;
        Ok(state
            .closed
            .iter()
            .filter(|t| t.magic == magic && t.closed_at > since)
            .map(|t| t.profit)
            .sum())
    }
}

impl MarketData for SimVenue {
    fn bar(&self, index: usize) -> Option<Bar> {
        let state = self.state();
        let len = state.bars.len();
        if index >= len {
            return None;
        }
        state.bars.get(len - 1 - index).cloned()
    }

    fn bid(&self) -> f64 {
        self.state().bid
    }

    fn ask(&self) -> f64 {
        self.state().ask
    }

    fn symbol_spec(&self) -> SymbolSpec {
        self.state().spec
    }
}

impl TimeSource for SimVenue {
    fn now(&self) -> DateTime<Utc> {
        self.state().now
    }
}
