//! Breakout engine - drives every component once per tick

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::trading_core::{
    BasketRecord, BasketSession, BasketState, DailyState, LifetimeStats, OpeningRange,
    RangeCalculator, RiskSizer, SessionPhase, TradingClock,
};
use crate::types::{AccountState, OrderSide, Ticket};

use super::config::{EngineConfig, RestartPolicy};
use super::lifecycle::{EntryPlan, FailureCounters, FlattenReport, LifecycleEvent, OrderLifecycle};
use super::order::{LifecycleState, OrderPair};
use super::position::Position;
use super::venue::{DirectionalSignal, ExecutionClient, MarketData, TimeSource};

/// Events emitted by the breakout engine
#[derive(Debug, Clone)]
pub enum EngineEvent {
    PhaseChanged {
        from: SessionPhase,
        to: SessionPhase,
    },
    DayRollover {
        day: NaiveDate,
    },
    /// Range over the part of the window seen so far
    RangeForming {
        high: f64,
        low: f64,
        bars: usize,
    },
    RangeCommitted {
        range: OpeningRange,
    },
    RangeFailed {
        reason: String,
    },
    PairPlaced {
        pair_id: Uuid,
        buy_level: Option<f64>,
        sell_level: Option<f64>,
        size: f64,
    },
    PositionOpened {
        ticket: Ticket,
        side: OrderSide,
        entry_price: f64,
        stop_loss: f64,
    },
    SiblingCancelled {
        ticket: Ticket,
    },
    TradeFinished {
        ticket: Option<Ticket>,
    },
    PairExpired,
    BreakEvenApplied {
        ticket: Ticket,
        stop_loss: f64,
    },
    BasketTargetHit {
        basket_id: String,
        profit: f64,
    },
    BasketClosed {
        record: BasketRecord,
    },
    BasketStarted {
        basket_id: String,
        target: f64,
    },
    DailyTargetReached {
        profit: f64,
    },
    Flattened {
        reason: String,
        closed: usize,
        cancelled: usize,
    },
}

/// What a tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Directional signal not warmed up; only the forced exit was honoured
    DataNotReady { phase: SessionPhase },
    /// Venue state not adopted yet; only the forced exit was honoured
    Reconciling { phase: SessionPhase },
    Processed { phase: SessionPhase },
}

/// Point-in-time view of the engine for renderers and the CLI
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub instrument: String,
    pub engine_id: u64,
    pub local_time: NaiveDateTime,
    pub phase: SessionPhase,
    pub lifecycle: LifecycleState,
    pub range: Option<OpeningRange>,
    pub forming_range: Option<OpeningRange>,
    pub pair: Option<OrderPair>,
    pub position: Option<Position>,
    pub basket: BasketState,
    pub daily: DailyState,
    pub lifetime: LifetimeStats,
    pub history: Vec<BasketRecord>,
    pub failures: FailureCounters,
    pub pairs_today: u32,
    pub ticks: u64,
}

/// Breakout engine for one (instrument, engine id)
pub struct BreakoutEngine<X, M, S, T>
where
    X: ExecutionClient,
    M: MarketData,
    S: DirectionalSignal,
    T: TimeSource,
{
    config: EngineConfig,
    exec: X,
    market: M,
    signal: S,
    clock: TradingClock<T>,
    range_calc: RangeCalculator,
    sizer: RiskSizer,
    lifecycle: OrderLifecycle,
    basket: BasketSession,
    committed_range: Option<OpeningRange>,
    forming_range: Option<OpeningRange>,
    last_phase: SessionPhase,
    pairs_today: u32,
    /// Basket target hit; flatten then roll over
    rollover_pending: bool,
    /// Startup flatten under FreshBasket still outstanding
    restart_flatten_pending: bool,
    /// Live venue state adopted and first basket opened
    reconciled: bool,
    daily_target_announced: bool,
    /// Engine-level query failures (account state, profit)
    query_failures: u32,
    ticks: u64,
    event_tx: broadcast::Sender<EngineEvent>,
}

impl<X, M, S, T> BreakoutEngine<X, M, S, T>
where
    X: ExecutionClient,
    M: MarketData,
    S: DirectionalSignal,
    T: TimeSource,
{
    /// Validate the config, reconcile with the venue and open the first basket.
    ///
    /// Only configuration errors fail construction. If the venue cannot be
    /// queried yet, reconciliation is retried at the start of each tick.
    pub fn new(config: EngineConfig, exec: X, market: M, signal: S, time: T) -> Result<Self> {
        config.validate()?;
        let mut clock = TradingClock::new(time, config.timezone, config.session)?;
        clock.detect_day_rollover();
        let sizer = RiskSizer::new(config.risk)?;
        let spec = market.symbol_spec();
        let range_calc =
            RangeCalculator::new(spec.pips_to_price(config.min_range_pips), config.max_range_bars);
        let comment = format!("{}-{}", config.instrument, config.engine_id);
        let lifecycle = OrderLifecycle::new(config.engine_id, comment);
        let basket = BasketSession::idle(
            config.engine_id,
            config.basket_target,
            config.daily_target,
            config.history_capacity,
            clock.now_utc(),
            clock.today(),
        );

        let (event_tx, _) = broadcast::channel(1000);
        let last_phase = clock.phase();

        let mut engine = Self {
            config,
            exec,
            market,
            signal,
            clock,
            range_calc,
            sizer,
            lifecycle,
            basket,
            committed_range: None,
            forming_range: None,
            last_phase,
            pairs_today: 0,
            rollover_pending: false,
            restart_flatten_pending: false,
            reconciled: false,
            daily_target_announced: false,
            query_failures: 0,
            ticks: 0,
            event_tx,
        };
        engine.reconciled = engine.reconcile();
        Ok(engine)
    }

    /// Adopt live positions and orders under the restart policy and open the
    /// first basket. Returns false, with nothing changed, if a venue query
    /// fails.
    fn reconcile(&mut self) -> bool {
        let magic = self.config.engine_id;
        let queried = self.exec.query_positions(magic).and_then(|positions| {
            let orders = self.exec.query_pending_orders(magic)?;
            let account = self.exec.query_account_state()?;
            Ok((positions, orders, account))
        });
        let (positions, orders, mut account) = match queried {
            Ok(live) => live,
            Err(e) => {
                self.query_failures += 1;
                warn!("Startup reconciliation failed, retrying next tick: {}", e);
                return false;
            }
        };

        let policy = self.config.restart_policy;
        let adopted = self.lifecycle.adopt(&positions, &orders);
        if adopted && policy == RestartPolicy::FreshBasket {
            info!(
                "Restart policy {}: flattening {} position(s) and {} order(s)",
                policy,
                positions.len(),
                orders.len()
            );
            self.restart_flatten_pending = !self.lifecycle.force_flatten(&mut self.exec).flat;
            match self.exec.query_account_state() {
                Ok(after) => account = after,
                Err(e) => {
                    self.query_failures += 1;
                    warn!(
                        "Account query after restart flatten failed, using earlier snapshot: {}",
                        e
                    );
                }
            }
        }

        let now = self.clock.now_utc();
        self.start_basket(&account, now);

        if adopted && policy == RestartPolicy::RecoverFromLive {
            let earliest = positions
                .iter()
                .filter(|p| p.magic == magic)
                .map(|p| p.opened_at)
                .min();
            if let Some(earliest) = earliest {
                self.basket.backdate_start(earliest - chrono::Duration::seconds(1));
            }
            self.pairs_today = 1;
            info!("Restart policy {}: resumed in state {}", policy, self.lifecycle.state());
        }

        info!(
            "Engine ready: {} id={} tz={} phase={} | Balance: ${:.2}",
            self.config.instrument,
            magic,
            self.config.timezone,
            self.clock.phase(),
            account.balance
        );
        true
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Run one tick. Steps always execute in the same order.
    pub fn on_tick(&mut self) -> TickOutcome {
        self.ticks += 1;

        // 1. Clock and day rollover
        self.clock.update();
        if self.clock.detect_day_rollover() {
            self.on_new_day(self.clock.today());
        }
        let phase = self.clock.phase();
        if phase != self.last_phase {
            info!("PHASE: {} -> {} at {}", self.last_phase, phase, self.clock.local_time());
            self.emit(EngineEvent::PhaseChanged {
                from: self.last_phase,
                to: phase,
            });
            self.last_phase = phase;
        }

        if !self.reconciled {
            self.reconciled = self.reconcile();
            if !self.reconciled {
                if phase == SessionPhase::ForcedExit {
                    self.forced_exit();
                }
                return TickOutcome::Reconciling { phase };
            }
        }

        // 2. Directional feed
        if !self.signal.is_ready() {
            debug!("Directional signal not ready, skipping tick");
            if phase == SessionPhase::ForcedExit {
                self.forced_exit();
            }
            return TickOutcome::DataNotReady { phase };
        }

        let events = self.lifecycle.on_tick(&mut self.exec);
        self.handle_lifecycle_events(events);

        // 3. Range
        match phase {
            SessionPhase::InRange => self.refresh_forming_range(),
            SessionPhase::PostRangeTrading if self.committed_range.is_none() => self.commit_range(),
            _ => {}
        }

        // 4. Placement
        if phase == SessionPhase::PostRangeTrading {
            self.try_place_pair();
        }

        // 5. Break-even
        if self.lifecycle.position().is_some() {
            let applied = self.lifecycle.apply_break_even(
                &mut self.exec,
                &self.market,
                &self.sizer,
                self.config.break_even_mode,
            );
            if let (Some(stop_loss), Some(pos)) = (applied, self.lifecycle.position()) {
                self.emit(EngineEvent::BreakEvenApplied {
                    ticket: pos.ticket,
                    stop_loss,
                });
            }
        }

        // 6. Basket profit and rollover
        self.manage_basket();

        // 7. Forced exit
        if phase == SessionPhase::ForcedExit {
            self.forced_exit();
        }

        // 8. Cutoff
        if phase.is_past_cutoff() {
            self.cutoff();
        }

        TickOutcome::Processed { phase }
    }

    fn on_new_day(&mut self, day: NaiveDate) {
        info!("NEW DAY: {} | Lifetime baskets: {}", day, self.basket.lifetime().total_baskets);
        self.basket.on_day_rollover(day);
        self.committed_range = None;
        self.forming_range = None;
        self.pairs_today = 0;
        self.daily_target_announced = false;
        self.emit(EngineEvent::DayRollover { day });
    }

    fn handle_lifecycle_events(&mut self, events: Vec<LifecycleEvent>) {
        for event in events {
            let event = match event {
                LifecycleEvent::Triggered {
                    ticket,
                    side,
                    entry_price,
                    stop_loss,
                } => EngineEvent::PositionOpened {
                    ticket,
                    side,
                    entry_price,
                    stop_loss,
                },
                LifecycleEvent::SiblingCancelled { ticket } => {
                    EngineEvent::SiblingCancelled { ticket }
                }
                LifecycleEvent::TradeFinished { ticket } => {
                    self.basket.record_trade();
                    EngineEvent::TradeFinished { ticket }
                }
                LifecycleEvent::PairExpired => EngineEvent::PairExpired,
            };
            self.emit(event);
        }
    }

    fn refresh_forming_range(&mut self) {
        let today = self.clock.today();
        let (start, _) = self.clock.range_window(today);
        let now = self.clock.now_utc();
        match self.range_calc.calculate(&self.market, start, now, today) {
            Ok(range) => {
                let changed = self
                    .forming_range
                    .map_or(true, |r| r.high != range.high || r.low != range.low);
                if changed {
                    debug!(
                        "Range forming: {:.5} - {:.5} ({} bars)",
                        range.high, range.low, range.bar_count
                    );
                    self.emit(EngineEvent::RangeForming {
                        high: range.high,
                        low: range.low,
                        bars: range.bar_count,
                    });
                }
                self.forming_range = Some(range);
            }
            Err(e) => debug!("Range not measurable yet: {}", e),
        }
    }

    fn commit_range(&mut self) {
        let today = self.clock.today();
        let (start, end) = self.clock.range_window(today);
        match self.range_calc.calculate(&self.market, start, end, today) {
            Ok(range) => {
                info!(
                    "RANGE: {} High: {:.5} | Low: {:.5} | Size: {:.1} pips{}",
                    today,
                    range.high,
                    range.low,
                    self.market.symbol_spec().price_to_pips(range.size),
                    if range.expanded { " (floored)" } else { "" }
                );
                self.committed_range = Some(range);
                self.forming_range = None;
                self.emit(EngineEvent::RangeCommitted { range });
            }
            Err(e) => {
                warn!("Range calculation failed, retrying next tick: {}", e);
                self.emit(EngineEvent::RangeFailed { reason: e.to_string() });
            }
        }
    }

    fn try_place_pair(&mut self) {
        let Some(range) = self.committed_range else {
            return;
        };
        if !self.lifecycle.is_flat() || self.rollover_pending || self.restart_flatten_pending {
            return;
        }
        if self.basket.daily().target_reached() {
            return;
        }
        if self.config.max_pairs_per_day > 0 && self.pairs_today >= self.config.max_pairs_per_day {
            return;
        }

        let spec = self.market.symbol_spec();
        if self.config.max_spread_pips > 0.0 {
            let spread_pips = spec.price_to_pips(self.market.spread());
            if spread_pips > self.config.max_spread_pips {
                debug!(
                    "Spread {:.1} pips above limit {:.1}",
                    spread_pips, self.config.max_spread_pips
                );
                return;
            }
        }

        let offset = spec.pips_to_price(self.config.entry_offset_pips);
        let mut plan = EntryPlan::from_range(&range, offset, 0.0);
        if self.config.trend_filter {
            if !self.signal.is_bullish() {
                plan.buy_level = None;
            }
            if !self.signal.is_bearish() {
                plan.sell_level = None;
            }
            if plan.buy_level.is_none() && plan.sell_level.is_none() {
                debug!("No directional bias, nothing to place");
                return;
            }
        }

        // Internal state says flat; make sure the venue agrees
        if !self.lifecycle.confirm_flat(&self.exec) {
            return;
        }

        let account = match self.exec.query_account_state() {
            Ok(account) => account,
            Err(e) => {
                self.query_failures += 1;
                warn!("Account query failed, placement skipped: {}", e);
                return;
            }
        };
        let sizing = self.sizer.position_size(&account, range.size, &spec);
        plan.size = sizing.size;

        let now = self.clock.now_utc();
        if self.lifecycle.place_pair(&mut self.exec, &self.market, &self.sizer, &plan, now) {
            self.pairs_today += 1;
            if let Some(pair) = self.lifecycle.pair() {
                info!(
                    "PAIR #{} placed | Size: {:.2} lots | Risk: ${:.2}{}",
                    self.pairs_today,
                    sizing.size,
                    sizing.risk_amount,
                    if sizing.margin_capped { " (margin capped)" } else { "" }
                );
                self.emit(EngineEvent::PairPlaced {
                    pair_id: pair.id,
                    buy_level: pair.buy.map(|l| l.entry_price),
                    sell_level: pair.sell.map(|l| l.entry_price),
                    size: pair.size,
                });
            }
        }
    }

    fn record_flatten(&mut self, report: &FlattenReport, reason: &str) {
        if report.noop {
            return;
        }
        for _ in &report.closed_positions {
            self.basket.record_trade();
        }
        self.emit(EngineEvent::Flattened {
            reason: reason.to_string(),
            closed: report.closed_positions.len(),
            cancelled: report.cancelled_orders.len(),
        });
    }

    fn manage_basket(&mut self) {
        if self.restart_flatten_pending {
            let report = self.lifecycle.force_flatten(&mut self.exec);
            self.record_flatten(&report, "restart");
            if report.flat {
                self.restart_flatten_pending = false;
                if let Ok(account) = self.exec.query_account_state() {
                    self.start_basket(&account, self.clock.now_utc());
                }
            }
            return;
        }

        if let Err(e) = self.basket.update_profit(&self.exec) {
            self.query_failures += 1;
            warn!("Basket profit update failed: {}", e);
        }

        if !self.rollover_pending && self.basket.check_target() {
            let basket = self.basket.current();
            info!(
                "TARGET HIT: basket {} profit ${:.2} >= ${:.2}",
                basket.id, basket.current_profit, basket.target_profit
            );
            self.emit(EngineEvent::BasketTargetHit {
                basket_id: basket.id.clone(),
                profit: basket.current_profit,
            });
            self.rollover_pending = true;
        }

        if !self.rollover_pending {
            return;
        }

        let report = self.lifecycle.force_flatten(&mut self.exec);
        self.record_flatten(&report, "basket target");
        if !report.flat {
            warn!("Basket flatten incomplete, retrying next tick");
            return;
        }

        let account = match self.exec.query_account_state() {
            Ok(account) => account,
            Err(e) => {
                self.query_failures += 1;
                warn!("Account query failed, basket rollover deferred: {}", e);
                return;
            }
        };
        // Pick up the profit realized by the flatten itself
        if let Err(e) = self.basket.update_profit(&self.exec) {
            self.query_failures += 1;
            warn!("Final basket profit update failed: {}", e);
        }

        let now = self.clock.now_utc();
        let record = self.basket.close_basket(now);
        self.emit(EngineEvent::BasketClosed { record });
        self.rollover_pending = false;
        self.start_basket(&account, now);

        let daily = self.basket.daily();
        if daily.target_reached() && !self.daily_target_announced {
            info!(
                "DAILY TARGET: ${:.2} >= ${:.2}, no new pairs today",
                daily.cumulative_profit, daily.daily_target
            );
            let profit = daily.cumulative_profit;
            self.daily_target_announced = true;
            self.emit(EngineEvent::DailyTargetReached { profit });
        }
    }

    fn start_basket(&mut self, account: &AccountState, now: DateTime<Utc>) {
        let basket = self.basket.start_new_basket(account, now);
        let event = EngineEvent::BasketStarted {
            basket_id: basket.id.clone(),
            target: basket.target_profit,
        };
        self.emit(event);
    }

    fn forced_exit(&mut self) {
        let report = self.lifecycle.force_flatten(&mut self.exec);
        if !report.noop {
            info!(
                "FORCED EXIT: closed {} position(s), cancelled {} order(s){}",
                report.closed_positions.len(),
                report.cancelled_orders.len(),
                if report.flat { "" } else { " - incomplete, retrying" }
            );
        }
        self.record_flatten(&report, "forced exit");
    }

    fn cutoff(&mut self) {
        match self.lifecycle.state() {
            LifecycleState::PendingBothSides => {
                let events = self.lifecycle.cancel_pending(&mut self.exec);
                self.handle_lifecycle_events(events);
            }
            LifecycleState::OneSideTriggered if self.config.close_positions_at_cutoff => {
                let report = self.lifecycle.force_flatten(&mut self.exec);
                self.record_flatten(&report, "cutoff");
            }
            _ => {}
        }
    }

    /// Current state for renderers
    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            instrument: self.config.instrument.clone(),
            engine_id: self.config.engine_id,
            local_time: self.clock.local_time(),
            phase: self.clock.phase(),
            lifecycle: self.lifecycle.state(),
            range: self.committed_range,
            forming_range: self.forming_range,
            pair: self.lifecycle.pair().cloned(),
            position: self.lifecycle.position().cloned(),
            basket: self.basket.current().clone(),
            daily: self.basket.daily().clone(),
            lifetime: self.basket.lifetime().clone(),
            history: self.basket.history().iter().cloned().collect(),
            failures: self.failures(),
            pairs_today: self.pairs_today,
            ticks: self.ticks,
        }
    }

    /// Lifecycle failures plus engine-level query failures
    pub fn failures(&self) -> FailureCounters {
        let mut failures = *self.lifecycle.failures();
        failures.queries += self.query_failures;
        failures
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn phase(&self) -> SessionPhase {
        self.clock.phase()
    }

    pub fn committed_range(&self) -> Option<&OpeningRange> {
        self.committed_range.as_ref()
    }

    pub fn forming_range(&self) -> Option<&OpeningRange> {
        self.forming_range.as_ref()
    }

    pub fn lifecycle(&self) -> &OrderLifecycle {
        &self.lifecycle
    }

    pub fn basket(&self) -> &BasketSession {
        &self.basket
    }

    pub fn pairs_today(&self) -> u32 {
        self.pairs_today
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::execution::simulated::{CallKind, SimVenue};
    use crate::execution::venue::StaticSignal;
    use crate::trading_core::{BasketTarget, RiskMethod, RiskParameters, TimeOfDay};
    use crate::types::{Bar, OrderKind, OrderRequest, SymbolSpec};
    use chrono::Duration;

    const MAGIC: u64 = 4242;

    fn at(hhmm: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(&format!("2025-03-03T{hhmm}:00Z"))
            .unwrap()
            .with_timezone(&Utc)
    }

    fn config() -> EngineConfig {
        EngineConfig {
            engine_id: MAGIC,
            min_range_pips: 5.0,
            ..Default::default()
        }
    }

    type Engine = BreakoutEngine<SimVenue, SimVenue, StaticSignal, SimVenue>;

    fn engine_with(config: EngineConfig, venue: &SimVenue, signal: StaticSignal) -> Engine {
        BreakoutEngine::new(config, venue.clone(), venue.clone(), signal, venue.clone()).unwrap()
    }

    fn bar(time: DateTime<Utc>, low: f64, high: f64, close: f64) -> Bar {
        Bar {
            open_time: time,
            open: close,
            high,
            low,
            close,
        }
    }

    /// 07:00-07:59 range of 1.1020-1.1050, quote left inside the range
    fn build_range(venue: &SimVenue, engine: &mut Engine) {
        for m in 0..60 {
            let t = at("07:00") + Duration::minutes(m);
            let (low, high) = match m {
                10 => (1.1020, 1.1035),
                40 => (1.1030, 1.1050),
                _ => (1.1030, 1.1040),
            };
            venue.push_bar(bar(t, low, high, 1.1035));
            engine.on_tick();
        }
    }

    fn enter_trading(venue: &SimVenue, engine: &mut Engine) {
        venue.push_bar(bar(at("08:00"), 1.1033, 1.1037, 1.1035));
        engine.on_tick();
    }

    fn new_venue() -> SimVenue {
        let venue = SimVenue::new(at("06:00"), SymbolSpec::default(), 10_000.0);
        venue.set_quote(1.1035, 1.1036);
        venue
    }

    #[test]
    fn test_range_commits_on_first_trading_tick() {
        let venue = new_venue();
        let mut engine = engine_with(config(), &venue, StaticSignal::neutral());
        assert_eq!(engine.phase(), SessionPhase::PreRange);

        build_range(&venue, &mut engine);
        assert_eq!(engine.phase(), SessionPhase::InRange);
        assert!(engine.committed_range().is_none());
        let forming = engine.forming_range().unwrap();
        assert_eq!(forming.low, 1.1020);

        enter_trading(&venue, &mut engine);
        let range = engine.committed_range().unwrap();
        assert_eq!(range.high, 1.1050);
        assert_eq!(range.low, 1.1020);
        assert!((range.size - 0.0030).abs() < 1e-12);
        assert_eq!(range.bar_count, 60);

        // Both entries placed on the same tick
        assert_eq!(engine.lifecycle().state(), LifecycleState::PendingBothSides);
        assert_eq!(venue.orders().len(), 2);
        assert_eq!(engine.pairs_today(), 1);
    }

    #[test]
    fn test_on_tick_is_idempotent_without_changes() {
        let venue = new_venue();
        let mut engine = engine_with(config(), &venue, StaticSignal::neutral());
        build_range(&venue, &mut engine);
        enter_trading(&venue, &mut engine);

        let before = venue.mutating_call_count();
        for _ in 0..5 {
            engine.on_tick();
        }
        assert_eq!(venue.mutating_call_count(), before);
    }

    #[test]
    fn test_data_not_ready_skips_placement() {
        let venue = new_venue();
        let mut engine = engine_with(config(), &venue, StaticSignal::warming_up());
        build_range(&venue, &mut engine);
        venue.push_bar(bar(at("08:00"), 1.1033, 1.1037, 1.1035));
        assert_eq!(
            engine.on_tick(),
            TickOutcome::DataNotReady {
                phase: SessionPhase::PostRangeTrading
            }
        );
        assert!(venue.orders().is_empty());
        assert_eq!(venue.mutating_call_count(), 0);
    }

    #[test]
    fn test_trend_filter_places_one_side() {
        let venue = new_venue();
        let config = EngineConfig {
            trend_filter: true,
            ..config()
        };
        let mut engine = engine_with(config, &venue, StaticSignal::bearish());
        build_range(&venue, &mut engine);
        enter_trading(&venue, &mut engine);

        let orders = venue.orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, OrderSide::Sell);
        assert_eq!(orders[0].kind, OrderKind::Stop);
    }

    #[test]
    fn test_fill_cancels_sibling_and_break_even() {
        let venue = new_venue();
        let config = EngineConfig {
            basket_target: BasketTarget::Fixed { amount: 1_000.0 },
            ..config()
        };
        let mut engine = engine_with(config, &venue, StaticSignal::neutral());
        let mut events = engine.subscribe();
        build_range(&venue, &mut engine);
        enter_trading(&venue, &mut engine);

        // Breakout above the range
        venue.set_time(at("08:05"));
        venue.set_quote(1.1051, 1.1052);
        engine.on_tick();
        assert_eq!(engine.lifecycle().state(), LifecycleState::OneSideTriggered);
        assert!(venue.orders().is_empty(), "sell entry cancelled");
        assert_eq!(venue.positions().len(), 1);

        // +1R at the bid moves the stop to entry, once
        venue.set_time(at("08:10"));
        venue.set_quote(1.1081, 1.1082);
        engine.on_tick();
        assert_eq!(venue.positions()[0].stop_loss, 1.1050);
        let modifies = venue.call_count(CallKind::Modify);
        engine.on_tick();
        assert_eq!(venue.call_count(CallKind::Modify), modifies);

        let mut saw_break_even = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, EngineEvent::BreakEvenApplied { .. }) {
                saw_break_even = true;
            }
        }
        assert!(saw_break_even);
    }

    #[test]
    fn test_basket_rollover_at_target() {
        let venue = new_venue();
        let config = EngineConfig {
            basket_target: BasketTarget::Fixed { amount: 10.0 },
            risk: RiskParameters {
                method: RiskMethod::FixedSize,
                fixed_size: 0.5,
                ..Default::default()
            },
            ..config()
        };
        let mut engine = engine_with(config, &venue, StaticSignal::neutral());
        build_range(&venue, &mut engine);
        enter_trading(&venue, &mut engine);
        let first_id = engine.basket().current().id.clone();

        venue.set_time(at("08:05"));
        venue.set_quote(1.1051, 1.1052);
        engine.on_tick();

        // 0.5 lots, $5 per pip: +1.8 pips floating is $9.00, below target
        venue.set_time(at("08:06"));
        venue.set_quote(1.10518, 1.10528);
        engine.on_tick();
        assert_eq!(engine.basket().current().id, first_id);

        // +2.1 pips is $10.50, target hit: flatten and roll over in one tick
        venue.set_time(at("08:07"));
        venue.set_quote(1.10521, 1.10531);
        engine.on_tick();

        assert!(venue.positions().is_empty());
        assert_ne!(engine.basket().current().id, first_id);
        let basket = engine.basket().current();
        assert_eq!(basket.current_profit, 0.0);
        assert_eq!(basket.trade_count, 0);
        assert_eq!(engine.basket().daily().baskets_completed, 1);
        let record = engine.basket().history().latest().unwrap();
        assert!((record.profit() - 10.5).abs() < 1e-6);
        assert_eq!(record.basket.trade_count, 1);
    }

    #[test]
    fn test_forced_exit_flattens_same_tick() {
        let venue = new_venue();
        let mut engine = engine_with(config(), &venue, StaticSignal::neutral());
        build_range(&venue, &mut engine);
        enter_trading(&venue, &mut engine);

        venue.set_time(at("08:05"));
        venue.set_quote(1.1051, 1.1052);
        engine.on_tick();
        assert_eq!(venue.positions().len(), 1);

        venue.set_time(at("20:00"));
        assert_eq!(
            engine.on_tick(),
            TickOutcome::Processed {
                phase: SessionPhase::ForcedExit
            }
        );
        assert!(venue.positions().is_empty());
        assert!(venue.orders().is_empty());
        assert_eq!(engine.lifecycle().state(), LifecycleState::Closed);

        let before = venue.mutating_call_count();
        venue.set_time(at("20:01"));
        engine.on_tick();
        engine.on_tick();
        assert_eq!(venue.mutating_call_count(), before);
    }

    #[test]
    fn test_forced_exit_retries_failed_close() {
        let venue = new_venue();
        let mut engine = engine_with(config(), &venue, StaticSignal::neutral());
        build_range(&venue, &mut engine);
        enter_trading(&venue, &mut engine);
        venue.set_time(at("08:05"));
        venue.set_quote(1.1051, 1.1052);
        engine.on_tick();

        venue.fail_next(CallKind::Close, 1);
        venue.set_time(at("20:00"));
        engine.on_tick();
        assert_eq!(venue.positions().len(), 1);
        assert_eq!(engine.failures().closes, 1);

        venue.set_time(at("20:01"));
        engine.on_tick();
        assert!(venue.positions().is_empty());
    }

    #[test]
    fn test_cutoff_cancels_untriggered_pair() {
        let venue = new_venue();
        let mut engine = engine_with(config(), &venue, StaticSignal::neutral());
        build_range(&venue, &mut engine);
        enter_trading(&venue, &mut engine);
        assert_eq!(venue.orders().len(), 2);

        venue.set_time(at("16:00"));
        engine.on_tick();
        assert!(venue.orders().is_empty());
        assert_eq!(engine.lifecycle().state(), LifecycleState::Closed);
        assert_eq!(engine.phase(), SessionPhase::AfterCutoff);
    }

    #[test]
    fn test_max_pairs_per_day() {
        let venue = new_venue();
        let config = EngineConfig {
            max_pairs_per_day: 1,
            ..config()
        };
        let mut engine = engine_with(config, &venue, StaticSignal::neutral());
        build_range(&venue, &mut engine);
        enter_trading(&venue, &mut engine);

        // Long triggers and is stopped out
        venue.set_time(at("08:05"));
        venue.set_quote(1.1051, 1.1052);
        engine.on_tick();
        venue.set_time(at("08:06"));
        venue.set_quote(1.1019, 1.1020);
        engine.on_tick();

        assert_eq!(engine.lifecycle().state(), LifecycleState::Closed);
        assert_eq!(engine.basket().current().trade_count, 1);
        assert!(venue.orders().is_empty(), "no second pair");
    }

    #[test]
    fn test_day_rollover_resets_range() {
        let venue = new_venue();
        let mut engine = engine_with(config(), &venue, StaticSignal::neutral());
        build_range(&venue, &mut engine);
        enter_trading(&venue, &mut engine);
        assert!(engine.committed_range().is_some());

        venue.set_time(at("06:00") + Duration::days(1));
        engine.on_tick();
        assert!(engine.committed_range().is_none());
        assert_eq!(engine.pairs_today(), 0);
        assert_eq!(engine.phase(), SessionPhase::PreRange);
    }

    fn leftover(venue: &SimVenue) -> (Ticket, Ticket) {
        let request = OrderRequest {
            side: OrderSide::Buy,
            volume: 0.2,
            price: 1.1050,
            stop_loss: 1.1020,
            take_profit: 1.1110,
            magic: MAGIC,
            comment: "previous run".into(),
        };
        let pos = venue.inject_position(&request, at("05:30"));
        let order = venue.inject_order(
            &OrderRequest {
                side: OrderSide::Sell,
                price: 1.1020,
                stop_loss: 1.1050,
                take_profit: 1.0960,
                ..request
            },
            OrderKind::Stop,
        );
        (pos, order)
    }

    #[test]
    fn test_restart_recover_from_live() {
        let venue = new_venue();
        let (pos, order) = leftover(&venue);
        let config = EngineConfig {
            restart_policy: RestartPolicy::RecoverFromLive,
            ..config()
        };
        let mut engine = engine_with(config, &venue, StaticSignal::neutral());

        assert_eq!(engine.lifecycle().state(), LifecycleState::OneSideTriggered);
        assert_eq!(engine.lifecycle().position().unwrap().ticket, pos);
        assert!(engine.basket().current().started_at < at("05:30"));

        engine.on_tick();
        assert_eq!(venue.positions().len(), 1, "position kept");
        assert!(venue.orders().iter().all(|o| o.ticket != order), "orphan sibling cancelled");
    }

    #[test]
    fn test_restart_fresh_basket() {
        let venue = new_venue();
        leftover(&venue);
        let config = EngineConfig {
            restart_policy: RestartPolicy::FreshBasket,
            ..config()
        };
        let engine = engine_with(config, &venue, StaticSignal::neutral());

        assert!(venue.positions().is_empty());
        assert!(venue.orders().is_empty());
        assert!(engine.lifecycle().is_flat());
        assert_eq!(engine.basket().current().trade_count, 0);
        assert_eq!(engine.basket().current().start_balance, venue.balance());
    }

    #[test]
    fn test_invalid_config_fails_at_init() {
        let venue = new_venue();
        let mut config = config();
        config.session.range_end = TimeOfDay::hm(6, 0);
        let result = BreakoutEngine::new(
            config,
            venue.clone(),
            venue.clone(),
            StaticSignal::neutral(),
            venue.clone(),
        );
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }

    #[test]
    fn test_snapshot_serializes() {
        let venue = new_venue();
        let mut engine = engine_with(config(), &venue, StaticSignal::neutral());
        build_range(&venue, &mut engine);
        enter_trading(&venue, &mut engine);

        let json = serde_json::to_value(engine.snapshot()).unwrap();
        assert_eq!(json["phase"], "PostRangeTrading");
        assert_eq!(json["lifecycle"], "PendingBothSides");
        assert_eq!(json["engine_id"], MAGIC);
    }

    #[test]
    fn test_fill_between_queries_is_tracked() {
        let venue = new_venue();
        let mut engine = engine_with(config(), &venue, StaticSignal::neutral());
        build_range(&venue, &mut engine);
        enter_trading(&venue, &mut engine);
        let buy = engine.lifecycle().pair().unwrap().buy.unwrap().ticket;

        // Buy fills after positions were read but before orders are
        venue.fill_during_next_order_query(buy);
        venue.set_time(at("08:05"));
        engine.on_tick();

        assert_eq!(engine.lifecycle().state(), LifecycleState::OneSideTriggered);
        assert_eq!(engine.lifecycle().position().map(|p| p.ticket), Some(buy));
        assert_eq!(engine.pairs_today(), 1, "no second pair on top of the position");
        assert_eq!(engine.basket().current().trade_count, 0);
        assert_eq!(venue.positions().len(), 1);
        assert!(venue.orders().is_empty(), "sell entry cancelled");
    }

    #[test]
    fn test_untracked_order_blocks_placement() {
        let venue = new_venue();
        let mut engine = engine_with(config(), &venue, StaticSignal::neutral());
        build_range(&venue, &mut engine);
        let stray = venue.inject_order(
            &OrderRequest {
                side: OrderSide::Sell,
                volume: 0.2,
                price: 1.1020,
                stop_loss: 1.1050,
                take_profit: 1.0960,
                magic: MAGIC,
                comment: "manual".into(),
            },
            OrderKind::Stop,
        );

        enter_trading(&venue, &mut engine);
        assert!(engine.committed_range().is_some());
        assert_eq!(engine.pairs_today(), 0);
        assert_eq!(venue.orders().len(), 1);
        assert_eq!(venue.orders()[0].ticket, stray);
        assert_eq!(engine.lifecycle().state(), LifecycleState::PendingBothSides);
    }

    #[test]
    fn test_forced_exit_closes_untracked_position() {
        let venue = new_venue();
        let mut engine = engine_with(config(), &venue, StaticSignal::neutral());
        build_range(&venue, &mut engine);
        enter_trading(&venue, &mut engine);
        venue.set_time(at("16:00"));
        engine.on_tick();
        assert_eq!(engine.lifecycle().state(), LifecycleState::Closed);

        venue.set_time(at("17:00"));
        venue.inject_position(
            &OrderRequest {
                side: OrderSide::Buy,
                volume: 0.2,
                price: 1.1036,
                stop_loss: 1.1000,
                take_profit: 1.1110,
                magic: MAGIC,
                comment: "manual".into(),
            },
            at("17:00"),
        );

        venue.set_time(at("20:00"));
        engine.on_tick();
        assert!(venue.positions().is_empty());
        assert_eq!(engine.lifecycle().state(), LifecycleState::Closed);

        let before = venue.mutating_call_count();
        venue.set_time(at("20:30"));
        engine.on_tick();
        assert_eq!(venue.mutating_call_count(), before);
    }

    #[test]
    fn test_wide_spread_blocks_placement() {
        let venue = new_venue();
        let config = EngineConfig {
            max_spread_pips: 2.0,
            ..config()
        };
        let mut engine = engine_with(config, &venue, StaticSignal::neutral());
        build_range(&venue, &mut engine);

        venue.set_spread(0.0005);
        enter_trading(&venue, &mut engine);
        assert!(engine.committed_range().is_some());
        assert!(venue.orders().is_empty());
        assert_eq!(engine.pairs_today(), 0);

        venue.set_spread(0.0001);
        venue.push_bar(bar(at("08:01"), 1.1033, 1.1037, 1.1035));
        engine.on_tick();
        assert_eq!(venue.orders().len(), 2);
        assert_eq!(engine.pairs_today(), 1);
    }

    #[test]
    fn test_daily_target_stops_new_pairs() {
        let venue = new_venue();
        let config = EngineConfig {
            basket_target: BasketTarget::Fixed { amount: 10.0 },
            daily_target: 10.0,
            risk: RiskParameters {
                method: RiskMethod::FixedSize,
                fixed_size: 0.5,
                ..Default::default()
            },
            ..config()
        };
        let mut engine = engine_with(config, &venue, StaticSignal::neutral());
        let mut events = engine.subscribe();
        build_range(&venue, &mut engine);
        enter_trading(&venue, &mut engine);

        venue.set_time(at("08:05"));
        venue.set_quote(1.1051, 1.1052);
        engine.on_tick();
        venue.set_time(at("08:07"));
        venue.set_quote(1.10521, 1.10531);
        engine.on_tick();
        assert_eq!(engine.basket().daily().baskets_completed, 1);
        assert!(engine.basket().daily().target_reached());

        venue.set_time(at("08:08"));
        engine.on_tick();
        engine.on_tick();
        assert!(venue.orders().is_empty(), "no pair after the daily target");
        assert!(venue.positions().is_empty());
        assert_eq!(engine.pairs_today(), 1);

        let mut announced = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, EngineEvent::DailyTargetReached { .. }) {
                announced += 1;
            }
        }
        assert_eq!(announced, 1);
    }

    #[test]
    fn test_close_positions_at_cutoff() {
        let venue = new_venue();
        let config = EngineConfig {
            close_positions_at_cutoff: true,
            ..config()
        };
        let mut engine = engine_with(config, &venue, StaticSignal::neutral());
        build_range(&venue, &mut engine);
        enter_trading(&venue, &mut engine);
        venue.set_time(at("08:05"));
        venue.set_quote(1.1051, 1.1052);
        engine.on_tick();
        assert_eq!(venue.positions().len(), 1);

        venue.set_time(at("16:00"));
        engine.on_tick();
        assert_eq!(engine.phase(), SessionPhase::AfterCutoff);
        assert!(venue.positions().is_empty());
        assert!(venue.orders().is_empty());
        assert_eq!(engine.lifecycle().state(), LifecycleState::Closed);
    }

    #[test]
    fn test_position_kept_past_cutoff_by_default() {
        let venue = new_venue();
        let mut engine = engine_with(config(), &venue, StaticSignal::neutral());
        build_range(&venue, &mut engine);
        enter_trading(&venue, &mut engine);
        venue.set_time(at("08:05"));
        venue.set_quote(1.1051, 1.1052);
        engine.on_tick();

        venue.set_time(at("16:00"));
        engine.on_tick();
        assert_eq!(venue.positions().len(), 1);
        assert_eq!(engine.lifecycle().state(), LifecycleState::OneSideTriggered);
    }

    #[test]
    fn test_startup_query_failure_defers_reconciliation() {
        let venue = new_venue();
        let (pos, order) = leftover(&venue);
        venue.fail_next(CallKind::QueryOrders, 1);

        let mut engine = engine_with(config(), &venue, StaticSignal::neutral());
        assert!(!engine.basket().current().is_active);
        assert_eq!(engine.lifecycle().state(), LifecycleState::Idle);
        assert_eq!(engine.failures().queries, 1);

        assert_eq!(
            engine.on_tick(),
            TickOutcome::Processed {
                phase: SessionPhase::PreRange
            }
        );
        assert!(engine.basket().current().is_active);
        assert_eq!(engine.lifecycle().position().map(|p| p.ticket), Some(pos));
        assert!(venue.orders().iter().all(|o| o.ticket != order));
    }

    #[test]
    fn test_forced_exit_while_reconciling() {
        let venue = new_venue();
        leftover(&venue);
        venue.fail_next(CallKind::QueryAccount, 2);
        let mut engine = engine_with(config(), &venue, StaticSignal::neutral());

        venue.set_time(at("20:00"));
        assert_eq!(
            engine.on_tick(),
            TickOutcome::Reconciling {
                phase: SessionPhase::ForcedExit
            }
        );
        assert!(venue.positions().is_empty());
        assert!(venue.orders().is_empty());
    }
}
