//! Property tests for session, sizing and bookkeeping invariants.
//!
//! Uses proptest to verify:
//! 1. Phase partition - phases over a day never move backwards
//! 2. Range floor - a built range is never narrower than the minimum
//! 3. Sizing bounds - size always lands on [min_lot, max_lot]
//! 4. Break-even - the stop only ever tightens toward entry
//! 5. History ring - keeps the newest entries in arrival order

use chrono::NaiveDate;
use proptest::prelude::*;
use range_breakout::trading_core::risk::break_even_stop;
use range_breakout::trading_core::{
    HistoryRing, RangeCalculator, RiskMethod, RiskParameters, RiskSizer, SessionBoundaries,
    SessionPhase, TimeOfDay,
};
use range_breakout::{AccountState, OrderSide, SymbolSpec};

// ── Strategies (proptest) ────────────────────────────────────────────

/// Four ordered minutes of the day
fn arb_boundaries() -> impl Strategy<Value = SessionBoundaries> {
    prop::collection::vec(0u32..1440, 4).prop_map(|mut minutes| {
        minutes.sort_unstable();
        let tod = |m: u32| TimeOfDay::hm(m / 60, m % 60);
        SessionBoundaries {
            range_start: tod(minutes[0]),
            range_end: tod(minutes[1]),
            trading_cutoff: tod(minutes[2]),
            force_exit: tod(minutes[3]),
        }
    })
}

fn arb_price() -> impl Strategy<Value = f64> {
    (0.5..2.0_f64).prop_map(|p| (p * 100_000.0).round() / 100_000.0)
}

fn arb_method() -> impl Strategy<Value = RiskMethod> {
    prop_oneof![
        Just(RiskMethod::PercentOfBalance),
        Just(RiskMethod::FixedSize),
        Just(RiskMethod::FixedDollarRisk),
    ]
}

fn arb_side() -> impl Strategy<Value = OrderSide> {
    prop_oneof![Just(OrderSide::Buy), Just(OrderSide::Sell)]
}

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 17).unwrap_or_default()
}

// ── 1. Phase Partition ───────────────────────────────────────────────

proptest! {
    /// Walking the day minute by minute, the phase rank never decreases
    #[test]
    fn phases_are_monotone(bounds in arb_boundaries()) {
        prop_assert!(bounds.validate().is_ok());

        let mut last = bounds.phase_at(0).rank();
        for minute in 1..1440 {
            let rank = bounds.phase_at(minute).rank();
            prop_assert!(rank >= last, "phase went back at minute {}", minute);
            last = rank;
        }
    }

    /// Each phase covers exactly its half-open interval
    #[test]
    fn phases_match_boundaries(bounds in arb_boundaries(), minute in 0u32..1440) {
        let phase = bounds.phase_at(minute);
        let expected = if minute < bounds.range_start.minutes() {
            SessionPhase::PreRange
        } else if minute < bounds.range_end.minutes() {
            SessionPhase::InRange
        } else if minute < bounds.trading_cutoff.minutes() {
            SessionPhase::PostRangeTrading
        } else if minute < bounds.force_exit.minutes() {
            SessionPhase::AfterCutoff
        } else {
            SessionPhase::ForcedExit
        };
        prop_assert_eq!(phase, expected);
    }
}

// ── 2. Range Floor ───────────────────────────────────────────────────

proptest! {
    /// A valid range is at least min_size wide and keeps its midpoint
    #[test]
    fn range_respects_floor(
        low in arb_price(),
        width in 0.00001..0.01_f64,
        min_size in 0.0..0.005_f64,
    ) {
        let calc = RangeCalculator::new(min_size, 500);
        let high = low + width;
        let range = calc.build(high, low, 10, date()).unwrap();

        prop_assert!(range.high > range.low);
        prop_assert!(range.size >= min_size - 1e-12);
        prop_assert!((range.midpoint() - (high + low) / 2.0).abs() < 1e-9);
        prop_assert_eq!(range.expanded, high - low < min_size);
    }

    /// Inverted or empty bands are rejected
    #[test]
    fn inverted_range_rejected(high in arb_price(), gap in 0.0..0.01_f64) {
        let calc = RangeCalculator::new(0.001, 500);
        prop_assert!(calc.build(high, high + gap, 10, date()).is_err());
    }
}

// ── 3. Sizing Bounds ─────────────────────────────────────────────────

proptest! {
    /// Size is within the symbol's lot bounds for any account and range
    #[test]
    fn size_within_lot_bounds(
        method in arb_method(),
        balance in 100.0..1_000_000.0_f64,
        range_size in 0.0..0.05_f64,
        risk_percent in 0.1..10.0_f64,
        fixed_size in 0.01..500.0_f64,
    ) {
        let params = RiskParameters {
            method,
            risk_percent,
            fixed_size,
            fixed_dollar_amount: balance / 100.0,
            ..RiskParameters::default()
        };
        let sizer = RiskSizer::new(params).unwrap();
        let spec = SymbolSpec::default();
        let account = AccountState { balance, equity: balance, free_margin: balance };

        let result = sizer.position_size(&account, range_size, &spec);
        prop_assert!(result.size >= spec.min_lot - 1e-12);
        prop_assert!(result.size <= spec.max_lot + 1e-12);
        if result.margin_capped {
            prop_assert_eq!(result.size, spec.min_lot);
        }
    }
}

// ── 4. Break-even Ratchet ────────────────────────────────────────────

proptest! {
    /// The break-even stop is entry and always tighter than the old stop
    #[test]
    fn break_even_never_loosens(
        entry in arb_price(),
        offset in -0.01..0.01_f64,
        side in arb_side(),
    ) {
        let stop = entry + offset;
        if let Some(new_stop) = break_even_stop(entry, stop, side) {
            prop_assert_eq!(new_stop, entry);
            match side {
                OrderSide::Buy => prop_assert!(new_stop > stop),
                OrderSide::Sell => prop_assert!(new_stop < stop),
            }
        } else {
            // Stop already at or through entry
            match side {
                OrderSide::Buy => prop_assert!(stop >= entry),
                OrderSide::Sell => prop_assert!(stop <= entry),
            }
        }
    }

    /// Applying break-even twice changes nothing the second time
    #[test]
    fn break_even_is_idempotent(
        entry in arb_price(),
        distance in 0.0001..0.01_f64,
        side in arb_side(),
    ) {
        let stop = entry - side.sign() * distance;
        prop_assert_eq!(break_even_stop(entry, stop, side), Some(entry));
        prop_assert_eq!(break_even_stop(entry, entry, side), None);
    }
}

// ── 5. History Ring ──────────────────────────────────────────────────

proptest! {
    /// The ring holds the newest `capacity` entries, oldest first
    #[test]
    fn ring_keeps_newest(capacity in 1usize..50, count in 0usize..200) {
        let mut ring = HistoryRing::new(capacity);
        let mut evicted = Vec::new();
        for i in 0..count {
            if let Some(old) = ring.push(i) {
                evicted.push(old);
            }
        }

        let kept: Vec<usize> = ring.iter().copied().collect();
        let start = count.saturating_sub(capacity);
        prop_assert_eq!(kept, (start..count).collect::<Vec<_>>());
        prop_assert_eq!(evicted, (0..start).collect::<Vec<_>>());
        prop_assert_eq!(ring.evicted_count(), start as u64);
        prop_assert_eq!(ring.latest().copied(), count.checked_sub(1));
    }
}
