//! Risk sizing: position size, stop-loss, take-profit and break-even
//!
//! All distances derive from the opening range size:
//! - stop distance = range size × `stop_loss_fraction`
//! - take-profit = entry ± risk × `take_profit_rr`
//! - break-even fires once unrealized R reaches `break_even_rr`

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{EngineError, Result};
use crate::types::{AccountState, OrderSide, SymbolSpec};

/// How position size is derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskMethod {
    /// Risk a percentage of account balance per trade
    PercentOfBalance,
    /// Always trade the configured lot size
    FixedSize,
    /// Risk a fixed money amount per trade
    FixedDollarRisk,
}

impl std::fmt::Display for RiskMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PercentOfBalance => write!(f, "percent-of-balance"),
            Self::FixedSize => write!(f, "fixed-size"),
            Self::FixedDollarRisk => write!(f, "fixed-dollar-risk"),
        }
    }
}

/// Risk configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskParameters {
    pub method: RiskMethod,
    /// Percent of balance at risk (PercentOfBalance)
    pub risk_percent: f64,
    /// Lots per trade (FixedSize)
    pub fixed_size: f64,
    /// Money at risk per trade (FixedDollarRisk)
    pub fixed_dollar_amount: f64,
    /// Stop distance as a fraction of the range size
    pub stop_loss_fraction: f64,
    /// Take-profit distance in multiples of the stop distance
    pub take_profit_rr: f64,
    /// Unrealized R at which the stop moves to entry
    pub break_even_rr: f64,
    /// Largest share of equity the position margin may consume
    pub max_margin_fraction: f64,
}

impl Default for RiskParameters {
    fn default() -> Self {
        Self {
            method: RiskMethod::PercentOfBalance,
            risk_percent: 1.0,
            fixed_size: 0.10,
            fixed_dollar_amount: 100.0,
            stop_loss_fraction: 1.0,
            take_profit_rr: 2.0,
            break_even_rr: 1.0,
            max_margin_fraction: 0.5,
        }
    }
}

impl RiskParameters {
    /// Reject non-positive parameters for the selected method
    pub fn validate(&self) -> Result<()> {
        let method_value = match self.method {
            RiskMethod::PercentOfBalance => ("risk_percent", self.risk_percent),
            RiskMethod::FixedSize => ("fixed_size", self.fixed_size),
            RiskMethod::FixedDollarRisk => ("fixed_dollar_amount", self.fixed_dollar_amount),
        };
        let checks = [
            method_value,
            ("stop_loss_fraction", self.stop_loss_fraction),
            ("take_profit_rr", self.take_profit_rr),
            ("break_even_rr", self.break_even_rr),
            ("max_margin_fraction", self.max_margin_fraction),
        ];
        for (name, value) in checks {
            if !(value.is_finite() && value > 0.0) {
                return Err(EngineError::Configuration(format!(
                    "{name} must be positive for {} sizing (got {value})",
                    self.method
                )));
            }
        }
        if self.method == RiskMethod::PercentOfBalance && self.risk_percent > 100.0 {
            return Err(EngineError::Configuration(format!(
                "risk_percent {} exceeds 100",
                self.risk_percent
            )));
        }
        Ok(())
    }
}

/// Outcome of a sizing calculation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SizingResult {
    /// Money at risk (zero for FixedSize)
    pub risk_amount: f64,
    /// Stop distance in price units
    pub stop_distance: f64,
    /// Size before lot-step rounding and clamping
    pub raw_size: f64,
    /// Final tradable size
    pub size: f64,
    /// Size fell back to the minimum because margin would exceed the limit
    pub margin_capped: bool,
}

/// Converts account state and range size into trade parameters
#[derive(Debug, Clone, Copy)]
pub struct RiskSizer {
    params: RiskParameters,
}

impl RiskSizer {
    pub fn new(params: RiskParameters) -> Result<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &RiskParameters {
        &self.params
    }

    /// Stop distance in price units for a range
    pub fn stop_distance(&self, range_size: f64) -> f64 {
        range_size * self.params.stop_loss_fraction
    }

    /// Position size for a range.
    ///
    /// The result is floored to the lot step and clamped to the symbol's
    /// [min_lot, max_lot]. If the resulting margin exceeds the configured
    /// share of equity, size falls back to min_lot and `margin_capped` is set.
    pub fn position_size(
        &self,
        account: &AccountState,
        range_size: f64,
        spec: &SymbolSpec,
    ) -> SizingResult {
        let stop_distance = self.stop_distance(range_size);
        let stop_pips = spec.price_to_pips(stop_distance);

        let risk_amount = match self.params.method {
            RiskMethod::PercentOfBalance => account.balance * self.params.risk_percent / 100.0,
            RiskMethod::FixedDollarRisk => self.params.fixed_dollar_amount,
            RiskMethod::FixedSize => 0.0,
        };

        let raw_size = match self.params.method {
            RiskMethod::FixedSize => self.params.fixed_size,
            _ => {
                let per_lot_risk = stop_pips * spec.pip_value_per_lot;
                if per_lot_risk > 0.0 {
                    risk_amount / per_lot_risk
                } else {
                    0.0
                }
            }
        };

        let mut size = spec.floor_to_step(raw_size).clamp(spec.min_lot, spec.max_lot);
        let mut margin_capped = false;

        let required_margin = size * spec.margin_per_lot;
        let margin_limit = account.equity * self.params.max_margin_fraction;
        if required_margin > margin_limit {
            warn!(
                "Margin {:.2} for {:.2} lots exceeds {:.0}% of equity ({:.2}), using {:.2} lots",
                required_margin,
                size,
                self.params.max_margin_fraction * 100.0,
                margin_limit,
                spec.min_lot
            );
            size = spec.min_lot;
            margin_capped = true;
        }

        SizingResult {
            risk_amount,
            stop_distance,
            raw_size,
            size,
            margin_capped,
        }
    }

    /// Stop-loss price: entry minus the stop distance for buys, plus for sells
    pub fn stop_loss(&self, entry: f64, range_size: f64, side: OrderSide) -> f64 {
        entry - side.sign() * self.stop_distance(range_size)
    }

    /// Take-profit price at `take_profit_rr` times the entry-to-stop distance
    pub fn take_profit(&self, entry: f64, stop: f64, side: OrderSide) -> f64 {
        entry + side.sign() * (entry - stop).abs() * self.params.take_profit_rr
    }

    /// Whether unrealized R has reached the break-even threshold
    pub fn break_even_trigger(&self, unrealized_r: f64) -> bool {
        unrealized_r >= self.params.break_even_rr
    }
}

/// Unrealized R-multiple of a position. None when the risk distance is not
/// positive (for example after the stop already sits at entry).
pub fn unrealized_r(entry: f64, price: f64, risk_distance: f64, side: OrderSide) -> Option<f64> {
    if !(risk_distance.is_finite() && risk_distance > 0.0) {
        return None;
    }
    Some(side.sign() * (price - entry) / risk_distance)
}

/// New stop at entry, only if that strictly tightens the current stop.
///
/// A stop of zero means "no stop" and is always tightened.
pub fn break_even_stop(entry: f64, current_stop: f64, side: OrderSide) -> Option<f64> {
    let tightens = match side {
        OrderSide::Buy => current_stop < entry,
        OrderSide::Sell => current_stop <= 0.0 || current_stop > entry,
    };
    tightens.then_some(entry)
}
