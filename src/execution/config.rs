//! Configuration for the breakout engine

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::trading_core::{BasketTarget, RiskParameters, SessionBoundaries, TimeOfDay, TimezoneRule};

use super::position::RiskDistanceSource;

/// What the engine does with tagged positions/orders it finds at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Adopt live positions and orders into the lifecycle and keep going
    RecoverFromLive,
    /// Flatten everything tagged with the engine id and start clean
    FreshBasket,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::RecoverFromLive
    }
}

impl std::fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RecoverFromLive => write!(f, "recover-from-live"),
            Self::FreshBasket => write!(f, "fresh-basket"),
        }
    }
}

/// Configuration for the breakout engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Symbol to trade (e.g., "EURUSD")
    pub instrument: String,

    /// Magic number tagging every order and position the engine owns
    pub engine_id: u64,

    /// Reference timezone for the session boundaries
    pub timezone: TimezoneRule,

    /// Range floor in pips
    pub min_range_pips: f64,

    /// Upper bound on bars scanned per range calculation
    pub max_range_bars: usize,

    /// Stop opening pairs once closed-basket profit for the day reaches this (0 = off)
    pub daily_target: f64,

    /// Closed baskets kept in history
    pub history_capacity: usize,

    /// Only place the side agreeing with the directional signal
    pub trend_filter: bool,

    /// Skip placement while the spread is wider than this (0 = off)
    pub max_spread_pips: f64,

    /// Distance beyond the range edge for entries, in pips
    pub entry_offset_pips: f64,

    /// Where break-even reads the initial risk distance from
    pub break_even_mode: RiskDistanceSource,

    pub restart_policy: RestartPolicy,

    /// Also close an open position at the trading cutoff
    pub close_positions_at_cutoff: bool,

    /// Order pairs allowed per day (0 = unlimited)
    pub max_pairs_per_day: u32,

    /// Range window, trading cutoff and forced exit
    pub session: SessionBoundaries,

    pub risk: RiskParameters,

    pub basket_target: BasketTarget,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instrument: "EURUSD".to_string(),
            engine_id: 240_617,
            timezone: TimezoneRule::Utc,
            session: SessionBoundaries {
                range_start: TimeOfDay::hm(7, 0),
                range_end: TimeOfDay::hm(8, 0),
                trading_cutoff: TimeOfDay::hm(16, 0),
                force_exit: TimeOfDay::hm(20, 0),
            },
            risk: RiskParameters::default(),
            min_range_pips: 10.0,
            max_range_bars: 500,
            basket_target: BasketTarget::Fixed { amount: 10.0 },
            daily_target: 0.0,
            history_capacity: 100,
            trend_filter: false,
            max_spread_pips: 0.0,
            entry_offset_pips: 0.0,
            break_even_mode: RiskDistanceSource::Cached,
            restart_policy: RestartPolicy::RecoverFromLive,
            close_positions_at_cutoff: false,
            max_pairs_per_day: 0,
        }
    }
}

impl EngineConfig {
    /// London open: range 07:00-08:00 London time, flat by 16:00
    pub fn london_open() -> Self {
        Self {
            timezone: TimezoneRule::Zone(chrono_tz::Europe::London),
            session: SessionBoundaries {
                range_start: TimeOfDay::hm(7, 0),
                range_end: TimeOfDay::hm(8, 0),
                trading_cutoff: TimeOfDay::hm(12, 0),
                force_exit: TimeOfDay::hm(16, 0),
            },
            max_spread_pips: 2.0,
            ..Default::default()
        }
    }

    /// New York open: range 09:30-10:00 ET, flat by 16:45, trend filtered
    pub fn new_york_open() -> Self {
        Self {
            timezone: TimezoneRule::Zone(chrono_tz::America::New_York),
            session: SessionBoundaries {
                range_start: TimeOfDay::hm(9, 30),
                range_end: TimeOfDay::hm(10, 0),
                trading_cutoff: TimeOfDay::hm(15, 0),
                force_exit: TimeOfDay::hm(16, 45),
            },
            trend_filter: true,
            max_pairs_per_day: 2,
            ..Default::default()
        }
    }

    /// Look up a preset by name
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "default" => Some(Self::default()),
            "london" | "london_open" => Some(Self::london_open()),
            "new_york" | "new_york_open" | "ny" => Some(Self::new_york_open()),
            _ => None,
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| EngineError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Configuration(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| EngineError::Configuration(e.to_string()))
    }

    /// Check everything the engine relies on at init
    pub fn validate(&self) -> Result<()> {
        self.session.validate()?;
        self.risk.validate()?;

        if self.instrument.trim().is_empty() {
            return Err(EngineError::Configuration("instrument must not be empty".into()));
        }
        if self.engine_id == 0 {
            return Err(EngineError::Configuration("engine_id must be non-zero".into()));
        }
        if !self.basket_target.is_positive() {
            return Err(EngineError::Configuration(format!(
                "basket target must be positive: {:?}",
                self.basket_target
            )));
        }
        if self.history_capacity == 0 {
            return Err(EngineError::Configuration("history_capacity must be at least 1".into()));
        }
        if self.max_range_bars < 2 {
            return Err(EngineError::Configuration("max_range_bars must be at least 2".into()));
        }
        let non_negative = [
            ("min_range_pips", self.min_range_pips),
            ("daily_target", self.daily_target),
            ("max_spread_pips", self.max_spread_pips),
            ("entry_offset_pips", self.entry_offset_pips),
        ];
        for (name, value) in non_negative {
            if !(value.is_finite() && value >= 0.0) {
                return Err(EngineError::Configuration(format!(
                    "{name} must be zero or positive (got {value})"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading_core::RiskMethod;

    #[test]
    fn test_default_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
        assert!(EngineConfig::london_open().validate().is_ok());
        assert!(EngineConfig::new_york_open().validate().is_ok());
    }

    #[test]
    fn test_misordered_boundaries_rejected() {
        let mut config = EngineConfig::default();
        config.session.trading_cutoff = TimeOfDay::hm(21, 0);
        let err = config.validate().unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            instrument = "GBPUSD"
            engine_id = 99
            timezone = "Europe/London"

            [session]
            range_start = "08:00"
            range_end = "08:30"
            trading_cutoff = "15:00"
            force_exit = "19:00"

            [risk]
            method = "fixed_size"
            fixed_size = 0.25

            [basket_target]
            kind = "percent_of_balance"
            percent = 0.5
            "#,
        )
        .unwrap();

        assert_eq!(config.instrument, "GBPUSD");
        assert_eq!(config.session.range_end, TimeOfDay::hm(8, 30));
        assert_eq!(config.risk.method, RiskMethod::FixedSize);
        assert_eq!(config.risk.take_profit_rr, 2.0);
        assert_eq!(config.basket_target, BasketTarget::PercentOfBalance { percent: 0.5 });
        assert_eq!(config.history_capacity, 100);
        assert_eq!(config.restart_policy, RestartPolicy::RecoverFromLive);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = EngineConfig::new_york_open();
        let text = config.to_toml_string().unwrap();
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_bad_time_rejected() {
        let err = EngineConfig::from_toml_str(
            r#"
            [session]
            range_start = "25:00"
            range_end = "08:30"
            trading_cutoff = "15:00"
            force_exit = "19:00"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[test]
    fn test_zero_engine_id_rejected() {
        let config = EngineConfig {
            engine_id: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
