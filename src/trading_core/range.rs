//! Opening range measurement
//!
//! Scans bars newest-first across a bounded window and reports the high/low
//! band. Ranges thinner than the configured floor are widened symmetrically
//! so the midpoint stays put.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::execution::venue::MarketData;

/// Bars required before a range is considered measurable
pub const MIN_RANGE_BARS: usize = 2;

/// High/low band measured over the range window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OpeningRange {
    pub high: f64,
    pub low: f64,
    pub size: f64,
    pub computed_for: NaiveDate,
    /// Number of bars that contributed
    pub bar_count: usize,
    /// Whether the floor rule widened the raw band
    pub expanded: bool,
}

impl OpeningRange {
    pub fn midpoint(&self) -> f64 {
        (self.high + self.low) / 2.0
    }
}

/// Range calculator configuration
#[derive(Debug, Clone, Copy)]
pub struct RangeCalculator {
    /// Minimum range size in price units
    min_size: f64,
    /// Upper bound on bars walked per calculation
    max_bars: usize,
}

impl RangeCalculator {
    pub fn new(min_size: f64, max_bars: usize) -> Self {
        Self {
            min_size: min_size.max(0.0),
            max_bars: max_bars.max(MIN_RANGE_BARS),
        }
    }

    /// Measure bars whose open time lies in `[window_start, window_end)`.
    ///
    /// Walks from the newest bar backwards, skipping bars at or after the
    /// window end, and stops at the first bar older than the window or at the
    /// end of available history. Only bars inside the window count against
    /// `max_bars`; if the limit is hit before the window start is passed the
    /// range is incomplete and `WindowTruncated` is returned.
    pub fn calculate<M: MarketData>(
        &self,
        market: &M,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        date: NaiveDate,
    ) -> Result<OpeningRange> {
        let mut high = f64::MIN;
        let mut low = f64::MAX;
        let mut found = 0usize;

        let mut index = 0usize;
        while let Some(bar) = market.bar(index) {
            index += 1;
            if bar.open_time < window_start {
                break;
            }
            if bar.open_time >= window_end {
                continue;
            }
            if found == self.max_bars {
                return Err(EngineError::WindowTruncated {
                    found,
                    max_bars: self.max_bars,
                });
            }
            high = high.max(bar.high);
            low = low.min(bar.low);
            found += 1;
        }

        if found < MIN_RANGE_BARS {
            return Err(EngineError::InsufficientData {
                found,
                required: MIN_RANGE_BARS,
            });
        }

        self.build(high, low, found, date)
    }

    /// Validate a raw band and apply the floor rule
    pub fn build(
        &self,
        high: f64,
        low: f64,
        bar_count: usize,
        date: NaiveDate,
    ) -> Result<OpeningRange> {
        let size = high - low;
        if size.is_nan() || size <= 0.0 {
            return Err(EngineError::InvalidRange { high, low });
        }

        let (high, low, expanded) = if size < self.min_size {
            let mid = (high + low) / 2.0;
            let half = self.min_size / 2.0;
            (mid + half, mid - half, true)
        } else {
            (high, low, false)
        };

        Ok(OpeningRange {
            high,
            low,
            size: high - low,
            computed_for: date,
            bar_count,
            expanded,
        })
    }

    pub fn min_size(&self) -> f64 {
        self.min_size
    }
}
