//! Trading clock and daily session phases
//!
//! Normalizes the venue's raw time into a reference timezone and partitions
//! the day into five phases using four time-of-day boundaries:
//!
//! ```text
//! 00:00 ── PreRange ── rangeStart ── InRange ── rangeEnd ── PostRangeTrading
//!       ── tradingCutoff ── AfterCutoff ── forceExit ── ForcedExit ── 24:00
//! ```

use chrono::{
    DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::execution::venue::TimeSource;

/// Minutes in a trading day
pub const MINUTES_PER_DAY: u32 = 24 * 60;

/// Time of day at minute resolution, written as "HH:MM"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    hour: u32,
    minute: u32,
}

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Result<Self> {
        if hour >= 24 || minute >= 60 {
            return Err(EngineError::Configuration(format!(
                "invalid time of day {hour:02}:{minute:02}"
            )));
        }
        Ok(Self { hour, minute })
    }

    /// Infallible constructor for literals; out-of-range fields wrap
    pub const fn hm(hour: u32, minute: u32) -> Self {
        Self {
            hour: hour % 24,
            minute: minute % 60,
        }
    }

    pub fn hour(&self) -> u32 {
        self.hour
    }

    pub fn minute(&self) -> u32 {
        self.minute
    }

    /// Minutes since midnight
    pub fn minutes(&self) -> u32 {
        self.hour * 60 + self.minute
    }

    pub fn to_naive_time(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour, self.minute, 0).unwrap_or(NaiveTime::MIN)
    }
}

impl std::fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl std::str::FromStr for TimeOfDay {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let (h, m) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| EngineError::Configuration(format!("expected HH:MM, got '{s}'")))?;
        let hour = h
            .parse()
            .map_err(|_| EngineError::Configuration(format!("bad hour in '{s}'")))?;
        let minute = m
            .parse()
            .map_err(|_| EngineError::Configuration(format!("bad minute in '{s}'")))?;
        Self::new(hour, minute)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(value: TimeOfDay) -> Self {
        value.to_string()
    }
}

/// How raw venue time maps into the reference timezone
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TimezoneRule {
    Utc,
    /// Fixed offset east of UTC in minutes
    Fixed(i32),
    /// IANA zone with daylight-saving transitions
    Zone(Tz),
}

impl TimezoneRule {
    /// Wall-clock time in the reference timezone
    pub fn localize(&self, raw: DateTime<Utc>) -> NaiveDateTime {
        match self {
            Self::Utc => raw.naive_utc(),
            Self::Fixed(minutes) => match FixedOffset::east_opt(minutes * 60) {
                Some(offset) => raw.with_timezone(&offset).naive_local(),
                None => raw.naive_utc(),
            },
            Self::Zone(tz) => raw.with_timezone(tz).naive_local(),
        }
    }

    /// UTC instant of a reference-timezone wall-clock time. Times skipped by a
    /// DST jump resolve to the first valid instant after the gap.
    pub fn to_utc(&self, local: NaiveDateTime) -> DateTime<Utc> {
        match self {
            Self::Utc => Utc.from_utc_datetime(&local),
            Self::Fixed(minutes) => FixedOffset::east_opt(minutes * 60)
                .and_then(|offset| offset.from_local_datetime(&local).earliest())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|| Utc.from_utc_datetime(&local)),
            Self::Zone(tz) => tz
                .from_local_datetime(&local)
                .earliest()
                .or_else(|| tz.from_local_datetime(&(local + Duration::hours(1))).earliest())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|| Utc.from_utc_datetime(&local)),
        }
    }
}

impl std::fmt::Display for TimezoneRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Utc => write!(f, "UTC"),
            Self::Fixed(minutes) => {
                let sign = if *minutes < 0 { '-' } else { '+' };
                let abs = minutes.abs();
                write!(f, "{}{:02}:{:02}", sign, abs / 60, abs % 60)
            }
            Self::Zone(tz) => write!(f, "{}", tz.name()),
        }
    }
}

impl std::str::FromStr for TimezoneRule {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("utc") || s.eq_ignore_ascii_case("gmt") {
            return Ok(Self::Utc);
        }

        if let Some(rest) = s.strip_prefix('+').or_else(|| s.strip_prefix('-')) {
            let sign = if s.starts_with('-') { -1 } else { 1 };
            let (h, m) = rest.split_once(':').unwrap_or((rest, "0"));
            let hours: i32 = h
                .parse()
                .map_err(|_| EngineError::Configuration(format!("bad offset '{s}'")))?;
            let minutes: i32 = m
                .parse()
                .map_err(|_| EngineError::Configuration(format!("bad offset '{s}'")))?;
            if hours > 14 || minutes >= 60 {
                return Err(EngineError::Configuration(format!("offset out of range '{s}'")));
            }
            return Ok(Self::Fixed(sign * (hours * 60 + minutes)));
        }

        s.parse::<Tz>()
            .map(Self::Zone)
            .map_err(|_| EngineError::Configuration(format!("unknown timezone '{s}'")))
    }
}

impl TryFrom<String> for TimezoneRule {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TimezoneRule> for String {
    fn from(value: TimezoneRule) -> Self {
        value.to_string()
    }
}

/// Segment of the trading day
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionPhase {
    PreRange,
    InRange,
    PostRangeTrading,
    AfterCutoff,
    ForcedExit,
}

impl SessionPhase {
    /// Position of the phase within the day. Comparisons go through this,
    /// not through variant declaration order.
    pub fn rank(&self) -> u8 {
        match self {
            Self::PreRange => 0,
            Self::InRange => 1,
            Self::PostRangeTrading => 2,
            Self::AfterCutoff => 3,
            Self::ForcedExit => 4,
        }
    }

    /// True once the trading window has closed for the day
    pub fn is_past_cutoff(&self) -> bool {
        self.rank() > Self::PostRangeTrading.rank()
    }
}

impl PartialOrd for SessionPhase {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SessionPhase {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PreRange => write!(f, "PRE-RANGE"),
            Self::InRange => write!(f, "IN-RANGE"),
            Self::PostRangeTrading => write!(f, "TRADING"),
            Self::AfterCutoff => write!(f, "AFTER-CUTOFF"),
            Self::ForcedExit => write!(f, "FORCED-EXIT"),
        }
    }
}

/// The four daily boundaries, in reference-timezone wall-clock time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionBoundaries {
    pub range_start: TimeOfDay,
    pub range_end: TimeOfDay,
    pub trading_cutoff: TimeOfDay,
    pub force_exit: TimeOfDay,
}

impl SessionBoundaries {
    /// Require rangeStart <= rangeEnd <= tradingCutoff <= forceExit
    pub fn validate(&self) -> Result<()> {
        let ordered = [
            ("range_start", self.range_start),
            ("range_end", self.range_end),
            ("trading_cutoff", self.trading_cutoff),
            ("force_exit", self.force_exit),
        ];
        for pair in ordered.windows(2) {
            let (a_name, a) = pair[0];
            let (b_name, b) = pair[1];
            if a.minutes() > b.minutes() {
                return Err(EngineError::Configuration(format!(
                    "{a_name} ({a}) must not be later than {b_name} ({b})"
                )));
            }
        }
        Ok(())
    }

    /// Phase for a minute of the day. Minutes past the end of the day clamp
    /// into ForcedExit.
    pub fn phase_at(&self, minute_of_day: u32) -> SessionPhase {
        if minute_of_day < self.range_start.minutes() {
            SessionPhase::PreRange
        } else if minute_of_day < self.range_end.minutes() {
            SessionPhase::InRange
        } else if minute_of_day < self.trading_cutoff.minutes() {
            SessionPhase::PostRangeTrading
        } else if minute_of_day < self.force_exit.minutes() {
            SessionPhase::AfterCutoff
        } else {
            SessionPhase::ForcedExit
        }
    }
}

/// Debounced clock over a raw time source
pub struct TradingClock<T: TimeSource> {
    source: T,
    timezone: TimezoneRule,
    boundaries: SessionBoundaries,
    last_raw: DateTime<Utc>,
    local: NaiveDateTime,
    last_day: Option<NaiveDate>,
    recomputes: u64,
}

impl<T: TimeSource> TradingClock<T> {
    /// Validate the boundaries and take an initial reading
    pub fn new(source: T, timezone: TimezoneRule, boundaries: SessionBoundaries) -> Result<Self> {
        boundaries.validate()?;
        let raw = source.now();
        let local = timezone.localize(raw);
        Ok(Self {
            source,
            timezone,
            boundaries,
            last_raw: raw,
            local,
            last_day: None,
            recomputes: 1,
        })
    }

    /// Re-read the source. Returns false (and does nothing) when raw time has
    /// not advanced since the previous call.
    pub fn update(&mut self) -> bool {
        let raw = self.source.now();
        if raw <= self.last_raw {
            return false;
        }
        self.last_raw = raw;
        self.local = self.timezone.localize(raw);
        self.recomputes += 1;
        true
    }

    /// Current phase of the day
    pub fn phase(&self) -> SessionPhase {
        self.boundaries.phase_at(self.minute_of_day())
    }

    /// True exactly once per calendar-day transition. Calling it consumes the
    /// transition. The first day the clock observes is not a rollover.
    pub fn detect_day_rollover(&mut self) -> bool {
        let today = self.local.date();
        match self.last_day {
            None => {
                self.last_day = Some(today);
                false
            }
            Some(day) if day != today => {
                debug!("Day rollover {} -> {}", day, today);
                self.last_day = Some(today);
                true
            }
            Some(_) => false,
        }
    }

    pub fn minute_of_day(&self) -> u32 {
        self.local.hour() * 60 + self.local.minute()
    }

    /// Calendar day in the reference timezone
    pub fn today(&self) -> NaiveDate {
        self.local.date()
    }

    pub fn local_time(&self) -> NaiveDateTime {
        self.local
    }

    /// Raw time of the last recompute
    pub fn now_utc(&self) -> DateTime<Utc> {
        self.last_raw
    }

    pub fn boundaries(&self) -> &SessionBoundaries {
        &self.boundaries
    }

    pub fn timezone(&self) -> TimezoneRule {
        self.timezone
    }

    /// Number of times normalized time was recomputed
    pub fn recompute_count(&self) -> u64 {
        self.recomputes
    }

    /// UTC instants of a reference-timezone window on `date`
    pub fn window_bounds(
        &self,
        date: NaiveDate,
        start: TimeOfDay,
        end: TimeOfDay,
    ) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = self.timezone.to_utc(date.and_time(start.to_naive_time()));
        let end = self.timezone.to_utc(date.and_time(end.to_naive_time()));
        (start, end)
    }

    /// The opening-range window for `date`
    pub fn range_window(&self, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        self.window_bounds(date, self.boundaries.range_start, self.boundaries.range_end)
    }
}
