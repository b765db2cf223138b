//! Schedules and occurrence calculation.
//!
//! A schedule is an infinite series of points in time anchored at a start
//! time. The only shipped variant is [`FixedSchedule`], which fires every
//! `interval` starting from `start`. Expressions use the `@every` form
//! (`@every 5m`, `@every 1h30m`).
//!
//! Occurrences are kept to whole microseconds, the precision at which run
//! times are stored.

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use std::fmt;
use thiserror::Error;

const NANOS_PER_SEC: i128 = 1_000_000_000;
const NANOS_PER_MICRO: i128 = 1_000;

/// Errors that can occur when parsing or building schedules.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// Interval is zero, negative, finer than a microsecond or unparsable.
    #[error("invalid interval expression: {0}")]
    InvalidInterval(String),

    /// Expression is not of a supported form.
    #[error("invalid schedule expression: {0}")]
    InvalidExpression(String),
}

/// A time series generator used to decide when DAG runs are due.
pub trait Schedule: Send + Sync + fmt::Debug + fmt::Display {
    /// First occurrence of the schedule.
    fn start_time(&self) -> DateTime<Utc>;

    /// First occurrence strictly after `after`.
    ///
    /// Returns the start time when `after` is before the start.
    fn next(&self, after: DateTime<Utc>) -> DateTime<Utc>;

    /// Latest occurrence at or before `at`, or `None` if `at` precedes the start.
    fn last_at_or_before(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>>;
}

/// Fires at `start + k * interval` for every `k >= 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedSchedule {
    start: DateTime<Utc>,
    interval: TimeDelta,
}

impl FixedSchedule {
    /// Create a schedule. The interval must be a positive whole number of
    /// microseconds. The start is truncated to the microsecond.
    pub fn new(start: DateTime<Utc>, interval: TimeDelta) -> Result<Self, ScheduleError> {
        if interval <= TimeDelta::zero() {
            return Err(ScheduleError::InvalidInterval(format!(
                "interval must be positive, got {}",
                interval
            )));
        }
        if total_nanos(interval) % NANOS_PER_MICRO != 0 {
            return Err(ScheduleError::InvalidInterval(format!(
                "interval must be a whole number of microseconds, got {}",
                interval
            )));
        }
        Ok(Self {
            start: start.trunc_subsecs(6),
            interval,
        })
    }

    /// Parse an `@every <duration>` expression anchored at `start`.
    pub fn parse(expression: &str, start: DateTime<Utc>) -> Result<Self, ScheduleError> {
        let trimmed = expression.trim();
        let rest = trimmed
            .strip_prefix("@every ")
            .ok_or_else(|| ScheduleError::InvalidExpression(trimmed.to_string()))?;
        let interval = parse_duration(rest.trim())?;
        Self::new(start, interval)
    }

    /// The interval between occurrences.
    pub fn interval(&self) -> TimeDelta {
        self.interval
    }

    /// The `n`-th occurrence, counting the start as occurrence zero.
    ///
    /// `None` when the result does not fit in a `DateTime<Utc>`.
    pub fn occurrence(&self, n: i64) -> Option<DateTime<Utc>> {
        let offset = total_nanos(self.interval).checked_mul(n as i128)?;
        let secs = i64::try_from(offset.div_euclid(NANOS_PER_SEC)).ok()?;
        let nanos = offset.rem_euclid(NANOS_PER_SEC) as u32;
        self.start.checked_add_signed(TimeDelta::new(secs, nanos)?)
    }

    /// Index of the latest occurrence at or before `at`.
    fn index_at_or_before(&self, at: DateTime<Utc>) -> Option<i64> {
        if at < self.start {
            return None;
        }
        let elapsed = total_nanos(at - self.start);
        i64::try_from(elapsed / total_nanos(self.interval)).ok()
    }
}

impl Schedule for FixedSchedule {
    fn start_time(&self) -> DateTime<Utc> {
        self.start
    }

    fn next(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        match self.index_at_or_before(after) {
            None => self.start,
            Some(n) => n
                .checked_add(1)
                .and_then(|k| self.occurrence(k))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    fn last_at_or_before(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.index_at_or_before(at).and_then(|n| self.occurrence(n))
    }
}

impl fmt::Display for FixedSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@every {}", format_duration(self.interval))
    }
}

fn total_nanos(delta: TimeDelta) -> i128 {
    delta.num_seconds() as i128 * NANOS_PER_SEC + delta.subsec_nanos() as i128
}

const UNITS: [(&str, i128); 7] = [
    ("d", 86_400 * NANOS_PER_SEC),
    ("h", 3_600 * NANOS_PER_SEC),
    ("m", 60 * NANOS_PER_SEC),
    ("s", NANOS_PER_SEC),
    ("ms", 1_000_000),
    ("us", 1_000),
    ("ns", 1),
];

/// Parse a duration string like "5m", "1h30m", "30s" or "1d12h".
pub fn parse_duration(s: &str) -> Result<TimeDelta, ScheduleError> {
    let invalid = || ScheduleError::InvalidInterval(s.to_string());
    let mut total: i128 = 0;
    let mut chars = s.chars().peekable();

    if chars.peek().is_none() {
        return Err(invalid());
    }

    while chars.peek().is_some() {
        let mut num = String::new();
        while let Some(c) = chars.peek().filter(|c| c.is_ascii_digit()) {
            num.push(*c);
            chars.next();
        }
        let mut unit = String::new();
        while let Some(c) = chars.peek().filter(|c| c.is_ascii_alphabetic()) {
            unit.push(*c);
            chars.next();
        }

        let value: i128 = num.parse().map_err(|_| invalid())?;
        let scale = UNITS
            .iter()
            .find(|(name, _)| *name == unit)
            .map(|(_, scale)| *scale)
            .ok_or_else(invalid)?;
        total = value
            .checked_mul(scale)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(invalid)?;
    }

    if total == 0 {
        return Err(invalid());
    }

    let secs = i64::try_from(total / NANOS_PER_SEC).map_err(|_| invalid())?;
    let nanos = (total % NANOS_PER_SEC) as u32;
    TimeDelta::new(secs, nanos).ok_or_else(invalid)
}

/// Canonical text form of a positive duration, largest units first.
///
/// Equal durations always format the same way, so `90m` and `1h30m` both
/// render as `1h30m`.
pub fn format_duration(delta: TimeDelta) -> String {
    let mut remaining = total_nanos(delta);
    if remaining <= 0 {
        return "0s".to_string();
    }
    let mut out = String::new();
    for (name, scale) in UNITS {
        let count = remaining / scale;
        if count > 0 {
            out.push_str(&format!("{}{}", count, name));
            remaining -= count * scale;
        }
    }
    out
}
