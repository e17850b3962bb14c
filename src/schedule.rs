//! Schedule expressions and due-instant computation
//!
//! Supported expressions:
//! - `@once`: a single run at `start_date`
//! - `@hourly`, `@daily`, `@weekly`
//! - `@every <duration>` or a bare duration such as `15m` or `6h`
//!
//! A workflow without a schedule is triggered manually only. Interval
//! instants are aligned to the workflow's `start_date`, and a run for an
//! instant becomes due once the clock has reached that instant.

use crate::error::{Result, TributaryError};
use crate::models::chrono_duration;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

/// Longest accepted interval: one century
pub const MAX_INTERVAL: Duration = Duration::from_secs(36_500 * 86_400);

/// `base + n * step_ms`, or `None` past the representable range
fn offset(base: DateTime<Utc>, step_ms: i64, n: i64) -> Option<DateTime<Utc>> {
    step_ms
        .checked_mul(n)
        .and_then(|ms| base.checked_add_signed(chrono::Duration::milliseconds(ms)))
}

/// When a workflow's runs are due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// No automatic runs
    Manual,
    /// Exactly one run, at the start date
    Once,
    /// Every `Duration`, starting at the start date
    Interval(Duration),
}

impl Schedule {
    /// Parse an optional schedule expression
    ///
    /// # Errors
    ///
    /// Returns `InvalidSchedule` for unknown presets, unparsable durations,
    /// zero intervals and intervals longer than [`MAX_INTERVAL`].
    pub fn parse(expr: Option<&str>) -> Result<Self> {
        let expr = match expr.map(str::trim) {
            None | Some("") => return Ok(Schedule::Manual),
            Some(expr) => expr,
        };

        let interval = match expr {
            "@once" => return Ok(Schedule::Once),
            "@hourly" => Duration::from_secs(3_600),
            "@daily" => Duration::from_secs(86_400),
            "@weekly" => Duration::from_secs(7 * 86_400),
            other => {
                let raw = other
                    .strip_prefix("@every")
                    .map(str::trim)
                    .unwrap_or(other);
                if raw.starts_with('@') {
                    return Err(TributaryError::InvalidSchedule(expr.to_string()));
                }
                humantime::parse_duration(raw)
                    .map_err(|_| TributaryError::InvalidSchedule(expr.to_string()))?
            }
        };

        if interval.is_zero() || interval > MAX_INTERVAL {
            return Err(TributaryError::InvalidSchedule(expr.to_string()));
        }

        Ok(Schedule::Interval(interval))
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, Schedule::Manual)
    }

    /// Schedule instants that should have runs by `now`.
    ///
    /// # Arguments
    ///
    /// * `start` - Anchor instant (`start_date`)
    /// * `last` - Logical date of the latest scheduled run, if any
    /// * `now` - Current time
    /// * `catchup` - Return every missed instant instead of only the latest
    /// * `limit` - Maximum number of instants returned
    ///
    /// # Returns
    ///
    /// Instants in ascending order, at most `limit` of them. Instants past
    /// the representable date range are never due.
    pub fn due_instants(
        &self,
        start: DateTime<Utc>,
        last: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        catchup: bool,
        limit: usize,
    ) -> Vec<DateTime<Utc>> {
        if limit == 0 {
            return Vec::new();
        }

        match self {
            Schedule::Manual => Vec::new(),
            Schedule::Once => {
                if last.is_none() && now >= start {
                    vec![start]
                } else {
                    Vec::new()
                }
            }
            Schedule::Interval(interval) => {
                let step_ms = chrono_duration(*interval).num_milliseconds().max(1);
                let next = match last {
                    Some(last) => match offset(last, step_ms, 1) {
                        Some(next) => next,
                        None => return Vec::new(),
                    },
                    None => start,
                };
                if next > now {
                    return Vec::new();
                }

                let missed = (now - next).num_milliseconds() / step_ms + 1;

                if catchup {
                    let count = missed.min(limit.min(i64::MAX as usize) as i64);
                    (0..count).map_while(|i| offset(next, step_ms, i)).collect()
                } else {
                    offset(next, step_ms, missed - 1).into_iter().collect()
                }
            }
        }
    }

    /// Aligned instants in `[from, to]`, used for backfills.
    ///
    /// Only interval schedules have instants; other schedules return nothing.
    pub fn instants_between(
        &self,
        start: DateTime<Utc>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<DateTime<Utc>> {
        let interval = match self {
            Schedule::Interval(interval) => *interval,
            _ => return Vec::new(),
        };
        if to < from {
            return Vec::new();
        }

        let step_ms = chrono_duration(interval).num_milliseconds().max(1);
        let offset_ms = (from - start).num_milliseconds();
        // First aligned instant at or after `from`
        let k = if offset_ms <= 0 {
            0
        } else {
            (offset_ms + step_ms - 1) / step_ms
        };

        let mut instants = Vec::new();
        let mut current = match offset(start, step_ms, k) {
            Some(current) => current,
            None => return instants,
        };
        while current < from {
            match offset(current, step_ms, 1) {
                Some(next) => current = next,
                None => return instants,
            }
        }
        while current <= to {
            instants.push(current);
            match offset(current, step_ms, 1) {
                Some(next) => current = next,
                None => break,
            }
        }
        instants
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Manual => write!(f, "manual"),
            Schedule::Once => write!(f, "@once"),
            Schedule::Interval(d) => write!(f, "@every {}", humantime::format_duration(*d)),
        }
    }
}
