//! Incremental watermark tracking.
//!
//! Watermark values arrive as JSON from the connectors and are persisted as
//! text. Two values compare numerically when both read as numbers,
//! chronologically when both read as timestamps, and lexicographically
//! otherwise.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use std::cmp::Ordering;

/// Canonical stored text of a watermark value; `None` for nulls.
pub fn to_stored(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// A watermark text that reads as a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimePoint {
    /// Wall-clock time without an offset
    Local(NaiveDateTime),
    /// Time with an explicit UTC offset
    Zoned(DateTime<FixedOffset>),
}

/// Reads RFC 3339 timestamps, `YYYY-MM-DD[ T]HH:MM:SS[.f]` and bare dates.
pub fn parse_time_point(text: &str) -> Option<TimePoint> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(TimePoint::Zoned(dt));
    }
    for fmt in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(TimePoint::Local(dt));
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(TimePoint::Local)
}

fn as_instant(text: &str) -> Option<DateTime<Utc>> {
    parse_time_point(text).map(|point| match point {
        TimePoint::Zoned(dt) => dt.with_timezone(&Utc),
        TimePoint::Local(dt) => dt.and_utc(),
    })
}

/// Orders two stored watermark texts.
pub fn compare(a: &str, b: &str) -> Ordering {
    if let (Ok(x), Ok(y)) = (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
        return x.partial_cmp(&y).unwrap_or(Ordering::Equal);
    }
    if let (Some(x), Some(y)) = (as_instant(a), as_instant(b)) {
        return x.cmp(&y);
    }
    a.cmp(b)
}

/// Running maximum of a table's watermark column over one extraction.
#[derive(Debug, Clone, Default)]
pub struct WatermarkTracker {
    previous: Option<String>,
    highest: Option<String>,
    /// Largest value seen strictly below `highest`.
    runner_up: Option<String>,
}

impl WatermarkTracker {
    /// Starts tracking from the value recorded by the last successful run.
    pub const fn new(previous: Option<String>) -> Self {
        Self {
            previous,
            highest: None,
            runner_up: None,
        }
    }

    /// Folds one extracted value into the maximum. Nulls are ignored.
    pub fn observe(&mut self, value: &Value) {
        let Some(candidate) = to_stored(value) else {
            return;
        };
        match self.highest.as_deref().map(|h| compare(&candidate, h)) {
            None => self.highest = Some(candidate),
            Some(Ordering::Greater) => self.runner_up = self.highest.replace(candidate),
            Some(Ordering::Less) => {
                let replace = self
                    .runner_up
                    .as_deref()
                    .is_none_or(|r| compare(&candidate, r) == Ordering::Greater);
                if replace {
                    self.runner_up = Some(candidate);
                }
            }
            Some(Ordering::Equal) => {}
        }
    }

    /// The value to persist, present only when it advances past the previous one.
    pub fn advanced(&self) -> Option<&str> {
        self.past_previous(self.highest.as_deref()?)
    }

    /// The value to persist when the read stopped at a row cap.
    ///
    /// Rows sharing the highest value may lie beyond the cap, so only the
    /// largest value below it counts as fully read. `None` when that value
    /// does not advance past the previous one.
    pub fn advanced_within_cap(&self) -> Option<&str> {
        self.past_previous(self.runner_up.as_deref()?)
    }

    fn past_previous<'a>(&self, value: &'a str) -> Option<&'a str> {
        match self.previous.as_deref() {
            Some(previous) if compare(value, previous) != Ordering::Greater => None,
            _ => Some(value),
        }
    }
}
