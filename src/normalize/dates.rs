//! Date specifications: absolute timestamps, epoch numbers, and relative phrases.
//!
//! Every function takes `now` explicitly so results are reproducible.

use std::sync::LazyLock;

use chrono::{
    DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, TimeZone, Utc,
};
use regex::Regex;
use serde_json::Value;

/// `now-3d`, `now+12h`, `now-2w`
static NOW_OFFSET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^now\s*([+-])\s*(\d+)\s*([hdwmy])$").unwrap());

/// `7d`, `24h`, `2w`, `3m`, `1y`
static SHORT_SPAN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d+)\s*([hdwmy])$").unwrap());

/// `last 7 days`, `past 2 weeks`, `3 months ago`, `past week`
static PHRASE_SPAN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?:last|past)\s+)?(\d+\s*)?(hour|day|week|month|year)s?(\s+ago)?$").unwrap()
});

/// A resolved date specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateSpec {
    /// A single absolute point in time.
    Instant(DateTime<Utc>),
    /// A completed period `[start, end)`.
    Window {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    /// A relative lower bound; the period runs up to now.
    Since(DateTime<Utc>),
    /// A future point; the period runs from now until it.
    Until(DateTime<Utc>),
}

impl DateSpec {
    /// Lower bound when the spec starts a range.
    pub fn start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            DateSpec::Instant(t) | DateSpec::Since(t) => t,
            DateSpec::Window { start, .. } => start,
            DateSpec::Until(_) => now,
        }
    }

    /// Whether the spec is relative to `now` (and therefore open-ended up to it).
    pub fn is_relative(&self) -> bool {
        matches!(self, DateSpec::Since(_) | DateSpec::Until(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl Unit {
    fn from_letter(c: &str) -> Option<Self> {
        match c {
            "h" => Some(Unit::Hour),
            "d" => Some(Unit::Day),
            "w" => Some(Unit::Week),
            "m" => Some(Unit::Month),
            "y" => Some(Unit::Year),
            _ => None,
        }
    }

    fn from_word(w: &str) -> Option<Self> {
        match w {
            "hour" => Some(Unit::Hour),
            "day" => Some(Unit::Day),
            "week" => Some(Unit::Week),
            "month" => Some(Unit::Month),
            "year" => Some(Unit::Year),
            _ => None,
        }
    }
}

fn shift(now: DateTime<Utc>, amount: u32, unit: Unit, forward: bool) -> Option<DateTime<Utc>> {
    let span = match unit {
        Unit::Hour => Duration::hours(amount.into()),
        Unit::Day => Duration::days(amount.into()),
        Unit::Week => Duration::weeks(amount.into()),
        Unit::Month | Unit::Year => {
            let months = if unit == Unit::Year { amount.checked_mul(12)? } else { amount };
            return if forward {
                now.checked_add_months(Months::new(months))
            } else {
                now.checked_sub_months(Months::new(months))
            };
        }
    };
    if forward {
        now.checked_add_signed(span)
    } else {
        now.checked_sub_signed(span)
    }
}

fn start_of_day(t: DateTime<Utc>) -> DateTime<Utc> {
    t.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|d| Utc.from_utc_datetime(&d))
        .unwrap_or(t)
}

fn first_of_month(year: i32, month: u32) -> Option<DateTime<Utc>> {
    let date = NaiveDate::from_ymd_opt(year, month, 1)?;
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}

fn named_period(phrase: &str, now: DateTime<Utc>) -> Option<DateSpec> {
    let today = start_of_day(now);
    let monday = today - Duration::days(now.weekday().num_days_from_monday().into());
    let this_month = first_of_month(now.year(), now.month())?;
    let this_year = first_of_month(now.year(), 1)?;

    let spec = match phrase {
        "today" => DateSpec::Since(today),
        "yesterday" => DateSpec::Window {
            start: today - Duration::days(1),
            end: today,
        },
        "this_week" => DateSpec::Since(monday),
        "last_week" => DateSpec::Window {
            start: monday - Duration::weeks(1),
            end: monday,
        },
        "this_month" => DateSpec::Since(this_month),
        "last_month" => DateSpec::Window {
            start: this_month.checked_sub_months(Months::new(1))?,
            end: this_month,
        },
        "this_year" => DateSpec::Since(this_year),
        "last_year" => DateSpec::Window {
            start: first_of_month(now.year() - 1, 1)?,
            end: this_year,
        },
        _ => return None,
    };
    Some(spec)
}

fn parse_phrase(raw: &str, now: DateTime<Utc>) -> Option<DateSpec> {
    let phrase = raw.trim().to_ascii_lowercase().replace('_', " ");
    let words: Vec<&str> = phrase.split_whitespace().collect();
    if let Some(spec) = named_period(&words.join("_"), now) {
        return Some(spec);
    }

    let compact = words.join(" ");

    if let Some(caps) = NOW_OFFSET.captures(&compact) {
        let forward = &caps[1] == "+";
        let amount: u32 = caps[2].parse().ok()?;
        let unit = Unit::from_letter(&caps[3])?;
        let t = shift(now, amount, unit, forward)?;
        return Some(if forward {
            DateSpec::Until(t)
        } else {
            DateSpec::Since(t)
        });
    }

    if let Some(caps) = SHORT_SPAN.captures(&compact) {
        let amount: u32 = caps[1].parse().ok()?;
        let unit = Unit::from_letter(&caps[2])?;
        return shift(now, amount, unit, false).map(DateSpec::Since);
    }

    if let Some(caps) = PHRASE_SPAN.captures(&compact) {
        // A bare unit ("day", "weeks") is not a phrase.
        let qualified = compact.starts_with("last") || compact.starts_with("past");
        let amount: u32 = match caps.get(1) {
            Some(m) => m.as_str().trim().parse().ok()?,
            None if qualified => 1,
            None => return None,
        };
        let unit = Unit::from_word(&caps[2])?;
        return shift(now, amount, unit, false).map(DateSpec::Since);
    }

    None
}

fn parse_absolute(raw: &str) -> Option<DateSpec> {
    let raw = raw.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(DateSpec::Instant(t.with_timezone(&Utc)));
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(DateSpec::Instant(Utc.from_utc_datetime(&t)));
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(DateSpec::Instant(Utc.from_utc_datetime(&t)));
    }
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let start = Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0)?);
        return Some(DateSpec::Window {
            start,
            end: start + Duration::days(1),
        });
    }
    None
}

/// Epoch seconds or milliseconds; values above 1e11 are taken as milliseconds.
fn parse_epoch(n: f64) -> Option<DateSpec> {
    if !n.is_finite() {
        return None;
    }
    let millis = if n.abs() > 1e11 { n } else { n * 1000.0 };
    DateTime::from_timestamp_millis(millis as i64).map(DateSpec::Instant)
}

/// Resolve one raw date value.
pub fn parse_date_spec(value: &Value, now: DateTime<Utc>) -> Option<DateSpec> {
    match value {
        Value::Number(n) => parse_epoch(n.as_f64()?),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            if let Ok(n) = s.parse::<f64>() {
                return parse_epoch(n);
            }
            parse_absolute(s).or_else(|| parse_phrase(s, now))
        }
        _ => None,
    }
}

/// A duration value: a number of days or any span phrase (`7d`, `2 weeks`).
pub fn parse_duration_spec(value: &Value, now: DateTime<Utc>) -> Option<DateSpec> {
    match value {
        Value::Number(n) => {
            let days = n.as_u64()?;
            let days = u32::try_from(days).ok()?;
            shift(now, days, Unit::Day, false).map(DateSpec::Since)
        }
        Value::String(s) => match parse_phrase(s, now)? {
            spec @ DateSpec::Since(_) => Some(spec),
            _ => None,
        },
        _ => None,
    }
}
