//! Due-date parsing.
//!
//! A strict pass accepts machine formats (RFC 3339, ISO dates). A lenient
//! pass then handles what people type into chat: "tomorrow", "Friday",
//! "in 3 days", "8. März", "March 8th", "8.3.". Relative words resolve
//! against "today" in the configured time zone.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Utc, Weekday};
use chrono_tz::Tz;
use regex::{Captures, Regex};
use std::sync::LazyLock;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid due date '{input}'")]
pub struct DueDateError {
    pub input: String,
}

// Literal patterns; `None` only if a pattern failed to compile.
static IN_N_UNITS: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^in\s+(\d{1,3})\s*(days?|weeks?|tagen?|wochen?)$").ok());
static WEEKDAY: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^(?:(?:next|this|coming|nächsten|nächster|nächste|kommenden|kommender|diesen)\s+)?([a-zäöü]+)$").ok()
});
static DAY_DOT_MONTH: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2})\.(\d{1,2})\.?(\d{2}|\d{4})?$").ok());
static MONTH_SLASH_DAY: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2})/(\d{1,2})(?:/(\d{4}))?$").ok());
static DAY_MONTH_NAME: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,2})(?:st|nd|rd|th|\.)?\s*(?:of\s+)?([a-zäöü]+)\.?,?(?:\s+(\d{4}))?$").ok()
});
static MONTH_NAME_DAY: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^([a-zäöü]+)\.?\s+(\d{1,2})(?:st|nd|rd|th|\.)?,?(?:\s+(\d{4}))?$").ok()
});

fn captures<'t>(re: &LazyLock<Option<Regex>>, text: &'t str) -> Option<Captures<'t>> {
    re.as_ref().and_then(|re| re.captures(text))
}

/// Resolve `input` to a calendar date. `now` is converted to `tz` to decide
/// what "today" is.
pub fn parse_due(input: &str, now: DateTime<Utc>, tz: Tz) -> Result<NaiveDate, DueDateError> {
    let trimmed = input.trim();
    let today = now.with_timezone(&tz).date_naive();
    parse_strict(trimmed, tz)
        .or_else(|| parse_lenient(trimmed, today))
        .ok_or_else(|| DueDateError {
            input: input.to_string(),
        })
}

/// RFC 3339 and ISO-like machine formats.
pub fn parse_strict(input: &str, tz: Tz) -> Option<NaiveDate> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&tz).date_naive());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, fmt) {
            return Some(naive.date());
        }
    }
    for fmt in ["%Y-%m-%d", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(input, fmt) {
            return Some(date);
        }
    }
    None
}

/// Natural-language dates in English and German.
pub fn parse_lenient(input: &str, today: NaiveDate) -> Option<NaiveDate> {
    let text = normalize(input);
    let text = text.as_str();

    match text {
        "today" | "heute" => return Some(today),
        "tomorrow" | "morgen" => return Some(today + Duration::days(1)),
        "day after tomorrow" | "übermorgen" => return Some(today + Duration::days(2)),
        "next week" | "nächste woche" | "in a week" | "in einer woche" => {
            return Some(today + Duration::weeks(1));
        }
        _ => {}
    }

    if let Some(caps) = captures(&IN_N_UNITS, text) {
        let n: i64 = caps.get(1)?.as_str().parse().ok()?;
        let unit = caps.get(2)?.as_str();
        return if unit.starts_with('w') {
            Some(today + Duration::weeks(n))
        } else {
            Some(today + Duration::days(n))
        };
    }

    if let Some(caps) = captures(&WEEKDAY, text)
        && let Some(weekday) = weekday_from_name(caps.get(1)?.as_str())
    {
        return Some(upcoming(today, weekday));
    }

    if let Some(caps) = captures(&DAY_DOT_MONTH, text) {
        let day: u32 = caps.get(1)?.as_str().parse().ok()?;
        let month: u32 = caps.get(2)?.as_str().parse().ok()?;
        let year = caps.get(3).and_then(|y| expand_year(y.as_str()));
        return resolve(today, year, month, day);
    }

    if let Some(caps) = captures(&MONTH_SLASH_DAY, text) {
        let month: u32 = caps.get(1)?.as_str().parse().ok()?;
        let day: u32 = caps.get(2)?.as_str().parse().ok()?;
        let year = caps.get(3).and_then(|y| y.as_str().parse().ok());
        return resolve(today, year, month, day);
    }

    if let Some(caps) = captures(&DAY_MONTH_NAME, text)
        && let Some(month) = month_from_name(caps.get(2)?.as_str())
    {
        let day: u32 = caps.get(1)?.as_str().parse().ok()?;
        let year = caps.get(3).and_then(|y| y.as_str().parse().ok());
        return resolve(today, year, month, day);
    }

    if let Some(caps) = captures(&MONTH_NAME_DAY, text)
        && let Some(month) = month_from_name(caps.get(1)?.as_str())
    {
        let day: u32 = caps.get(2)?.as_str().parse().ok()?;
        let year = caps.get(3).and_then(|y| y.as_str().parse().ok());
        return resolve(today, year, month, day);
    }

    None
}

fn normalize(input: &str) -> String {
    let lower = input.to_lowercase();
    let mut text = lower
        .trim()
        .trim_end_matches(['!', '?', ','])
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    for prefix in ["due ", "by ", "on ", "until ", "bis ", "am ", "zum ", "fällig "] {
        if let Some(rest) = text.strip_prefix(prefix) {
            text = rest.to_string();
        }
    }
    // "friday." but not "8.3."
    if text.ends_with('.') && !text.chars().rev().nth(1).is_some_and(|c| c.is_ascii_digit()) {
        text.pop();
    }
    text
}

/// The next `weekday` strictly after `today`.
fn upcoming(today: NaiveDate, weekday: Weekday) -> NaiveDate {
    let from = today.weekday().num_days_from_monday() as i64;
    let to = weekday.num_days_from_monday() as i64;
    let mut delta = (to - from).rem_euclid(7);
    if delta == 0 {
        delta = 7;
    }
    today + Duration::days(delta)
}

/// Dates without a year land on the next occurrence, today included.
fn resolve(today: NaiveDate, year: Option<i32>, month: u32, day: u32) -> Option<NaiveDate> {
    match year {
        Some(y) => NaiveDate::from_ymd_opt(y, month, day),
        None => {
            let this_year = NaiveDate::from_ymd_opt(today.year(), month, day)?;
            if this_year >= today {
                Some(this_year)
            } else {
                NaiveDate::from_ymd_opt(today.year() + 1, month, day)
            }
        }
    }
}

fn expand_year(raw: &str) -> Option<i32> {
    let y: i32 = raw.parse().ok()?;
    Some(if raw.len() == 2 { 2000 + y } else { y })
}

fn weekday_from_name(name: &str) -> Option<Weekday> {
    let wd = match name {
        "monday" | "mon" | "montag" => Weekday::Mon,
        "tuesday" | "tue" | "tues" | "dienstag" => Weekday::Tue,
        "wednesday" | "wed" | "mittwoch" => Weekday::Wed,
        "thursday" | "thu" | "thur" | "thurs" | "donnerstag" => Weekday::Thu,
        "friday" | "fri" | "freitag" => Weekday::Fri,
        "saturday" | "sat" | "samstag" | "sonnabend" => Weekday::Sat,
        "sunday" | "sun" | "sonntag" => Weekday::Sun,
        _ => return None,
    };
    Some(wd)
}

fn month_from_name(name: &str) -> Option<u32> {
    let m = match name {
        "january" | "jan" | "januar" => 1,
        "february" | "feb" | "februar" => 2,
        "march" | "mar" | "märz" | "maerz" | "mär" => 3,
        "april" | "apr" => 4,
        "may" | "mai" => 5,
        "june" | "jun" | "juni" => 6,
        "july" | "jul" | "juli" => 7,
        "august" | "aug" => 8,
        "september" | "sep" | "sept" => 9,
        "october" | "oct" | "oktober" | "okt" => 10,
        "november" | "nov" => 11,
        "december" | "dec" | "dezember" | "dez" => 12,
        _ => return None,
    };
    Some(m)
}

/// Midnight UTC on `date`, the form the task-list service stores due dates in.
pub fn due_instant(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    // 2024-03-04 is a Monday.
    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_strict_formats() {
        let tz = chrono_tz::UTC;
        assert_eq!(parse_strict("2024-03-08", tz), Some(d(2024, 3, 8)));
        assert_eq!(parse_strict("2024/03/08", tz), Some(d(2024, 3, 8)));
        assert_eq!(parse_strict("2024-03-08T10:00:00Z", tz), Some(d(2024, 3, 8)));
        assert_eq!(parse_strict("2024-03-08T10:00:00", tz), Some(d(2024, 3, 8)));
        assert_eq!(parse_strict("Friday", tz), None);
    }

    #[test]
    fn test_rfc3339_uses_zone() {
        let tz: Tz = "Europe/Berlin".parse().unwrap();
        assert_eq!(parse_strict("2024-03-07T23:30:00Z", tz), Some(d(2024, 3, 8)));
    }

    #[test]
    fn test_relative_words() {
        assert_eq!(parse_lenient("tomorrow", monday()), Some(d(2024, 3, 5)));
        assert_eq!(parse_lenient("Morgen", monday()), Some(d(2024, 3, 5)));
        assert_eq!(parse_lenient("today", monday()), Some(monday()));
        assert_eq!(parse_lenient("übermorgen", monday()), Some(d(2024, 3, 6)));
        assert_eq!(parse_lenient("next week", monday()), Some(d(2024, 3, 11)));
        assert_eq!(parse_lenient("in 3 days", monday()), Some(d(2024, 3, 7)));
        assert_eq!(parse_lenient("in 2 Wochen", monday()), Some(d(2024, 3, 18)));
    }

    #[test]
    fn test_weekdays() {
        assert_eq!(parse_lenient("Friday", monday()), Some(d(2024, 3, 8)));
        assert_eq!(parse_lenient("due friday.", monday()), Some(d(2024, 3, 8)));
        assert_eq!(parse_lenient("next Friday", monday()), Some(d(2024, 3, 8)));
        assert_eq!(parse_lenient("Freitag", monday()), Some(d(2024, 3, 8)));
        // Same weekday means a week from today.
        assert_eq!(parse_lenient("monday", monday()), Some(d(2024, 3, 11)));
    }

    #[test]
    fn test_numeric_dates() {
        assert_eq!(parse_lenient("8.3.", monday()), Some(d(2024, 3, 8)));
        assert_eq!(parse_lenient("08.03.2025", monday()), Some(d(2025, 3, 8)));
        assert_eq!(parse_lenient("8.3.25", monday()), Some(d(2025, 3, 8)));
        assert_eq!(parse_lenient("3/8", monday()), Some(d(2024, 3, 8)));
        // Already passed this year: next year.
        assert_eq!(parse_lenient("1.2.", monday()), Some(d(2025, 2, 1)));
    }

    #[test]
    fn test_month_names() {
        assert_eq!(parse_lenient("8. März", monday()), Some(d(2024, 3, 8)));
        assert_eq!(parse_lenient("March 8th", monday()), Some(d(2024, 3, 8)));
        assert_eq!(parse_lenient("8th of March", monday()), Some(d(2024, 3, 8)));
        assert_eq!(parse_lenient("Dec 24, 2024", monday()), Some(d(2024, 12, 24)));
    }

    #[test]
    fn test_rejects_nonsense() {
        assert_eq!(parse_lenient("whenever", monday()), None);
        assert_eq!(parse_lenient("31.2.", monday()), None);
        assert_eq!(parse_lenient("", monday()), None);
    }

    #[test]
    fn test_parse_due_uses_zone_for_today() {
        // 23:30 UTC Monday is already Tuesday in Berlin.
        let now = Utc.with_ymd_and_hms(2024, 3, 4, 23, 30, 0).unwrap();
        let berlin: Tz = "Europe/Berlin".parse().unwrap();
        assert_eq!(parse_due("tomorrow", now, berlin).unwrap(), d(2024, 3, 6));
        assert_eq!(parse_due("tomorrow", now, chrono_tz::UTC).unwrap(), d(2024, 3, 5));

        let err = parse_due("someday", now, chrono_tz::UTC).unwrap_err();
        assert_eq!(err.to_string(), "invalid due date 'someday'");
    }

    #[test]
    fn test_due_instant_is_midnight_utc() {
        assert_eq!(
            due_instant(d(2024, 3, 8)),
            Utc.with_ymd_and_hms(2024, 3, 8, 0, 0, 0).unwrap()
        );
    }
}
