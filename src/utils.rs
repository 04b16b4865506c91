//! Shared helpers for timestamps and bulk SQL statements.
//!
//! Timestamps are persisted as fixed-width RFC 3339 UTC strings
//! (`2024-05-01T12:00:00.000000Z`), so comparing the stored text in SQL gives
//! the same answer as comparing the instants.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};

use crate::error::{Error, Result};

/// Largest number of bound parameters used by one `IN (...)` lookup.
pub const MAX_IN_CLAUSE: usize = 500;

/// Format a timestamp in the canonical stored form.
#[must_use]
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// The current time in the canonical stored form.
#[must_use]
pub fn now_timestamp() -> String {
    format_timestamp(&Utc::now())
}

/// Parse a stored or imported timestamp leniently.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.f]`, `YYYY-MM-DDTHH:MM:SS[.f]`
/// (read as UTC) and a bare `YYYY-MM-DD`. Anything else yields `None`, which
/// callers treat as an absent timestamp.
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for pattern in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, pattern) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Re-format an optional foreign timestamp into the canonical form.
///
/// Unparseable input is dropped rather than stored verbatim.
#[must_use]
pub fn normalize_timestamp(raw: Option<&str>) -> Option<String> {
    raw.and_then(parse_timestamp).map(|ts| format_timestamp(&ts))
}

/// Parse a user-supplied watermark or date filter.
pub fn parse_watermark(raw: &str) -> Result<DateTime<Utc>> {
    parse_timestamp(raw).ok_or_else(|| {
        Error::Validation(format!(
            "Invalid timestamp '{raw}'. Expected RFC 3339 or YYYY-MM-DD"
        ))
    })
}

/// Build `?, ?, ?` with `count` placeholders.
#[must_use]
pub fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}
