//! Timestamp conversions shared by storage, ingestion and the read API.

use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeError {
    #[error("unparseable timestamp: {0:?}")]
    Unparseable(String),

    #[error("epoch millis out of range: {0}")]
    OutOfRange(i64),
}

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Parses RFC 3339 (`2025-01-02T09:30:00Z`, offsets allowed) or a naive
/// `YYYY-MM-DD HH:MM:SS[.f]`, which is taken as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, TimeError> {
    let raw = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }

    // Postgres renders timestamptz as `2025-01-02 09:30:00+00`.
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Ok(dt.with_timezone(&Utc));
    }

    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| TimeError::Unparseable(raw.to_string()))
}

pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub fn from_millis(ms: i64) -> Result<DateTime<Utc>, TimeError> {
    DateTime::from_timestamp_millis(ms).ok_or(TimeError::OutOfRange(ms))
}
