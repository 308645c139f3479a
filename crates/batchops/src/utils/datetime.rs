//! Timestamp parsing helpers for TEXT-stored datetimes

use crate::errors::RepositoryError;
use chrono::{DateTime, NaiveDateTime, Utc};

/// Parse a stored timestamp from either RFC3339 or the bare SQLite format
pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(dt.and_utc());
    }
    Err(RepositoryError::DateTimeParse {
        value: s.to_string(),
    })
}

/// Parse an optional stored timestamp
pub fn parse_datetime_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    s.map(|v| parse_datetime(&v)).transpose()
}
