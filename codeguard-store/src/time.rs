//! Timestamp encoding.
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC text with microsecond
//! precision (`2025-01-31T12:00:00.000000Z`), so lexicographic order in SQL
//! matches chronological order and window filters can use plain `>=`.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::Row;

/// Encode a timestamp for storage.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Decode a stored timestamp.
pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|ts| ts.with_timezone(&Utc))
}

pub(crate) fn column_ts(row: &Row, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(column)?;
    decode(row, column, &raw)
}

pub(crate) fn column_opt_ts(row: &Row, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(column)?;
    raw.map(|raw| decode(row, column, &raw)).transpose()
}

fn decode(row: &Row, column: &str, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    parse_ts(raw).map_err(|e| {
        let index = row.as_ref().column_index(column).unwrap_or_default();
        rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e))
    })
}
