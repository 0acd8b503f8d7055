//! Normalization of persisted expiry timestamps.
//!
//! Records written by older versions, other tools, or by hand may carry
//! `expiresAt` as an RFC 3339 string, as epoch milliseconds, or wrapped in the
//! Halo API date object. Everything is coerced to `DateTime<Utc>` before any
//! comparison against the clock.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

/// Field name used for expiry in persisted token records
pub const EXPIRES_AT: &str = "expiresAt";

/// Parse an RFC 3339 timestamp; offset-less timestamps are read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Coerce any supported expiry representation into a UTC timestamp.
pub fn coalesce_date_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => parse_timestamp(raw),
        Value::Number(millis) => millis.as_i64().and_then(DateTime::from_timestamp_millis),
        Value::Object(map) => map.get("ISO8601Date").and_then(coalesce_date_time),
        _ => None,
    }
}

/// Rewrite a record's `expiresAt` into canonical RFC 3339 form.
///
/// Returns `None` when the record is not an object or its expiry is missing or
/// unparsable.
pub fn normalize_record(mut record: Value) -> Option<Value> {
    let fields = record.as_object_mut()?;
    let expires_at = coalesce_date_time(fields.get(EXPIRES_AT)?)?;
    fields.insert(EXPIRES_AT.to_string(), Value::String(expires_at.to_rfc3339()));
    Some(record)
}
