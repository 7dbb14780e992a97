//! Row mapping helpers shared by the repositories.
//!
//! Timestamps are ISO-8601 UTC strings; JSON-typed columns are serialized
//! JSON strings (NULL maps to None).

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{Result, StoreError};

pub fn now_ts() -> String {
    to_ts(Utc::now())
}

/// Fixed-width RFC 3339 so lexicographic ordering matches time ordering.
pub fn to_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, false)
}

pub fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptRow(format!("bad timestamp {:?}: {}", s, e)))
}

pub fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

pub fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

pub fn to_opt_json<T: Serialize>(value: &Option<T>) -> Result<Option<String>> {
    value.as_ref().map(|v| to_json(v)).transpose()
}

pub fn parse_opt_json<T: DeserializeOwned>(s: Option<String>) -> Result<Option<T>> {
    s.as_deref().map(|v| Ok(serde_json::from_str(v)?)).transpose()
}
