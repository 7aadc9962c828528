use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ParseError;
use crate::key::{lookup, DedupKey};

/// Epoch values above this are taken to be milliseconds, anything below seconds.
const EPOCH_MILLIS_THRESHOLD: f64 = 1e11;

/// The canonical output record. Optional fields absent from the source are omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wiki: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minor: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub len_old: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub len_new: Option<i64>,
    /// `len_new - len_old`, only when both are integers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    pub processed_at: String,
}

/// Structural parse of a raw line. Nothing beyond "is a JSON object" is validated.
pub fn parse_line(line: &str) -> Result<Map<String, Value>, ParseError> {
    match serde_json::from_str::<Value>(line)? {
        Value::Object(map) => Ok(map),
        _ => Err(ParseError::NotAnObject),
    }
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn string_field(record: &Map<String, Value>, field: &str) -> Option<String> {
    lookup(record, field)?.as_str().map(str::to_owned)
}

fn first_string(record: &Map<String, Value>, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|field| match lookup(record, field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn epoch(value: f64) -> Option<DateTime<Utc>> {
    let millis = if value.abs() > EPOCH_MILLIS_THRESHOLD {
        value
    } else {
        value * 1000.0
    };
    if !millis.is_finite() {
        return None;
    }
    Utc.timestamp_millis_opt(millis.round() as i64).single()
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => epoch(n.as_f64()?),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    }
}

/// Event time from `meta.dt`, then `timestamp`, then `ts`. Falls back to `now`.
fn event_time(record: &Map<String, Value>, now: DateTime<Utc>) -> DateTime<Utc> {
    ["meta.dt", "timestamp", "ts"]
        .iter()
        .find_map(|field| lookup(record, field).and_then(parse_timestamp))
        .unwrap_or(now)
}

fn lengths(record: &Map<String, Value>) -> (Option<i64>, Option<i64>) {
    let old = lookup(record, "length.old").or_else(|| lookup(record, "len_old"));
    let new = lookup(record, "length.new").or_else(|| lookup(record, "len_new"));
    (old.and_then(Value::as_i64), new.and_then(Value::as_i64))
}

pub fn normalize(key: &DedupKey, record: &Map<String, Value>, now: DateTime<Utc>) -> NormalizedRecord {
    let title = string_field(record, "title");
    let wiki = string_field(record, "wiki");
    let namespace = lookup(record, "namespace").and_then(Value::as_i64);
    let (len_old, len_new) = lengths(record);

    let page_key = title.as_ref().map(|title| {
        format!(
            "{}:{}:{}",
            wiki.as_deref().unwrap_or_default(),
            namespace.unwrap_or_default(),
            title
        )
    });

    NormalizedRecord {
        key: key.to_string(),
        kind: first_string(record, &["event_type", "type"]).unwrap_or_else(|| "unknown".to_owned()),
        timestamp: rfc3339(event_time(record, now)),
        user: first_string(record, &["user", "user_id"]),
        title,
        wiki,
        namespace,
        comment: string_field(record, "comment"),
        page_key,
        bot: lookup(record, "bot").and_then(Value::as_bool),
        minor: lookup(record, "minor").and_then(Value::as_bool),
        len_old,
        len_new,
        delta: len_old.zip(len_new).and_then(|(old, new)| new.checked_sub(old)),
        processed_at: rfc3339(now),
    }
}
