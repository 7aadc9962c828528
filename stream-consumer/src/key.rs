//! Dedup key derivation.
//!
//! A record carrying an explicit identity uses it verbatim. Otherwise the key is a
//! SipHash of a fixed tuple of fields that do not change when the same event is
//! delivered twice.
use std::fmt;
use std::hash::Hasher;

use serde_json::{Map, Value};
use siphasher::sip::SipHasher24;

use crate::error::KeyError;

/// Identity fields, most specific first. Dotted names address nested objects.
const IDENTITY_FIELDS: &[&str] = &["event_id", "revision.new", "rev_id", "id"];

/// Fallback tuple. Each slot takes the first of its alternatives that is present.
const FALLBACK_FIELDS: &[&[&str]] = &[
    &["timestamp", "ts"],
    &["user_id", "user"],
    &["campaign_id", "page_id", "title"],
    &["event_type", "type"],
];

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for DedupKey {
    fn from(key: String) -> Self {
        DedupKey(key)
    }
}

impl From<&str> for DedupKey {
    fn from(key: &str) -> Self {
        DedupKey(key.to_owned())
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn lookup<'a>(record: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    let mut parts = field.split('.');
    let mut current = record.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    match current {
        Value::Null => None,
        value => Some(value),
    }
}

fn identity(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
        _ => None,
    }
}

pub fn derive_key(record: &Map<String, Value>) -> Result<DedupKey, KeyError> {
    if let Some(key) = IDENTITY_FIELDS
        .iter()
        .find_map(|field| lookup(record, field).and_then(identity))
    {
        return Ok(DedupKey(key));
    }

    let slots: Vec<Option<&Value>> = FALLBACK_FIELDS
        .iter()
        .map(|alternatives| alternatives.iter().find_map(|field| lookup(record, field)))
        .collect();

    if slots.iter().all(Option::is_none) {
        return Err(KeyError::NoIdentity);
    }

    // Zero keys: the hash must be identical across processes and restarts.
    let mut hasher = SipHasher24::new_with_keys(0, 0);
    for (i, slot) in slots.iter().enumerate() {
        if i > 0 {
            hasher.write(b"|");
        }
        let rendered = slot.map_or_else(|| "null".to_owned(), |value| value.to_string());
        hasher.write(rendered.as_bytes());
    }

    Ok(DedupKey(format!("{:016x}", hasher.finish())))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_identity_fields_in_priority_order() {
        let record = object(json!({"id": 1, "rev_id": 2, "revision": {"new": 3}, "event_id": "e-4"}));
        assert_eq!(derive_key(&record).unwrap().as_str(), "e-4");

        let record = object(json!({"id": 1, "rev_id": 2, "revision": {"new": 3, "old": 2}}));
        assert_eq!(derive_key(&record).unwrap().as_str(), "3");

        let record = object(json!({"id": 1, "rev_id": 2}));
        assert_eq!(derive_key(&record).unwrap().as_str(), "2");

        let record = object(json!({"id": 42, "user": "a"}));
        assert_eq!(derive_key(&record).unwrap().as_str(), "42");
    }

    #[test]
    fn test_unusable_identity_falls_through() {
        let record = object(json!({"event_id": "  ", "rev_id": 1.5, "id": "abc"}));
        assert_eq!(derive_key(&record).unwrap().as_str(), "abc");
    }

    #[test]
    fn test_fallback_hash_is_stable_and_ignores_other_fields() {
        let a = object(json!({"ts": 1000, "user": "a", "title": "Main", "type": "edit", "comment": "x"}));
        let b = object(json!({"type": "edit", "title": "Main", "user": "a", "ts": 1000, "comment": "y"}));

        let key = derive_key(&a).unwrap();
        assert_eq!(key, derive_key(&b).unwrap());
        assert_eq!(key.as_str().len(), 16);
        assert!(key.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fallback_hash_distinguishes_events() {
        let a = object(json!({"ts": 1000, "user": "a", "type": "edit"}));
        let b = object(json!({"ts": 1001, "user": "a", "type": "edit"}));
        assert_ne!(derive_key(&a).unwrap(), derive_key(&b).unwrap());
    }

    #[test]
    fn test_no_usable_fields_is_an_error() {
        let record = object(json!({"comment": "nothing to key on", "id": null}));
        assert_eq!(derive_key(&record), Err(KeyError::NoIdentity));
    }
}
