// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! JSON representation
//!
//! Every [`Value`](crate::Value) converts to a [`serde_json::Value`]. Types without a JSON
//! counterpart are written as strings:
//!
//! | value | JSON |
//! |-------|------|
//! | bytes | base64 string (standard alphabet, padded) |
//! | timestamp | RFC 3339 string with millisecond precision, `Z` suffix |
//! | ulid | its canonical 26 character string |
//! | pattern | `/source/flags` |
//! | keyed map | object, keys rendered with their `Display` |
//! | set | array of its keys, in key order |
//! | non-finite float | `null` |
//!
//! # Example
//!
//! ```json
//! {
//!   "id": 1,
//!   "title": "Buy milk",
//!   "due": "2025-03-01T09:30:00.000Z",
//!   "tags": ["errand", "food"]
//! }
//! ```
//!
//! Converting back from JSON is lossless for everything JSON can express: objects become
//! [`Value::Object`](crate::Value::Object), and strings stay strings even if they look like a
//! timestamp or a ulid.
use crate::{Key, Value as Record};
use chrono::SecondsFormat;
use serde_json::{Map, Number, Value};

/// Converts a [`Key`] to a [`serde_json::Value`].
impl From<Key> for Value {
    fn from(key: Key) -> Self {
        match key {
            Key::Int(i) => i.into(),
            Key::Str(s) => s.into(),
        }
    }
}

/// Converts a [`Value`](crate::Value) to a [`serde_json::Value`].
impl From<Record> for Value {
    fn from(value: Record) -> Self {
        match value {
            Record::Null => Value::Null,
            Record::Bool(v) => v.into(),
            Record::I64(v) => v.into(),
            Record::U64(v) => v.into(),
            Record::F64(v) => Number::from_f64(v).map_or(Value::Null, Value::Number),
            Record::String(v) => v.into(),
            Record::Bytes(v) => {
                base64::Engine::encode(&base64::engine::general_purpose::STANDARD, v).into()
            }
            Record::Timestamp(v) => v.to_rfc3339_opts(SecondsFormat::Millis, true).into(),
            Record::Ulid(v) => v.to_string().into(),
            Record::Pattern(v) => v.to_string().into(),
            Record::Array(items) => Value::Array(items.into_iter().map(Into::into).collect()),
            Record::Object(fields) => {
                Value::Object(fields.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
            Record::Map(entries) => Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.into()))
                    .collect::<Map<_, _>>(),
            ),
            Record::Set(keys) => Value::Array(keys.into_iter().map(Into::into).collect()),
        }
    }
}

impl From<&Record> for Value {
    fn from(value: &Record) -> Self {
        value.clone().into()
    }
}

/// Converts a [`serde_json::Value`] to a [`Value`](crate::Value).
///
/// Integers that fit an `i64` become [`Value::I64`](crate::Value::I64), larger ones
/// [`Value::U64`](crate::Value::U64), and everything else [`Value::F64`](crate::Value::F64).
impl From<Value> for Record {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Record::Null,
            Value::Bool(v) => Record::Bool(v),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Record::I64(i)
                } else if let Some(u) = n.as_u64() {
                    Record::U64(u)
                } else {
                    n.as_f64().map_or(Record::Null, Record::F64)
                }
            }
            Value::String(v) => Record::String(v),
            Value::Array(items) => Record::Array(items.into_iter().map(Into::into).collect()),
            Value::Object(fields) => {
                Record::Object(fields.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{Key, Pattern, Value, record, value};
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::collections::{BTreeMap, BTreeSet};

    #[test]
    fn records_render_as_json() {
        let due = Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 0).unwrap();
        let mut record = record! {
            "id" => 1,
            "title" => "Buy milk",
            "done" => false,
            "tags" => ["errand", "food"],
            "owner" => { "name" => "Ada" },
            "weight" => 1.5
        };
        if let Value::Object(fields) = &mut record {
            fields.insert("due".into(), Value::from(due));
            fields.insert("blob".into(), Value::from(vec![0u8, 1, 2, 3]));
            fields.insert("pattern".into(), Value::from(Pattern::new("^a+$", "i")));
        }

        let rendered = serde_json::Value::from(record);
        assert_eq!(
            rendered,
            json!({
                "id": 1,
                "title": "Buy milk",
                "done": false,
                "tags": ["errand", "food"],
                "owner": { "name": "Ada" },
                "weight": 1.5,
                "due": "2025-03-01T09:30:00.000Z",
                "blob": "AAECAw==",
                "pattern": "/^a+$/i"
            })
        );
    }

    #[test]
    fn keyed_containers_become_objects_and_arrays() {
        let map: BTreeMap<Key, Value> = [(Key::from(7), value!("seven")), (Key::from("x"), value!(null))]
            .into_iter()
            .collect();
        assert_eq!(serde_json::Value::from(Value::from(map)), json!({ "7": "seven", "x": null }));

        let set: BTreeSet<Key> = [Key::from("b"), Key::from(2), Key::from("a")].into_iter().collect();
        assert_eq!(serde_json::Value::from(Value::from(set)), json!([2, "a", "b"]));
    }

    #[test]
    fn non_finite_floats_become_null() {
        assert_eq!(serde_json::Value::from(Value::F64(f64::NAN)), serde_json::Value::Null);
        assert_eq!(serde_json::Value::from(Value::F64(f64::INFINITY)), serde_json::Value::Null);
    }

    #[test]
    fn json_converts_back_into_records() {
        let parsed = Value::from(json!({
            "id": 1,
            "big": u64::MAX,
            "ratio": 0.25,
            "tags": ["a", null, true]
        }));
        assert_eq!(
            parsed,
            record! {
                "id" => 1,
                "big" => (u64::MAX),
                "ratio" => 0.25,
                "tags" => ["a", null, true]
            }
        );
    }
}
