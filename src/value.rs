// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Record values.
//!
//! Rows held by a [`Collection`](crate::Collection) are dynamically typed, JSON-like trees. A
//! [`Value`] is either a scalar, an atomic leaf (bytes, timestamps, ulids, patterns) that is always
//! copied as a unit, or one of four containers:
//!
//! | container | addressed by | key-assignable |
//! |-----------|--------------|----------------|
//! | [`Value::Object`] | [`Prop::Field`] | yes |
//! | [`Value::Map`] | [`Prop::Entry`] | yes |
//! | [`Value::Array`] | [`Prop::Index`] | no |
//! | [`Value::Set`] | n/a (membership only) | no |
//!
//! Values are owned trees, so a value can never contain itself and cloning always terminates.
use crate::draft::DraftError;
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

/// The key of a row within a collection, or of an entry within a [`Value::Map`].
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
#[cfg_attr(feature = "serde", serde(untagged))]
pub enum Key {
    Int(i64),
    Str(String),
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(inner) => write!(f, "{inner}"),
            Self::Str(inner) => write!(f, "{inner:?}"),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(inner) => write!(f, "{inner}"),
            Self::Str(inner) => f.write_str(inner),
        }
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Key {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u32> for Key {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<Key> for Value {
    fn from(value: Key) -> Self {
        match value {
            Key::Int(i) => Self::I64(i),
            Key::Str(s) => Self::String(s),
        }
    }
}

/// Addresses one child slot of a container [`Value`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub enum Prop {
    /// A named field of a [`Value::Object`].
    Field(String),
    /// A position in a [`Value::Array`].
    Index(usize),
    /// An entry of a [`Value::Map`].
    Entry(Key),
}

impl fmt::Display for Prop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(name) => write!(f, "field `{name}`"),
            Self::Index(index) => write!(f, "index {index}"),
            Self::Entry(key) => write!(f, "entry `{key}`"),
        }
    }
}

impl From<&str> for Prop {
    fn from(value: &str) -> Self {
        Self::Field(value.to_string())
    }
}

impl From<String> for Prop {
    fn from(value: String) -> Self {
        Self::Field(value)
    }
}

impl From<usize> for Prop {
    fn from(value: usize) -> Self {
        Self::Index(value)
    }
}

impl From<Key> for Prop {
    fn from(value: Key) -> Self {
        Self::Entry(value)
    }
}

/// A compiled-pattern value object: its source text plus flags.
///
/// Patterns are atomic. They are compared and cloned as a whole and never drafted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub struct Pattern {
    pub source: String,
    pub flags: String,
}

impl Pattern {
    pub fn new(source: impl Into<String>, flags: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            flags: flags.into(),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.source, self.flags)
    }
}

/// A dynamically typed record value.
#[derive(Clone, Default)]
#[cfg_attr(feature = "serde", derive(::serde::Deserialize, ::serde::Serialize))]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    I64(i64),
    U64(u64),
    F64(f64),
    String(String),
    // NOTE: serde_bytes keeps byte buffers compact for binary formats.
    Bytes(#[cfg_attr(feature = "serde", serde(with = "serde_bytes"))] Vec<u8>),
    Timestamp(DateTime<Utc>),
    Ulid(ulid::Ulid),
    Pattern(Pattern),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    Map(BTreeMap<Key, Value>),
    Set(BTreeSet<Key>),
}

/// The type of a [`Value`], without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Bool,
    I64,
    U64,
    F64,
    String,
    Bytes,
    Timestamp,
    Ulid,
    Pattern,
    Array,
    Object,
    Map,
    Set,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::I64 => "i64",
            Self::U64 => "u64",
            Self::F64 => "f64",
            Self::String => "string",
            Self::Bytes => "bytes",
            Self::Timestamp => "timestamp",
            Self::Ulid => "ulid",
            Self::Pattern => "pattern",
            Self::Array => "array",
            Self::Object => "object",
            Self::Map => "map",
            Self::Set => "set",
        };
        f.write_str(name)
    }
}

impl Value {
    /// An empty [`Value::Object`].
    pub fn object() -> Self {
        Self::Object(BTreeMap::new())
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Null => ValueKind::Null,
            Self::Bool(_) => ValueKind::Bool,
            Self::I64(_) => ValueKind::I64,
            Self::U64(_) => ValueKind::U64,
            Self::F64(_) => ValueKind::F64,
            Self::String(_) => ValueKind::String,
            Self::Bytes(_) => ValueKind::Bytes,
            Self::Timestamp(_) => ValueKind::Timestamp,
            Self::Ulid(_) => ValueKind::Ulid,
            Self::Pattern(_) => ValueKind::Pattern,
            Self::Array(_) => ValueKind::Array,
            Self::Object(_) => ValueKind::Object,
            Self::Map(_) => ValueKind::Map,
            Self::Set(_) => ValueKind::Set,
        }
    }

    /// Whether this value gets its own nested draft when reached through a parent draft.
    ///
    /// Scalars and atomic leaves are always handed out as plain values.
    pub fn is_draftable(&self) -> bool {
        matches!(
            self,
            Self::Array(_) | Self::Object(_) | Self::Map(_) | Self::Set(_)
        )
    }

    /// Whether individual children of this value can be assigned by key.
    pub fn is_key_assignable(&self) -> bool {
        matches!(self, Self::Object(_) | Self::Map(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::I64(i) => Some(i),
            Self::U64(u) => i64::try_from(u).ok(),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Object(fields) => Some(fields),
            _ => None,
        }
    }

    /// Reads a field of an object (or a string-keyed map entry).
    pub fn get_field(&self, name: &str) -> Option<&Value> {
        match self {
            Self::Object(fields) => fields.get(name),
            Self::Map(entries) => entries.get(&Key::Str(name.to_string())),
            _ => None,
        }
    }

    /// Interprets this value as a row key.
    pub fn to_key(&self) -> Option<Key> {
        match self {
            Self::String(s) => Some(Key::Str(s.clone())),
            Self::I64(i) => Some(Key::Int(*i)),
            Self::U64(u) => i64::try_from(*u).ok().map(Key::Int),
            _ => None,
        }
    }

    /// Reads the child at `prop`.
    ///
    /// Field and entry addressing are interchangeable for string keys, so `"id"` reaches both an
    /// object field and a map entry keyed by the string `"id"`.
    pub fn get_prop(&self, prop: &Prop) -> Option<&Value> {
        match (self, prop) {
            (Self::Object(fields), Prop::Field(name)) => fields.get(name),
            (Self::Object(fields), Prop::Entry(Key::Str(name))) => fields.get(name),
            (Self::Map(entries), Prop::Entry(key)) => entries.get(key),
            (Self::Map(entries), Prop::Field(name)) => entries.get(&Key::Str(name.clone())),
            (Self::Array(items), Prop::Index(index)) => items.get(*index),
            _ => None,
        }
    }

    pub fn get_prop_mut(&mut self, prop: &Prop) -> Option<&mut Value> {
        match (self, prop) {
            (Self::Object(fields), Prop::Field(name)) => fields.get_mut(name),
            (Self::Object(fields), Prop::Entry(Key::Str(name))) => fields.get_mut(name),
            (Self::Map(entries), Prop::Entry(key)) => entries.get_mut(key),
            (Self::Map(entries), Prop::Field(name)) => entries.get_mut(&Key::Str(name.clone())),
            (Self::Array(items), Prop::Index(index)) => items.get_mut(*index),
            _ => None,
        }
    }

    pub fn has_prop(&self, prop: &Prop) -> bool {
        self.get_prop(prop).is_some()
    }

    /// Checks that `prop` can address a child of this value.
    pub(crate) fn check_prop(&self, prop: &Prop) -> Result<(), DraftError> {
        match (self, prop) {
            (Self::Object(_), Prop::Field(_) | Prop::Entry(Key::Str(_)))
            | (Self::Map(_), Prop::Entry(_) | Prop::Field(_))
            | (Self::Array(_), Prop::Index(_)) => Ok(()),
            _ => Err(DraftError::InvalidProp {
                prop: prop.clone(),
                kind: self.kind(),
            }),
        }
    }

    /// Writes `value` at `prop`, returning the previous child.
    ///
    /// Writing one past the end of an array appends.
    pub fn set_prop(&mut self, prop: Prop, value: Value) -> Result<Option<Value>, DraftError> {
        self.check_prop(&prop)?;
        match (self, prop) {
            (Self::Object(fields), Prop::Field(name) | Prop::Entry(Key::Str(name))) => {
                Ok(fields.insert(name, value))
            }
            (Self::Map(entries), Prop::Entry(key)) => Ok(entries.insert(key, value)),
            (Self::Map(entries), Prop::Field(name)) => Ok(entries.insert(Key::Str(name), value)),
            (Self::Array(items), Prop::Index(index)) => {
                let len = items.len();
                if index < len {
                    Ok(Some(std::mem::replace(&mut items[index], value)))
                } else if index == len {
                    items.push(value);
                    Ok(None)
                } else {
                    Err(DraftError::IndexOutOfBounds { index, len })
                }
            }
            // check_prop rejected every other combination
            (this, prop) => Err(DraftError::InvalidProp {
                prop,
                kind: this.kind(),
            }),
        }
    }

    /// Removes the child at `prop`. Later array elements shift down.
    pub fn remove_prop(&mut self, prop: &Prop) -> Result<Option<Value>, DraftError> {
        self.check_prop(prop)?;
        Ok(match (self, prop) {
            (Self::Object(fields), Prop::Field(name) | Prop::Entry(Key::Str(name))) => {
                fields.remove(name)
            }
            (Self::Map(entries), Prop::Entry(key)) => entries.remove(key),
            (Self::Map(entries), Prop::Field(name)) => entries.remove(&Key::Str(name.clone())),
            (Self::Array(items), Prop::Index(index)) if *index < items.len() => {
                Some(items.remove(*index))
            }
            _ => None,
        })
    }

    /// Merges the fields of `other` into `self`, with `other` winning on shared fields.
    ///
    /// Only objects merge with objects and maps with maps; any other combination replaces
    /// `self` with `other` wholesale.
    pub fn merge_fields(&mut self, other: Value) {
        match (self, other) {
            (Self::Object(fields), Self::Object(incoming)) => fields.extend(incoming),
            (Self::Map(entries), Self::Map(incoming)) => entries.extend(incoming),
            (this, other) => *this = other,
        }
    }

    /// Consuming variant of [`Value::merge_fields`].
    #[must_use]
    pub fn merged_with(mut self, other: Value) -> Self {
        self.merge_fields(other);
        self
    }
}

macro_rules! impl_from {
(
    $(
        $source:ty => $target:ident $(with $conv:ident)?
    ),* $(,)?
    ) => {
        $(
            impl From<$source> for Value {
                fn from(value: $source) -> Self {
                    Self::$target(impl_from!(value$(, $conv)?))
                }
            }
        )*
    };

    ($value:ident, $conv:ident) => {
        $value.$conv()
    };

    ($value:ident) => {
        $value
    };
}

impl_from!(
    &[u8]         => Bytes with into,
    Vec<u8>       => Bytes,
    String        => String,
    &str          => String with to_string,
    f64           => F64,
    f32           => F64 with into,
    u8            => U64 with into,
    u16           => U64 with into,
    u32           => U64 with into,
    u64           => U64,
    i8            => I64 with into,
    i16           => I64 with into,
    i32           => I64 with into,
    i64           => I64,
    bool          => Bool,
    DateTime<Utc> => Timestamp,
    ulid::Ulid    => Ulid,
    Pattern       => Pattern,
    Vec<Value>    => Array,
    BTreeMap<String, Value> => Object,
    BTreeMap<Key, Value>    => Map,
    BTreeSet<Key> => Set,
);

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(inner) => fmt::Debug::fmt(inner, f),
            Self::I64(inner) => write!(f, "{inner}"),
            Self::U64(inner) => write!(f, "{inner}u"),
            // {:?} keeps at least one decimal so floats never read as integers.
            Self::F64(inner) => write!(f, "{inner:?}"),
            Self::String(inner) => fmt::Debug::fmt(inner, f),
            Self::Bytes(inner) => write!(f, "{inner:02X?}"),
            Self::Timestamp(inner) => write!(f, "{}", inner.to_rfc3339()),
            Self::Ulid(inner) => write!(f, "{inner}"),
            Self::Pattern(inner) => write!(f, "{inner}"),
            Self::Array(items) => f.debug_list().entries(items).finish(),
            Self::Object(fields) => f.debug_map().entries(fields).finish(),
            Self::Map(entries) => f.debug_map().entries(entries).finish(),
            Self::Set(members) => f.debug_set().entries(members).finish(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(b1), Bool(b2)) => b1.eq(b2),
            (I64(i1), I64(i2)) => i1.eq(i2),
            (U64(u1), U64(u2)) => u1.eq(u2),
            (F64(d1), F64(d2)) => d1.total_cmp(d2).is_eq(),
            (String(s1), String(s2)) => s1.eq(s2),
            (Bytes(b1), Bytes(b2)) => b1.eq(b2),
            (Timestamp(t1), Timestamp(t2)) => t1.eq(t2),
            (Ulid(u1), Ulid(u2)) => u1.eq(u2),
            (Pattern(p1), Pattern(p2)) => p1.eq(p2),
            (Array(a1), Array(a2)) => a1.eq(a2),
            (Object(o1), Object(o2)) => o1.eq(o2),
            (Map(m1), Map(m2)) => m1.eq(m2),
            (Set(s1), Set(s2)) => s1.eq(s2),
            _ => false,
        }
    }
}
impl Eq for Value {}

impl PartialEq<str> for Value {
    fn eq(&self, other: &str) -> bool {
        matches!(self, Self::String(s) if s == other)
    }
}
impl PartialEq<&str> for Value {
    fn eq(&self, other: &&str) -> bool {
        matches!(self, Self::String(s) if s == other)
    }
}
impl PartialEq<bool> for Value {
    fn eq(&self, other: &bool) -> bool {
        matches!(self, Self::Bool(b) if b == other)
    }
}
impl PartialEq<i64> for Value {
    fn eq(&self, other: &i64) -> bool {
        self.as_i64() == Some(*other)
    }
}
// i32 because it's the "default" inference integer type
impl PartialEq<i32> for Value {
    fn eq(&self, other: &i32) -> bool {
        self.as_i64() == Some(i64::from(*other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;

    #[test]
    fn floats_compare_by_total_order() {
        assert_eq!(Value::F64(f64::NAN), Value::F64(f64::NAN));
        assert_ne!(Value::F64(0.0), Value::F64(-0.0));
        assert_ne!(Value::I64(1), Value::U64(1));
    }

    #[test]
    fn field_and_entry_addressing_agree_for_string_keys() {
        let object = record! { "id" => 1 };
        assert_eq!(object.get_prop(&Prop::Entry(Key::from("id"))), Some(&Value::I64(1)));

        let mut map = Value::Map(BTreeMap::new());
        map.set_prop(Prop::from("id"), Value::I64(2)).unwrap();
        assert_eq!(map.get_field("id"), Some(&Value::I64(2)));
    }

    #[test]
    fn array_writes_append_at_len_and_reject_gaps() {
        let mut array = Value::Array(vec![Value::I64(1)]);
        assert_eq!(array.set_prop(Prop::Index(1), Value::I64(2)), Ok(None));
        assert_eq!(
            array.set_prop(Prop::Index(5), Value::I64(3)),
            Err(DraftError::IndexOutOfBounds { index: 5, len: 2 })
        );
        assert_eq!(array.remove_prop(&Prop::Index(0)), Ok(Some(Value::I64(1))));
        assert_eq!(array, Value::Array(vec![Value::I64(2)]));
    }

    #[test]
    fn props_must_match_the_container() {
        let mut object = Value::object();
        assert_eq!(
            object.set_prop(Prop::Index(0), Value::Null),
            Err(DraftError::InvalidProp {
                prop: Prop::Index(0),
                kind: ValueKind::Object
            })
        );
        assert!(Value::I64(1).check_prop(&Prop::from("x")).is_err());
    }

    #[test]
    fn merge_fields_unions_with_incoming_winning() {
        let mut base = record! { "a" => 1, "b" => 2 };
        base.merge_fields(record! { "b" => 3, "c" => 4 });
        assert_eq!(base, record! { "a" => 1, "b" => 3, "c" => 4 });

        let mut scalar = Value::I64(1);
        scalar.merge_fields(record! { "a" => 1 });
        assert_eq!(scalar, record! { "a" => 1 });
    }

    #[test]
    fn keys_from_values() {
        assert_eq!(Value::from("a").to_key(), Some(Key::from("a")));
        assert_eq!(Value::U64(7).to_key(), Some(Key::Int(7)));
        assert_eq!(Value::U64(u64::MAX).to_key(), None);
        assert_eq!(Value::Bool(true).to_key(), None);
    }

    #[test]
    fn debug_rendering() {
        let value = record! { "n" => 1, "u" => 2u64, "f" => 1.0, "tags" => ["a"] };
        insta::assert_snapshot!(format!("{value:?}"), @r#"{"f": 1.0, "n": 1, "tags": ["a"], "u": 2u}"#);
    }
}
