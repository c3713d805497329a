//! Typed dynamic attribute bag.
//!
//! Several records of the data model (inodes, replicas, pools, credentials)
//! carry a free-form set of extra attributes next to their fixed columns.
//! [`Extensible`] holds them as JSON values and serializes to the JSON text
//! that the store persists in its `xattr` columns.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{DmError, DmResult, ErrorCode};

/// A key/value container with typed accessors.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Extensible {
    dictionary: BTreeMap<String, Value>,
}

impl Extensible {
    /// An empty bag.
    pub fn new() -> Extensible {
        Extensible::default()
    }

    /// True when a field with this key is present.
    pub fn has_field(&self, key: &str) -> bool {
        self.dictionary.contains_key(key)
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.dictionary.len()
    }

    /// True when the bag has no fields.
    pub fn is_empty(&self) -> bool {
        self.dictionary.is_empty()
    }

    /// Raw access to a value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.dictionary.get(key)
    }

    /// Insert or replace a value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.dictionary.insert(key.into(), value.into());
    }

    /// Remove a value, returning it if present.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.dictionary.remove(key)
    }

    /// Remove all content.
    pub fn clear(&mut self) {
        self.dictionary.clear();
    }

    /// Iterate over the fields in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.dictionary.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Copy all fields of `other` into this bag, replacing existing keys.
    pub fn extend_from(&mut self, other: &Extensible) {
        for (k, v) in other.iter() {
            self.dictionary.insert(k.to_string(), v.clone());
        }
    }

    fn field(&self, key: &str) -> DmResult<&Value> {
        self.dictionary.get(key).ok_or_else(|| {
            DmError::new(ErrorCode::INVALID_VALUE, format!("field '{key}' not present"))
        })
    }

    /// Get a boolean, converting from numbers and the usual strings.
    pub fn get_bool(&self, key: &str) -> DmResult<bool> {
        match self.field(key)? {
            Value::Bool(b) => Ok(*b),
            Value::Number(n) => Ok(n.as_i64().unwrap_or(0) != 0),
            Value::String(s) => match s.as_str() {
                "true" | "yes" | "1" => Ok(true),
                "false" | "no" | "0" => Ok(false),
                _ => Err(bad_type(key, "bool")),
            },
            _ => Err(bad_type(key, "bool")),
        }
    }

    /// Get a signed integer, converting from strings when possible.
    pub fn get_long(&self, key: &str) -> DmResult<i64> {
        match self.field(key)? {
            Value::Number(n) => n.as_i64().ok_or_else(|| bad_type(key, "long")),
            Value::String(s) => s.parse().map_err(|_| bad_type(key, "long")),
            _ => Err(bad_type(key, "long")),
        }
    }

    /// Get an unsigned integer, converting from strings when possible.
    pub fn get_unsigned(&self, key: &str) -> DmResult<u64> {
        match self.field(key)? {
            Value::Number(n) => n.as_u64().ok_or_else(|| bad_type(key, "unsigned")),
            Value::String(s) => s.parse().map_err(|_| bad_type(key, "unsigned")),
            _ => Err(bad_type(key, "unsigned")),
        }
    }

    /// Get a float, converting from integers and strings when possible.
    pub fn get_double(&self, key: &str) -> DmResult<f64> {
        match self.field(key)? {
            Value::Number(n) => n.as_f64().ok_or_else(|| bad_type(key, "double")),
            Value::String(s) => s.parse().map_err(|_| bad_type(key, "double")),
            _ => Err(bad_type(key, "double")),
        }
    }

    /// Get a string; scalars are rendered to text.
    pub fn get_string(&self, key: &str) -> DmResult<String> {
        match self.field(key)? {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            _ => Err(bad_type(key, "string")),
        }
    }

    /// Serialize to JSON text.
    pub fn serialize_json(&self) -> String {
        serde_json::to_string(&self.dictionary).unwrap_or_else(|_| "{}".to_string())
    }

    /// Rebuild from JSON text. The empty string deserializes to an empty bag.
    pub fn deserialize_json(serial: &str) -> DmResult<Extensible> {
        if serial.trim().is_empty() {
            return Ok(Extensible::new());
        }
        let dictionary = serde_json::from_str(serial).map_err(|e| {
            DmError::new(ErrorCode::MALFORMED, format!("invalid attribute json: {e}"))
        })?;
        Ok(Extensible { dictionary })
    }
}

fn bad_type(key: &str, wanted: &str) -> DmError {
    DmError::new(
        ErrorCode::INVALID_VALUE,
        format!("field '{key}' can not be read as {wanted}"),
    )
}

// The persisted form is the JSON text itself, matching what the metadata
// store keeps in its xattr columns.
impl Serialize for Extensible {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.serialize_json())
    }
}

impl<'de> Deserialize<'de> for Extensible {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct JsonTextVisitor;

        impl Visitor<'_> for JsonTextVisitor {
            type Value = Extensible;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object serialized as text")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Extensible, E> {
                Extensible::deserialize_json(v).map_err(|e| E::custom(e.to_string()))
            }
        }

        deserializer.deserialize_str(JsonTextVisitor)
    }
}
