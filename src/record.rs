//! Raw store records and alias-aware field access
//!
//! The backing document store offers no schema guarantees: the same logical
//! field may appear under several historical names, timestamps may be stored
//! as epoch millis, `{seconds, nanoseconds}` objects, or numeric strings, and
//! any field may simply be absent.
//!
//! All of that variance is confined to this module. Every component reads raw
//! data exclusively through [`RawRecord`]'s alias-aware accessors, so adding a
//! newly discovered legacy field name is a one-line change at the call site
//! rather than a scattered schema branch.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An unmapped, schema-variable document as stored
///
/// Identity in the store is the record id; identity for the application is
/// derived from the record's contents (e.g. the participant set for
/// conversation records).
///
/// # Examples
///
/// ```rust
/// use chat_reconcile::RawRecord;
/// use serde_json::json;
///
/// let record = RawRecord::new("m1", json!({ "text": "hello", "is_read": true }));
/// assert_eq!(record.str_field(&["content", "text"]), Some("hello"));
/// assert_eq!(record.bool_field(&["isRead", "is_read"]), Some(true));
/// assert_eq!(record.str_field(&["missing"]), None);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Store-assigned record id
    pub id: String,

    /// Raw field map exactly as stored
    pub fields: Map<String, Value>,
}

impl RawRecord {
    /// Create a record from an id and a JSON object
    ///
    /// Non-object values produce an empty field map; the mapper layer treats
    /// missing fields as defaults, so this constructor never fails.
    pub fn new(id: impl Into<String>, fields: Value) -> Self {
        let fields = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Get the first present value among the given field name aliases
    pub fn get(&self, aliases: &[&str]) -> Option<&Value> {
        aliases.iter().find_map(|name| self.fields.get(*name))
    }

    /// String value under any of the aliases
    pub fn str_field(&self, aliases: &[&str]) -> Option<&str> {
        self.get(aliases).and_then(Value::as_str)
    }

    /// Boolean value under any of the aliases
    pub fn bool_field(&self, aliases: &[&str]) -> Option<bool> {
        self.get(aliases).and_then(Value::as_bool)
    }

    /// Integer value under any of the aliases
    ///
    /// Accepts JSON integers, floats (truncated), and numeric strings.
    pub fn i64_field(&self, aliases: &[&str]) -> Option<i64> {
        self.get(aliases).and_then(coerce_i64)
    }

    /// Epoch-millisecond timestamp under any of the aliases
    ///
    /// Accepts three stored shapes:
    /// - integer (or numeric string) epoch millis;
    /// - `{ "seconds": i64, "nanoseconds": i64 }` objects, converted as
    ///   `seconds * 1000 + nanoseconds / 1_000_000`;
    /// - floats, truncated to millis.
    ///
    /// Returns `None` when no alias is present — a timestamp is never
    /// invented.
    pub fn millis_field(&self, aliases: &[&str]) -> Option<i64> {
        let value = self.get(aliases)?;
        millis_from_value(value)
    }

    /// List of id strings under any of the aliases
    ///
    /// Non-array values and non-string entries yield an empty/partial list
    /// rather than an error.
    pub fn id_list_field(&self, aliases: &[&str]) -> Vec<String> {
        self.get(aliases)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Object value under any of the aliases
    pub fn map_field(&self, aliases: &[&str]) -> Option<&Map<String, Value>> {
        self.get(aliases).and_then(Value::as_object)
    }
}

/// Coerce a JSON value to i64 (integer, float, or numeric string)
fn coerce_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Interpret a JSON value as an epoch-millisecond timestamp
fn millis_from_value(value: &Value) -> Option<i64> {
    match value {
        Value::Object(map) => {
            // Seconds-based representation with optional sub-second remainder
            let seconds = map.get("seconds").and_then(coerce_i64)?;
            let nanos = map.get("nanoseconds").and_then(coerce_i64).unwrap_or(0);
            Some(seconds * 1000 + nanos / 1_000_000)
        }
        _ => coerce_i64(value),
    }
}
