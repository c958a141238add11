//! Dynamic column values for database-agnostic row exchange.
//!
//! Every value that crosses the wire or enters a hash is one of these
//! variants. The set deliberately mirrors the wire codec: drivers that
//! speak richer type systems (dates, decimals, geometry) map those types
//! to text or bytes before handing rows to the engine.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// A dynamic column value.
///
/// Values are totally ordered so that key tuples can be compared
/// lexicographically: type classes order null < bool < numeric < text <
/// bytes < array, and `Int`/`Uint` compare by numeric value across the two
/// representations. Equality agrees with the ordering, so `Int(5)` and
/// `Uint(5)` are the same key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Unsigned integer (values above `i64::MAX` only; smaller unsigned
    /// values may use either representation and compare equal).
    Uint(u64),
    /// Text string (UTF-8).
    Text(String),
    /// Binary string.
    Bytes(Vec<u8>),
    /// Array of values; used for nested structures in the schema exchange.
    Array(Vec<Value>),
}

impl Value {
    /// Rank of the type class for cross-type ordering.
    fn type_class(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Uint(_) => 2,
            Value::Text(_) => 3,
            Value::Bytes(_) => 4,
            Value::Array(_) => 5,
        }
    }

    /// Check if this value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get this value as a signed integer, if it is a numeric that fits.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Uint(n) => i64::try_from(*n).ok(),
            _ => None,
        }
    }

    /// Get this value as an unsigned integer, if it is a non-negative numeric.
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Value::Uint(n) => Some(*n),
            Value::Int(n) => u64::try_from(*n).ok(),
            _ => None,
        }
    }

    /// Get this value as a string slice, if it is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get this value as a byte slice, if it is a binary string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get this value as an array, if it is one.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        let class = self.type_class().cmp(&other.type_class());
        if class != Ordering::Equal {
            return class;
        }

        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (a @ (Value::Int(_) | Value::Uint(_)), b @ (Value::Int(_) | Value::Uint(_))) => {
                cmp_numeric(a, b)
            }
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => a.cmp(b),
            _ => unreachable!("type classes already compared"),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Compare two numeric values across the `Int`/`Uint` representations.
fn cmp_numeric(a: &Value, b: &Value) -> Ordering {
    let wide = |v: &Value| -> i128 {
        match v {
            Value::Int(n) => i128::from(*n),
            Value::Uint(n) => i128::from(*n),
            _ => unreachable!(),
        }
    };
    wide(a).cmp(&wide(b))
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}
