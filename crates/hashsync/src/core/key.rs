//! Key tuples and half-open key ranges.
//!
//! A key is an ordered tuple of column values, compared lexicographically.
//! The empty tuple is a sentinel: as a lower bound it means "before the
//! first row", as an upper bound it means "past the end of the table".

use std::cmp::Ordering;
use std::fmt;

use super::value::Value;

/// An ordered tuple of key-column values.
pub type Key = Vec<Value>;

/// A half-open key range `(prev, last]`.
///
/// `prev = []` starts at the beginning of the table; `last = []` extends to
/// the end of the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    /// Exclusive lower bound; empty means from the start.
    pub prev: Key,
    /// Inclusive upper bound; empty means to the end.
    pub last: Key,
}

impl KeyRange {
    /// Create a range `(prev, last]`.
    pub fn new(prev: Key, last: Key) -> Self {
        Self { prev, last }
    }

    /// The full-table range `([], []]`.
    pub fn whole_table() -> Self {
        Self::new(Key::new(), Key::new())
    }

    /// Whether the range extends to the end of the table.
    pub fn to_end(&self) -> bool {
        self.last.is_empty()
    }

    /// Whether `key` lies inside `(prev, last]`.
    pub fn contains(&self, key: &Key) -> bool {
        after_bound(key, &self.prev) && within_bound(key, &self.last)
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}]", format_key(&self.prev), format_key(&self.last))
    }
}

/// Compare two non-sentinel keys lexicographically.
pub fn cmp_keys(a: &Key, b: &Key) -> Ordering {
    a.cmp(b)
}

/// Whether `key` is strictly greater than the exclusive lower bound.
pub fn after_bound(key: &Key, prev: &Key) -> bool {
    prev.is_empty() || cmp_keys(key, prev) == Ordering::Greater
}

/// Whether `key` is at or below the inclusive upper bound.
pub fn within_bound(key: &Key, last: &Key) -> bool {
    last.is_empty() || cmp_keys(key, last) != Ordering::Greater
}

/// Whether upper bound `a` lies strictly before upper bound `b`, treating
/// the empty key as past-the-end.
pub fn upper_bound_lt(a: &Key, b: &Key) -> bool {
    if a.is_empty() {
        return false;
    }
    if b.is_empty() {
        return true;
    }
    cmp_keys(a, b) == Ordering::Less
}

/// Render a key for log output.
pub fn format_key(key: &Key) -> String {
    if key.is_empty() {
        return "[]".to_string();
    }
    let parts: Vec<String> = key
        .iter()
        .map(|v| match v {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(n) => n.to_string(),
            Value::Uint(n) => n.to_string(),
            Value::Text(s) => format!("'{}'", s),
            Value::Bytes(b) => format!("x'{}'", hex(b)),
            Value::Array(_) => "<array>".to_string(),
        })
        .collect();
    format!("[{}]", parts.join(","))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
