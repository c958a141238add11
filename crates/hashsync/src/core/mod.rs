//! Core data model: values, keys, ranges, and table descriptors.

pub mod key;
pub mod schema;
pub mod value;

pub use key::{Key, KeyRange};
pub use schema::{check_schema_match, Database, TableDef};
pub use value::Value;

/// An ordered tuple of column values in the descriptor's data-column order.
pub type Row = Vec<Value>;
