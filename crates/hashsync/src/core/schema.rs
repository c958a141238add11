//! Table descriptors and schema comparison.
//!
//! Descriptors are exchanged once per run (the SCHEMA command) and are
//! immutable afterwards. Key columns are listed in the order the engine
//! sorts by, independent of the physical column order.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::value::Value;
use crate::error::{Result, SyncError};

/// Descriptor of one table to synchronize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    /// Table name.
    pub name: String,

    /// Key columns in sort order.
    pub key_columns: Vec<String>,

    /// Data columns in exchange order (excluding auto-generated columns).
    pub columns: Vec<String>,

    /// Whether the key is guaranteed unique.
    #[serde(default = "default_true")]
    pub key_unique: bool,
}

fn default_true() -> bool {
    true
}

impl TableDef {
    /// Indices of the key columns within the data-column list.
    ///
    /// Fails if a key column is not part of the exchanged columns.
    pub fn key_indices(&self) -> Result<Vec<usize>> {
        self.key_columns
            .iter()
            .map(|kc| {
                self.columns.iter().position(|c| c == kc).ok_or_else(|| {
                    SyncError::SchemaMismatch(format!(
                        "table {}: key column {} is not an exchanged column",
                        self.name, kc
                    ))
                })
            })
            .collect()
    }
}

/// The set of table descriptors for one end.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Database {
    /// Tables, sorted by name.
    pub tables: Vec<TableDef>,
}

impl Database {
    /// Sort tables by name; descriptors are exchanged in this order.
    pub fn sort(&mut self) {
        self.tables.sort_by(|a, b| a.name.cmp(&b.name));
    }
}

// The SCHEMA exchange encodes descriptors as value trees so that the wire
// format stays self-describing end to end.

impl TableDef {
    /// Encode as a value tree: [name, key_columns, columns, key_unique].
    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::Text(self.name.clone()),
            Value::Array(self.key_columns.iter().map(|c| Value::Text(c.clone())).collect()),
            Value::Array(self.columns.iter().map(|c| Value::Text(c.clone())).collect()),
            Value::Bool(self.key_unique),
        ])
    }

    /// Decode from the value tree produced by [`TableDef::to_value`].
    pub fn from_value(value: &Value) -> Result<Self> {
        let fields = value
            .as_array()
            .filter(|a| a.len() == 4)
            .ok_or_else(|| SyncError::protocol("malformed table descriptor"))?;
        let name = fields[0]
            .as_text()
            .ok_or_else(|| SyncError::protocol("table descriptor: name must be text"))?
            .to_string();
        let key_columns = text_list(&fields[1], "key columns")?;
        let columns = text_list(&fields[2], "columns")?;
        let key_unique = match fields[3] {
            Value::Bool(b) => b,
            _ => return Err(SyncError::protocol("table descriptor: key_unique must be bool")),
        };
        Ok(TableDef { name, key_columns, columns, key_unique })
    }
}

impl Database {
    /// Encode the table list as a value tree.
    pub fn to_value(&self) -> Value {
        Value::Array(self.tables.iter().map(TableDef::to_value).collect())
    }

    /// Decode from the value tree produced by [`Database::to_value`].
    pub fn from_value(value: &Value) -> Result<Self> {
        let tables = value
            .as_array()
            .ok_or_else(|| SyncError::protocol("malformed table list"))?
            .iter()
            .map(TableDef::from_value)
            .collect::<Result<Vec<_>>>()?;
        Ok(Database { tables })
    }
}

fn text_list(value: &Value, what: &str) -> Result<Vec<String>> {
    value
        .as_array()
        .ok_or_else(|| SyncError::protocol(format!("table descriptor: {} must be an array", what)))?
        .iter()
        .map(|v| {
            v.as_text()
                .map(str::to_string)
                .ok_or_else(|| SyncError::protocol(format!("table descriptor: {} must be text", what)))
        })
        .collect()
}

/// Check that the source and destination schemas agree for every table that
/// will be synchronized.
///
/// Tables named in `ignore` (or outside a non-empty `only` set) are skipped.
/// Tables present on only one end, or present on both with different
/// columns or keys, fail with [`SyncError::SchemaMismatch`].
pub fn check_schema_match(
    from: &Database,
    to: &Database,
    ignore: &BTreeSet<String>,
    only: &BTreeSet<String>,
) -> Result<()> {
    let applicable = |name: &str| {
        !ignore.contains(name) && (only.is_empty() || only.contains(name))
    };
    let mut problems = Vec::new();

    for table in from.tables.iter().filter(|t| applicable(&t.name)) {
        match to.tables.iter().find(|t| t.name == table.name) {
            None => problems.push(format!("table {} is missing at the destination", table.name)),
            Some(other) if other != table => problems.push(format!(
                "table {} differs (source keys {:?} columns {:?}, destination keys {:?} columns {:?})",
                table.name, table.key_columns, table.columns, other.key_columns, other.columns
            )),
            Some(_) => {}
        }
    }
    for table in to.tables.iter().filter(|t| applicable(&t.name)) {
        if !from.tables.iter().any(|t| t.name == table.name) {
            problems.push(format!("table {} is missing at the source", table.name));
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(SyncError::SchemaMismatch(problems.join("; ")))
    }
}
