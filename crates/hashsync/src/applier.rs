//! Row application: replace a destination key range with delivered rows.
//!
//! Rows are applied in-context on the worker task rather than through a
//! buffer and a separate task; the stream itself then provides flow
//! control when the destination disk cannot keep up with the source.

use tracing::trace;

use crate::client::DatabaseClient;
use crate::core::{Key, KeyRange, Row, TableDef};
use crate::error::{Result, SyncError};
use crate::scanner::row_key;

/// Applies delivered row sets to one destination table.
pub struct RowApplier {
    table: TableDef,
    key_indices: Vec<usize>,
    /// Rows inserted, replaced, or deleted so far for this table.
    pub rows_changed: u64,
}

impl RowApplier {
    /// Create an applier for `table`.
    pub fn new(table: &TableDef) -> Result<Self> {
        Ok(Self {
            table: table.clone(),
            key_indices: table.key_indices()?,
            rows_changed: 0,
        })
    }

    /// Replace the destination rows of `range` with `rows`.
    ///
    /// Deletes every destination row in the range whose key is absent from
    /// the delivered set, then upserts the delivered rows. A row outside
    /// the declared range, out of order, or of the wrong width is a
    /// protocol violation.
    pub async fn apply<C: DatabaseClient + ?Sized>(
        &mut self,
        client: &mut C,
        range: &KeyRange,
        rows: &[Row],
    ) -> Result<()> {
        let mut keys = Vec::with_capacity(rows.len());
        let mut prev_key: Option<Key> = None;
        for row in rows {
            if row.len() != self.table.columns.len() {
                return Err(SyncError::protocol(format!(
                    "table {}: delivered row has {} columns, descriptor has {}",
                    self.table.name,
                    row.len(),
                    self.table.columns.len()
                )));
            }
            let key = row_key(&self.key_indices, row);
            if !range.contains(&key) {
                return Err(SyncError::protocol(format!(
                    "table {}: delivered row key {:?} outside declared range {}",
                    self.table.name, key, range
                )));
            }
            if let Some(prev) = &prev_key {
                if key <= *prev {
                    return Err(SyncError::protocol(format!(
                        "table {}: delivered rows out of key order",
                        self.table.name
                    )));
                }
            }
            prev_key = Some(key.clone());
            keys.push(key);
        }

        let deleted = client.delete_range_except(&self.table, range, &keys).await?;
        let written = client.upsert_rows(&self.table, rows).await?;
        self.rows_changed += deleted + written;
        trace!(
            table = %self.table.name,
            range = %range,
            delivered = rows.len(),
            deleted,
            "applied row range"
        );
        Ok(())
    }
}
