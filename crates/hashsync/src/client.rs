//! The database-client capability consumed by the engine.
//!
//! The engine names no concrete driver: each worker owns one object
//! implementing [`DatabaseClient`] and performs every database interaction
//! through it. Implementations exist per engine; the crate ships an
//! in-memory one (see [`crate::drivers::memory`]) used by tests and the CLI.

use async_trait::async_trait;

use crate::core::{Database, Key, KeyRange, Row, TableDef};
use crate::error::Result;

/// Database access capability, one instance per worker.
///
/// # Scan contract
///
/// [`scan_range`](DatabaseClient::scan_range) must return rows of
/// `(prev, last]` in key order, at most `limit` of them, with key columns
/// ordered exactly as the descriptor's `key_columns`. The engine resumes
/// scans by passing the last returned row's key as the next `prev`
/// (keyset pagination), so equal-key rows under a non-unique key must be
/// returned in a stable order.
///
/// # Snapshots
///
/// Engines without snapshot export/import keep the default no-op
/// implementations; the worker barrier choreography stays correct either
/// way. `export_snapshot` and `import_snapshot` are expected to leave the
/// client inside a started transaction, which the defaults do by calling
/// [`begin_transaction`](DatabaseClient::begin_transaction).
#[async_trait]
pub trait DatabaseClient: Send {
    /// Begin the worker's transaction.
    async fn begin_transaction(&mut self) -> Result<()>;

    /// Commit the worker's transaction.
    async fn commit_transaction(&mut self) -> Result<()>;

    /// Roll back the worker's transaction.
    async fn rollback_transaction(&mut self) -> Result<()>;

    /// Disable referential-integrity checks for the transaction.
    async fn disable_referential_integrity(&mut self) -> Result<()> {
        Ok(())
    }

    /// Re-enable referential-integrity checks.
    async fn enable_referential_integrity(&mut self) -> Result<()> {
        Ok(())
    }

    /// Discover the table descriptors for this end.
    async fn populate_schema(&mut self) -> Result<Database>;

    /// Read up to `limit` rows of `(prev, last]` in key order.
    async fn scan_range(
        &mut self,
        table: &TableDef,
        prev: &Key,
        last: &Key,
        limit: usize,
    ) -> Result<Vec<Row>>;

    /// Insert-or-replace rows by key. Returns the number of rows written.
    async fn upsert_rows(&mut self, table: &TableDef, rows: &[Row]) -> Result<u64>;

    /// Delete every row whose key lies in `range` and is not in `keep`.
    /// Returns the number of rows deleted.
    async fn delete_range_except(
        &mut self,
        table: &TableDef,
        range: &KeyRange,
        keep: &[Key],
    ) -> Result<u64>;

    /// Begin a transaction and export an opaque snapshot token for peers.
    async fn export_snapshot(&mut self) -> Result<String> {
        self.begin_transaction().await?;
        Ok(String::new())
    }

    /// Adopt a peer's snapshot and begin a transaction inside it.
    async fn import_snapshot(&mut self, _token: &str) -> Result<()> {
        self.begin_transaction().await
    }

    /// Release any snapshot hold taken by [`export_snapshot`](DatabaseClient::export_snapshot).
    async fn unhold_snapshot(&mut self) -> Result<()> {
        Ok(())
    }
}
