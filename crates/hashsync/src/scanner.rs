//! Range scanning: the row streamer behind both endpoints.
//!
//! Scans run as chunked keyset reads against the [`DatabaseClient`], feeding
//! a [`RowHasher`] as they go. The source uses the row-limit and byte-budget
//! clamps to pick block boundaries; the destination hashes delivered ranges
//! unclamped.

use crate::client::DatabaseClient;
use crate::core::{Key, KeyRange, Row, TableDef};
use crate::error::Result;
use crate::hasher::{HashAlgorithm, RowHasher};

/// Rows fetched per driver round trip.
const SCAN_CHUNK: usize = 1024;

/// Outcome of scanning a key range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeScan {
    /// Upper bound actually covered: the requested `last` when the scan ran
    /// to the end of the range, otherwise the key of the final row scanned
    /// before a clamp.
    pub last_key: Key,
    /// Rows scanned.
    pub row_count: u64,
    /// Serialized bytes scanned.
    pub bytes: u64,
    /// Digest of the scanned row sequence.
    pub hash: Vec<u8>,
    /// False when a row-limit or byte-budget clamp stopped the scan short
    /// of the requested extent.
    pub covered_extent: bool,
}

/// Extract a row's key using precomputed key-column indices.
pub fn row_key(key_indices: &[usize], row: &Row) -> Key {
    key_indices.iter().map(|&i| row[i].clone()).collect()
}

/// Hash the rows of `range`, clamped by `row_limit` (0 = unlimited) and
/// `byte_budget` (None = unlimited).
///
/// The byte budget includes the row that crosses it, so a scan always makes
/// progress even when a single row exceeds the budget.
pub async fn hash_range<C: DatabaseClient + ?Sized>(
    client: &mut C,
    table: &TableDef,
    algorithm: HashAlgorithm,
    range: &KeyRange,
    row_limit: u64,
    byte_budget: Option<u64>,
) -> Result<RangeScan> {
    let key_indices = table.key_indices()?;
    let mut hasher = RowHasher::new(algorithm);
    let mut cursor = range.prev.clone();
    let mut covered_extent = true;

    'scan: loop {
        let ask = chunk_size(row_limit, hasher.row_count());
        if ask == 0 {
            covered_extent = false;
            break;
        }
        let rows = client.scan_range(table, &cursor, &range.last, ask).await?;
        let got = rows.len();
        for row in &rows {
            hasher.update(row);
            cursor = row_key(&key_indices, row);
            if row_limit > 0 && hasher.row_count() >= row_limit {
                covered_extent = false;
                break 'scan;
            }
            if let Some(budget) = byte_budget {
                if hasher.bytes() >= budget {
                    covered_extent = false;
                    break 'scan;
                }
            }
        }
        if got < ask {
            break;
        }
    }

    // A scan that ran to the range's natural end answers for the whole
    // requested extent, whatever key its final row had.
    if covered_extent {
        cursor = range.last.clone();
    } else if hasher.row_count() == 0 {
        // Row limit of zero asked for nothing; report the empty prefix.
        cursor = range.prev.clone();
    }

    Ok(RangeScan {
        last_key: cursor,
        row_count: hasher.row_count(),
        bytes: hasher.bytes(),
        hash: hasher.finish(),
        covered_extent,
    })
}

/// Collect the rows of `range`, clamped by `byte_budget`.
///
/// Returns the rows, the covered upper bound (as for [`hash_range`]), and
/// whether the requested extent was covered.
pub async fn collect_range<C: DatabaseClient + ?Sized>(
    client: &mut C,
    table: &TableDef,
    range: &KeyRange,
    byte_budget: Option<u64>,
) -> Result<(Vec<Row>, Key, bool)> {
    let key_indices = table.key_indices()?;
    // The hasher is only used here for its serialized-size accounting.
    let mut sizer = RowHasher::new(HashAlgorithm::Xxh64);
    let mut collected = Vec::new();
    let mut cursor = range.prev.clone();
    let mut covered_extent = true;

    'scan: loop {
        let rows = client.scan_range(table, &cursor, &range.last, SCAN_CHUNK).await?;
        let got = rows.len();
        for row in rows {
            sizer.update(&row);
            cursor = row_key(&key_indices, &row);
            collected.push(row);
            if let Some(budget) = byte_budget {
                if sizer.bytes() >= budget {
                    covered_extent = false;
                    break 'scan;
                }
            }
        }
        if got < SCAN_CHUNK {
            break;
        }
    }

    if covered_extent {
        cursor = range.last.clone();
    } else if collected.is_empty() {
        cursor = range.prev.clone();
    }
    Ok((collected, cursor, covered_extent))
}

/// Whether any row exists after `key` (to the end of the table).
pub async fn has_rows_after<C: DatabaseClient + ?Sized>(
    client: &mut C,
    table: &TableDef,
    key: &Key,
) -> Result<bool> {
    let rows = client.scan_range(table, key, &Key::new(), 1).await?;
    Ok(!rows.is_empty())
}

fn chunk_size(row_limit: u64, scanned: u64) -> usize {
    if row_limit == 0 {
        return SCAN_CHUNK;
    }
    let remaining = row_limit.saturating_sub(scanned);
    remaining.min(SCAN_CHUNK as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::memory::{Fixture, FixtureTable, MemoryDb};
    use crate::core::Value;

    fn db() -> MemoryDb {
        MemoryDb::from_fixture(&Fixture {
            tables: vec![FixtureTable {
                name: "footbl".to_string(),
                key_columns: vec!["col1".to_string()],
                columns: vec!["col1".to_string(), "another_col".to_string(), "col3".to_string()],
                key_unique: true,
                rows: vec![
                    vec![Value::Int(2), Value::Int(10), Value::Text("test".into())],
                    vec![Value::Int(4), Value::Null, Value::Text("foo".into())],
                    vec![Value::Int(5), Value::Null, Value::Null],
                    vec![Value::Int(8), Value::Int(-1), Value::Text("longer str".into())],
                    vec![Value::Int(100), Value::Int(0), Value::Text("last".into())],
                ],
            }],
        })
        .unwrap()
    }

    fn table(db: &MemoryDb) -> TableDef {
        db.database().tables[0].clone()
    }

    #[tokio::test]
    async fn test_full_range_covers_extent() {
        let db = db();
        let table = table(&db);
        let mut client = db.client();
        client.begin_transaction().await.unwrap();

        let scan = hash_range(
            &mut client,
            &table,
            HashAlgorithm::Md5,
            &KeyRange::whole_table(),
            0,
            None,
        )
        .await
        .unwrap();
        assert_eq!(scan.row_count, 5);
        assert!(scan.covered_extent);
        assert!(scan.last_key.is_empty());
    }

    #[tokio::test]
    async fn test_row_limit_clamps_at_midpoint() {
        let db = db();
        let table = table(&db);
        let mut client = db.client();
        client.begin_transaction().await.unwrap();

        let scan = hash_range(
            &mut client,
            &table,
            HashAlgorithm::Md5,
            &KeyRange::whole_table(),
            3,
            None,
        )
        .await
        .unwrap();
        assert_eq!(scan.row_count, 3);
        assert!(!scan.covered_extent);
        assert_eq!(scan.last_key, vec![Value::Int(5)]);
    }

    #[tokio::test]
    async fn test_byte_budget_clamps() {
        let db = db();
        let table = table(&db);
        let mut client = db.client();
        client.begin_transaction().await.unwrap();

        let scan = hash_range(
            &mut client,
            &table,
            HashAlgorithm::Md5,
            &KeyRange::whole_table(),
            0,
            Some(1),
        )
        .await
        .unwrap();
        // The crossing row is included, so a tiny budget still advances.
        assert_eq!(scan.row_count, 1);
        assert_eq!(scan.last_key, vec![Value::Int(2)]);
    }

    #[tokio::test]
    async fn test_bounded_range_reports_requested_upper_bound() {
        let db = db();
        let table = table(&db);
        let mut client = db.client();
        client.begin_transaction().await.unwrap();

        let range = KeyRange::new(vec![Value::Int(2)], vec![Value::Int(9)]);
        let scan = hash_range(&mut client, &table, HashAlgorithm::Md5, &range, 0, None)
            .await
            .unwrap();
        assert_eq!(scan.row_count, 3);
        assert!(scan.covered_extent);
        // Ran out of rows before the bound: answers for the requested extent.
        assert_eq!(scan.last_key, vec![Value::Int(9)]);
    }

    #[tokio::test]
    async fn test_collect_and_has_rows_after() {
        let db = db();
        let table = table(&db);
        let mut client = db.client();
        client.begin_transaction().await.unwrap();

        let (rows, last, covered) =
            collect_range(&mut client, &table, &KeyRange::whole_table(), None).await.unwrap();
        assert_eq!(rows.len(), 5);
        assert!(covered);
        assert!(last.is_empty());

        assert!(has_rows_after(&mut client, &table, &vec![Value::Int(8)]).await.unwrap());
        assert!(!has_rows_after(&mut client, &table, &vec![Value::Int(100)]).await.unwrap());
    }
}
