//! End-to-end synchronization tests.
//!
//! Both endpoints run in-process over duplex pipes with in-memory database
//! engines, exercising the full protocol: negotiation, snapshot sharing,
//! schema comparison, the range-walk itself, and commit/abort behavior.

use std::collections::BTreeSet;

use hashsync::drivers::memory::{footbl_fixture, Fixture, FixtureTable, MemoryDb};
use hashsync::protocol::MIN_TARGET_BLOCK_SIZE;
use hashsync::{sync_from, sync_to, Endpoint, Result, SyncError, SyncOptions, SyncStats, Value};
use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};

type Streams = (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>);

fn pipe_pair() -> (Streams, Streams) {
    let (dest_stream, src_stream) = duplex(1 << 20);
    (split(dest_stream), split(src_stream))
}

/// Run a sync between two in-memory databases and return the destination
/// side's statistics.
async fn run_sync(
    source: &MemoryDb,
    dest: &MemoryDb,
    workers: usize,
    options: SyncOptions,
) -> Result<SyncStats> {
    let mut src_endpoints = Vec::new();
    let mut dst_endpoints = Vec::new();
    for _ in 0..workers {
        let ((dest_in, dest_out), (src_in, src_out)) = pipe_pair();
        dst_endpoints.push(Endpoint::new(dest.client(), dest_in, dest_out));
        src_endpoints.push(Endpoint::new(source.client(), src_in, src_out));
    }
    let from = tokio::spawn(sync_from(src_endpoints));
    let result = sync_to(dst_endpoints, options).await;
    from.await.expect("source side panicked").ok();
    result
}

fn assert_tables_equal(a: &MemoryDb, b: &MemoryDb) {
    for table in a.database().tables {
        assert_eq!(
            a.table_rows(&table.name),
            b.table_rows(&table.name),
            "table {} differs",
            table.name
        );
    }
}

const FOOTBL: &[(i64, Option<i64>, Option<&str>)] = &[
    (2, Some(10), Some("test")),
    (4, None, Some("foo")),
    (5, None, None),
    (8, Some(-1), Some("longer str")),
    (100, Some(0), Some("last")),
];

#[tokio::test]
async fn test_full_transfer_to_empty_destination() {
    let source = MemoryDb::from_fixture(&footbl_fixture(FOOTBL)).unwrap();
    let dest = MemoryDb::from_fixture(&footbl_fixture(&[])).unwrap();

    let stats = run_sync(&source, &dest, 1, SyncOptions::default()).await.unwrap();

    assert_tables_equal(&source, &dest);
    // One initial hash over the whole table, then a single rows sweep.
    assert_eq!(stats.tables, 1);
    assert_eq!(stats.hash_commands, 1);
    assert_eq!(stats.rows_commands, 1);
    assert_eq!(stats.rows_changed, 5);
}

#[tokio::test]
async fn test_identical_tables_transfer_no_rows() {
    let source = MemoryDb::from_fixture(&footbl_fixture(FOOTBL)).unwrap();
    let dest = MemoryDb::from_fixture(&footbl_fixture(FOOTBL)).unwrap();

    let stats = run_sync(&source, &dest, 1, SyncOptions::default()).await.unwrap();

    assert_tables_equal(&source, &dest);
    // A single hash over ([], []] matches and the table completes.
    assert_eq!(stats.hash_commands, 1);
    assert_eq!(stats.rows_commands, 0);
    assert_eq!(stats.rows_changed, 0);
}

#[tokio::test]
async fn test_single_missing_row_subdivides() {
    let source = MemoryDb::from_fixture(&footbl_fixture(FOOTBL)).unwrap();
    let dest_rows: Vec<_> = FOOTBL.iter().filter(|(k, _, _)| *k != 5).cloned().collect();
    let dest = MemoryDb::from_fixture(&footbl_fixture(&dest_rows)).unwrap();

    let stats = run_sync(&source, &dest, 1, SyncOptions::default()).await.unwrap();

    assert_tables_equal(&source, &dest);
    // The first mismatch must subdivide at least once before rows flow.
    assert!(stats.hash_commands >= 2, "expected a subdivision step, got {:?}", stats);
    assert!(stats.rows_commands >= 1);
    assert!(stats.rows_changed >= 1);
}

#[tokio::test]
async fn test_empty_source_empties_destination() {
    let source = MemoryDb::from_fixture(&footbl_fixture(&[])).unwrap();
    let dest = MemoryDb::from_fixture(&footbl_fixture(FOOTBL)).unwrap();

    let stats = run_sync(&source, &dest, 1, SyncOptions::default()).await.unwrap();

    assert!(dest.table_rows("footbl").is_empty());
    assert_eq!(stats.rows_changed, 5);
}

#[tokio::test]
async fn test_second_run_is_idempotent() {
    let source = MemoryDb::from_fixture(&footbl_fixture(FOOTBL)).unwrap();
    let dest = MemoryDb::from_fixture(&footbl_fixture(&[])).unwrap();

    run_sync(&source, &dest, 1, SyncOptions::default()).await.unwrap();
    let second = run_sync(&source, &dest, 1, SyncOptions::default()).await.unwrap();

    assert_eq!(second.rows_commands, 0, "second run must transfer no rows");
    assert_eq!(second.rows_changed, 0);
    assert_tables_equal(&source, &dest);
}

#[tokio::test]
async fn test_reverse_sync_leaves_source_unchanged() {
    let a = MemoryDb::from_fixture(&footbl_fixture(FOOTBL)).unwrap();
    let b = MemoryDb::from_fixture(&footbl_fixture(&[(3, Some(1), Some("stale"))])).unwrap();

    run_sync(&a, &b, 1, SyncOptions::default()).await.unwrap();
    let before = a.to_json();
    let stats = run_sync(&b, &a, 1, SyncOptions::default()).await.unwrap();

    assert_eq!(a.to_json(), before);
    assert_eq!(stats.rows_changed, 0);
}

#[tokio::test]
async fn test_composite_key_table_converges() {
    let secondtbl = |rows: Vec<Vec<Value>>| Fixture {
        tables: vec![FixtureTable {
            name: "secondtbl".to_string(),
            key_columns: vec!["tri".to_string(), "sec".to_string()],
            columns: vec![
                "pri".to_string(),
                "sec".to_string(),
                "tri".to_string(),
                "quo".to_string(),
            ],
            key_unique: true,
            rows,
        }],
    };
    let rows = vec![
        vec![Value::Int(100), Value::Int(100), Value::Text("aa".into()), Value::Int(100)],
        vec![Value::Int(9), Value::Int(968116383), Value::Text("aa".into()), Value::Int(9)],
        vec![Value::Int(340), Value::Int(363401169), Value::Text("ab".into()), Value::Int(20)],
        vec![Value::Int(2), Value::Int(2349174), Value::Text("xy".into()), Value::Int(1)],
    ];
    let source = MemoryDb::from_fixture(&secondtbl(rows.clone())).unwrap();
    let dest = MemoryDb::from_fixture(&secondtbl(vec![rows[1].clone()])).unwrap();

    run_sync(&source, &dest, 1, SyncOptions::default()).await.unwrap();

    // Replies order rows by (tri, sec), not by the declared column order.
    let synced = dest.table_rows("secondtbl");
    assert_eq!(synced.len(), 4);
    assert_eq!(synced[0][2], Value::Text("aa".into()));
    assert_eq!(synced[0][1], Value::Int(100));
    assert_eq!(synced[3][2], Value::Text("xy".into()));
    assert_tables_equal(&source, &dest);
}

fn multi_table_fixture(pad: &str, rows_per_table: i64) -> Fixture {
    Fixture {
        tables: ["alpha", "beta", "gamma"]
            .iter()
            .map(|name| FixtureTable {
                name: name.to_string(),
                key_columns: vec!["id".to_string()],
                columns: vec!["id".to_string(), "payload".to_string()],
                key_unique: true,
                rows: (0..rows_per_table)
                    .map(|i| vec![Value::Int(i), Value::Text(format!("{}-{}-{}", name, i, pad))])
                    .collect(),
            })
            .collect(),
    }
}

#[tokio::test]
async fn test_two_workers_with_shared_snapshot() {
    let source = MemoryDb::from_fixture(&multi_table_fixture("x", 50)).unwrap();
    let dest = MemoryDb::from_fixture(&multi_table_fixture("", 0)).unwrap();

    let stats = run_sync(&source, &dest, 2, SyncOptions::default()).await.unwrap();

    assert_eq!(stats.tables, 3);
    assert_tables_equal(&source, &dest);
}

#[tokio::test]
async fn test_small_blocks_force_sequential_rows() {
    // ~50 bytes per row against the minimum block size forces the source to
    // clamp row payloads and pipeline combined replies.
    let pad = "p".repeat(40);
    let source = MemoryDb::from_fixture(&multi_table_fixture(&pad, 500)).unwrap();
    let dest = MemoryDb::from_fixture(&multi_table_fixture("", 0)).unwrap();

    let options = SyncOptions { target_block_size: MIN_TARGET_BLOCK_SIZE, ..Default::default() };
    let stats = run_sync(&source, &dest, 1, options).await.unwrap();

    assert!(stats.rows_commands > 3, "expected several row blocks, got {:?}", stats);
    assert_tables_equal(&source, &dest);
}

#[tokio::test]
async fn test_small_blocks_with_scattered_differences() {
    let pad = "q".repeat(40);
    let source = MemoryDb::from_fixture(&multi_table_fixture(&pad, 500)).unwrap();
    let dest = MemoryDb::from_fixture(&multi_table_fixture(&pad, 500)).unwrap();

    // Corrupt a handful of scattered destination rows and drop one.
    {
        let table = dest.database().tables[0].clone();
        let mut client = dest.client();
        use hashsync::DatabaseClient;
        client.begin_transaction().await.unwrap();
        client
            .upsert_rows(
                &table,
                &[
                    vec![Value::Int(17), Value::Text("corrupt".into())],
                    vec![Value::Int(250), Value::Text("corrupt".into())],
                    vec![Value::Int(499), Value::Text("corrupt".into())],
                ],
            )
            .await
            .unwrap();
        client
            .delete_range_except(
                &table,
                &hashsync::KeyRange::new(vec![Value::Int(41)], vec![Value::Int(42)]),
                &[],
            )
            .await
            .unwrap();
        client.commit_transaction().await.unwrap();
    }

    let options = SyncOptions { target_block_size: MIN_TARGET_BLOCK_SIZE, ..Default::default() };
    let stats = run_sync(&source, &dest, 1, options).await.unwrap();

    assert_tables_equal(&source, &dest);
    // Only the differing neighborhoods should have shipped rows: far less
    // than the 1500 rows of the full dataset.
    assert!(stats.rows_changed < 300, "shipped too much: {:?}", stats);
}

#[tokio::test]
async fn test_schema_mismatch_detected_by_leader() {
    let source = MemoryDb::from_fixture(&multi_table_fixture("x", 5)).unwrap();
    let dest = MemoryDb::from_fixture(&footbl_fixture(&[])).unwrap();

    let err = run_sync(&source, &dest, 1, SyncOptions::default()).await;
    assert!(matches!(err, Err(SyncError::SchemaMismatch(_))));
}

#[tokio::test]
async fn test_ignore_tables_skips_mismatched_table() {
    let mut fixture = multi_table_fixture("x", 5);
    let source = MemoryDb::from_fixture(&fixture).unwrap();
    fixture.tables.remove(0); // "alpha" missing at the destination
    let dest = MemoryDb::from_fixture(&fixture).unwrap();

    let ignore: BTreeSet<String> = ["alpha".to_string()].into();
    let options = SyncOptions { ignore_tables: ignore, ..Default::default() };
    let stats = run_sync(&source, &dest, 1, options).await.unwrap();
    assert_eq!(stats.tables, 2);
}

#[tokio::test]
async fn test_only_tables_restricts_sync() {
    let source = MemoryDb::from_fixture(&multi_table_fixture("x", 5)).unwrap();
    let dest = MemoryDb::from_fixture(&multi_table_fixture("", 0)).unwrap();

    let only: BTreeSet<String> = ["beta".to_string()].into();
    let options = SyncOptions { only_tables: only, ..Default::default() };
    let stats = run_sync(&source, &dest, 1, options).await.unwrap();

    assert_eq!(stats.tables, 1);
    assert_eq!(dest.table_rows("beta").len(), 5);
    assert!(dest.table_rows("alpha").is_empty());
}

#[tokio::test]
async fn test_rollback_after_leaves_destination_untouched() {
    let source = MemoryDb::from_fixture(&footbl_fixture(FOOTBL)).unwrap();
    let dest = MemoryDb::from_fixture(&footbl_fixture(&[])).unwrap();

    let options = SyncOptions { rollback_after: true, ..Default::default() };
    let stats = run_sync(&source, &dest, 1, options).await.unwrap();

    assert_eq!(stats.rows_changed, 5);
    assert!(dest.table_rows("footbl").is_empty());
}

#[tokio::test]
async fn test_dead_source_aborts_run() {
    let source = MemoryDb::from_fixture(&footbl_fixture(FOOTBL)).unwrap();
    let dest = MemoryDb::from_fixture(&footbl_fixture(&[])).unwrap();

    let ((dest_in, dest_out), src_streams) = pipe_pair();
    drop(src_streams); // the source end dies before answering anything

    let result = sync_to(
        vec![Endpoint::new(dest.client(), dest_in, dest_out)],
        SyncOptions::default(),
    )
    .await;

    assert!(matches!(result, Err(SyncError::Io(_))));
    assert!(dest.table_rows("footbl").is_empty());
}

#[tokio::test]
async fn test_one_dead_worker_aborts_the_other() {
    let source = MemoryDb::from_fixture(&multi_table_fixture("x", 50)).unwrap();
    let dest = MemoryDb::from_fixture(&multi_table_fixture("", 0)).unwrap();

    // Worker 0 gets a live source; worker 1's source is gone.
    let ((d0_in, d0_out), (s0_in, s0_out)) = pipe_pair();
    let ((d1_in, d1_out), dead) = pipe_pair();
    drop(dead);

    let from = tokio::spawn(sync_from(vec![Endpoint::new(source.client(), s0_in, s0_out)]));
    let result = sync_to(
        vec![
            Endpoint::new(dest.client(), d0_in, d0_out),
            Endpoint::new(dest.client(), d1_in, d1_out),
        ],
        SyncOptions::default(),
    )
    .await;
    from.await.expect("source side panicked").ok();

    // The broken worker's IO failure is the recorded cause, and nothing
    // was committed by either worker.
    assert!(matches!(result, Err(SyncError::Io(_))));
    for name in ["alpha", "beta", "gamma"] {
        assert!(dest.table_rows(name).is_empty());
    }
}

#[tokio::test]
async fn test_empty_databases_sync_cleanly() {
    let source = MemoryDb::from_json(r#"{"tables": []}"#).unwrap();
    let dest = MemoryDb::from_json(r#"{"tables": []}"#).unwrap();

    let stats = run_sync(&source, &dest, 1, SyncOptions::default()).await.unwrap();
    assert_eq!(stats, SyncStats::default());
}

#[tokio::test]
async fn test_xxh64_run_converges() {
    let source = MemoryDb::from_fixture(&footbl_fixture(FOOTBL)).unwrap();
    let dest = MemoryDb::from_fixture(&footbl_fixture(&[(2, Some(10), Some("test"))])).unwrap();

    let options = SyncOptions {
        algorithm: "xxh64".parse().unwrap(),
        ..Default::default()
    };
    run_sync(&source, &dest, 1, options).await.unwrap();
    assert_tables_equal(&source, &dest);
}
