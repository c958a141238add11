//! In-memory database engine.
//!
//! Backs the test suite and the CLI's fixture mode. A [`MemoryDb`] is the
//! shared committed store; each worker takes a [`MemoryClient`] "connection"
//! whose transaction is a cloned read view plus a write log replayed on
//! commit, which gives the same observable behavior as a snapshot-isolated
//! engine. Snapshot export/import clones the committed state under an
//! opaque token so concurrent workers adopt an identical view.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::client::DatabaseClient;
use crate::core::key::within_bound;
use crate::core::{Database, Key, KeyRange, Row, TableDef, Value};
use crate::error::{Result, SyncError};
use crate::scanner::row_key;

type TableData = BTreeMap<Key, Row>;
type Store = BTreeMap<String, TableData>;

/// JSON-loadable description of one table's schema and contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureTable {
    /// Table name.
    pub name: String,
    /// Key columns in sort order.
    pub key_columns: Vec<String>,
    /// Data columns in exchange order.
    pub columns: Vec<String>,
    /// Whether the key is unique (the memory engine enforces it either way).
    #[serde(default = "default_true")]
    pub key_unique: bool,
    /// Row tuples in column order.
    #[serde(default)]
    pub rows: Vec<Row>,
}

fn default_true() -> bool {
    true
}

/// JSON-loadable database fixture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fixture {
    /// Tables in any order.
    pub tables: Vec<FixtureTable>,
}

struct Shared {
    database: Database,
    store: Store,
    snapshots: HashMap<String, Store>,
}

/// Shared in-memory database; clone handles freely, state is common.
#[derive(Clone)]
pub struct MemoryDb {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryDb {
    /// Create an empty database with the given schema.
    pub fn new(mut database: Database) -> Self {
        database.sort();
        let store = database
            .tables
            .iter()
            .map(|t| (t.name.clone(), TableData::new()))
            .collect();
        Self {
            shared: Arc::new(Mutex::new(Shared {
                database,
                store,
                snapshots: HashMap::new(),
            })),
        }
    }

    /// Build a database from a fixture, loading its rows.
    pub fn from_fixture(fixture: &Fixture) -> Result<Self> {
        let database = Database {
            tables: fixture
                .tables
                .iter()
                .map(|t| TableDef {
                    name: t.name.clone(),
                    key_columns: t.key_columns.clone(),
                    columns: t.columns.clone(),
                    key_unique: t.key_unique,
                })
                .collect(),
        };
        let db = Self::new(database);
        {
            let mut shared = db.shared.lock().unwrap();
            for table in &fixture.tables {
                let def = shared
                    .database
                    .tables
                    .iter()
                    .find(|t| t.name == table.name)
                    .cloned()
                    .expect("fixture table was just registered");
                let key_indices = def.key_indices()?;
                let data = shared.store.get_mut(&table.name).unwrap();
                for row in &table.rows {
                    if row.len() != def.columns.len() {
                        return Err(SyncError::database(format!(
                            "fixture table {}: row width {} does not match {} columns",
                            table.name,
                            row.len(),
                            def.columns.len()
                        )));
                    }
                    data.insert(row_key(&key_indices, row), row.clone());
                }
            }
        }
        Ok(db)
    }

    /// Parse a fixture from JSON text and load it.
    pub fn from_json(json: &str) -> Result<Self> {
        let fixture: Fixture =
            serde_json::from_str(json).map_err(|e| SyncError::database(format!("bad fixture: {}", e)))?;
        Self::from_fixture(&fixture)
    }

    /// Dump the committed state back to a fixture.
    pub fn to_fixture(&self) -> Fixture {
        let shared = self.shared.lock().unwrap();
        Fixture {
            tables: shared
                .database
                .tables
                .iter()
                .map(|def| FixtureTable {
                    name: def.name.clone(),
                    key_columns: def.key_columns.clone(),
                    columns: def.columns.clone(),
                    key_unique: def.key_unique,
                    rows: shared.store[&def.name].values().cloned().collect(),
                })
                .collect(),
        }
    }

    /// Serialize the committed state to pretty JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(&self.to_fixture()).expect("fixture serializes")
    }

    /// The schema of this database.
    pub fn database(&self) -> Database {
        self.shared.lock().unwrap().database.clone()
    }

    /// Committed rows of `table` in key order. Test helper.
    pub fn table_rows(&self, table: &str) -> Vec<Row> {
        self.shared.lock().unwrap().store[table].values().cloned().collect()
    }

    /// Open a connection.
    pub fn client(&self) -> MemoryClient {
        MemoryClient {
            db: self.clone(),
            view: None,
            log: Vec::new(),
        }
    }
}

enum WriteOp {
    Upsert { table: String, rows: Vec<Row> },
    DeleteRangeExcept { table: String, range: KeyRange, keep: Vec<Key> },
}

/// One connection to a [`MemoryDb`].
pub struct MemoryClient {
    db: MemoryDb,
    /// Transaction read view; `None` outside a transaction.
    view: Option<Store>,
    /// Writes to replay on commit.
    log: Vec<WriteOp>,
}

impl MemoryClient {
    fn view(&self) -> Result<&Store> {
        self.view
            .as_ref()
            .ok_or_else(|| SyncError::database("no transaction in progress"))
    }

    fn view_mut(&mut self) -> Result<&mut Store> {
        self.view
            .as_mut()
            .ok_or_else(|| SyncError::database("no transaction in progress"))
    }

    fn apply(store: &mut Store, op: &WriteOp, key_indices: &HashMap<String, Vec<usize>>) -> (u64, u64) {
        match op {
            WriteOp::Upsert { table, rows } => {
                let data = store.get_mut(table).expect("table exists");
                let indices = &key_indices[table];
                let mut written = 0;
                for row in rows {
                    let old = data.insert(row_key(indices, row), row.clone());
                    if old.as_ref() != Some(row) {
                        written += 1;
                    }
                }
                (written, 0)
            }
            WriteOp::DeleteRangeExcept { table, range, keep } => {
                let data = store.get_mut(table).expect("table exists");
                let doomed: Vec<Key> = range_iter(data, range)
                    .map(|(k, _)| k.clone())
                    .filter(|k| !keep.contains(k))
                    .collect();
                let deleted = doomed.len() as u64;
                for key in doomed {
                    data.remove(&key);
                }
                (0, deleted)
            }
        }
    }

    fn key_index_map(&self) -> Result<HashMap<String, Vec<usize>>> {
        let shared = self.db.shared.lock().unwrap();
        shared
            .database
            .tables
            .iter()
            .map(|t| Ok((t.name.clone(), t.key_indices()?)))
            .collect()
    }
}

fn range_iter<'a>(
    data: &'a TableData,
    range: &'a KeyRange,
) -> impl Iterator<Item = (&'a Key, &'a Row)> + 'a {
    let lower = if range.prev.is_empty() {
        Bound::Unbounded
    } else {
        Bound::Excluded(range.prev.clone())
    };
    data.range((lower, Bound::Unbounded))
        .take_while(move |(k, _)| within_bound(k, &range.last))
}

#[async_trait]
impl DatabaseClient for MemoryClient {
    async fn begin_transaction(&mut self) -> Result<()> {
        let shared = self.db.shared.lock().unwrap();
        self.view = Some(shared.store.clone());
        self.log.clear();
        Ok(())
    }

    async fn commit_transaction(&mut self) -> Result<()> {
        let key_indices = self.key_index_map()?;
        self.view()?;
        let mut shared = self.db.shared.lock().unwrap();
        for op in self.log.drain(..) {
            MemoryClient::apply(&mut shared.store, &op, &key_indices);
        }
        drop(shared);
        self.view = None;
        Ok(())
    }

    async fn rollback_transaction(&mut self) -> Result<()> {
        self.view()?;
        self.view = None;
        self.log.clear();
        Ok(())
    }

    async fn populate_schema(&mut self) -> Result<Database> {
        Ok(self.db.database())
    }

    async fn scan_range(
        &mut self,
        table: &TableDef,
        prev: &Key,
        last: &Key,
        limit: usize,
    ) -> Result<Vec<Row>> {
        let view = self.view()?;
        let data = view
            .get(&table.name)
            .ok_or_else(|| SyncError::database(format!("unknown table {}", table.name)))?;
        let range = KeyRange::new(prev.clone(), last.clone());
        Ok(range_iter(data, &range).take(limit).map(|(_, row)| row.clone()).collect())
    }

    async fn upsert_rows(&mut self, table: &TableDef, rows: &[Row]) -> Result<u64> {
        let key_indices = self.key_index_map()?;
        let op = WriteOp::Upsert { table: table.name.clone(), rows: rows.to_vec() };
        let (written, _) = MemoryClient::apply(self.view_mut()?, &op, &key_indices);
        self.log.push(op);
        Ok(written)
    }

    async fn delete_range_except(
        &mut self,
        table: &TableDef,
        range: &KeyRange,
        keep: &[Key],
    ) -> Result<u64> {
        let key_indices = self.key_index_map()?;
        let op = WriteOp::DeleteRangeExcept {
            table: table.name.clone(),
            range: range.clone(),
            keep: keep.to_vec(),
        };
        let (_, deleted) = MemoryClient::apply(self.view_mut()?, &op, &key_indices);
        self.log.push(op);
        Ok(deleted)
    }

    async fn export_snapshot(&mut self) -> Result<String> {
        let token = Uuid::new_v4().to_string();
        let mut shared = self.db.shared.lock().unwrap();
        let view = shared.store.clone();
        shared.snapshots.insert(token.clone(), view.clone());
        drop(shared);
        self.view = Some(view);
        self.log.clear();
        Ok(token)
    }

    async fn import_snapshot(&mut self, token: &str) -> Result<()> {
        let shared = self.db.shared.lock().unwrap();
        let view = shared
            .snapshots
            .get(token)
            .cloned()
            .ok_or_else(|| SyncError::database(format!("unknown snapshot {}", token)))?;
        drop(shared);
        self.view = Some(view);
        self.log.clear();
        Ok(())
    }

    async fn unhold_snapshot(&mut self) -> Result<()> {
        self.db.shared.lock().unwrap().snapshots.clear();
        Ok(())
    }
}

/// Convenience: build the `footbl`-style fixture used across the test
/// suites from (key, second, third) triples.
pub fn footbl_fixture(rows: &[(i64, Option<i64>, Option<&str>)]) -> Fixture {
    Fixture {
        tables: vec![FixtureTable {
            name: "footbl".to_string(),
            key_columns: vec!["col1".to_string()],
            columns: vec!["col1".to_string(), "another_col".to_string(), "col3".to_string()],
            key_unique: true,
            rows: rows
                .iter()
                .map(|(k, second, third)| {
                    vec![
                        Value::Int(*k),
                        second.map(Value::Int).unwrap_or(Value::Null),
                        third.map(|s| Value::Text(s.to_string())).unwrap_or(Value::Null),
                    ]
                })
                .collect(),
        }],
    }
}
