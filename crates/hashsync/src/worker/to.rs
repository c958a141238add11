//! Destination-side worker.
//!
//! Drives the protocol for its share of the tables:
//!
//! ```text
//! NEGOTIATE_PROTOCOL → NEGOTIATE_BLOCK → SHARE_SNAPSHOT
//!    → POPULATE_SCHEMA (leader) → BEGIN_TXN → COMPARE_SCHEMA (leader)
//!    → ENQUEUE_TABLES (leader) → BARRIER
//!    → TABLE_LOOP { pop → OPEN → exchange → close } → BARRIER
//!    → COMMIT_OR_ROLLBACK → QUIT
//! ```
//!
//! Any failure aborts the shared queue (first worker records the cause),
//! optionally commits what finished when `partial` is set, and always shuts
//! the outbound stream so the peer sees EOF and terminates.

use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info};

use crate::applier::RowApplier;
use crate::client::DatabaseClient;
use crate::core::{check_schema_match, Database, Key, KeyRange, Row, TableDef, Value};
use crate::error::{Result, SyncError};
use crate::protocol::{
    key_value, read_message, send_message, Message, Verb, PROTOCOL_VERSION,
};
use crate::queue::SyncQueue;
use crate::scanner::hash_range;
use crate::selector::{Decision, RangeSelector};
use crate::worker::{SyncOptions, SyncStats};

/// One destination worker.
pub struct DestWorker<C, R, W> {
    client: C,
    input: R,
    output: W,
    queue: Arc<SyncQueue>,
    leader: bool,
    options: Arc<SyncOptions>,
    target_block_size: u64,
    stats: SyncStats,
}

impl<C, R, W> DestWorker<C, R, W>
where
    C: DatabaseClient,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Create a worker. The worker at index 0 is the leader.
    pub fn new(
        client: C,
        input: R,
        output: W,
        queue: Arc<SyncQueue>,
        leader: bool,
        options: Arc<SyncOptions>,
    ) -> Self {
        let target_block_size = options.target_block_size;
        Self {
            client,
            input,
            output,
            queue,
            leader,
            options,
            target_block_size,
            stats: SyncStats::default(),
        }
    }

    /// Run to completion, returning this worker's statistics.
    pub async fn run(mut self) -> Result<SyncStats> {
        match self.sync().await {
            Ok(()) => {
                let _ = self.output.shutdown().await;
                Ok(self.stats)
            }
            Err(e) => {
                // Make sure all other workers terminate promptly; only the
                // first failure is worth printing.
                if self.queue.abort(&e) {
                    error!("{}", e);
                }
                // With --partial, commit what we finished, ignoring any
                // secondary failure.
                if self.options.partial {
                    let _ = self.client.commit_transaction().await;
                }
                let _ = self.output.shutdown().await;
                Err(e)
            }
        }
    }

    async fn sync(&mut self) -> Result<()> {
        self.negotiate_protocol().await?;
        self.negotiate_block_size().await?;
        self.share_snapshot().await?;

        let database = if self.leader {
            Some(self.client.populate_schema().await?)
        } else {
            None
        };

        self.client.begin_transaction().await?;

        if let Some(database) = &database {
            self.compare_schema(database).await?;
            self.queue.enqueue(
                &database.tables,
                &self.options.ignore_tables,
                &self.options.only_tables,
            );
        }
        // Wait for the leader to finish the one-shot setup before any
        // worker starts popping tables.
        self.queue.wait_at_barrier().await?;

        self.sync_tables().await?;

        if self.options.rollback_after {
            self.client.rollback_transaction().await?;
            info!("rolled back");
        } else {
            let started = Instant::now();
            self.client.commit_transaction().await?;
            info!(elapsed = ?started.elapsed(), "committed");
        }

        // A quit lets the other end close its output and exit gracefully;
        // its failure is irrelevant this late.
        let _ = send_message(&mut self.output, &Message::new(Verb::Quit, vec![])).await;
        Ok(())
    }

    async fn negotiate_protocol(&mut self) -> Result<()> {
        let request = Message::new(
            Verb::Protocol,
            vec![
                Value::Uint(u64::from(PROTOCOL_VERSION)),
                Value::Text(self.options.algorithm.to_string()),
            ],
        );
        let reply = self.request(request, Verb::Protocol).await?;
        let accepted = reply.uint_arg(0)?;
        if accepted == 0 || accepted > u64::from(PROTOCOL_VERSION) {
            return Err(SyncError::protocol(format!("peer negotiated unusable protocol version {}", accepted)));
        }
        Ok(())
    }

    async fn negotiate_block_size(&mut self) -> Result<()> {
        let request = Message::new(Verb::TargetBlockSize, vec![Value::Uint(self.options.target_block_size)]);
        let reply = self.request(request, Verb::TargetBlockSize).await?;
        // The responder picks block boundaries, so its accepted value is
        // authoritative.
        self.target_block_size = reply.uint_arg(0)?;
        debug!(block_size = self.target_block_size, "negotiated block size");
        Ok(())
    }

    async fn share_snapshot(&mut self) -> Result<()> {
        if self.queue.worker_count() > 1 && self.options.snapshot {
            // Wait for all workers to be up and connected before taking the
            // snapshot, so engines that lock instead of exporting hold their
            // locks as briefly as possible, and so no changes land at all if
            // a worker fails to start.
            self.queue.wait_at_barrier().await?;

            if self.leader {
                let reply = self.request(Message::new(Verb::ExportSnapshot, vec![]), Verb::ExportSnapshot).await?;
                self.queue.set_snapshot(reply.text_arg(0)?);
            }
            self.queue.wait_at_barrier().await?;

            if !self.leader {
                let token = self
                    .queue
                    .snapshot()
                    .ok_or_else(|| SyncError::protocol("leader published no snapshot"))?;
                self.request(
                    Message::new(Verb::ImportSnapshot, vec![Value::Text(token)]),
                    Verb::ImportSnapshot,
                )
                .await?;
            }
            self.queue.wait_at_barrier().await?;

            // Once every worker has its transaction, lock-based engines can
            // let go.
            if self.leader {
                self.request(Message::new(Verb::UnholdSnapshot, vec![]), Verb::UnholdSnapshot).await?;
            }
        } else {
            self.request(Message::new(Verb::WithoutSnapshot, vec![]), Verb::WithoutSnapshot).await?;
        }
        Ok(())
    }

    async fn compare_schema(&mut self, database: &Database) -> Result<()> {
        // Only the leader compares; the schemas are immutable for the run,
        // so doing it in every worker would just waste traffic.
        let reply = self.request(Message::new(Verb::Schema, vec![]), Verb::Schema).await?;
        let from_database = Database::from_value(reply.arg(0)?)?;
        check_schema_match(
            &from_database,
            database,
            &self.options.ignore_tables,
            &self.options.only_tables,
        )
    }

    async fn sync_tables(&mut self) -> Result<()> {
        self.client.disable_referential_integrity().await?;

        while let Some(table) = self.queue.pop() {
            self.queue.check_aborted()?;
            self.sync_table(&table).await?;
        }

        // All tables done everywhere before integrity comes back on.
        self.queue.wait_at_barrier().await?;
        self.client.enable_referential_integrity().await?;
        Ok(())
    }

    async fn sync_table(&mut self, table: &TableDef) -> Result<()> {
        let mut selector = RangeSelector::new();
        let mut applier = RowApplier::new(table)?;
        let mut hash_commands: u64 = 0;
        let mut rows_commands: u64 = 0;
        let started = Instant::now();

        info!(table = %table.name, "starting");

        let mut reply = self
            .request(
                Message::new(Verb::Open, vec![Value::Text(table.name.clone())]),
                Verb::HashNext,
            )
            .await?;

        loop {
            // Likely to have been idle for a moment, so a good place to
            // notice another worker's failure.
            self.queue.check_aborted()?;

            let (decision, deferred) = match reply.verb {
                Verb::HashNext | Verb::HashFail => {
                    hash_commands += 1;
                    let prev = reply.key_arg(0)?;
                    let last = reply.key_arg(1)?;
                    let (count, hash) = if reply.verb == Verb::HashNext {
                        (reply.uint_arg(2)?, reply.bytes_arg(3)?)
                    } else {
                        (reply.uint_arg(3)?, reply.bytes_arg(4)?)
                    };
                    debug!(table = %table.name, range = %KeyRange::new(prev.clone(), last.clone()), "hash reply");
                    let own = self.own_hash(table, &prev, &last).await?;
                    let decision =
                        selector.on_hash_reply(&prev, &last, count, &hash, &own.hash, own.row_count)?;
                    (decision, None)
                }
                Verb::Rows => {
                    rows_commands += 1;
                    let prev = reply.key_arg(0)?;
                    let last = reply.key_arg(1)?;
                    let count = reply.uint_arg(2)?;
                    let rows = reply.rows_from(3)?;
                    if rows.len() as u64 != count {
                        return Err(SyncError::protocol("row payload does not match its declared count"));
                    }
                    debug!(table = %table.name, range = %KeyRange::new(prev.clone(), last.clone()), rows = rows.len(), "rows reply");
                    let decision = selector.on_rows_reply(&prev, &last)?;
                    (decision, Some((KeyRange::new(prev, last), rows)))
                }
                Verb::RowsAndHashNext | Verb::RowsAndHashFail => {
                    hash_commands += 1;
                    rows_commands += 1;
                    let prev = reply.key_arg(0)?;
                    let rows_last = reply.key_arg(1)?;
                    let next = reply.key_arg(2)?;
                    let (failed, count, hash) = if reply.verb == Verb::RowsAndHashFail {
                        (Some(reply.key_arg(3)?), reply.uint_arg(4)?, reply.bytes_arg(5)?)
                    } else {
                        (None, reply.uint_arg(3)?, reply.bytes_arg(4)?)
                    };
                    let rows_start = if failed.is_some() { 6 } else { 5 };
                    let rows = reply.rows_from(rows_start)?;
                    debug!(
                        table = %table.name,
                        rows_range = %KeyRange::new(prev.clone(), rows_last.clone()),
                        hash_range = %KeyRange::new(rows_last.clone(), next.clone()),
                        rows = rows.len(),
                        "combined reply"
                    );
                    let own = self.own_hash(table, &rows_last, &next).await?;
                    let decision = selector.on_combined_reply(
                        &prev,
                        &rows_last,
                        &next,
                        failed.as_ref(),
                        count,
                        &hash,
                        &own.hash,
                        own.row_count,
                    )?;
                    (decision, Some((KeyRange::new(prev, rows_last), rows)))
                }
                other => {
                    return Err(SyncError::protocol(format!("unexpected reply {:?}", other)));
                }
            };

            // Send the next command before applying delivered rows: the
            // command travels back over the network while we write to disk,
            // and it depends only on hashes of ranges ahead of the rows.
            let command = match &decision {
                Decision::RequestHash { prev, last, row_limit } => Some(Message::new(
                    Verb::Hash,
                    vec![
                        Value::Text(table.name.clone()),
                        key_value(prev),
                        key_value(last),
                        Value::Uint(*row_limit),
                    ],
                )),
                Decision::RequestRows { prev, last } => Some(Message::new(
                    Verb::Rows,
                    vec![Value::Text(table.name.clone()), key_value(prev), key_value(last)],
                )),
                Decision::TableComplete => None,
            };
            if let Some(command) = &command {
                send_message(&mut self.output, command).await?;
            }

            if let Some((range, rows)) = deferred {
                self.apply_rows(&mut applier, &range, &rows).await?;
            }

            if command.is_none() {
                break;
            }
            reply = read_message(&mut self.input).await?;
        }

        info!(
            table = %table.name,
            elapsed = ?started.elapsed(),
            hash_commands,
            rows_commands,
            rows_changed = applier.rows_changed,
            "finished"
        );
        self.stats.tables += 1;
        self.stats.hash_commands += hash_commands;
        self.stats.rows_commands += rows_commands;
        self.stats.rows_changed += applier.rows_changed;
        Ok(())
    }

    async fn apply_rows(
        &mut self,
        applier: &mut RowApplier,
        range: &KeyRange,
        rows: &[Row],
    ) -> Result<()> {
        applier.apply(&mut self.client, range, rows).await
    }

    async fn own_hash(
        &mut self,
        table: &TableDef,
        prev: &Key,
        last: &Key,
    ) -> Result<crate::scanner::RangeScan> {
        hash_range(
            &mut self.client,
            table,
            self.options.algorithm,
            &KeyRange::new(prev.clone(), last.clone()),
            0,
            None,
        )
        .await
    }

    async fn request(&mut self, message: Message, expected: Verb) -> Result<Message> {
        send_message(&mut self.output, &message).await?;
        let reply = read_message(&mut self.input).await?;
        if reply.verb != expected {
            return Err(SyncError::protocol(format!(
                "expected {:?} reply to {:?}, got {:?}",
                expected, message.verb, reply.verb
            )));
        }
        Ok(reply)
    }
}
