//! Source-side responder.
//!
//! Services one destination worker over a stream pair. Stateless per
//! request apart from the table selected by `OPEN` and the read transaction
//! begun at snapshot time, so every reply is computed from the request
//! arguments and the database alone. The reply's `last_key` is wherever
//! this side's row-limit or byte-budget clamp landed; the destination
//! accepts it as authoritative.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::client::DatabaseClient;
use crate::core::{Database, Key, KeyRange, Row, TableDef, Value};
use crate::error::{Result, SyncError};
use crate::hasher::HashAlgorithm;
use crate::protocol::{
    key_value, read_message, row_value, send_message, Message, Verb, DEFAULT_TARGET_BLOCK_SIZE,
    MIN_TARGET_BLOCK_SIZE, PROTOCOL_VERSION,
};
use crate::scanner::{collect_range, has_rows_after, hash_range};

/// One source worker: a responder loop over a stream pair.
pub struct SourceWorker<C, R, W> {
    client: C,
    input: R,
    output: W,
    algorithm: HashAlgorithm,
    target_block_size: u64,
    database: Option<Database>,
    table: Option<TableDef>,
}

impl<C, R, W> SourceWorker<C, R, W>
where
    C: DatabaseClient,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Create a responder over an already-connected stream pair.
    pub fn new(client: C, input: R, output: W) -> Self {
        Self {
            client,
            input,
            output,
            algorithm: HashAlgorithm::default(),
            target_block_size: DEFAULT_TARGET_BLOCK_SIZE,
            database: None,
            table: None,
        }
    }

    /// Serve requests until QUIT or peer hangup.
    ///
    /// The outbound stream is closed on the way out in every case so the
    /// peer unblocks promptly.
    pub async fn run(mut self) -> Result<()> {
        let result = self.serve().await;
        let _ = self.output.shutdown().await;
        result
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            let message = match read_message(&mut self.input).await {
                Ok(message) => message,
                // Hangup without QUIT: the peer aborted; nothing to do but
                // leave (our transaction is read-only).
                Err(SyncError::Io(_)) => break,
                Err(e) => return Err(e),
            };
            match message.verb {
                Verb::Protocol => self.negotiate_protocol(&message).await?,
                Verb::TargetBlockSize => self.negotiate_block_size(&message).await?,
                Verb::ExportSnapshot => {
                    let token = self.client.export_snapshot().await?;
                    self.reply(Verb::ExportSnapshot, vec![Value::Text(token)]).await?;
                }
                Verb::ImportSnapshot => {
                    let token = message.text_arg(0)?;
                    self.client.import_snapshot(&token).await?;
                    self.reply(Verb::ImportSnapshot, vec![Value::Null]).await?;
                }
                Verb::UnholdSnapshot => {
                    self.client.unhold_snapshot().await?;
                    self.reply(Verb::UnholdSnapshot, vec![Value::Null]).await?;
                }
                Verb::WithoutSnapshot => {
                    self.client.begin_transaction().await?;
                    self.reply(Verb::WithoutSnapshot, vec![Value::Null]).await?;
                }
                Verb::Schema => {
                    let schema_value = self.database().await?.to_value();
                    self.reply(Verb::Schema, vec![schema_value]).await?;
                }
                Verb::Open => {
                    let name = message.text_arg(0)?;
                    self.open_table(&name).await?;
                    debug!(table = %name, "opened");
                    // The first hash covers an initial block from the start
                    // of the table, sized by the byte budget.
                    self.serve_hash(Key::new(), Key::new(), 0).await?;
                }
                Verb::Hash => {
                    self.check_table(&message.text_arg(0)?)?;
                    let prev = message.key_arg(1)?;
                    let last = message.key_arg(2)?;
                    let row_limit = message.uint_arg(3)?;
                    self.serve_hash(prev, last, row_limit).await?;
                }
                Verb::Rows => {
                    self.check_table(&message.text_arg(0)?)?;
                    let prev = message.key_arg(1)?;
                    let last = message.key_arg(2)?;
                    self.serve_rows(prev, last).await?;
                }
                Verb::Quit => {
                    info!("peer finished");
                    break;
                }
                other => {
                    return Err(SyncError::protocol(format!("unexpected command {:?}", other)));
                }
            }
        }
        Ok(())
    }

    async fn negotiate_protocol(&mut self, message: &Message) -> Result<()> {
        let theirs = message.uint_arg(0)?;
        let algorithm: HashAlgorithm = message.text_arg(1)?.parse()?;
        self.algorithm = algorithm;
        let accepted = theirs.min(u64::from(PROTOCOL_VERSION));
        self.reply(Verb::Protocol, vec![Value::Uint(accepted)]).await
    }

    async fn negotiate_block_size(&mut self, message: &Message) -> Result<()> {
        let requested = message.uint_arg(0)?;
        // Combined replies must fit the destination's next command in the
        // kernel send buffer; below one page that guarantee is gone.
        self.target_block_size = requested.max(MIN_TARGET_BLOCK_SIZE);
        self.reply(Verb::TargetBlockSize, vec![Value::Uint(self.target_block_size)]).await
    }

    async fn serve_hash(&mut self, prev: Key, last: Key, row_limit: u64) -> Result<()> {
        let table = self.table()?.clone();
        let range = KeyRange::new(prev.clone(), last.clone());
        let budget = self.target_block_size;
        let scan = hash_range(
            &mut self.client,
            &table,
            self.algorithm,
            &range,
            row_limit,
            Some(budget),
        )
        .await?;

        if scan.row_count == 0 && !range.to_end() {
            // Nothing in the requested range; if nothing follows it either,
            // answer for the whole tail so the peer can finish in one step.
            if !has_rows_after(&mut self.client, &table, &range.prev).await? {
                return self
                    .reply(
                        Verb::HashNext,
                        vec![
                            key_value(&prev),
                            key_value(&Key::new()),
                            Value::Uint(0),
                            Value::Bytes(scan.hash),
                        ],
                    )
                    .await;
            }
        }

        // A clamp that lands exactly on the requested boundary still covers
        // the extent.
        if scan.covered_extent || range.to_end() || scan.last_key == range.last {
            // Covered the whole extent the peer asked about (or an
            // exploratory probe that we clamped where we chose).
            self.reply(
                Verb::HashNext,
                vec![
                    key_value(&prev),
                    key_value(&scan.last_key),
                    Value::Uint(scan.row_count),
                    Value::Bytes(scan.hash),
                ],
            )
            .await
        } else {
            // Clamped short of a finite requested extent; the remainder up
            // to it stays outstanding at the destination.
            self.reply(
                Verb::HashFail,
                vec![
                    key_value(&prev),
                    key_value(&scan.last_key),
                    key_value(&last),
                    Value::Uint(scan.row_count),
                    Value::Bytes(scan.hash),
                ],
            )
            .await
        }
    }

    async fn serve_rows(&mut self, prev: Key, last: Key) -> Result<()> {
        let table = self.table()?.clone();
        let range = KeyRange::new(prev.clone(), last.clone());
        let budget = self.target_block_size;
        let (rows, rows_last, covered) =
            collect_range(&mut self.client, &table, &range, Some(budget)).await?;
        let covered = covered || (!range.to_end() && rows_last == range.last);

        if covered {
            if range.to_end() {
                return self.reply_rows(&prev, &Key::new(), rows).await;
            }
            // Piggyback the next block's hash so the destination can pipeline.
            let next_range = KeyRange::new(last.clone(), Key::new());
            let next = hash_range(
                &mut self.client,
                &table,
                self.algorithm,
                &next_range,
                0,
                Some(budget),
            )
            .await?;
            if next.row_count == 0 {
                // No rows past the extent: extend the delivered range to the
                // end of the table, which also finishes it.
                return self.reply_rows(&prev, &Key::new(), rows).await;
            }
            self.reply_combined(Verb::RowsAndHashNext, &prev, &last, &next.last_key, None, &next, rows)
                .await
        } else {
            // Row payload clamped at rows_last; cover what we can of the
            // remaining extent with a hash and flag the rest outstanding.
            let sub_range = KeyRange::new(rows_last.clone(), last.clone());
            let sub = hash_range(
                &mut self.client,
                &table,
                self.algorithm,
                &sub_range,
                0,
                Some(budget),
            )
            .await?;
            if sub.covered_extent || range.to_end() {
                self.reply_combined(
                    Verb::RowsAndHashNext,
                    &prev,
                    &rows_last,
                    &sub.last_key,
                    None,
                    &sub,
                    rows,
                )
                .await
            } else {
                self.reply_combined(
                    Verb::RowsAndHashFail,
                    &prev,
                    &rows_last,
                    &sub.last_key,
                    Some(&last),
                    &sub,
                    rows,
                )
                .await
            }
        }
    }

    async fn reply_rows(&mut self, prev: &Key, last: &Key, rows: Vec<Row>) -> Result<()> {
        let mut args = vec![key_value(prev), key_value(last), Value::Uint(rows.len() as u64)];
        args.extend(rows.iter().map(row_value));
        self.reply(Verb::Rows, args).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn reply_combined(
        &mut self,
        verb: Verb,
        prev: &Key,
        rows_last: &Key,
        next: &Key,
        failed: Option<&Key>,
        hash_scan: &crate::scanner::RangeScan,
        rows: Vec<Row>,
    ) -> Result<()> {
        let mut args = vec![key_value(prev), key_value(rows_last), key_value(next)];
        if let Some(failed) = failed {
            args.push(key_value(failed));
        }
        args.push(Value::Uint(hash_scan.row_count));
        args.push(Value::Bytes(hash_scan.hash.clone()));
        args.extend(rows.iter().map(row_value));
        self.reply(verb, args).await
    }

    async fn reply(&mut self, verb: Verb, args: Vec<Value>) -> Result<()> {
        send_message(&mut self.output, &Message::new(verb, args)).await
    }

    async fn database(&mut self) -> Result<&Database> {
        if self.database.is_none() {
            self.database = Some(self.client.populate_schema().await?);
        }
        Ok(self.database.as_ref().expect("just populated"))
    }

    async fn open_table(&mut self, name: &str) -> Result<()> {
        let table = self
            .database()
            .await?
            .tables
            .iter()
            .find(|t| t.name == name)
            .cloned()
            .ok_or_else(|| SyncError::protocol(format!("OPEN for unknown table {}", name)))?;
        self.table = Some(table);
        Ok(())
    }

    fn table(&self) -> Result<&TableDef> {
        self.table
            .as_ref()
            .ok_or_else(|| SyncError::protocol("table command before OPEN"))
    }

    fn check_table(&self, name: &str) -> Result<()> {
        let open = self.table()?;
        if open.name != name {
            return Err(SyncError::protocol(format!(
                "command names table {} but {} is open",
                name, open.name
            )));
        }
        Ok(())
    }
}
