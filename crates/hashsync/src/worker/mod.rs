//! Worker spawning and run coordination for both endpoints.
//!
//! Each worker is one tokio task owning a database client and a stream
//! pair; within a worker every exchange is strictly sequential, which is
//! what the request/response protocol requires. Concurrency exists only
//! across workers, which share nothing but the [`SyncQueue`].

pub mod from;
pub mod to;

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;

use crate::client::DatabaseClient;
use crate::error::{Result, SyncError};
use crate::hasher::HashAlgorithm;
use crate::protocol::DEFAULT_TARGET_BLOCK_SIZE;
use crate::queue::SyncQueue;

pub use from::SourceWorker;
pub use to::DestWorker;

/// Options for a sync run, shared by all workers of one side.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Target bytes per hash- or rows-exchange unit.
    pub target_block_size: u64,
    /// Range-hash algorithm.
    pub algorithm: HashAlgorithm,
    /// Tables to skip.
    pub ignore_tables: BTreeSet<String>,
    /// When non-empty, only these tables are synchronized.
    pub only_tables: BTreeSet<String>,
    /// Share a snapshot across workers (multi-worker runs only).
    pub snapshot: bool,
    /// Attempt to commit finished work even when a worker fails.
    pub partial: bool,
    /// Roll back at the end instead of committing (for dry runs and tests).
    pub rollback_after: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            target_block_size: DEFAULT_TARGET_BLOCK_SIZE,
            algorithm: HashAlgorithm::default(),
            ignore_tables: BTreeSet::new(),
            only_tables: BTreeSet::new(),
            snapshot: true,
            partial: false,
            rollback_after: false,
        }
    }
}

/// Aggregate statistics from a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Tables synchronized.
    pub tables: u64,
    /// Hash exchanges received.
    pub hash_commands: u64,
    /// Row deliveries received.
    pub rows_commands: u64,
    /// Destination rows inserted, replaced, or deleted.
    pub rows_changed: u64,
}

impl SyncStats {
    fn merge(&mut self, other: SyncStats) {
        self.tables += other.tables;
        self.hash_commands += other.hash_commands;
        self.rows_commands += other.rows_commands;
        self.rows_changed += other.rows_changed;
    }
}

/// One worker's database client and connected stream pair.
pub struct Endpoint<C, R, W> {
    /// Database connection for this worker.
    pub client: C,
    /// Stream carrying the peer's messages to us.
    pub input: R,
    /// Stream carrying our messages to the peer.
    pub output: W,
}

impl<C, R, W> Endpoint<C, R, W> {
    /// Bundle a client with its stream pair.
    pub fn new(client: C, input: R, output: W) -> Self {
        Self { client, input, output }
    }
}

/// Run the destination side: one worker per endpoint, worker 0 leading.
///
/// Returns merged statistics on success; on failure, the first recorded
/// error after every worker has wound down.
pub async fn sync_to<C, R, W>(
    endpoints: Vec<Endpoint<C, R, W>>,
    options: SyncOptions,
) -> Result<SyncStats>
where
    C: DatabaseClient + Send + 'static,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    if endpoints.is_empty() {
        return Err(SyncError::protocol("no workers configured"));
    }
    let queue = Arc::new(SyncQueue::new(endpoints.len()));
    let options = Arc::new(options);

    let mut tasks = JoinSet::new();
    for (index, endpoint) in endpoints.into_iter().enumerate() {
        let worker = DestWorker::new(
            endpoint.client,
            endpoint.input,
            endpoint.output,
            queue.clone(),
            index == 0,
            options.clone(),
        );
        tasks.spawn(worker.run());
    }

    let mut stats = SyncStats::default();
    let mut first_error: Option<SyncError> = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(worker_stats)) => stats.merge(worker_stats),
            Ok(Err(e)) => {
                if first_error.as_ref().map(|f| f.is_abort()).unwrap_or(true) {
                    first_error = Some(e);
                }
            }
            Err(join_error) => {
                queue.abort(&SyncError::database(join_error.to_string()));
                first_error = Some(SyncError::database(format!("worker task failed: {}", join_error)));
            }
        }
    }

    match first_error {
        None => Ok(stats),
        Some(e) => Err(e),
    }
}

/// Run the source side: one independent responder per endpoint.
pub async fn sync_from<C, R, W>(endpoints: Vec<Endpoint<C, R, W>>) -> Result<()>
where
    C: DatabaseClient + Send + 'static,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut tasks = JoinSet::new();
    for endpoint in endpoints {
        let worker = SourceWorker::new(endpoint.client, endpoint.input, endpoint.output);
        tasks.spawn(worker.run());
    }

    let mut first_error: Option<SyncError> = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
            Err(join_error) => {
                first_error = Some(SyncError::database(format!("worker task failed: {}", join_error)));
            }
        }
    }
    match first_error {
        None => Ok(()),
        Some(e) => Err(e),
    }
}
