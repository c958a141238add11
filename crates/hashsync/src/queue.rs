//! Shared worker coordination: table queue, barrier, and cooperative abort.
//!
//! One `SyncQueue` is shared by all destination workers of a run. The
//! leader enqueues the tables once; workers pop until drained. Barriers are
//! generation-counted and reusable, and every barrier wait races the abort
//! token so a failed worker can never strand its peers.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Barrier;
use tokio_util::sync::CancellationToken;

use crate::core::TableDef;
use crate::error::{Result, SyncError};

/// Shared coordination state for one side's workers.
pub struct SyncQueue {
    workers: usize,
    state: Mutex<QueueState>,
    barrier: Barrier,
    cancel: CancellationToken,
    aborted: AtomicBool,
}

#[derive(Default)]
struct QueueState {
    tables: VecDeque<Arc<TableDef>>,
    snapshot: Option<String>,
    abort_cause: Option<String>,
}

impl SyncQueue {
    /// Create a queue for `workers` participants.
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            state: Mutex::new(QueueState::default()),
            barrier: Barrier::new(workers),
            cancel: CancellationToken::new(),
            aborted: AtomicBool::new(false),
        }
    }

    /// Number of participating workers.
    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Queue up the tables to synchronize, honoring the ignore/only filters.
    /// Leader only; called once per run, before the post-enqueue barrier.
    pub fn enqueue(
        &self,
        tables: &[TableDef],
        ignore: &BTreeSet<String>,
        only: &BTreeSet<String>,
    ) {
        let mut state = self.state.lock().unwrap();
        for table in tables {
            if ignore.contains(&table.name) {
                continue;
            }
            if !only.is_empty() && !only.contains(&table.name) {
                continue;
            }
            state.tables.push_back(Arc::new(table.clone()));
        }
    }

    /// Take the next table, or `None` when drained.
    ///
    /// Tables are fully enqueued before the barrier that releases the table
    /// loop, so an empty queue is always a drained queue.
    pub fn pop(&self) -> Option<Arc<TableDef>> {
        self.state.lock().unwrap().tables.pop_front()
    }

    /// Wait until every worker arrives, or fail fast if the run aborts.
    pub async fn wait_at_barrier(&self) -> Result<()> {
        tokio::select! {
            _ = self.barrier.wait() => Ok(()),
            _ = self.cancel.cancelled() => Err(SyncError::Aborted),
        }
    }

    /// Record a failure and wake everything up.
    ///
    /// Returns true iff this call was the first to abort; only the first
    /// caller's error is worth reporting.
    pub fn abort(&self, cause: &SyncError) -> bool {
        let first = self
            .aborted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first && !cause.is_abort() {
            self.state.lock().unwrap().abort_cause = Some(cause.to_string());
        }
        self.cancel.cancel();
        first
    }

    /// Fail if another worker has aborted the run. Checked at every command
    /// boundary of the per-table loop.
    pub fn check_aborted(&self) -> Result<()> {
        if self.aborted.load(Ordering::Acquire) {
            return Err(SyncError::Aborted);
        }
        Ok(())
    }

    /// Whether the run has aborted.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// The first recorded failure, if any.
    pub fn abort_cause(&self) -> Option<String> {
        self.state.lock().unwrap().abort_cause.clone()
    }

    /// Publish the shared snapshot token. Leader only, before the barrier
    /// that lets the other workers read it.
    pub fn set_snapshot(&self, token: String) {
        self.state.lock().unwrap().snapshot = Some(token);
    }

    /// Read the shared snapshot token.
    pub fn snapshot(&self) -> Option<String> {
        self.state.lock().unwrap().snapshot.clone()
    }
}
