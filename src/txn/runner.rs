//! Optimistic transaction runner.
//!
//! Callers hand the runner a builder invoked with the attempt number. The
//! first attempt builds from whatever state the caller already holds; when a
//! commit aborts because another writer got there first, the builder is
//! called again with the next attempt number so it can refresh and rebuild
//! (or report that nothing is left to do).

use super::op::Operation;
use crate::core::error::{KeelError, KeelResult};
use crate::store::{Commit, Store};
use crate::watch::WatchHub;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Default attempt bound.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// What a builder wants committed.
#[derive(Debug, Clone, PartialEq)]
pub enum TxnPlan {
    /// Commit these operations.
    Apply(Vec<Operation>),
    /// The target state already holds.
    NoChange,
}

/// Runner counters.
#[derive(Debug, Default)]
pub struct TxnStats {
    commits: AtomicU64,
    aborts: AtomicU64,
    no_ops: AtomicU64,
    contention_failures: AtomicU64,
}

/// Point-in-time copy of [`TxnStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxnStatsSnapshot {
    pub commits: u64,
    pub aborts: u64,
    pub no_ops: u64,
    pub contention_failures: u64,
}

impl TxnStats {
    pub fn snapshot(&self) -> TxnStatsSnapshot {
        TxnStatsSnapshot {
            commits: self.commits.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
            no_ops: self.no_ops.load(Ordering::Relaxed),
            contention_failures: self.contention_failures.load(Ordering::Relaxed),
        }
    }
}

/// Commits operation lists against a [`Store`] and publishes the results.
pub struct TxnRunner {
    store: Arc<dyn Store>,
    hub: Arc<WatchHub>,
    max_attempts: u32,
    /// Serialises commit and publish so watchers see commit order.
    publish: Mutex<()>,
    stats: TxnStats,
}

impl std::fmt::Debug for TxnRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnRunner")
            .field("max_attempts", &self.max_attempts)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

impl TxnRunner {
    pub fn new(store: Arc<dyn Store>, hub: Arc<WatchHub>) -> Self {
        Self {
            store,
            hub,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            publish: Mutex::new(()),
            stats: TxnStats::default(),
        }
    }

    /// Override the attempt bound (minimum 1).
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn hub(&self) -> &Arc<WatchHub> {
        &self.hub
    }

    pub fn stats(&self) -> TxnStatsSnapshot {
        self.stats.snapshot()
    }

    /// Run a builder until it commits, reports no change, or fails.
    ///
    /// Builder errors are returned as-is. An aborted commit re-invokes the
    /// builder with `attempt + 1`; once `max_attempts` commits have aborted
    /// the call fails with [`KeelError::ExcessiveContention`].
    pub fn run<F>(&self, mut build: F) -> KeelResult<()>
    where
        F: FnMut(u32) -> KeelResult<TxnPlan>,
    {
        for attempt in 0..self.max_attempts {
            let ops = match build(attempt)? {
                TxnPlan::NoChange => {
                    self.stats.no_ops.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(attempt, "txn: no change");
                    return Ok(());
                }
                TxnPlan::Apply(ops) => ops,
            };
            if ops.is_empty() {
                self.stats.no_ops.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }

            match self.commit(&ops) {
                Ok(commit) => {
                    tracing::debug!(attempt, revision = commit.revision, ops = ops.len(), "txn: committed");
                    return Ok(());
                }
                Err(KeelError::TxnAborted) => {
                    self.stats.aborts.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(attempt, ops = ops.len(), "txn: aborted, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        self.stats
            .contention_failures
            .fetch_add(1, Ordering::Relaxed);
        tracing::warn!(attempts = self.max_attempts, "txn: excessive contention");
        Err(KeelError::ExcessiveContention {
            attempts: self.max_attempts,
        })
    }

    /// Submit a fixed operation list exactly once.
    pub fn run_ops(&self, ops: Vec<Operation>) -> KeelResult<()> {
        if ops.is_empty() {
            self.stats.no_ops.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        match self.commit(&ops) {
            Ok(commit) => {
                tracing::debug!(revision = commit.revision, ops = ops.len(), "txn: committed");
                Ok(())
            }
            Err(e) => {
                if e == KeelError::TxnAborted {
                    self.stats.aborts.fetch_add(1, Ordering::Relaxed);
                }
                Err(e)
            }
        }
    }

    fn commit(&self, ops: &[Operation]) -> KeelResult<Commit> {
        let _publish = self.publish.lock();
        let commit = self.store.apply(ops)?;
        self.stats.commits.fetch_add(1, Ordering::Relaxed);
        self.hub.publish(&commit.changes);
        Ok(commit)
    }
}
