#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use gdpr_contracts::OperationKey;
use gdpr_storage::{ROW_AFFECTED, SUCCESS_NO_INFO};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::DispatchError;
use crate::shard_pool::ShardPool;
use crate::statement_cache::PreparedOperation;

/// What the caller must do after recording one write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchDecision {
    /// Batching is off; the write stands (and commits) on its own.
    Immediate,
    /// Below the boundary; the write stays buffered.
    Accumulate,
    /// The shared counter just reached a multiple of the batch size.
    FlushNow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushReport {
    pub flush_seq: u64,
    pub rows: usize,
    pub failed: usize,
}

/// Client-wide write counter and the prepared operations holding buffered rows.
#[derive(Debug)]
pub struct BatchCommitController {
    batch_size: i64,
    writes: AtomicU64,
    flushes: AtomicU64,
    flushed_through: AtomicU64,
    pending: Mutex<HashMap<OperationKey, Arc<PreparedOperation>>>,
    flush_lock: Mutex<()>,
}

impl BatchCommitController {
    pub fn new(batch_size: i64) -> Self {
        Self {
            batch_size,
            writes: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            flushed_through: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            flush_lock: Mutex::new(()),
        }
    }

    pub fn batch_size(&self) -> i64 {
        self.batch_size
    }

    pub fn record_write(&self) -> BatchDecision {
        if self.batch_size <= 0 {
            self.writes.fetch_add(1, Ordering::AcqRel);
            return BatchDecision::Immediate;
        }
        let n = self.writes.fetch_add(1, Ordering::AcqRel) + 1;
        if n % self.batch_size as u64 == 0 {
            BatchDecision::FlushNow
        } else {
            BatchDecision::Accumulate
        }
    }

    /// Marks `op` as holding buffered rows for the next flush.
    pub fn track(&self, op: &Arc<PreparedOperation>) {
        self.pending
            .lock()
            .entry(op.key().clone())
            .or_insert_with(|| op.clone());
    }

    pub fn writes_recorded(&self) -> u64 {
        self.writes.load(Ordering::Acquire)
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Acquire)
    }

    /// Writes recorded since the last flush boundary.
    pub fn writes_since_boundary(&self) -> u64 {
        if self.batch_size <= 0 {
            return 0;
        }
        self.writes_recorded()
            .saturating_sub(self.flushed_through.load(Ordering::Acquire))
    }

    pub fn pending_operations(&self) -> usize {
        self.pending.lock().len()
    }

    /// Runs every buffered row as one batch and, without auto-commit, commits
    /// every shard. Any row code other than one affected row or the bulk
    /// success sentinel fails the whole batch.
    pub fn flush(
        &self,
        pool: &ShardPool,
        auto_commit: bool,
    ) -> Result<FlushReport, DispatchError> {
        let _serial = self.flush_lock.lock();
        let ops: Vec<_> = self.pending.lock().drain().map(|(_, op)| op).collect();
        let flush_seq = self.flushes.fetch_add(1, Ordering::AcqRel) + 1;
        self.flushed_through
            .fetch_max(self.writes_recorded(), Ordering::AcqRel);
        let mut report = FlushReport {
            flush_seq,
            ..FlushReport::default()
        };
        let mut first_error = None;
        for op in &ops {
            debug!(key = %op.key(), rows = op.pending_batch_rows(), "executing batch");
            match op.execute_batch() {
                Ok(codes) => {
                    report.rows += codes.len();
                    report.failed += codes
                        .iter()
                        .filter(|c| **c != ROW_AFFECTED && **c != SUCCESS_NO_INFO)
                        .count();
                }
                Err(source) => {
                    warn!(key = %op.key(), error = %source, "batch execution failed");
                    first_error.get_or_insert(DispatchError::Execution {
                        shard_index: op.shard().index(),
                        source,
                    });
                }
            }
        }
        if !auto_commit {
            for shard in pool.iter() {
                if let Err(source) = shard.commit() {
                    warn!(shard_index = shard.index(), error = %source, "commit failed");
                    first_error.get_or_insert(DispatchError::Execution {
                        shard_index: shard.index(),
                        source,
                    });
                }
            }
        }
        info!(flush_seq, rows = report.rows, failed = report.failed, "batch flushed");
        if let Some(err) = first_error {
            return Err(err);
        }
        if report.failed > 0 {
            return Err(DispatchError::BatchPartialFailure {
                rows: report.rows,
                failed: report.failed,
            });
        }
        Ok(report)
    }

    /// Flushes whatever accumulated since the last boundary. `None` when
    /// there was nothing to flush.
    pub fn flush_remaining(
        &self,
        pool: &ShardPool,
        auto_commit: bool,
    ) -> Option<Result<FlushReport, DispatchError>> {
        if self.pending_operations() == 0 && self.writes_since_boundary() == 0 {
            return None;
        }
        Some(self.flush(pool, auto_commit))
    }
}
