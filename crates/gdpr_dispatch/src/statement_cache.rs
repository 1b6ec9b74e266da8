#![forbid(unsafe_code)]

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use gdpr_contracts::{ColumnValue, OperationKey, StatementPlan};
use gdpr_storage::{Execution, PrepareHints, StatementHandle, StorageError};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::DispatchError;
use crate::shard_pool::Shard;

/// A statement prepared on one shard's connection.
#[derive(Debug)]
pub struct PreparedOperation {
    key: OperationKey,
    text: String,
    handle: StatementHandle,
    shard: Arc<Shard>,
    released: AtomicBool,
}

impl PreparedOperation {
    pub fn prepare(
        key: OperationKey,
        plan: StatementPlan,
        shard: Arc<Shard>,
        hints: PrepareHints,
    ) -> Result<Self, DispatchError> {
        let handle = shard
            .with_connection(|c| c.prepare(&plan, hints))
            .map_err(|source| DispatchError::Prepare {
                shard_index: shard.index(),
                source,
            })?;
        Ok(Self {
            key,
            text: plan.render(),
            handle,
            shard,
            released: AtomicBool::new(false),
        })
    }

    pub fn key(&self) -> &OperationKey {
        &self.key
    }

    /// Parameterized text; never contains bound values.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn shard(&self) -> &Arc<Shard> {
        &self.shard
    }

    pub fn execute(&self, params: &[ColumnValue]) -> Result<Execution, StorageError> {
        self.shard
            .with_connection(|c| c.execute(self.handle, params))
    }

    pub fn add_batch(&self, params: Vec<ColumnValue>) -> Result<(), StorageError> {
        self.shard
            .with_connection(|c| c.add_batch(self.handle, params))
    }

    pub fn pending_batch_rows(&self) -> usize {
        self.shard
            .with_connection(|c| c.pending_batch_rows(self.handle))
    }

    pub fn execute_batch(&self) -> Result<Vec<i64>, StorageError> {
        self.shard.with_connection(|c| c.execute_batch(self.handle))
    }

    /// Releases the statement on its connection. Later calls are no-ops.
    pub fn release(&self) -> Result<(), StorageError> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shard.with_connection(|c| {
            if c.is_closed() {
                Ok(())
            } else {
                c.release(self.handle)
            }
        })
    }
}

/// Process-wide registry of prepared operations keyed by shape. Entries live
/// until the client is cleaned up.
#[derive(Debug, Default)]
pub struct StatementCache {
    entries: RwLock<HashMap<OperationKey, Arc<PreparedOperation>>>,
    built: AtomicU64,
    discarded: AtomicU64,
}

impl StatementCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &OperationKey) -> Option<Arc<PreparedOperation>> {
        self.entries.read().get(key).cloned()
    }

    /// Returns the registered operation for `key`, building one on a miss.
    ///
    /// `build` runs without holding the registry lock, so racing callers may
    /// each build. Exactly one registration wins; every loser is released on
    /// its shard and the winner is returned to all callers. A failed build
    /// leaves the registry untouched.
    pub fn get_or_create<F>(
        &self,
        key: OperationKey,
        build: F,
    ) -> Result<Arc<PreparedOperation>, DispatchError>
    where
        F: FnOnce() -> Result<PreparedOperation, DispatchError>,
    {
        if let Some(existing) = self.get(&key) {
            return Ok(existing);
        }
        let candidate = Arc::new(build()?);
        self.built.fetch_add(1, Ordering::Relaxed);

        let winner = match self.entries.write().entry(key) {
            Entry::Occupied(slot) => slot.get().clone(),
            Entry::Vacant(slot) => {
                debug!(key = %slot.key(), "prepared operation registered");
                slot.insert(candidate.clone());
                return Ok(candidate);
            }
        };

        self.discarded.fetch_add(1, Ordering::Relaxed);
        debug!(key = %winner.key(), "prepared operation lost registration race");
        if let Err(err) = candidate.release() {
            warn!(key = %candidate.key(), error = %err, "release of discarded operation failed");
        }
        Ok(winner)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Number of operations prepared, winners and losers alike.
    pub fn built_count(&self) -> u64 {
        self.built.load(Ordering::Relaxed)
    }

    pub fn discarded_count(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    pub fn entries(&self) -> Vec<Arc<PreparedOperation>> {
        self.entries.read().values().cloned().collect()
    }

    /// Empties the registry and releases every operation in it.
    pub fn release_all(&self) -> usize {
        let drained: Vec<_> = self.entries.write().drain().map(|(_, op)| op).collect();
        for op in &drained {
            if let Err(err) = op.release() {
                warn!(key = %op.key(), error = %err, "release of cached operation failed");
            }
        }
        drained.len()
    }
}
