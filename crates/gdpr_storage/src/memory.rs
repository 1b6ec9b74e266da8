#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use gdpr_contracts::{
    ColumnValue, DeviceId, FieldMap, PolicyMetadata, PolicySelector, Record, RecordKey,
    StatementPlan, TableName, UnixSeconds, UnixTimeMs, Validate,
};
use parking_lot::Mutex;
use tracing::debug;

use crate::shard::{
    check_param_count, param_int, param_key, param_text, selector_from_params, Execution,
    PrepareHints, PreparedSlots, ShardConnection, StatementHandle, StorageError, StoreFlavor,
    EXECUTE_FAILED,
};

/// How `TombstoneRecord` treats data rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeleteMode {
    /// Flip the tombstone flag and keep the row.
    #[default]
    Tombstone,
    /// Remove the data row. Policy rows are never touched by data deletes.
    Physical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryStoreStats {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub statements_prepared: u64,
    pub statements_released: u64,
    pub executions: u64,
    pub batches_executed: u64,
    pub commits: u64,
    pub uncommitted_writes: u64,
}

impl MemoryStoreStats {
    pub fn open_statements(&self) -> u64 {
        self.statements_prepared
            .saturating_sub(self.statements_released)
    }
}

type PolicyTable = BTreeMap<(RecordKey, DeviceId), PolicyMetadata>;

#[derive(Debug, Default)]
struct MemoryTables {
    data: BTreeMap<TableName, BTreeMap<RecordKey, Record>>,
    policies: BTreeMap<TableName, PolicyTable>,
    /// Keys removed by physical deletes; they stay deleted.
    erased: BTreeMap<TableName, BTreeSet<RecordKey>>,
    delete_mode: DeleteMode,
    stats: MemoryStoreStats,
    refuse_prepares: u32,
    unavailable_tables: BTreeSet<TableName>,
    prepare_delay: Option<Duration>,
    last_fetch_size: Option<u32>,
}

/// In-process relational backing store. Clones share the same tables, so a
/// test can hold one handle while the dispatcher owns a connection.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    name: String,
    inner: Arc<Mutex<MemoryTables>>,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(Mutex::new(MemoryTables::default())),
        }
    }

    pub fn with_delete_mode(self, mode: DeleteMode) -> Self {
        self.inner.lock().delete_mode = mode;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> String {
        format!("mem://{}", self.name)
    }

    pub fn connect(&self, auto_commit: bool) -> MemoryShard {
        self.inner.lock().stats.connections_opened += 1;
        MemoryShard {
            store: self.clone(),
            endpoint: self.endpoint(),
            slots: PreparedSlots::default(),
            auto_commit,
            closed: false,
        }
    }

    pub fn stats(&self) -> MemoryStoreStats {
        self.inner.lock().stats
    }

    pub fn last_fetch_size(&self) -> Option<u32> {
        self.inner.lock().last_fetch_size
    }

    /// Raw row lookup, tombstoned rows included.
    pub fn record(&self, table: &TableName, key: &RecordKey) -> Option<Record> {
        self.inner
            .lock()
            .data
            .get(table)
            .and_then(|t| t.get(key))
            .cloned()
    }

    pub fn record_count(&self, table: &TableName) -> usize {
        self.inner.lock().data.get(table).map(|t| t.len()).unwrap_or(0)
    }

    /// Raw policy lookup on `(id, device_id)`, tombstoned rows included.
    pub fn policy(
        &self,
        table: &TableName,
        id: &RecordKey,
        device_id: DeviceId,
    ) -> Option<PolicyMetadata> {
        self.inner
            .lock()
            .policies
            .get(table)
            .and_then(|t| t.get(&(id.clone(), device_id)))
            .cloned()
    }

    pub fn policy_count(&self, table: &TableName) -> usize {
        self.inner
            .lock()
            .policies
            .get(table)
            .map(|t| t.len())
            .unwrap_or(0)
    }

    pub fn live_policy_count(&self, table: &TableName, now: UnixSeconds) -> u64 {
        let guard = self.inner.lock();
        live_count(guard.policies.get(table), now)
    }

    /// Tombstones every policy row whose ttl has passed, together with the
    /// data row it governs. Returns the number of policy rows expired.
    pub fn expire_policies(
        &self,
        policy_table: &TableName,
        data_table: &TableName,
        now: UnixSeconds,
    ) -> usize {
        let mut guard = self.inner.lock();
        let tables = &mut *guard;
        let mut expired = Vec::new();
        if let Some(policies) = tables.policies.get_mut(policy_table) {
            for row in policies.values_mut() {
                if !row.tombstone && row.ttl <= now {
                    row.tombstone = true;
                    expired.push((row.id.clone(), row.device_id));
                }
            }
        }
        if let Some(data) = tables.data.get_mut(data_table) {
            for (id, device_id) in &expired {
                if let Some(record) = data.get_mut(id) {
                    if record.device_id == *device_id {
                        record.tombstone = true;
                    }
                }
            }
        }
        expired.len()
    }

    /// Live data rows that have no live policy row on the same `(key, device_id)`.
    pub fn orphaned_records(
        &self,
        data_table: &TableName,
        policy_table: &TableName,
    ) -> Vec<RecordKey> {
        let guard = self.inner.lock();
        let Some(data) = guard.data.get(data_table) else {
            return Vec::new();
        };
        let policies = guard.policies.get(policy_table);
        data.values()
            .filter(|r| !r.tombstone)
            .filter(|r| {
                let covered = policies
                    .and_then(|p| p.get(&(r.key.clone(), r.device_id)))
                    .map(|p| !p.tombstone)
                    .unwrap_or(false);
                !covered
            })
            .map(|r| r.key.clone())
            .collect()
    }

    /// The next `count` prepare calls fail as if the shard were unreachable.
    pub fn refuse_next_prepares(&self, count: u32) {
        self.inner.lock().refuse_prepares = count;
    }

    pub fn set_table_unavailable(&self, table: &TableName, unavailable: bool) {
        let mut guard = self.inner.lock();
        if unavailable {
            guard.unavailable_tables.insert(table.clone());
        } else {
            guard.unavailable_tables.remove(table);
        }
    }

    /// Stalls every prepare, widening race windows for concurrency tests.
    pub fn set_prepare_delay(&self, delay: Option<Duration>) {
        self.inner.lock().prepare_delay = delay;
    }
}

fn live_count(policies: Option<&PolicyTable>, now: UnixSeconds) -> u64 {
    policies
        .map(|t| t.values().filter(|p| p.is_live_at(now)).count() as u64)
        .unwrap_or(0)
}

impl MemoryTables {
    fn execute(
        &mut self,
        endpoint: &str,
        plan: &StatementPlan,
        params: &[ColumnValue],
    ) -> Result<Execution, StorageError> {
        check_param_count(plan, params)?;
        if self.unavailable_tables.contains(plan.table()) {
            return Err(StorageError::Unavailable {
                endpoint: endpoint.to_string(),
                reason: format!("table {} is unavailable", plan.table()),
            });
        }
        self.stats.executions += 1;
        match plan {
            StatementPlan::ReadRecord { table } => {
                let key = param_key(params, 0)?;
                let rows = self
                    .data
                    .get(table)
                    .and_then(|t| t.get(&key))
                    .filter(|r| !r.tombstone)
                    .cloned()
                    .into_iter()
                    .collect();
                Ok(Execution::Records(rows))
            }
            StatementPlan::InsertRecord { table, columns } => {
                let key = param_key(params, 0)?;
                let fields: FieldMap = columns
                    .iter()
                    .zip(params[1..].iter())
                    .map(|(c, v)| (c.clone(), v.as_text()))
                    .collect();
                let record = Record::new(key.clone(), fields)?;
                let erased = self
                    .erased
                    .get(table)
                    .is_some_and(|keys| keys.contains(&key));
                let rows = self.data.entry(table.clone()).or_default();
                if erased || rows.contains_key(&key) {
                    return Err(StorageError::DuplicateKey {
                        table: table.to_string(),
                        key: key.to_string(),
                    });
                }
                rows.insert(key, record);
                Ok(Execution::Affected(1))
            }
            StatementPlan::UpdateRecord {
                table,
                columns,
                match_device,
            } => {
                let key = param_key(params, columns.len())?;
                let device = if *match_device {
                    Some(DeviceId(param_int(params, columns.len() + 1)?))
                } else {
                    None
                };
                let Some(record) = self.data.get_mut(table).and_then(|t| t.get_mut(&key)) else {
                    return Ok(Execution::Affected(0));
                };
                if record.tombstone || device.is_some_and(|d| d != record.device_id) {
                    return Ok(Execution::Affected(0));
                }
                let mut updated = record.clone();
                for (c, v) in columns.iter().zip(params.iter()) {
                    updated.fields.insert(c.clone(), v.as_text());
                }
                updated.device_id = DeviceId::from_fields(&updated.fields)?;
                updated.validate()?;
                *record = updated;
                Ok(Execution::Affected(1))
            }
            StatementPlan::TombstoneRecord { table } => {
                let key = param_key(params, 0)?;
                let Some(rows) = self.data.get_mut(table) else {
                    return Ok(Execution::Affected(0));
                };
                match self.delete_mode {
                    DeleteMode::Physical => {
                        let erased = self.erased.entry(table.clone()).or_default();
                        if rows.remove(&key).is_some() {
                            erased.insert(key);
                            Ok(Execution::Affected(1))
                        } else {
                            Ok(Execution::Affected(u64::from(erased.contains(&key))))
                        }
                    }
                    DeleteMode::Tombstone => match rows.get_mut(&key) {
                        Some(record) => {
                            record.tombstone = true;
                            Ok(Execution::Affected(1))
                        }
                        None => Ok(Execution::Affected(0)),
                    },
                }
            }
            StatementPlan::ScanRecords { table } => {
                let start = param_key(params, 0)?;
                let count = param_int(params, 1)?;
                if count < 0 {
                    return Err(StorageError::InvalidParam {
                        index: 2,
                        reason: "count must be >= 0",
                    });
                }
                let rows = self
                    .data
                    .get(table)
                    .map(|t| {
                        t.range(start..)
                            .map(|(_, r)| r)
                            .filter(|r| !r.tombstone)
                            .take(count as usize)
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(Execution::Records(rows))
            }
            StatementPlan::ReadPolicy { table, filter } => {
                let selector = selector_from_params(*filter, params, 0)?;
                let rows = self
                    .policies
                    .get(table)
                    .map(|t| {
                        t.values()
                            .filter(|p| !p.tombstone && selector.matches(p))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(Execution::Policies(rows))
            }
            StatementPlan::InsertPolicy { table } => {
                let row = policy_from_params(params)?;
                let rows = self.policies.entry(table.clone()).or_default();
                let id = (row.id.clone(), row.device_id);
                if rows.contains_key(&id) {
                    return Err(StorageError::DuplicateKey {
                        table: table.to_string(),
                        key: format!("{}@{}", row.id, row.device_id),
                    });
                }
                rows.insert(id, row);
                Ok(Execution::Affected(1))
            }
            StatementPlan::UpdatePolicy {
                table,
                attribute,
                filter,
            } => {
                let value = param_text(params, 0)?;
                let selector = selector_from_params(*filter, params, 1)?;
                let Some(rows) = self.policies.get_mut(table) else {
                    return Ok(Execution::Affected(0));
                };
                update_policies(table, rows, &selector, *attribute, &value)
            }
            StatementPlan::TombstonePolicy { table, filter } => {
                let selector = selector_from_params(*filter, params, 0)?;
                let mut matched = 0;
                if let Some(rows) = self.policies.get_mut(table) {
                    for row in rows.values_mut().filter(|p| selector.matches(p)) {
                        row.tombstone = true;
                        matched += 1;
                    }
                }
                Ok(Execution::Affected(matched))
            }
            StatementPlan::CountLivePolicies { table } => {
                let now = UnixSeconds(param_int(params, 0)?.max(0) as u64);
                Ok(Execution::Count(live_count(self.policies.get(table), now)))
            }
        }
    }
}

fn policy_from_params(params: &[ColumnValue]) -> Result<PolicyMetadata, StorageError> {
    let ttl = param_int(params, 4)?;
    let inserted_at = param_int(params, 9)?;
    let row = PolicyMetadata {
        id: param_key(params, 0)?,
        device_id: DeviceId(param_int(params, 1)?),
        querier: param_text(params, 2)?,
        purpose: param_text(params, 3)?,
        ttl: UnixSeconds(ttl.max(0) as u64),
        origin: param_text(params, 5)?,
        objection: param_text(params, 6)?,
        sharing: param_text(params, 7)?,
        enforcement_action: param_text(params, 8)?,
        inserted_at: UnixTimeMs(inserted_at.max(0) as u64),
        tombstone: false,
    };
    row.validate()?;
    Ok(row)
}

fn update_policies(
    table: &TableName,
    rows: &mut PolicyTable,
    selector: &PolicySelector,
    attribute: gdpr_contracts::PolicyAttribute,
    value: &str,
) -> Result<Execution, StorageError> {
    let mut staged = Vec::new();
    for (id, row) in rows.iter() {
        if row.tombstone || !selector.matches(row) {
            continue;
        }
        let mut next = row.clone();
        next.apply(attribute, value)?;
        staged.push((id.clone(), next));
    }
    // A device_id change re-keys the row; refuse to overwrite another row.
    for (old_id, next) in &staged {
        let new_id = (next.id.clone(), next.device_id);
        if &new_id != old_id && rows.contains_key(&new_id) {
            return Err(StorageError::DuplicateKey {
                table: table.to_string(),
                key: format!("{}@{}", next.id, next.device_id),
            });
        }
    }
    let affected = staged.len() as u64;
    for (old_id, next) in staged {
        rows.remove(&old_id);
        rows.insert((next.id.clone(), next.device_id), next);
    }
    Ok(Execution::Affected(affected))
}

/// Connection to a `MemoryStore`.
#[derive(Debug)]
pub struct MemoryShard {
    store: MemoryStore,
    endpoint: String,
    slots: PreparedSlots,
    auto_commit: bool,
    closed: bool,
}

impl MemoryShard {
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed {
            return Err(StorageError::Closed {
                endpoint: self.endpoint.clone(),
            });
        }
        Ok(())
    }

    fn note_write(&self, plan: &StatementPlan, affected: u64) {
        if !self.auto_commit && plan.is_write() {
            let mut guard = self.store.inner.lock();
            guard.stats.uncommitted_writes += affected;
        }
    }
}

impl ShardConnection for MemoryShard {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn flavor(&self) -> StoreFlavor {
        StoreFlavor::Memory
    }

    fn prepare(
        &mut self,
        plan: &StatementPlan,
        hints: PrepareHints,
    ) -> Result<StatementHandle, StorageError> {
        self.ensure_open()?;
        plan.validate()?;
        let delay = {
            let mut guard = self.store.inner.lock();
            if guard.refuse_prepares > 0 {
                guard.refuse_prepares -= 1;
                return Err(StorageError::Unavailable {
                    endpoint: self.endpoint.clone(),
                    reason: "prepare refused".to_string(),
                });
            }
            guard.stats.statements_prepared += 1;
            if hints.fetch_size.is_some() {
                guard.last_fetch_size = hints.fetch_size;
            }
            guard.prepare_delay
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let handle = self.slots.register(plan, hints);
        debug!(endpoint = %self.endpoint, handle = handle.0, text = %plan.render(), "prepared statement");
        Ok(handle)
    }

    fn release(&mut self, handle: StatementHandle) -> Result<(), StorageError> {
        self.slots.release(handle)?;
        self.store.inner.lock().stats.statements_released += 1;
        Ok(())
    }

    fn execute(
        &mut self,
        handle: StatementHandle,
        params: &[ColumnValue],
    ) -> Result<Execution, StorageError> {
        self.ensure_open()?;
        let plan = self.slots.plan(handle)?.clone();
        let out = self
            .store
            .inner
            .lock()
            .execute(&self.endpoint, &plan, params)?;
        if let Execution::Affected(n) = out {
            self.note_write(&plan, n);
        }
        Ok(out)
    }

    fn add_batch(
        &mut self,
        handle: StatementHandle,
        params: Vec<ColumnValue>,
    ) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.slots.push_batch(handle, params)
    }

    fn execute_batch(&mut self, handle: StatementHandle) -> Result<Vec<i64>, StorageError> {
        self.ensure_open()?;
        let (plan, rows) = self.slots.take_batch(handle)?;
        let mut codes = Vec::with_capacity(rows.len());
        let mut written = 0;
        {
            let mut guard = self.store.inner.lock();
            guard.stats.batches_executed += 1;
            for params in rows {
                match guard.execute(&self.endpoint, &plan, &params) {
                    Ok(Execution::Affected(n)) => {
                        written += n;
                        codes.push(n as i64);
                    }
                    Ok(_) => codes.push(EXECUTE_FAILED),
                    Err(_) => codes.push(EXECUTE_FAILED),
                }
            }
        }
        self.note_write(&plan, written);
        Ok(codes)
    }

    fn pending_batch_rows(&self, handle: StatementHandle) -> usize {
        self.slots.pending_rows(handle)
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        self.ensure_open()?;
        let mut guard = self.store.inner.lock();
        guard.stats.commits += 1;
        guard.stats.uncommitted_writes = 0;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self) -> Result<(), StorageError> {
        if self.closed {
            return Ok(());
        }
        let open = self.slots.clear() as u64;
        self.closed = true;
        let mut guard = self.store.inner.lock();
        guard.stats.statements_released += open;
        guard.stats.connections_closed += 1;
        Ok(())
    }
}
