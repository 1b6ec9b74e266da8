#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gdpr_contracts::{
    ColumnValue, ContractViolation, DeviceId, FieldMap, OperationKey, OrderedFields,
    PolicyAttribute, PolicyDraft, PolicyFilter, PolicyMetadata, PolicySelector, Record, RecordKey,
    StatementPlan, Status, TableName, UnixSeconds, UnixTimeMs, DEVICE_ID_FIELD,
};
use gdpr_storage::{Execution, PrepareHints};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::audit::{AuditEntry, AuditSink, AuditSinkRuntime};
use crate::batch::{BatchCommitController, BatchDecision};
use crate::config::DispatchConfig;
use crate::error::DispatchError;
use crate::router::ShardRouter;
use crate::shard_pool::{DefaultConnector, ShardConnector, ShardPool};
use crate::statement_cache::{PreparedOperation, StatementCache};
use crate::ttl_monitor::{ConvergenceOutcome, LiveCountOracle, TtlExpiryMonitor};

/// Status of one call plus whatever it read.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome<T> {
    pub status: Status,
    pub value: Option<T>,
}

impl<T> DispatchOutcome<T> {
    fn found(value: T) -> Self {
        Self {
            status: Status::Ok,
            value: Some(value),
        }
    }

    fn bare(status: Status) -> Self {
        Self {
            status,
            value: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}

/// Independent statuses of the data write and the policy write of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitOutcome {
    pub data: Status,
    pub policy: Status,
}

impl SplitOutcome {
    /// First non-success of the two, data first.
    pub fn combined(&self) -> Status {
        if !self.data.is_ok() {
            self.data
        } else if !self.policy.is_ok() {
            self.policy
        } else {
            self.data
        }
    }
}

enum WriteOutcome {
    Buffered,
    Flushed,
    Applied(u64),
}

/// Audit context gathered while a call runs.
struct CallTrace {
    querier: String,
    query: String,
}

/// Client-side entry point: one per benchmark client, shared by its worker
/// threads.
pub struct OperationDispatcher {
    config: DispatchConfig,
    router: ShardRouter,
    pool: ShardPool,
    cache: StatementCache,
    batch: BatchCommitController,
    audit: AuditSink,
    ttl: TtlExpiryMonitor,
    oracle: Option<Box<dyn LiveCountOracle>>,
    closed: AtomicBool,
    /// Shared by writes in flight; cleanup holds it exclusively.
    write_gate: RwLock<()>,
}

impl std::fmt::Debug for OperationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationDispatcher")
            .field("client_id", &self.config.client_id)
            .field("shards", &self.pool.len())
            .field("cached_operations", &self.cache.len())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl OperationDispatcher {
    pub fn init(config: DispatchConfig) -> Result<Self, DispatchError> {
        let audit = AuditSink::new(AuditSinkRuntime::from_endpoint(
            config.audit_endpoint.as_deref(),
        ));
        Self::init_with(config, &DefaultConnector::new(), audit)
    }

    pub fn init_with(
        config: DispatchConfig,
        connector: &dyn ShardConnector,
        audit: AuditSink,
    ) -> Result<Self, DispatchError> {
        let router = ShardRouter::new(config.endpoints.len())?;
        let pool = ShardPool::open(&config, connector)?;
        info!(
            client_id = %config.client_id,
            shards = pool.len(),
            user = config.credentials.as_ref().map(|c| c.user()).unwrap_or("-"),
            batch_size = config.batch_size,
            fetch_size = config.fetch_size,
            auto_commit = config.auto_commit,
            batch_update_api = config.batch_update_api,
            "dispatcher initialized"
        );
        Ok(Self {
            router,
            pool,
            cache: StatementCache::new(),
            batch: BatchCommitController::new(config.batch_size),
            audit,
            ttl: TtlExpiryMonitor::new(config.ttl.clone()),
            oracle: None,
            closed: AtomicBool::new(false),
            write_gate: RwLock::new(()),
            config,
        })
    }

    /// Replaces the store-backed live count used by `verify_ttl`.
    pub fn with_live_count_oracle(mut self, oracle: Box<dyn LiveCountOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn router(&self) -> &ShardRouter {
        &self.router
    }

    pub fn pool(&self) -> &ShardPool {
        &self.pool
    }

    pub fn cache(&self) -> &StatementCache {
        &self.cache
    }

    pub fn batch(&self) -> &BatchCommitController {
        &self.batch
    }

    pub fn audit(&self) -> &AuditSink {
        &self.audit
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // ---- data track ----

    pub fn read(&self, table: &str, key: &str) -> DispatchOutcome<Record> {
        let mut trace = self.trace(self.config.client_id.clone());
        let outcome = match self.read_inner(table, key, &mut trace) {
            Ok(Some(record)) => {
                trace.querier = record.device_id.to_string();
                DispatchOutcome::found(record)
            }
            Ok(None) => {
                DispatchOutcome::bare(self.fail("read", &DispatchError::NotFound(key.to_string())))
            }
            Err(err) if self.is_read_noise(&err) => {
                // Benchmark keys are random; a broken read path is not a client failure.
                warn!(key, error = %err, "read failed, reported as ok");
                DispatchOutcome::bare(Status::Ok)
            }
            Err(err) => DispatchOutcome::bare(self.fail("read", &err)),
        };
        let result = match &outcome.value {
            Some(record) => serde_json::to_string(record).unwrap_or_default(),
            None => outcome.status.to_string(),
        };
        self.emit(trace, result);
        outcome
    }

    fn read_inner(
        &self,
        table: &str,
        key: &str,
        trace: &mut CallTrace,
    ) -> Result<Option<Record>, DispatchError> {
        let table = TableName::new(table)?;
        let key = RecordKey::new(key)?;
        let op = self.prepared(
            StatementPlan::ReadRecord { table },
            self.router.shard_index(key.as_str()),
        )?;
        trace.query = op.text().to_string();
        match self.execute(&op, &[ColumnValue::text(key.as_str())])? {
            Execution::Records(rows) => Ok(rows.into_iter().next()),
            other => Err(unexpected("read", &other)),
        }
    }

    pub fn insert(&self, table: &str, key: &str, fields: &FieldMap) -> Status {
        let mut trace = self.trace(device_actor(fields));
        let status = match self.insert_inner(table, key, fields, &mut trace) {
            Ok(status) => status,
            Err(err) => self.fail("insert", &err),
        };
        self.emit(trace, status.to_string());
        status
    }

    fn insert_inner(
        &self,
        table: &str,
        key: &str,
        fields: &FieldMap,
        trace: &mut CallTrace,
    ) -> Result<Status, DispatchError> {
        let table = TableName::new(table)?;
        let key = RecordKey::new(key)?;
        // Rejects malformed device ids and field names before anything is bound.
        Record::new(key.clone(), fields.clone())?;
        let ordered = OrderedFields::from_map(fields);
        let op = self.prepared(
            StatementPlan::InsertRecord {
                table,
                columns: ordered.columns,
            },
            self.router.shard_index(key.as_str()),
        )?;
        trace.query = op.text().to_string();
        let mut params = Vec::with_capacity(ordered.values.len() + 1);
        params.push(ColumnValue::text(key.as_str()));
        params.extend(ordered.values.into_iter().map(ColumnValue::Text));
        self.apply_write(&op, params).map(single_row_status)
    }

    /// Data row plus a policy row expiring at `ttl`, stamped with the
    /// configured policy defaults.
    pub fn insert_with_expiry(
        &self,
        table: &str,
        key: &str,
        fields: &FieldMap,
        ttl: UnixSeconds,
    ) -> SplitOutcome {
        self.insert_with_policy(table, key, fields, self.config.policy_defaults.draft(ttl))
    }

    /// Two independent writes. A policy failure after a data success leaves
    /// the data row orphaned; both statuses are reported.
    pub fn insert_with_policy(
        &self,
        table: &str,
        key: &str,
        fields: &FieldMap,
        draft: PolicyDraft,
    ) -> SplitOutcome {
        let data = self.insert(table, key, fields);
        let mut trace = self.trace(device_actor(fields));
        let policy = match self.insert_policy_inner(key, fields, draft, &mut trace) {
            Ok(status) => status,
            Err(err) => self.fail("insert policy", &err),
        };
        self.emit(trace, policy.to_string());
        if data.is_ok() && !policy.is_ok() {
            warn!(key, "policy write failed after data write; data row has no policy");
        }
        SplitOutcome { data, policy }
    }

    fn insert_policy_inner(
        &self,
        key: &str,
        fields: &FieldMap,
        draft: PolicyDraft,
        trace: &mut CallTrace,
    ) -> Result<Status, DispatchError> {
        let id = RecordKey::new(key)?;
        let device_id = DeviceId::from_fields(fields)?;
        let row = draft.into_metadata(id, device_id, UnixTimeMs::now())?;
        let op = self.prepared(
            StatementPlan::InsertPolicy {
                table: self.config.policy_table.clone(),
            },
            self.router.shard_index(row.id.as_str()),
        )?;
        trace.query = op.text().to_string();
        self.apply_write(&op, policy_params(&row))
            .map(single_row_status)
    }

    /// Applies `fields` to the live row at `key`. A `device_id` entry narrows
    /// the target to `(key, device_id)` and is not itself rewritten.
    pub fn update(&self, table: &str, key: &str, fields: &FieldMap) -> Status {
        let mut trace = self.trace(device_actor(fields));
        let status = match self.update_inner(table, key, fields, &mut trace) {
            Ok(status) => status,
            Err(err) => self.fail("update", &err),
        };
        self.emit(trace, status.to_string());
        status
    }

    fn update_inner(
        &self,
        table: &str,
        key: &str,
        fields: &FieldMap,
        trace: &mut CallTrace,
    ) -> Result<Status, DispatchError> {
        let table = TableName::new(table)?;
        let key = RecordKey::new(key)?;
        let device = match fields.get(DEVICE_ID_FIELD) {
            Some(raw) => Some(DeviceId::parse(raw)?),
            None => None,
        };
        let mut changes = fields.clone();
        changes.remove(DEVICE_ID_FIELD);
        if changes.is_empty() {
            return Err(DispatchError::Contract(ContractViolation::InvalidValue {
                field: "fields",
                reason: "update must change at least one field",
            }));
        }
        let ordered = OrderedFields::from_map(&changes);
        let op = self.prepared(
            StatementPlan::UpdateRecord {
                table,
                columns: ordered.columns,
                match_device: device.is_some(),
            },
            self.router.shard_index(key.as_str()),
        )?;
        trace.query = op.text().to_string();
        let mut params: Vec<ColumnValue> =
            ordered.values.into_iter().map(ColumnValue::Text).collect();
        params.push(ColumnValue::text(key.as_str()));
        if let Some(device) = device {
            params.push(ColumnValue::Int(device.0));
        }
        let affected = self.execute_write(&op, &params)?;
        Ok(match affected {
            0 => Status::NotFound,
            1 => Status::Ok,
            _ => Status::UnexpectedState,
        })
    }

    /// Tombstones the data row. The policy row is left untouched.
    pub fn delete(&self, table: &str, key: &str) -> Status {
        let mut trace = self.trace(self.config.client_id.clone());
        let status = match self.delete_inner(table, key, &mut trace) {
            Ok(status) => status,
            Err(err) => self.fail("delete", &err),
        };
        self.emit(trace, status.to_string());
        status
    }

    fn delete_inner(
        &self,
        table: &str,
        key: &str,
        trace: &mut CallTrace,
    ) -> Result<Status, DispatchError> {
        let table = TableName::new(table)?;
        let key = RecordKey::new(key)?;
        let op = self.prepared(
            StatementPlan::TombstoneRecord { table },
            self.router.shard_index(key.as_str()),
        )?;
        trace.query = op.text().to_string();
        let affected = self.execute_write(&op, &[ColumnValue::text(key.as_str())])?;
        Ok(if affected == 0 {
            Status::NotFound
        } else {
            Status::Ok
        })
    }

    /// Up to `count` live rows from `start_key` onward on `start_key`'s shard,
    /// projected onto `fields` when given.
    pub fn scan(
        &self,
        table: &str,
        start_key: &str,
        count: i64,
        fields: Option<&[String]>,
    ) -> DispatchOutcome<Vec<Record>> {
        let mut trace = self.trace(self.config.client_id.clone());
        let outcome = match self.scan_inner(table, start_key, count, &mut trace) {
            Ok(rows) => DispatchOutcome::found(
                rows.iter()
                    .map(|r| r.project(fields))
                    .collect::<Vec<_>>(),
            ),
            Err(err) => DispatchOutcome::bare(self.fail("scan", &err)),
        };
        let result = match &outcome.value {
            Some(rows) => format!("{} rows", rows.len()),
            None => outcome.status.to_string(),
        };
        self.emit(trace, result);
        outcome
    }

    fn scan_inner(
        &self,
        table: &str,
        start_key: &str,
        count: i64,
        trace: &mut CallTrace,
    ) -> Result<Vec<Record>, DispatchError> {
        let table = TableName::new(table)?;
        let start = RecordKey::new(start_key)?;
        if count < 0 {
            return Err(DispatchError::Contract(ContractViolation::InvalidRange {
                field: "count",
                min: 0,
                max: i64::MAX,
                got: count,
            }));
        }
        let op = self.prepared(
            StatementPlan::ScanRecords { table },
            self.router.shard_index(start.as_str()),
        )?;
        trace.query = op.text().to_string();
        if count == 0 {
            return Ok(Vec::new());
        }
        match self.execute(&op, &[ColumnValue::text(start.as_str()), ColumnValue::Int(count)])? {
            Execution::Records(mut rows) => {
                rows.truncate(count as usize);
                Ok(rows)
            }
            other => Err(unexpected("scan", &other)),
        }
    }

    // ---- policy track ----

    pub fn read_policy(&self, selector: &PolicySelector) -> DispatchOutcome<Vec<PolicyMetadata>> {
        let mut trace = self.trace(selector.actor());
        let outcome = match self.read_policy_inner(selector, &mut trace) {
            Ok(rows) if rows.is_empty() => DispatchOutcome::bare(self.fail(
                "read policy",
                &DispatchError::NotFound(selector.actor()),
            )),
            Ok(rows) => DispatchOutcome::found(rows),
            Err(err) => DispatchOutcome::bare(self.fail("read policy", &err)),
        };
        let result = match &outcome.value {
            Some(rows) => serde_json::to_string(rows).unwrap_or_default(),
            None => outcome.status.to_string(),
        };
        self.emit(trace, result);
        outcome
    }

    fn read_policy_inner(
        &self,
        selector: &PolicySelector,
        trace: &mut CallTrace,
    ) -> Result<Vec<PolicyMetadata>, DispatchError> {
        let plan = StatementPlan::ReadPolicy {
            table: self.config.policy_table.clone(),
            filter: filter_of(selector),
        };
        trace.query = plan.render();
        let params = selector_params(selector);
        let mut rows = Vec::new();
        for shard_index in self.policy_shards(selector) {
            let op = self.prepared(plan.clone(), shard_index)?;
            match self.execute(&op, &params)? {
                Execution::Policies(found) => rows.extend(found),
                other => return Err(unexpected("read policy", &other)),
            }
        }
        Ok(rows)
    }

    /// Sets `attribute` to `value` on every live policy row `selector` resolves.
    pub fn update_policy(
        &self,
        selector: &PolicySelector,
        attribute: PolicyAttribute,
        value: &str,
    ) -> Status {
        let mut trace = self.trace(selector.actor());
        let status = match self.update_policy_inner(selector, attribute, value, &mut trace) {
            Ok(0) => Status::NotFound,
            Ok(_) => Status::Ok,
            Err(err) => self.fail("update policy", &err),
        };
        self.emit(trace, status.to_string());
        status
    }

    /// `update_policy` addressed by workload abbreviation (`SRC`, `OBJ`, ...).
    pub fn update_policy_abbrev(
        &self,
        selector: &PolicySelector,
        abbreviation: &str,
        value: &str,
    ) -> Status {
        self.update_policy(selector, PolicyAttribute::from_abbreviation(abbreviation), value)
    }

    /// Processor read: `querier`'s live rows whose abbreviated condition
    /// attribute equals `value`.
    pub fn read_policy_where(
        &self,
        querier: &str,
        condition: &str,
        value: &str,
    ) -> DispatchOutcome<Vec<PolicyMetadata>> {
        self.read_policy(&PolicySelector::from_condition(querier, condition, value))
    }

    /// Processor update. Both the condition and the changed field are
    /// workload abbreviations.
    pub fn update_policy_where(
        &self,
        querier: &str,
        condition: &str,
        condition_value: &str,
        field: &str,
        value: &str,
    ) -> Status {
        self.update_policy_abbrev(
            &PolicySelector::from_condition(querier, condition, condition_value),
            field,
            value,
        )
    }

    pub fn delete_policy_where(&self, querier: &str, condition: &str, value: &str) -> Status {
        self.delete_policy(&PolicySelector::from_condition(querier, condition, value))
    }

    fn update_policy_inner(
        &self,
        selector: &PolicySelector,
        attribute: PolicyAttribute,
        value: &str,
        trace: &mut CallTrace,
    ) -> Result<u64, DispatchError> {
        let plan = StatementPlan::UpdatePolicy {
            table: self.config.policy_table.clone(),
            attribute,
            filter: filter_of(selector),
        };
        trace.query = plan.render();
        let mut params = vec![ColumnValue::text(value)];
        params.extend(selector_params(selector));
        let mut affected = 0;
        for shard_index in self.policy_shards(selector) {
            let op = self.prepared(plan.clone(), shard_index)?;
            affected += self.execute_write(&op, &params)?;
        }
        Ok(affected)
    }

    /// Tombstones the policy rows `selector` resolves. Data rows are untouched.
    pub fn delete_policy(&self, selector: &PolicySelector) -> Status {
        let mut trace = self.trace(selector.actor());
        let status = match self.delete_policy_inner(selector, &mut trace) {
            Ok(0) => Status::NotFound,
            Ok(_) => Status::Ok,
            Err(err) => self.fail("delete policy", &err),
        };
        self.emit(trace, status.to_string());
        status
    }

    fn delete_policy_inner(
        &self,
        selector: &PolicySelector,
        trace: &mut CallTrace,
    ) -> Result<u64, DispatchError> {
        let plan = StatementPlan::TombstonePolicy {
            table: self.config.policy_table.clone(),
            filter: filter_of(selector),
        };
        trace.query = plan.render();
        let params = selector_params(selector);
        let mut affected = 0;
        for shard_index in self.policy_shards(selector) {
            let op = self.prepared(plan.clone(), shard_index)?;
            affected += self.execute_write(&op, &params)?;
        }
        Ok(affected)
    }

    /// Live policy rows across every shard as of now.
    pub fn live_policy_count(&self) -> Result<u64, DispatchError> {
        let plan = StatementPlan::CountLivePolicies {
            table: self.config.policy_table.clone(),
        };
        let now = i64::try_from(UnixSeconds::now().0).unwrap_or(i64::MAX);
        let mut total = 0;
        for shard_index in 0..self.pool.len() {
            let op = self.prepared(plan.clone(), shard_index)?;
            match self.execute(&op, &[ColumnValue::Int(now)])? {
                Execution::Count(n) => total += n,
                other => return Err(unexpected("live count", &other)),
            }
        }
        Ok(total)
    }

    /// Blocks until at most `expected_live` policy rows remain live.
    pub fn verify_ttl(&self, expected_live: u64) -> DispatchOutcome<ConvergenceOutcome> {
        let store_count = || self.live_policy_count();
        let oracle: &dyn LiveCountOracle = match &self.oracle {
            Some(oracle) => &**oracle,
            None => &store_count,
        };
        let outcome = self.ttl.await_convergence(oracle, expected_live);
        let status = if outcome.is_converged() {
            Status::Ok
        } else {
            Status::Error
        };
        self.emit(
            self.trace_with(
                self.config.client_id.clone(),
                format!("VERIFY TTL live <= {expected_live}"),
            ),
            format!("{outcome:?}"),
        );
        DispatchOutcome {
            status,
            value: Some(outcome),
        }
    }

    /// Most recent `count` audit entries the sink retains, oldest first.
    pub fn read_log(&self, count: usize) -> Vec<AuditEntry> {
        self.audit.recent(count)
    }

    /// Flushes accumulated writes, commits, releases every cached operation,
    /// and closes the shards. Later calls are no-ops. Waits for writes
    /// already in flight; writes arriving after it starts fail as closed.
    pub fn cleanup(&self) -> Result<(), DispatchError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _drained = self.write_gate.write();
        let mut first_error = None;
        if let Some(Err(err)) = self.batch.flush_remaining(&self.pool, self.config.auto_commit) {
            warn!(error = %err, "final batch flush failed");
            first_error.get_or_insert(err);
        }
        if !self.config.auto_commit {
            for shard in self.pool.iter() {
                if let Err(source) = shard.commit() {
                    first_error.get_or_insert(DispatchError::Execution {
                        shard_index: shard.index(),
                        source,
                    });
                }
            }
        }
        let released = self.cache.release_all();
        for shard in self.pool.iter() {
            if let Err(source) = shard.close() {
                first_error.get_or_insert(DispatchError::Execution {
                    shard_index: shard.index(),
                    source,
                });
            }
        }
        info!(
            released,
            writes = self.batch.writes_recorded(),
            flushes = self.batch.flush_count(),
            "dispatcher closed"
        );
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // ---- internals ----

    fn ensure_open(&self) -> Result<(), DispatchError> {
        if self.is_closed() {
            return Err(DispatchError::Closed);
        }
        Ok(())
    }

    fn prepared(
        &self,
        plan: StatementPlan,
        shard_index: usize,
    ) -> Result<Arc<PreparedOperation>, DispatchError> {
        self.ensure_open()?;
        let shard = self.pool.get(shard_index).ok_or_else(|| {
            DispatchError::Configuration(format!("no shard at index {shard_index}"))
        })?;
        let key = OperationKey::for_plan(&plan, shard_index);
        let hints = PrepareHints {
            fetch_size: if matches!(plan, StatementPlan::ScanRecords { .. }) {
                self.config.fetch_size_hint()
            } else {
                None
            },
        };
        self.cache.get_or_create(key.clone(), || {
            debug!(key = %key, "building prepared operation");
            PreparedOperation::prepare(key.clone(), plan, shard.clone(), hints)
        })
    }

    fn execute(
        &self,
        op: &PreparedOperation,
        params: &[ColumnValue],
    ) -> Result<Execution, DispatchError> {
        op.execute(params).map_err(|source| DispatchError::Execution {
            shard_index: op.shard().index(),
            source,
        })
    }

    /// Unbatched write; commits its shard right away without auto-commit.
    fn execute_write(
        &self,
        op: &PreparedOperation,
        params: &[ColumnValue],
    ) -> Result<u64, DispatchError> {
        let affected = match self.execute(op, params)? {
            Execution::Affected(n) => n,
            other => return Err(unexpected("write", &other)),
        };
        if !self.config.auto_commit {
            self.commit_shard(op)?;
        }
        Ok(affected)
    }

    fn commit_shard(&self, op: &PreparedOperation) -> Result<(), DispatchError> {
        op.shard()
            .commit()
            .map_err(|source| DispatchError::Execution {
                shard_index: op.shard().index(),
                source,
            })
    }

    /// Insert path shared by data and policy rows; counted by the batch controller.
    fn apply_write(
        &self,
        op: &Arc<PreparedOperation>,
        params: Vec<ColumnValue>,
    ) -> Result<WriteOutcome, DispatchError> {
        let _in_flight = self.write_gate.read();
        self.ensure_open()?;
        if self.config.batching_enabled() && self.config.batch_update_api {
            op.add_batch(params)
                .map_err(|source| DispatchError::Execution {
                    shard_index: op.shard().index(),
                    source,
                })?;
            self.batch.track(op);
            return match self.batch.record_write() {
                BatchDecision::FlushNow => {
                    self.batch.flush(&self.pool, self.config.auto_commit)?;
                    Ok(WriteOutcome::Flushed)
                }
                BatchDecision::Accumulate | BatchDecision::Immediate => Ok(WriteOutcome::Buffered),
            };
        }
        let affected = match self.execute(op, &params)? {
            Execution::Affected(n) => n,
            other => return Err(unexpected("insert", &other)),
        };
        match self.batch.record_write() {
            BatchDecision::Immediate => {
                if !self.config.auto_commit {
                    self.commit_shard(op)?;
                }
            }
            BatchDecision::FlushNow => {
                self.batch.flush(&self.pool, self.config.auto_commit)?;
            }
            BatchDecision::Accumulate => {}
        }
        Ok(WriteOutcome::Applied(affected))
    }

    fn policy_shards(&self, selector: &PolicySelector) -> Vec<usize> {
        match selector {
            PolicySelector::Device { id, .. } => vec![self.router.shard_index(id.as_str())],
            PolicySelector::Attribute { .. } => (0..self.pool.len()).collect(),
        }
    }

    fn is_read_noise(&self, err: &DispatchError) -> bool {
        self.config.read_error_is_noise
            && matches!(
                err,
                DispatchError::Execution { .. } | DispatchError::Prepare { .. }
            )
    }

    fn fail(&self, operation: &'static str, err: &DispatchError) -> Status {
        let status = err.status();
        match status {
            Status::NotFound => debug!(operation, error = %err, "dispatch miss"),
            _ => warn!(operation, error = %err, status = %status, "dispatch failed"),
        }
        status
    }

    fn trace(&self, querier: String) -> CallTrace {
        self.trace_with(querier, String::new())
    }

    fn trace_with(&self, querier: String, query: String) -> CallTrace {
        CallTrace { querier, query }
    }

    fn emit(&self, trace: CallTrace, result: String) {
        self.audit
            .record(AuditEntry::new(trace.querier, trace.query, result));
    }
}

impl Drop for OperationDispatcher {
    fn drop(&mut self) {
        if let Err(err) = self.cleanup() {
            warn!(error = %err, "cleanup on drop failed");
        }
    }
}

/// An insert must touch exactly one row.
fn single_row_status(outcome: WriteOutcome) -> Status {
    match outcome {
        WriteOutcome::Buffered => Status::BatchedOk,
        WriteOutcome::Flushed | WriteOutcome::Applied(1) => Status::Ok,
        WriteOutcome::Applied(_) => Status::UnexpectedState,
    }
}

fn unexpected(operation: &str, got: &Execution) -> DispatchError {
    DispatchError::UnexpectedState(format!("{operation} returned {got:?}"))
}

fn device_actor(fields: &FieldMap) -> String {
    DeviceId::from_fields(fields)
        .unwrap_or(DeviceId::UNASSIGNED)
        .to_string()
}

fn filter_of(selector: &PolicySelector) -> PolicyFilter {
    match selector {
        PolicySelector::Device { .. } => PolicyFilter::ByDevice,
        PolicySelector::Attribute { attribute, .. } => PolicyFilter::ByAttribute(*attribute),
    }
}

fn selector_params(selector: &PolicySelector) -> Vec<ColumnValue> {
    match selector {
        PolicySelector::Device { id, device_id } => {
            vec![ColumnValue::text(id.as_str()), ColumnValue::Int(device_id.0)]
        }
        PolicySelector::Attribute { querier, value, .. } => {
            vec![ColumnValue::text(querier.as_str()), ColumnValue::text(value.as_str())]
        }
    }
}

fn policy_params(row: &PolicyMetadata) -> Vec<ColumnValue> {
    let to_int = |v: u64| ColumnValue::Int(i64::try_from(v).unwrap_or(i64::MAX));
    vec![
        ColumnValue::text(row.id.as_str()),
        ColumnValue::Int(row.device_id.0),
        ColumnValue::text(row.querier.as_str()),
        ColumnValue::text(row.purpose.as_str()),
        to_int(row.ttl.0),
        ColumnValue::text(row.origin.as_str()),
        ColumnValue::text(row.objection.as_str()),
        ColumnValue::text(row.sharing.as_str()),
        ColumnValue::text(row.enforcement_action.as_str()),
        to_int(row.inserted_at.0),
    ]
}
