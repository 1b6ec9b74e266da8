#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use gdpr_contracts::{
    ColumnValue, ContractViolation, DeviceId, PolicyFilter, PolicyMetadata, PolicySelector,
    Record, RecordKey, StatementPlan,
};

/// Per-row batch result: exactly one row affected.
pub const ROW_AFFECTED: i64 = 1;
/// Per-row batch result some drivers report for rewritten bulk inserts.
pub const SUCCESS_NO_INFO: i64 = -2;
/// Per-row batch result for a row the backing store refused.
pub const EXECUTE_FAILED: i64 = -3;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error("duplicate key {key} in table {table}")]
    DuplicateKey { table: String, key: String },
    #[error("unknown prepared statement #{0}")]
    UnknownStatement(u64),
    #[error("expected {expected} bound parameters, got {got}")]
    ParamCountMismatch { expected: usize, got: usize },
    #[error("parameter ${index} is invalid: {reason}")]
    InvalidParam { index: usize, reason: &'static str },
    #[error("connection to {endpoint} is closed")]
    Closed { endpoint: String },
    #[error("{endpoint} unavailable: {reason}")]
    Unavailable { endpoint: String, reason: String },
    #[error("{endpoint} answered http {status}")]
    HttpStatus { endpoint: String, status: u16 },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error(transparent)]
    ContractViolation(#[from] ContractViolation),
}

/// Backing-store flavor selected from an endpoint URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreFlavor {
    /// In-process relational store addressed as `mem://<name>`.
    Memory,
    /// External policy microservice addressed as `http(s)://host[:port]/prefix`.
    PolicyService,
}

impl StoreFlavor {
    pub fn from_endpoint(endpoint: &str) -> Option<Self> {
        let e = endpoint.trim();
        if e.starts_with("mem://") {
            Some(StoreFlavor::Memory)
        } else if e.starts_with("http://") || e.starts_with("https://") {
            Some(StoreFlavor::PolicyService)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StoreFlavor::Memory => "memory",
            StoreFlavor::PolicyService => "policy_service",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StatementHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrepareHints {
    /// Row fetch size hinted for scans; `None` leaves the store default.
    pub fetch_size: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Execution {
    Records(Vec<Record>),
    Policies(Vec<PolicyMetadata>),
    Affected(u64),
    Count(u64),
}

/// One owned connection to one partition of the backing store.
///
/// Connections are not shared between threads concurrently; the dispatcher
/// serializes access per shard.
pub trait ShardConnection: Send {
    fn endpoint(&self) -> &str;
    fn flavor(&self) -> StoreFlavor;

    fn prepare(
        &mut self,
        plan: &StatementPlan,
        hints: PrepareHints,
    ) -> Result<StatementHandle, StorageError>;
    fn release(&mut self, handle: StatementHandle) -> Result<(), StorageError>;

    fn execute(
        &mut self,
        handle: StatementHandle,
        params: &[ColumnValue],
    ) -> Result<Execution, StorageError>;
    fn add_batch(
        &mut self,
        handle: StatementHandle,
        params: Vec<ColumnValue>,
    ) -> Result<(), StorageError>;
    /// Runs every buffered row of `handle`, returning one result code per row.
    fn execute_batch(&mut self, handle: StatementHandle) -> Result<Vec<i64>, StorageError>;
    fn pending_batch_rows(&self, handle: StatementHandle) -> usize;

    fn commit(&mut self) -> Result<(), StorageError>;
    fn is_closed(&self) -> bool;
    fn close(&mut self) -> Result<(), StorageError>;
}

#[derive(Debug, Clone)]
struct SlotEntry {
    plan: StatementPlan,
    hints: PrepareHints,
    batch: Vec<Vec<ColumnValue>>,
}

/// Prepared-statement bookkeeping shared by the connection flavors.
#[derive(Debug, Default)]
pub struct PreparedSlots {
    next_handle: u64,
    slots: BTreeMap<StatementHandle, SlotEntry>,
}

impl PreparedSlots {
    pub fn register(&mut self, plan: &StatementPlan, hints: PrepareHints) -> StatementHandle {
        self.next_handle = self.next_handle.saturating_add(1);
        let handle = StatementHandle(self.next_handle);
        self.slots.insert(
            handle,
            SlotEntry {
                plan: plan.clone(),
                hints,
                batch: Vec::new(),
            },
        );
        handle
    }

    pub fn plan(&self, handle: StatementHandle) -> Result<&StatementPlan, StorageError> {
        self.slots
            .get(&handle)
            .map(|s| &s.plan)
            .ok_or(StorageError::UnknownStatement(handle.0))
    }

    pub fn hints(&self, handle: StatementHandle) -> Result<PrepareHints, StorageError> {
        self.slots
            .get(&handle)
            .map(|s| s.hints)
            .ok_or(StorageError::UnknownStatement(handle.0))
    }

    pub fn release(&mut self, handle: StatementHandle) -> Result<(), StorageError> {
        self.slots
            .remove(&handle)
            .map(|_| ())
            .ok_or(StorageError::UnknownStatement(handle.0))
    }

    pub fn push_batch(
        &mut self,
        handle: StatementHandle,
        params: Vec<ColumnValue>,
    ) -> Result<(), StorageError> {
        let slot = self
            .slots
            .get_mut(&handle)
            .ok_or(StorageError::UnknownStatement(handle.0))?;
        check_param_count(&slot.plan, &params)?;
        slot.batch.push(params);
        Ok(())
    }

    pub fn take_batch(
        &mut self,
        handle: StatementHandle,
    ) -> Result<(StatementPlan, Vec<Vec<ColumnValue>>), StorageError> {
        let slot = self
            .slots
            .get_mut(&handle)
            .ok_or(StorageError::UnknownStatement(handle.0))?;
        Ok((slot.plan.clone(), std::mem::take(&mut slot.batch)))
    }

    pub fn pending_rows(&self, handle: StatementHandle) -> usize {
        self.slots.get(&handle).map(|s| s.batch.len()).unwrap_or(0)
    }

    pub fn open_count(&self) -> usize {
        self.slots.len()
    }

    /// Drops every slot, returning how many were still open.
    pub fn clear(&mut self) -> usize {
        let open = self.slots.len();
        self.slots.clear();
        open
    }
}

pub fn check_param_count(plan: &StatementPlan, params: &[ColumnValue]) -> Result<(), StorageError> {
    let expected = plan.param_count();
    if params.len() != expected {
        return Err(StorageError::ParamCountMismatch {
            expected,
            got: params.len(),
        });
    }
    Ok(())
}

pub fn param_key(params: &[ColumnValue], index: usize) -> Result<RecordKey, StorageError> {
    let raw = params.get(index).ok_or(StorageError::InvalidParam {
        index: index + 1,
        reason: "missing",
    })?;
    Ok(RecordKey::new(raw.as_text())?)
}

pub fn param_int(params: &[ColumnValue], index: usize) -> Result<i64, StorageError> {
    params
        .get(index)
        .and_then(ColumnValue::as_int)
        .ok_or(StorageError::InvalidParam {
            index: index + 1,
            reason: "expected an integer",
        })
}

pub fn param_text(params: &[ColumnValue], index: usize) -> Result<String, StorageError> {
    params
        .get(index)
        .map(ColumnValue::as_text)
        .ok_or(StorageError::InvalidParam {
            index: index + 1,
            reason: "missing",
        })
}

/// Rebuilds the policy selector bound at `first` for `filter`.
pub fn selector_from_params(
    filter: PolicyFilter,
    params: &[ColumnValue],
    first: usize,
) -> Result<PolicySelector, StorageError> {
    match filter {
        PolicyFilter::ByDevice => Ok(PolicySelector::Device {
            id: param_key(params, first)?,
            device_id: DeviceId(param_int(params, first + 1)?),
        }),
        PolicyFilter::ByAttribute(attribute) => Ok(PolicySelector::Attribute {
            querier: param_text(params, first)?,
            attribute,
            value: param_text(params, first + 1)?,
        }),
    }
}
