#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use gdpr_contracts::{
    ColumnValue, PolicyMetadata, Record, StatementPlan, Validate, POLICY_INSERT_COLUMNS,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::shard::{
    check_param_count, param_int, param_key, param_text, selector_from_params, Execution,
    PrepareHints, PreparedSlots, ShardConnection, StatementHandle, StorageError, StoreFlavor,
    EXECUTE_FAILED,
};

pub const POLICY_SERVICE_CONNECT_TIMEOUT_MS_DEFAULT: u64 = 2_000;
pub const POLICY_SERVICE_REQUEST_TIMEOUT_MS_DEFAULT: u64 = 5_000;

/// Login sent to the policy service as HTTP basic auth.
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceCredentials {
    user: String,
    password: String,
}

impl ServiceCredentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    /// Builds credentials from optional login knobs; no user means none.
    pub fn from_parts(user: Option<String>, password: Option<String>) -> Option<Self> {
        user.map(|u| Self::new(u, password.unwrap_or_default()))
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn authorization(&self) -> String {
        let pair = format!("{}:{}", self.user, self.password);
        format!("Basic {}", BASE64.encode(pair.as_bytes()))
    }
}

impl fmt::Debug for ServiceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceCredentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyServiceConfig {
    pub base_url: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub credentials: Option<ServiceCredentials>,
}

impl PolicyServiceConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            connect_timeout_ms: POLICY_SERVICE_CONNECT_TIMEOUT_MS_DEFAULT,
            request_timeout_ms: POLICY_SERVICE_REQUEST_TIMEOUT_MS_DEFAULT,
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Option<ServiceCredentials>) -> Self {
        self.credentials = credentials;
        self
    }
}

/// Service route and the status code a successful call answers with.
fn route(plan: &StatementPlan) -> (&'static str, u16) {
    match plan {
        StatementPlan::ReadRecord { .. } => ("get_obj", 200),
        StatementPlan::InsertRecord { .. } => ("add_obj", 201),
        StatementPlan::UpdateRecord { .. } => ("modify_obj", 200),
        StatementPlan::TombstoneRecord { .. } => ("delete_obj", 200),
        StatementPlan::ScanRecords { .. } => ("scan_obj", 200),
        StatementPlan::ReadPolicy { .. } => ("mget_obj", 200),
        StatementPlan::InsertPolicy { .. } => ("madd_obj", 201),
        StatementPlan::UpdatePolicy { .. } => ("mmodify_obj", 200),
        StatementPlan::TombstonePolicy { .. } => ("mdelete_obj", 200),
        StatementPlan::CountLivePolicies { .. } => ("mcount_live", 200),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ServiceReply {
    #[serde(default)]
    records: Vec<Record>,
    #[serde(default)]
    policies: Vec<PolicyMetadata>,
    affected: Option<u64>,
    count: Option<u64>,
}

/// Backing-store flavor that delegates every statement to the external
/// policy microservice over HTTP/JSON.
#[derive(Debug)]
pub struct PolicyServiceConnection {
    config: PolicyServiceConfig,
    agent: ureq::Agent,
    slots: PreparedSlots,
    closed: bool,
}

impl PolicyServiceConnection {
    pub fn open(config: PolicyServiceConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_millis(config.connect_timeout_ms))
            .timeout_read(Duration::from_millis(config.request_timeout_ms))
            .timeout_write(Duration::from_millis(config.request_timeout_ms))
            .build();
        Self {
            config,
            agent,
            slots: PreparedSlots::default(),
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed {
            return Err(StorageError::Closed {
                endpoint: self.config.base_url.clone(),
            });
        }
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/", self.config.base_url.trim_end_matches('/'), path)
    }

    fn call(
        &self,
        plan: &StatementPlan,
        hints: PrepareHints,
        params: &[ColumnValue],
    ) -> Result<Execution, StorageError> {
        check_param_count(plan, params)?;
        let body = request_body(plan, hints, params)?;
        let (path, expected) = route(plan);
        let url = self.url(path);
        debug!(url = %url, "policy service call");
        let mut request = self
            .agent
            .post(&url)
            .set("content-type", "application/json");
        if let Some(credentials) = &self.config.credentials {
            request = request.set("authorization", &credentials.authorization());
        }
        let reply = match request.send_string(&body.to_string()) {
            Ok(resp) => {
                if resp.status() != expected {
                    return Err(StorageError::HttpStatus {
                        endpoint: url,
                        status: resp.status(),
                    });
                }
                let text = resp
                    .into_string()
                    .map_err(|e| StorageError::Decode(e.to_string()))?;
                if text.trim().is_empty() {
                    ServiceReply::default()
                } else {
                    serde_json::from_str::<ServiceReply>(&text)
                        .map_err(|e| StorageError::Decode(e.to_string()))?
                }
            }
            // Missing rows are an empty result, not a failure.
            Err(ureq::Error::Status(404, _)) => return Ok(empty_result(plan)),
            Err(ureq::Error::Status(code, _)) => {
                return Err(StorageError::HttpStatus {
                    endpoint: url,
                    status: code,
                })
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(StorageError::Transport(err.to_string()))
            }
        };
        Ok(decode_reply(plan, reply))
    }
}

fn empty_result(plan: &StatementPlan) -> Execution {
    match plan {
        StatementPlan::ReadRecord { .. } | StatementPlan::ScanRecords { .. } => {
            Execution::Records(Vec::new())
        }
        StatementPlan::ReadPolicy { .. } => Execution::Policies(Vec::new()),
        StatementPlan::CountLivePolicies { .. } => Execution::Count(0),
        _ => Execution::Affected(0),
    }
}

fn decode_reply(plan: &StatementPlan, reply: ServiceReply) -> Execution {
    match plan {
        StatementPlan::ReadRecord { .. } | StatementPlan::ScanRecords { .. } => {
            Execution::Records(reply.records)
        }
        StatementPlan::ReadPolicy { .. } => Execution::Policies(reply.policies),
        StatementPlan::CountLivePolicies { .. } => Execution::Count(reply.count.unwrap_or(0)),
        _ => Execution::Affected(reply.affected.unwrap_or(1)),
    }
}

fn selector_json(
    plan_filter: gdpr_contracts::PolicyFilter,
    params: &[ColumnValue],
    first: usize,
) -> Result<Value, StorageError> {
    let selector = selector_from_params(plan_filter, params, first)?;
    serde_json::to_value(selector).map_err(|e| StorageError::Decode(e.to_string()))
}

/// JSON request for one execution. The parameterized text travels as
/// `query`; values travel as separate JSON members.
fn request_body(
    plan: &StatementPlan,
    hints: PrepareHints,
    params: &[ColumnValue],
) -> Result<Value, StorageError> {
    let mut body = Map::new();
    body.insert("query".into(), json!(plan.render()));
    body.insert("table".into(), json!(plan.table().as_str()));
    match plan {
        StatementPlan::ReadRecord { .. } | StatementPlan::TombstoneRecord { .. } => {
            body.insert("id".into(), json!(param_key(params, 0)?.as_str()));
        }
        StatementPlan::InsertRecord { columns, .. } => {
            body.insert("id".into(), json!(param_key(params, 0)?.as_str()));
            let fields: Map<String, Value> = columns
                .iter()
                .zip(params[1..].iter())
                .map(|(c, v)| (c.clone(), json!(v.as_text())))
                .collect();
            body.insert("fields".into(), Value::Object(fields));
        }
        StatementPlan::UpdateRecord {
            columns,
            match_device,
            ..
        } => {
            let fields: Map<String, Value> = columns
                .iter()
                .zip(params.iter())
                .map(|(c, v)| (c.clone(), json!(v.as_text())))
                .collect();
            body.insert("fields".into(), Value::Object(fields));
            body.insert("id".into(), json!(param_key(params, columns.len())?.as_str()));
            if *match_device {
                body.insert(
                    "device_id".into(),
                    json!(param_int(params, columns.len() + 1)?),
                );
            }
        }
        StatementPlan::ScanRecords { .. } => {
            body.insert("id".into(), json!(param_key(params, 0)?.as_str()));
            body.insert("limit".into(), json!(param_int(params, 1)?));
            if let Some(fetch) = hints.fetch_size {
                body.insert("fetch_size".into(), json!(fetch));
            }
        }
        StatementPlan::ReadPolicy { filter, .. } | StatementPlan::TombstonePolicy { filter, .. } => {
            body.insert("selector".into(), selector_json(*filter, params, 0)?);
        }
        StatementPlan::InsertPolicy { .. } => {
            let mut row = Map::new();
            for (name, value) in POLICY_INSERT_COLUMNS.iter().zip(params.iter()) {
                row.insert((*name).to_string(), serde_json::to_value(value).unwrap_or(Value::Null));
            }
            row.insert("tomb".into(), json!(0));
            body.insert("fields".into(), Value::Object(row));
        }
        StatementPlan::UpdatePolicy {
            attribute, filter, ..
        } => {
            let mut fields = Map::new();
            fields.insert(attribute.column().to_string(), json!(param_text(params, 0)?));
            body.insert("fields".into(), Value::Object(fields));
            body.insert("selector".into(), selector_json(*filter, params, 1)?);
        }
        StatementPlan::CountLivePolicies { .. } => {
            body.insert("now".into(), json!(param_int(params, 0)?));
        }
    }
    Ok(Value::Object(body))
}

impl ShardConnection for PolicyServiceConnection {
    fn endpoint(&self) -> &str {
        &self.config.base_url
    }

    fn flavor(&self) -> StoreFlavor {
        StoreFlavor::PolicyService
    }

    fn prepare(
        &mut self,
        plan: &StatementPlan,
        hints: PrepareHints,
    ) -> Result<StatementHandle, StorageError> {
        self.ensure_open()?;
        plan.validate()?;
        Ok(self.slots.register(plan, hints))
    }

    fn release(&mut self, handle: StatementHandle) -> Result<(), StorageError> {
        self.slots.release(handle)
    }

    fn execute(
        &mut self,
        handle: StatementHandle,
        params: &[ColumnValue],
    ) -> Result<Execution, StorageError> {
        self.ensure_open()?;
        let plan = self.slots.plan(handle)?.clone();
        let hints = self.slots.hints(handle)?;
        self.call(&plan, hints, params)
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
        let hints = self.slots.hints(handle)?;
        let (plan, rows) = self.slots.take_batch(handle)?;
        let codes = rows
            .iter()
            .map(|params| match self.call(&plan, hints, params) {
                Ok(Execution::Affected(n)) => n as i64,
                Ok(_) | Err(_) => EXECUTE_FAILED,
            })
            .collect();
        Ok(codes)
    }

    fn pending_batch_rows(&self, handle: StatementHandle) -> usize {
        self.slots.pending_rows(handle)
    }

    // Every service call is durable on its own.
    fn commit(&mut self) -> Result<(), StorageError> {
        self.ensure_open()
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self) -> Result<(), StorageError> {
        self.slots.clear();
        self.closed = true;
        Ok(())
    }
}
