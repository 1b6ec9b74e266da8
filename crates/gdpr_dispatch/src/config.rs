#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use gdpr_contracts::{PolicyDraft, TableName, UnixSeconds, ENFORCEMENT_ALLOW};
use gdpr_storage::{ServiceCredentials, StoreFlavor};

use crate::error::DispatchError;

pub const DB_URL: &str = "db.url";
pub const DB_USER: &str = "db.user";
pub const DB_PASSWD: &str = "db.passwd";
pub const DB_BATCH_SIZE: &str = "db.batchsize";
pub const FETCH_SIZE: &str = "jdbc.fetchsize";
pub const AUTO_COMMIT: &str = "jdbc.autocommit";
pub const BATCH_UPDATE_API: &str = "jdbc.batchupdateapi";
pub const POLICY_TABLE: &str = "gdpr.policytable";
pub const AUDIT_ENDPOINT: &str = "gdpr.audit.endpoint";
pub const TTL_POLL_MS: &str = "gdpr.ttl.poll_ms";
pub const TTL_MAX_WAIT_MS: &str = "gdpr.ttl.max_wait_ms";
pub const CLIENT_ID: &str = "gdpr.client_id";
pub const READ_ERROR_IS_NOISE: &str = "gdpr.read_error_is_noise";
pub const POLICY_QUERIER: &str = "gdpr.policy.querier";
pub const POLICY_PURPOSE: &str = "gdpr.policy.purpose";
pub const POLICY_ORIGIN: &str = "gdpr.policy.origin";
pub const POLICY_OBJECTION: &str = "gdpr.policy.objection";
pub const POLICY_SHARING: &str = "gdpr.policy.sharing";
pub const POLICY_ENFORCEMENT: &str = "gdpr.policy.enforcement_action";

/// Integer knobs left unset read as this value.
pub const UNSET: i64 = -1;
pub const POLICY_TABLE_DEFAULT: &str = "user_policy";
pub const CLIENT_ID_DEFAULT: &str = "gdpr-client";
pub const TTL_POLL_MS_DEFAULT: u64 = 1_000;

const ALL_KEYS: [&str; 19] = [
    DB_URL,
    DB_USER,
    DB_PASSWD,
    DB_BATCH_SIZE,
    FETCH_SIZE,
    AUTO_COMMIT,
    BATCH_UPDATE_API,
    POLICY_TABLE,
    AUDIT_ENDPOINT,
    TTL_POLL_MS,
    TTL_MAX_WAIT_MS,
    CLIENT_ID,
    READ_ERROR_IS_NOISE,
    POLICY_QUERIER,
    POLICY_PURPOSE,
    POLICY_ORIGIN,
    POLICY_OBJECTION,
    POLICY_SHARING,
    POLICY_ENFORCEMENT,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlPolicy {
    pub poll_interval: Duration,
    /// `None` blocks until convergence.
    pub max_wait: Option<Duration>,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(TTL_POLL_MS_DEFAULT),
            max_wait: None,
        }
    }
}

/// Attribute values stamped on policy rows created by `insert_with_expiry`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDefaults {
    pub querier: String,
    pub purpose: String,
    pub origin: String,
    pub objection: String,
    pub sharing: String,
    pub enforcement_action: String,
}

impl Default for PolicyDefaults {
    fn default() -> Self {
        Self {
            querier: "1".to_string(),
            purpose: "1".to_string(),
            origin: "1".to_string(),
            objection: "0".to_string(),
            sharing: "0".to_string(),
            enforcement_action: ENFORCEMENT_ALLOW.to_string(),
        }
    }
}

impl PolicyDefaults {
    pub fn draft(&self, ttl: UnixSeconds) -> PolicyDraft {
        PolicyDraft {
            querier: self.querier.clone(),
            purpose: self.purpose.clone(),
            origin: self.origin.clone(),
            objection: self.objection.clone(),
            sharing: self.sharing.clone(),
            enforcement_action: self.enforcement_action.clone(),
            ttl,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Ordered shard pool; position is the shard index.
    pub endpoints: Vec<String>,
    /// Basic-auth login for policy-service shards.
    pub credentials: Option<ServiceCredentials>,
    pub batch_size: i64,
    pub fetch_size: i64,
    pub auto_commit: bool,
    pub batch_update_api: bool,
    pub policy_table: TableName,
    pub audit_endpoint: Option<String>,
    pub ttl: TtlPolicy,
    pub client_id: String,
    /// Report failed reads as OK; benchmark keys are random and may hit broken rows.
    pub read_error_is_noise: bool,
    pub policy_defaults: PolicyDefaults,
}

impl DispatchConfig {
    /// Config over `endpoints` with every other knob at its default.
    pub fn for_endpoints<I, S>(endpoints: I) -> Result<Self, DispatchError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let joined = endpoints
            .into_iter()
            .map(Into::into)
            .collect::<Vec<String>>()
            .join(",");
        let mut props = BTreeMap::new();
        props.insert(DB_URL.to_string(), joined);
        Self::from_properties(&props)
    }

    pub fn from_properties(props: &BTreeMap<String, String>) -> Result<Self, DispatchError> {
        let get = |key: &str| {
            props
                .get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let endpoints = parse_endpoints(get(DB_URL).as_deref().unwrap_or(""))?;
        let policy_table = TableName::new(
            get(POLICY_TABLE).unwrap_or_else(|| POLICY_TABLE_DEFAULT.to_string()),
        )
        .map_err(|e| DispatchError::Configuration(format!("{POLICY_TABLE}: {e}")))?;

        let poll_ms = parse_int(get(TTL_POLL_MS), TTL_POLL_MS)?;
        let max_wait_ms = parse_int(get(TTL_MAX_WAIT_MS), TTL_MAX_WAIT_MS)?;
        let ttl = TtlPolicy {
            poll_interval: Duration::from_millis(if poll_ms > 0 {
                poll_ms as u64
            } else {
                TTL_POLL_MS_DEFAULT
            }),
            max_wait: (max_wait_ms >= 0).then(|| Duration::from_millis(max_wait_ms as u64)),
        };

        let defaults = PolicyDefaults::default();
        let policy_defaults = PolicyDefaults {
            querier: get(POLICY_QUERIER).unwrap_or(defaults.querier),
            purpose: get(POLICY_PURPOSE).unwrap_or(defaults.purpose),
            origin: get(POLICY_ORIGIN).unwrap_or(defaults.origin),
            objection: get(POLICY_OBJECTION).unwrap_or(defaults.objection),
            sharing: get(POLICY_SHARING).unwrap_or(defaults.sharing),
            enforcement_action: get(POLICY_ENFORCEMENT).unwrap_or(defaults.enforcement_action),
        };

        Ok(Self {
            endpoints,
            credentials: ServiceCredentials::from_parts(get(DB_USER), get(DB_PASSWD)),
            batch_size: parse_int(get(DB_BATCH_SIZE), DB_BATCH_SIZE)?,
            fetch_size: parse_int(get(FETCH_SIZE), FETCH_SIZE)?,
            auto_commit: parse_bool(get(AUTO_COMMIT), AUTO_COMMIT, true)?,
            batch_update_api: parse_bool(get(BATCH_UPDATE_API), BATCH_UPDATE_API, false)?,
            policy_table,
            audit_endpoint: get(AUDIT_ENDPOINT),
            ttl,
            client_id: get(CLIENT_ID).unwrap_or_else(|| CLIENT_ID_DEFAULT.to_string()),
            read_error_is_noise: parse_bool(get(READ_ERROR_IS_NOISE), READ_ERROR_IS_NOISE, true)?,
            policy_defaults,
        })
    }

    /// Reads every property from `GDPR_<KEY>` with dots as underscores,
    /// e.g. `db.batchsize` from `GDPR_DB_BATCHSIZE` and `gdpr.ttl.poll_ms`
    /// from `GDPR_TTL_POLL_MS`.
    pub fn from_env() -> Result<Self, DispatchError> {
        let props = ALL_KEYS
            .iter()
            .filter_map(|key| {
                env::var(env_var_name(key))
                    .ok()
                    .map(|v| (key.to_string(), v))
            })
            .collect::<BTreeMap<_, _>>();
        Self::from_properties(&props)
    }

    pub fn flavor(&self) -> Option<StoreFlavor> {
        self.endpoints
            .first()
            .and_then(|e| StoreFlavor::from_endpoint(e))
    }

    pub fn fetch_size_hint(&self) -> Option<u32> {
        u32::try_from(self.fetch_size).ok().filter(|v| *v > 0)
    }

    pub fn batching_enabled(&self) -> bool {
        self.batch_size > 0
    }
}

pub fn env_var_name(key: &str) -> String {
    let key = key.strip_prefix("gdpr.").unwrap_or(key);
    format!("GDPR_{}", key.replace('.', "_").to_ascii_uppercase())
}

fn parse_endpoints(raw: &str) -> Result<Vec<String>, DispatchError> {
    let endpoints = raw
        .split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(str::to_string)
        .collect::<Vec<_>>();
    if endpoints.is_empty() {
        return Err(DispatchError::Configuration(format!(
            "{DB_URL} must name at least one shard endpoint"
        )));
    }
    Ok(endpoints)
}

fn parse_int(raw: Option<String>, key: &str) -> Result<i64, DispatchError> {
    match raw {
        None => Ok(UNSET),
        Some(v) => v
            .parse::<i64>()
            .map_err(|_| DispatchError::Configuration(format!("{key} must be an integer, got {v:?}"))),
    }
}

fn parse_bool(raw: Option<String>, key: &str, default: bool) -> Result<bool, DispatchError> {
    match raw.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None => Ok(default),
        Some("true") | Some("1") | Some("yes") => Ok(true),
        Some("false") | Some("0") | Some("no") => Ok(false),
        Some(other) => Err(DispatchError::Configuration(format!(
            "{key} must be a boolean, got {other:?}"
        ))),
    }
}
