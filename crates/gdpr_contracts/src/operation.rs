#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::{ContractViolation, Validate};
use crate::policy::PolicyAttribute;
use crate::record::{validate_field_name, FieldMap, TableName};

/// Policy-row columns in bind order for `InsertPolicy`.
pub const POLICY_INSERT_COLUMNS: [&str; 10] = [
    "id",
    "device_id",
    "querier",
    "purpose",
    "ttl",
    "origin",
    "objection",
    "sharing",
    "enforcement_action",
    "inserted_at",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    Read,
    Insert,
    Update,
    Delete,
    Scan,
}

impl Opcode {
    pub fn as_str(self) -> &'static str {
        match self {
            Opcode::Read => "READ",
            Opcode::Insert => "INSERT",
            Opcode::Update => "UPDATE",
            Opcode::Delete => "DELETE",
            Opcode::Scan => "SCAN",
        }
    }
}

/// Stable digest of the field names an operation binds, in column order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldSignature(String);

impl FieldSignature {
    pub fn empty() -> Self {
        Self(String::new())
    }

    pub fn from_columns<S: AsRef<str>>(columns: &[S]) -> Self {
        let joined = columns
            .iter()
            .map(|c| c.as_ref())
            .collect::<Vec<_>>()
            .join(",");
        Self(joined)
    }

    fn with_suffix(mut self, suffix: &str) -> Self {
        if !self.0.is_empty() {
            self.0.push('|');
        }
        self.0.push_str(suffix);
        self
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Canonical shape of a prepared operation. Equal keys share one cached operation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationKey {
    pub opcode: Opcode,
    pub table: TableName,
    pub field_count: usize,
    pub field_signature: FieldSignature,
    pub shard_index: usize,
}

impl OperationKey {
    pub fn for_plan(plan: &StatementPlan, shard_index: usize) -> Self {
        Self {
            opcode: plan.opcode(),
            table: plan.table().clone(),
            field_count: plan.field_count(),
            field_signature: plan.field_signature(),
            shard_index,
        }
    }
}

impl std::fmt::Display for OperationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:[{}]@{}",
            self.opcode.as_str(),
            self.table,
            self.field_count,
            self.field_signature.as_str(),
            self.shard_index
        )
    }
}

/// Bound parameter or returned scalar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnValue {
    Int(i64),
    Text(String),
}

impl ColumnValue {
    pub fn text(v: impl Into<String>) -> Self {
        ColumnValue::Text(v.into())
    }

    pub fn as_text(&self) -> String {
        match self {
            ColumnValue::Int(v) => v.to_string(),
            ColumnValue::Text(v) => v.clone(),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ColumnValue::Int(v) => Some(*v),
            ColumnValue::Text(v) => v.trim().parse().ok(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyFilter {
    /// Binds `(id, device_id)`.
    ByDevice,
    /// Binds `(querier, value)` against the given attribute.
    ByAttribute(PolicyAttribute),
}

impl PolicyFilter {
    fn signature(self) -> String {
        match self {
            PolicyFilter::ByDevice => "by:id,device_id".to_string(),
            PolicyFilter::ByAttribute(attr) => format!("by:querier,{}", attr.column()),
        }
    }

    fn where_clause(self, first_param: usize) -> String {
        match self {
            PolicyFilter::ByDevice => format!(
                "id = ${} AND device_id = ${}",
                first_param,
                first_param + 1
            ),
            PolicyFilter::ByAttribute(attr) => format!(
                "querier = ${} AND {} = ${}",
                first_param,
                attr.column(),
                first_param + 1
            ),
        }
    }
}

/// What a prepared operation does. Values are always bound positionally;
/// the rendered text never contains caller data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "plan", rename_all = "snake_case")]
pub enum StatementPlan {
    /// `[key]`
    ReadRecord { table: TableName },
    /// `[key, columns...]`
    InsertRecord {
        table: TableName,
        columns: Vec<String>,
    },
    /// `[columns..., key]` plus `device_id` when `match_device`.
    UpdateRecord {
        table: TableName,
        columns: Vec<String>,
        match_device: bool,
    },
    /// `[key]`
    TombstoneRecord { table: TableName },
    /// `[start_key, count]`
    ScanRecords { table: TableName },
    /// Filter params.
    ReadPolicy {
        table: TableName,
        filter: PolicyFilter,
    },
    /// `POLICY_INSERT_COLUMNS` order.
    InsertPolicy { table: TableName },
    /// `[value]` then filter params.
    UpdatePolicy {
        table: TableName,
        attribute: PolicyAttribute,
        filter: PolicyFilter,
    },
    /// Filter params.
    TombstonePolicy {
        table: TableName,
        filter: PolicyFilter,
    },
    /// `[now_unix_seconds]`
    CountLivePolicies { table: TableName },
}

impl StatementPlan {
    pub fn table(&self) -> &TableName {
        match self {
            StatementPlan::ReadRecord { table }
            | StatementPlan::InsertRecord { table, .. }
            | StatementPlan::UpdateRecord { table, .. }
            | StatementPlan::TombstoneRecord { table }
            | StatementPlan::ScanRecords { table }
            | StatementPlan::ReadPolicy { table, .. }
            | StatementPlan::InsertPolicy { table }
            | StatementPlan::UpdatePolicy { table, .. }
            | StatementPlan::TombstonePolicy { table, .. }
            | StatementPlan::CountLivePolicies { table } => table,
        }
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            StatementPlan::ReadRecord { .. }
            | StatementPlan::ReadPolicy { .. }
            | StatementPlan::CountLivePolicies { .. } => Opcode::Read,
            StatementPlan::InsertRecord { .. } | StatementPlan::InsertPolicy { .. } => {
                Opcode::Insert
            }
            StatementPlan::UpdateRecord { .. } | StatementPlan::UpdatePolicy { .. } => {
                Opcode::Update
            }
            StatementPlan::TombstoneRecord { .. } | StatementPlan::TombstonePolicy { .. } => {
                Opcode::Delete
            }
            StatementPlan::ScanRecords { .. } => Opcode::Scan,
        }
    }

    pub fn field_count(&self) -> usize {
        match self {
            StatementPlan::InsertRecord { columns, .. }
            | StatementPlan::UpdateRecord { columns, .. } => columns.len(),
            StatementPlan::InsertPolicy { .. } => POLICY_INSERT_COLUMNS.len(),
            StatementPlan::CountLivePolicies { .. } => 0,
            _ => 1,
        }
    }

    pub fn field_signature(&self) -> FieldSignature {
        match self {
            StatementPlan::ReadRecord { .. }
            | StatementPlan::TombstoneRecord { .. }
            | StatementPlan::ScanRecords { .. } => FieldSignature::empty(),
            StatementPlan::InsertRecord { columns, .. } => {
                FieldSignature::from_columns(columns.as_slice())
            }
            StatementPlan::UpdateRecord {
                columns,
                match_device,
                ..
            } => {
                let sig = FieldSignature::from_columns(columns.as_slice());
                if *match_device {
                    sig.with_suffix("by:key,device_id")
                } else {
                    sig.with_suffix("by:key")
                }
            }
            StatementPlan::ReadPolicy { filter, .. }
            | StatementPlan::TombstonePolicy { filter, .. } => {
                FieldSignature::empty().with_suffix(&filter.signature())
            }
            StatementPlan::InsertPolicy { .. } => {
                FieldSignature::from_columns(&POLICY_INSERT_COLUMNS[..])
            }
            StatementPlan::UpdatePolicy {
                attribute, filter, ..
            } => FieldSignature::from_columns(&[attribute.column()][..])
                .with_suffix(&filter.signature()),
            StatementPlan::CountLivePolicies { .. } => {
                FieldSignature::empty().with_suffix("count:live")
            }
        }
    }

    /// Number of positional parameters a single execution binds.
    pub fn param_count(&self) -> usize {
        match self {
            StatementPlan::ReadRecord { .. }
            | StatementPlan::TombstoneRecord { .. }
            | StatementPlan::CountLivePolicies { .. } => 1,
            StatementPlan::InsertRecord { columns, .. } => columns.len() + 1,
            StatementPlan::UpdateRecord {
                columns,
                match_device,
                ..
            } => columns.len() + 1 + usize::from(*match_device),
            StatementPlan::ScanRecords { .. }
            | StatementPlan::ReadPolicy { .. }
            | StatementPlan::TombstonePolicy { .. } => 2,
            StatementPlan::InsertPolicy { .. } => POLICY_INSERT_COLUMNS.len(),
            StatementPlan::UpdatePolicy { .. } => 3,
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self.opcode(), Opcode::Read | Opcode::Scan)
    }

    /// Parameterized operation text, used for preparation and audit.
    pub fn render(&self) -> String {
        match self {
            StatementPlan::ReadRecord { table } => {
                format!("SELECT * FROM {table} WHERE key = $1 AND tomb = 0")
            }
            StatementPlan::InsertRecord { table, columns } => {
                let mut names = vec!["key".to_string()];
                names.extend(columns.iter().cloned());
                format!(
                    "INSERT INTO {table} ({}) VALUES ({})",
                    names.join(", "),
                    placeholders(1, names.len())
                )
            }
            StatementPlan::UpdateRecord {
                table,
                columns,
                match_device,
            } => {
                let sets = columns
                    .iter()
                    .enumerate()
                    .map(|(i, c)| format!("{c} = ${}", i + 1))
                    .collect::<Vec<_>>()
                    .join(", ");
                let key_param = columns.len() + 1;
                let device_clause = if *match_device {
                    format!(" AND device_id = ${}", key_param + 1)
                } else {
                    String::new()
                };
                format!(
                    "UPDATE {table} SET {sets} WHERE key = ${key_param}{device_clause} AND tomb = 0"
                )
            }
            StatementPlan::TombstoneRecord { table } => {
                format!("UPDATE {table} SET tomb = 1 WHERE key = $1")
            }
            StatementPlan::ScanRecords { table } => format!(
                "SELECT * FROM {table} WHERE key >= $1 AND tomb = 0 ORDER BY key LIMIT $2"
            ),
            StatementPlan::ReadPolicy { table, filter } => format!(
                "SELECT * FROM {table} WHERE {} AND tomb = 0",
                filter.where_clause(1)
            ),
            StatementPlan::InsertPolicy { table } => format!(
                "INSERT INTO {table} ({}, tomb) VALUES ({}, 0)",
                POLICY_INSERT_COLUMNS.join(", "),
                placeholders(1, POLICY_INSERT_COLUMNS.len())
            ),
            StatementPlan::UpdatePolicy {
                table,
                attribute,
                filter,
            } => format!(
                "UPDATE {table} SET {} = $1 WHERE {} AND tomb = 0",
                attribute.column(),
                filter.where_clause(2)
            ),
            StatementPlan::TombstonePolicy { table, filter } => format!(
                "UPDATE {table} SET tomb = 1 WHERE {}",
                filter.where_clause(1)
            ),
            StatementPlan::CountLivePolicies { table } => {
                format!("SELECT COUNT(*) FROM {table} WHERE tomb = 0 AND ttl > $1")
            }
        }
    }
}

impl Validate for StatementPlan {
    fn validate(&self) -> Result<(), ContractViolation> {
        match self {
            StatementPlan::InsertRecord { columns, .. }
            | StatementPlan::UpdateRecord { columns, .. } => {
                if columns.is_empty() {
                    return Err(ContractViolation::InvalidValue {
                        field: "columns",
                        reason: "must not be empty",
                    });
                }
                for c in columns {
                    validate_field_name(c)?;
                    if c == "key" || c == "tomb" {
                        return Err(ContractViolation::InvalidValue {
                            field: "columns",
                            reason: "reserved column name",
                        });
                    }
                }
                let mut sorted = columns.clone();
                sorted.sort();
                sorted.dedup();
                if sorted.len() != columns.len() {
                    return Err(ContractViolation::InvalidValue {
                        field: "columns",
                        reason: "duplicate column name",
                    });
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn placeholders(first: usize, count: usize) -> String {
    (first..first + count)
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Field map split into stable column order and the matching value list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedFields {
    pub columns: Vec<String>,
    pub values: Vec<String>,
}

impl OrderedFields {
    pub fn from_map(fields: &FieldMap) -> Self {
        let (columns, values): (Vec<String>, Vec<String>) = fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .unzip();
        Self { columns, values }
    }

    /// Comma-joined column list, the shape component of the operation key.
    pub fn field_keys(&self) -> String {
        self.columns.join(",")
    }
}
