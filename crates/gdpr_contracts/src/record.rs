#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::common::{validate_ident, ContractViolation, Validate};

/// Field name that carries the owning device of a data record.
pub const DEVICE_ID_FIELD: &str = "device_id";

pub const RECORD_KEY_MAX_LEN: usize = 256;
pub const TABLE_NAME_MAX_LEN: usize = 128;
pub const FIELD_NAME_MAX_LEN: usize = 128;

/// Ordered field projection of a data record. Iteration order is the column order.
pub type FieldMap = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub i64);

impl DeviceId {
    /// Device id used for records inserted without a `device_id` field.
    pub const UNASSIGNED: DeviceId = DeviceId(0);

    pub fn parse(raw: &str) -> Result<Self, ContractViolation> {
        raw.trim()
            .parse::<i64>()
            .map(DeviceId)
            .map_err(|_| ContractViolation::InvalidValue {
                field: "device_id",
                reason: "must be an integer",
            })
    }

    /// Resolves the device of a field map; a missing field is `UNASSIGNED`.
    pub fn from_fields(fields: &FieldMap) -> Result<Self, ContractViolation> {
        match fields.get(DEVICE_ID_FIELD) {
            Some(raw) => Self::parse(raw),
            None => Ok(Self::UNASSIGNED),
        }
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKey(String);

impl RecordKey {
    pub fn new(key: impl Into<String>) -> Result<Self, ContractViolation> {
        let key = key.into();
        validate_ident("record_key", &key, RECORD_KEY_MAX_LEN)?;
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for RecordKey {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_ident("record_key", &self.0, RECORD_KEY_MAX_LEN)
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableName(String);

impl TableName {
    pub fn new(name: impl Into<String>) -> Result<Self, ContractViolation> {
        let name = name.into();
        validate_ident("table", &name, TABLE_NAME_MAX_LEN)?;
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ContractViolation::InvalidValue {
                field: "table",
                reason: "must be [A-Za-z0-9_]",
            });
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A user-data row on the data track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: RecordKey,
    pub fields: FieldMap,
    pub device_id: DeviceId,
    pub tombstone: bool,
}

impl Record {
    pub fn new(key: RecordKey, fields: FieldMap) -> Result<Self, ContractViolation> {
        let device_id = DeviceId::from_fields(&fields)?;
        let record = Self {
            key,
            fields,
            device_id,
            tombstone: false,
        };
        record.validate()?;
        Ok(record)
    }

    /// Copy of this record restricted to `fields`; `None` keeps every field.
    pub fn project(&self, fields: Option<&[String]>) -> Record {
        let Some(wanted) = fields else {
            return self.clone();
        };
        let projected = self
            .fields
            .iter()
            .filter(|(name, _)| wanted.iter().any(|w| w == *name))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Record {
            key: self.key.clone(),
            fields: projected,
            device_id: self.device_id,
            tombstone: self.tombstone,
        }
    }
}

impl Validate for Record {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.key.validate()?;
        for name in self.fields.keys() {
            validate_field_name(name)?;
        }
        Ok(())
    }
}

pub fn validate_field_name(name: &str) -> Result<(), ContractViolation> {
    validate_ident("field_name", name, FIELD_NAME_MAX_LEN)?;
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ContractViolation::InvalidValue {
            field: "field_name",
            reason: "must be [A-Za-z0-9_]",
        });
    }
    Ok(())
}
