#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::{validate_ident, ContractViolation, UnixSeconds, UnixTimeMs, Validate};
use crate::record::{DeviceId, RecordKey};

pub const ENFORCEMENT_ALLOW: &str = "allow";
pub const POLICY_VALUE_MAX_LEN: usize = 256;

/// Attribute columns of a policy row that conditions and updates may address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAttribute {
    Querier,
    Purpose,
    Origin,
    Objection,
    Sharing,
    Ttl,
    DeviceId,
    EnforcementAction,
}

impl PolicyAttribute {
    /// Workload abbreviation table. Unknown abbreviations fall back to `Purpose`.
    pub fn from_abbreviation(abbrev: &str) -> Self {
        match abbrev.trim() {
            "SRC" => PolicyAttribute::Origin,
            "OBJ" => PolicyAttribute::Objection,
            "PUR" => PolicyAttribute::Purpose,
            "SHR" => PolicyAttribute::Sharing,
            "TTL" => PolicyAttribute::Ttl,
            "USR" => PolicyAttribute::DeviceId,
            "DEC" => PolicyAttribute::EnforcementAction,
            _ => PolicyAttribute::Purpose,
        }
    }

    pub fn column(self) -> &'static str {
        match self {
            PolicyAttribute::Querier => "querier",
            PolicyAttribute::Purpose => "purpose",
            PolicyAttribute::Origin => "origin",
            PolicyAttribute::Objection => "objection",
            PolicyAttribute::Sharing => "sharing",
            PolicyAttribute::Ttl => "ttl",
            PolicyAttribute::DeviceId => "device_id",
            PolicyAttribute::EnforcementAction => "enforcement_action",
        }
    }
}

/// Companion policy row governing one data record on the same device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyMetadata {
    pub id: RecordKey,
    pub querier: String,
    pub purpose: String,
    pub ttl: UnixSeconds,
    pub origin: String,
    pub objection: String,
    pub sharing: String,
    pub enforcement_action: String,
    pub inserted_at: UnixTimeMs,
    pub device_id: DeviceId,
    pub tombstone: bool,
}

impl PolicyMetadata {
    pub fn is_allow(&self) -> bool {
        self.enforcement_action == ENFORCEMENT_ALLOW
    }

    pub fn is_live_at(&self, now: UnixSeconds) -> bool {
        !self.tombstone && self.ttl > now
    }

    pub fn attribute_value(&self, attribute: PolicyAttribute) -> String {
        match attribute {
            PolicyAttribute::Querier => self.querier.clone(),
            PolicyAttribute::Purpose => self.purpose.clone(),
            PolicyAttribute::Origin => self.origin.clone(),
            PolicyAttribute::Objection => self.objection.clone(),
            PolicyAttribute::Sharing => self.sharing.clone(),
            PolicyAttribute::Ttl => self.ttl.0.to_string(),
            PolicyAttribute::DeviceId => self.device_id.to_string(),
            PolicyAttribute::EnforcementAction => self.enforcement_action.clone(),
        }
    }

    /// Sets one attribute from its textual value.
    pub fn apply(&mut self, attribute: PolicyAttribute, value: &str) -> Result<(), ContractViolation> {
        match attribute {
            PolicyAttribute::Ttl => {
                self.ttl = value.trim().parse::<u64>().map(UnixSeconds).map_err(|_| {
                    ContractViolation::InvalidValue {
                        field: "ttl",
                        reason: "must be an absolute unix timestamp in seconds",
                    }
                })?;
            }
            PolicyAttribute::DeviceId => self.device_id = DeviceId::parse(value)?,
            other => {
                validate_policy_value(other.column(), value)?;
                let slot = match other {
                    PolicyAttribute::Querier => &mut self.querier,
                    PolicyAttribute::Purpose => &mut self.purpose,
                    PolicyAttribute::Origin => &mut self.origin,
                    PolicyAttribute::Objection => &mut self.objection,
                    PolicyAttribute::Sharing => &mut self.sharing,
                    _ => &mut self.enforcement_action,
                };
                *slot = value.to_string();
            }
        }
        Ok(())
    }
}

impl Validate for PolicyMetadata {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.id.validate()?;
        validate_policy_value("querier", &self.querier)?;
        validate_policy_value("purpose", &self.purpose)?;
        validate_policy_value("origin", &self.origin)?;
        validate_policy_value("objection", &self.objection)?;
        validate_policy_value("sharing", &self.sharing)?;
        validate_ident(
            "enforcement_action",
            &self.enforcement_action,
            POLICY_VALUE_MAX_LEN,
        )?;
        Ok(())
    }
}

fn validate_policy_value(field: &'static str, value: &str) -> Result<(), ContractViolation> {
    if value.len() > POLICY_VALUE_MAX_LEN {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "exceeds maximum length",
        });
    }
    if value.chars().any(|c| c.is_control()) {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not contain control characters",
        });
    }
    Ok(())
}

/// Caller-supplied policy attributes for a new policy row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDraft {
    pub querier: String,
    pub purpose: String,
    pub origin: String,
    pub objection: String,
    pub sharing: String,
    pub enforcement_action: String,
    pub ttl: UnixSeconds,
}

impl PolicyDraft {
    pub fn into_metadata(
        self,
        id: RecordKey,
        device_id: DeviceId,
        inserted_at: UnixTimeMs,
    ) -> Result<PolicyMetadata, ContractViolation> {
        let row = PolicyMetadata {
            id,
            querier: self.querier,
            purpose: self.purpose,
            ttl: self.ttl,
            origin: self.origin,
            objection: self.objection,
            sharing: self.sharing,
            enforcement_action: self.enforcement_action,
            inserted_at,
            device_id,
            tombstone: false,
        };
        row.validate()?;
        Ok(row)
    }
}

/// How a policy operation resolves its target rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicySelector {
    /// Data-subject access: exactly the row joined on `(id, device_id)`.
    Device { id: RecordKey, device_id: DeviceId },
    /// Processor access: every live row of `querier` whose `attribute` equals `value`.
    Attribute {
        querier: String,
        attribute: PolicyAttribute,
        value: String,
    },
}

impl PolicySelector {
    /// Processor condition addressed by workload abbreviation, resolved through
    /// the same table as updated fields.
    pub fn from_condition(
        querier: impl Into<String>,
        abbreviation: &str,
        value: impl Into<String>,
    ) -> Self {
        PolicySelector::Attribute {
            querier: querier.into(),
            attribute: PolicyAttribute::from_abbreviation(abbreviation),
            value: value.into(),
        }
    }

    pub fn matches(&self, row: &PolicyMetadata) -> bool {
        match self {
            PolicySelector::Device { id, device_id } => {
                &row.id == id && row.device_id == *device_id
            }
            PolicySelector::Attribute {
                querier,
                attribute,
                value,
            } => &row.querier == querier && &row.attribute_value(*attribute) == value,
        }
    }

    /// Audit actor for operations resolved through this selector.
    pub fn actor(&self) -> String {
        match self {
            PolicySelector::Device { device_id, .. } => device_id.to_string(),
            PolicySelector::Attribute { querier, .. } => querier.clone(),
        }
    }
}
