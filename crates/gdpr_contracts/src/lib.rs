#![forbid(unsafe_code)]

pub mod common;
pub mod operation;
pub mod policy;
pub mod record;
pub mod status;

pub use common::{ContractViolation, UnixSeconds, UnixTimeMs, Validate};
pub use operation::{
    ColumnValue, FieldSignature, Opcode, OperationKey, OrderedFields, PolicyFilter, StatementPlan,
    POLICY_INSERT_COLUMNS,
};
pub use policy::{
    PolicyAttribute, PolicyDraft, PolicyMetadata, PolicySelector, ENFORCEMENT_ALLOW,
};
pub use record::{DeviceId, FieldMap, Record, RecordKey, TableName, DEVICE_ID_FIELD};
pub use status::Status;
