#![forbid(unsafe_code)]

use gdpr_contracts::{ContractViolation, Status};
use gdpr_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    /// Fatal at init.
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("prepare failed on shard {shard_index}: {source}")]
    Prepare {
        shard_index: usize,
        #[source]
        source: StorageError,
    },
    #[error("execution failed on shard {shard_index}: {source}")]
    Execution {
        shard_index: usize,
        #[source]
        source: StorageError,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("batch flush rejected {failed} of {rows} rows")]
    BatchPartialFailure { rows: usize, failed: usize },
    #[error("unexpected state: {0}")]
    UnexpectedState(String),
    #[error("client is closed")]
    Closed,
    #[error(transparent)]
    Contract(#[from] ContractViolation),
}

impl DispatchError {
    pub fn status(&self) -> Status {
        match self {
            DispatchError::NotFound(_) => Status::NotFound,
            DispatchError::UnexpectedState(_) => Status::UnexpectedState,
            DispatchError::Configuration(_)
            | DispatchError::Prepare { .. }
            | DispatchError::Execution { .. }
            | DispatchError::BatchPartialFailure { .. }
            | DispatchError::Closed
            | DispatchError::Contract(_) => Status::Error,
        }
    }
}
