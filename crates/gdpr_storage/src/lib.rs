#![forbid(unsafe_code)]

pub mod memory;
pub mod policy_service;
pub mod shard;

pub use memory::{DeleteMode, MemoryShard, MemoryStore, MemoryStoreStats};
pub use policy_service::{PolicyServiceConfig, PolicyServiceConnection, ServiceCredentials};
pub use shard::{
    Execution, PrepareHints, ShardConnection, StatementHandle, StorageError, StoreFlavor,
    EXECUTE_FAILED, ROW_AFFECTED, SUCCESS_NO_INFO,
};
