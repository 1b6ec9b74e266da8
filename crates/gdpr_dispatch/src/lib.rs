#![forbid(unsafe_code)]

pub mod audit;
pub mod batch;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod router;
pub mod shard_pool;
pub mod statement_cache;
pub mod ttl_monitor;

pub use audit::{AuditEntry, AuditHttpConfig, AuditSink, AuditSinkRuntime};
pub use batch::{BatchCommitController, BatchDecision, FlushReport};
pub use config::{DispatchConfig, PolicyDefaults, TtlPolicy};
pub use dispatcher::{DispatchOutcome, OperationDispatcher, SplitOutcome};
pub use error::DispatchError;
pub use router::ShardRouter;
pub use shard_pool::{DefaultConnector, Shard, ShardConnector, ShardPool};
pub use statement_cache::{PreparedOperation, StatementCache};
pub use ttl_monitor::{ConvergenceOutcome, HttpLiveCountOracle, LiveCountOracle, TtlExpiryMonitor};
