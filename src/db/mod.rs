//! Database instance and transaction layer.
//!
//! This module provides:
//! - The driver boundary and its PostgreSQL binding
//! - Pool sets with host failover and client verification
//! - Ad-hoc and transactional query executors
//! - The context-local transaction store
//! - Named instances, the instance registry and the transaction orchestrator

pub mod context;
pub mod driver;
pub mod executor;
pub mod instance;
pub mod params;
pub mod pool_set;
pub mod postgres;
pub mod registry;
pub mod transaction;
pub mod types;

pub use context::{QueryOutcome, ScopeMap, TransactionScope, TransactionStore, inherit};
pub use driver::{Client, Driver, Pool, Running, StreamHandle, Submittable};
pub use executor::{BoundExecutor, Executor, QueryExecutor, UnboundExecutor};
pub use instance::Instance;
pub use pool_set::PoolSet;
pub use registry::InstanceRegistry;
pub use transaction::{TransactionContext, Transactional, orchestrate, with_transaction};
