//! Named database instances with host failover and cross-instance transactions.
//!
//! Each instance is backed by one pool per redundant host. Queries run ad-hoc
//! on a freshly acquired, health-checked client, or join the transaction that
//! is active for the instance in the current call chain. A transaction can
//! span several instances and is committed or rolled back on all of them.

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::{Config, InstanceConfig};
pub use db::{Instance, InstanceRegistry, TransactionContext, with_transaction};
pub use error::{DbError, DbResult};
