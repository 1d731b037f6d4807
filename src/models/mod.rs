//! Data models shared by the instance and transaction layers.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;

// Re-export commonly used types
pub use connection::{ConnectOptions, DEFAULT_PORT, InstanceSummary};
pub use query::{ColumnMetadata, Query, QueryParam, QueryResult};
