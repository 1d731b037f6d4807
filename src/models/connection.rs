//! Connection-related data models.
//!
//! This module defines the normalized per-host option set a pool is built from,
//! and the summaries reported for registered instances.

use crate::config::PoolOptions;
use serde::{Deserialize, Serialize};

/// Default PostgreSQL port used when a host entry omits one.
pub const DEFAULT_PORT: u16 = 5432;

/// One normalized connection option set: a single host of an instance's failover list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    /// Database name from the URL path, if any.
    pub database: Option<String>,
    /// Single-host URL handed to the driver. Contains sensitive data - never log
    #[serde(skip_serializing)]
    pub connection_string: String,
    /// Sizing of the pool built for this host.
    #[serde(default)]
    pub pool_options: PoolOptions,
}

impl ConnectOptions {
    /// Display label for logs, e.g. `db1.internal:5432`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Get a display-safe version of the connection string (credentials masked).
    pub fn masked_connection_string(&self) -> String {
        // Simple masking: replace password in URL
        if let Some(at_pos) = self.connection_string.find('@') {
            let scheme_end = self
                .connection_string
                .find("://")
                .map(|p| p + 3)
                .unwrap_or(0);
            if let Some(colon_pos) = self.connection_string[scheme_end..at_pos].rfind(':') {
                let colon_pos = scheme_end + colon_pos;
                let prefix = &self.connection_string[..colon_pos + 1];
                let suffix = &self.connection_string[at_pos..];
                return format!("{}****{}", prefix, suffix);
            }
        }
        self.connection_string.clone()
    }
}

/// Information about a registered instance (no secrets exposed).
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    pub name: String,
    /// Host addresses in failover order.
    pub hosts: Vec<String>,
    /// True while the instance holds live pools (between create and dispose).
    pub created: bool,
}
