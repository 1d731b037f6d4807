//! Error types for database instances and transactions.
//!
//! This module defines the single domain error used throughout the crate. Each
//! variant belongs to one class of the failure taxonomy (see [`ErrorKind`]) and
//! carries the original cause so callers always get a full cause chain.

use std::sync::Arc;
use thiserror::Error;

/// Underlying driver error kept for diagnostics.
pub type Cause = Arc<dyn std::error::Error + Send + Sync>;

/// Taxonomy class of a [`DbError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Host unreachable; the next redundant host may be tried.
    Connectivity,
    /// Authentication, protocol or TLS failure; never retried across hosts.
    NonConnectivity,
    /// Execution failure on an otherwise healthy client.
    Query,
    /// Clients could not be acquired before a transaction began.
    Initialization,
    /// Invalid options, unknown instance names, misuse of the transaction wrapper.
    Configuration,
    /// Failure while finishing a transaction.
    Transaction,
    Internal,
}

#[derive(Error, Debug, Clone)]
pub enum DbError {
    #[error("Connectivity error: {message}")]
    Connectivity {
        message: String,
        /// Machine-readable code, e.g. "ConnectionRefused" or a SQLSTATE
        code: Option<String>,
        #[source]
        cause: Option<Cause>,
    },

    #[error("Connection rejected: {message}")]
    NonConnectivity {
        message: String,
        code: Option<String>,
        #[source]
        cause: Option<Cause>,
    },

    #[error("Query failed: {message}")]
    Query {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        #[source]
        cause: Option<Cause>,
    },

    #[error("Could not initialize transaction on instance '{instance}'")]
    Initialization {
        instance: String,
        #[source]
        cause: Box<DbError>,
    },

    #[error("No client available for instance '{instance}' after {attempts} attempt(s)")]
    NoClientAvailable {
        instance: String,
        attempts: usize,
        #[source]
        cause: Option<Box<DbError>>,
    },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    Transaction {
        message: String,
        transaction_id: String,
        #[source]
        cause: Option<Box<DbError>>,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a failover-eligible connectivity error.
    pub fn connectivity(message: impl Into<String>, code: Option<String>) -> Self {
        Self::Connectivity {
            message: message.into(),
            code,
            cause: None,
        }
    }

    /// Create an error for a host that was reached but refused the client.
    pub fn non_connectivity(message: impl Into<String>, code: Option<String>) -> Self {
        Self::NonConnectivity {
            message: message.into(),
            code,
            cause: None,
        }
    }

    /// Create a query error with optional SQL state.
    pub fn query(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql_state,
            cause: None,
        }
    }

    /// Wrap an acquisition failure that prevented a transaction from starting.
    pub fn initialization(instance: impl Into<String>, cause: DbError) -> Self {
        Self::Initialization {
            instance: instance.into(),
            cause: Box::new(cause),
        }
    }

    /// Create the error raised when every pool of an instance was exhausted.
    pub fn no_client_available(
        instance: impl Into<String>,
        attempts: usize,
        cause: Option<DbError>,
    ) -> Self {
        Self::NoClientAvailable {
            instance: instance.into(),
            attempts,
            cause: cause.map(Box::new),
        }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a transaction error.
    pub fn transaction(
        message: impl Into<String>,
        transaction_id: impl Into<String>,
        cause: Option<DbError>,
    ) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.into(),
            cause: cause.map(Box::new),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Attach the driver error this one was classified from.
    pub fn with_cause(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        let source: Cause = Arc::new(source);
        match &mut self {
            Self::Connectivity { cause, .. }
            | Self::NonConnectivity { cause, .. }
            | Self::Query { cause, .. } => *cause = Some(source),
            _ => {}
        }
        self
    }

    /// Taxonomy class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connectivity { .. } | Self::NoClientAvailable { .. } => ErrorKind::Connectivity,
            Self::NonConnectivity { .. } => ErrorKind::NonConnectivity,
            Self::Query { .. } => ErrorKind::Query,
            Self::Initialization { .. } => ErrorKind::Initialization,
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Transaction { .. } => ErrorKind::Transaction,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Whether the next redundant host should be tried after this error.
    pub fn is_failover_eligible(&self) -> bool {
        matches!(self, Self::Connectivity { .. })
    }

    /// Machine-readable code of the underlying failure, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Connectivity { code, .. } | Self::NonConnectivity { code, .. } => code.as_deref(),
            Self::Query { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }

    /// Get a suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connectivity { .. } | Self::NoClientAvailable { .. } => {
                Some("Check that the database hosts are running and reachable")
            }
            Self::NonConnectivity { .. } => {
                Some("Verify the credentials, database name and TLS settings")
            }
            Self::Query { .. } => Some("Check the SQL syntax and referenced objects"),
            Self::Initialization { cause, .. } => cause.suggestion(),
            _ => None,
        }
    }

    /// Classify a sqlx error raised while opening or checking out a connection.
    pub fn from_connect_error(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Configuration(msg) => {
                Self::configuration(format!("Invalid connection options: {}", msg))
            }
            sqlx::Error::Io(io_err) => {
                let code = Some(format!("{:?}", io_err.kind()));
                if is_unreachable(io_err) {
                    Self::connectivity(format!("I/O error: {}", io_err), code).with_cause(err)
                } else {
                    Self::non_connectivity(format!("I/O error: {}", io_err), code).with_cause(err)
                }
            }
            sqlx::Error::PoolTimedOut => Self::connectivity(
                "Timed out waiting for a connection",
                Some("PoolTimedOut".to_string()),
            )
            .with_cause(err),
            sqlx::Error::PoolClosed => Self::non_connectivity(
                "Connection pool is closed",
                Some("PoolClosed".to_string()),
            )
            .with_cause(err),
            sqlx::Error::Tls(tls_err) => {
                Self::non_connectivity(format!("TLS error: {}", tls_err), None).with_cause(err)
            }
            sqlx::Error::Protocol(msg) => {
                Self::non_connectivity(format!("Protocol error: {}", msg), None).with_cause(err)
            }
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                let message = db_err.message().to_string();
                if code.as_deref().is_some_and(is_connection_sql_state) {
                    Self::connectivity(message, code).with_cause(err)
                } else {
                    Self::non_connectivity(message, code).with_cause(err)
                }
            }
            _ => Self::non_connectivity(format!("Connect failed: {}", err), None).with_cause(err),
        }
    }

    /// Classify a sqlx error raised while executing a statement on a live client.
    pub fn from_query_error(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                if code.as_deref().is_some_and(is_connection_sql_state) {
                    return Self::connectivity(db_err.message(), code).with_cause(err);
                }
                Self::query(db_err.message(), code).with_cause(err)
            }
            sqlx::Error::Io(io_err) => Self::connectivity(
                format!("Connection lost: {}", io_err),
                Some(format!("{:?}", io_err.kind())),
            )
            .with_cause(err),
            sqlx::Error::RowNotFound => Self::query("No rows returned", None).with_cause(err),
            sqlx::Error::ColumnNotFound(col) => {
                Self::query(format!("Column not found: {}", col), None).with_cause(err)
            }
            sqlx::Error::ColumnDecode { index, source } => Self::query(
                format!("Failed to decode column {}: {}", index, source),
                None,
            )
            .with_cause(err),
            sqlx::Error::Decode(source) => {
                Self::query(format!("Decode error: {}", source), None).with_cause(err)
            }
            sqlx::Error::Protocol(msg) => {
                Self::non_connectivity(format!("Protocol error: {}", msg), None).with_cause(err)
            }
            _ => Self::query(format!("Query failed: {}", err), None).with_cause(err),
        }
    }
}

/// I/O failures meaning the target host could not be reached at all.
fn is_unreachable(err: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;

    match err.kind() {
        ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected | TimedOut
        | AddrNotAvailable | HostUnreachable | NetworkUnreachable | UnexpectedEof => true,
        // Name resolution failures surface as uncategorized errors
        _ => {
            let message = err.to_string().to_lowercase();
            message.contains("lookup") || message.contains("resolve")
        }
    }
}

/// SQLSTATE class 08 (connection exception) and 57P03 (cannot connect now).
fn is_connection_sql_state(code: &str) -> bool {
    code.starts_with("08") || code == "57P03"
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
