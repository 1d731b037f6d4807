//! PostgreSQL binding of the driver boundary, built on sqlx.
//!
//! Every host of an instance gets its own lazily connecting sqlx pool. Clients
//! are checked-out pool connections; releasing one with an error closes the
//! connection instead of returning it to the pool. Bulk import and export run
//! as streaming operations ([`CopyIn`], [`CopyOut`]).

use crate::db::driver::{Client, Driver, Pool, Running, Submittable};
use crate::db::params;
use crate::db::types::{column_metadata, row_to_json};
use crate::error::{DbError, DbResult, ErrorKind};
use crate::models::{ConnectOptions, Query, QueryResult};
use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPoolOptions, PgRow};
use sqlx::{Either, Execute, Executor, Postgres};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// Capacity of each pool's connectivity error event channel.
const ERROR_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, Default)]
pub struct PgDriver;

impl PgDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Driver for PgDriver {
    type Client = PgClient;
    type Pool = PgPool;

    fn create_pool(&self, options: &ConnectOptions) -> DbResult<PgPool> {
        let connect_options =
            PgConnectOptions::from_str(&options.connection_string).map_err(|e| {
                DbError::configuration(format!(
                    "Invalid PostgreSQL connection string for {}: {}",
                    options.address(),
                    e
                ))
            })?;

        let pool_opts = &options.pool_options;
        // Clients are verified by the pool set, so sqlx's own ping is disabled
        let pool = PgPoolOptions::new()
            .min_connections(pool_opts.min_connections_or_default())
            .max_connections(pool_opts.max_connections_or_default())
            .acquire_timeout(Duration::from_secs(pool_opts.acquire_timeout_or_default()))
            .idle_timeout(Some(Duration::from_secs(
                pool_opts.idle_timeout_or_default(),
            )))
            .test_before_acquire(false)
            .connect_lazy_with(connect_options);

        let (events, _) = broadcast::channel(ERROR_EVENT_CAPACITY);
        Ok(PgPool {
            pool,
            host: options.address(),
            events,
        })
    }
}

/// One host's connection pool.
#[derive(Debug)]
pub struct PgPool {
    pool: sqlx::PgPool,
    host: String,
    events: broadcast::Sender<DbError>,
}

impl PgPool {
    pub fn host(&self) -> &str {
        &self.host
    }
}

#[async_trait]
impl Pool for PgPool {
    type Client = PgClient;

    async fn connect(&self) -> DbResult<PgClient> {
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(DbError::from_connect_error)?;
        Ok(PgClient {
            conn,
            host: self.host.clone(),
            events: self.events.clone(),
        })
    }

    async fn end(&self) {
        self.pool.close().await;
    }

    /// Emits connectivity errors observed on this pool's connections.
    fn subscribe_errors(&self) -> Option<broadcast::Receiver<DbError>> {
        Some(self.events.subscribe())
    }
}

/// A connection checked out of a [`PgPool`].
#[derive(Debug)]
pub struct PgClient {
    conn: PoolConnection<Postgres>,
    host: String,
    events: broadcast::Sender<DbError>,
}

impl PgClient {
    pub fn host(&self) -> &str {
        &self.host
    }
}

#[async_trait]
impl Client for PgClient {
    /// Statements without parameters use the simple query protocol, so
    /// transaction control and multi-statement scripts work as written.
    /// Rows and affected-row counts are collected from the same round trip.
    async fn query(&mut self, query: &Query) -> DbResult<QueryResult> {
        let start = Instant::now();
        let conn = &mut *self.conn;

        let (rows, rows_affected) = if query.params.is_empty() {
            collect(conn, query.sql.as_str()).await
        } else {
            collect(conn, params::prepare(&query.sql, &query.params)).await
        }
        .map_err(DbError::from_query_error)?;

        Ok(rows_to_result(rows, rows_affected, start))
    }

    async fn release(self, error: Option<&DbError>) {
        let Some(error) = error else {
            debug!(host = %self.host, "Client returned to pool");
            return;
        };

        if error.kind() == ErrorKind::Connectivity {
            // No subscribers is fine
            let _ = self.events.send(error.clone());
        }
        let host = self.host;
        if let Err(close_err) = self.conn.close().await {
            warn!(host = %host, error = %close_err, "Failed to close client");
        } else {
            debug!(host = %host, "Client closed after error");
        }
    }
}

/// Drain every result of a statement: rows and the completion counts.
async fn collect<'q, E>(
    conn: &mut PgConnection,
    query: E,
) -> Result<(Vec<PgRow>, u64), sqlx::Error>
where
    E: 'q + Execute<'q, Postgres>,
{
    let mut rows = Vec::new();
    let mut rows_affected = 0;
    let mut results = conn.fetch_many(query);
    while let Some(step) = results.try_next().await? {
        match step {
            Either::Left(done) => rows_affected += done.rows_affected(),
            Either::Right(row) => rows.push(row),
        }
    }
    Ok((rows, rows_affected))
}

fn rows_to_result(rows: Vec<PgRow>, rows_affected: u64, start: Instant) -> QueryResult {
    let execution_time_ms = start.elapsed().as_millis() as u64;
    let Some(first) = rows.first() else {
        return QueryResult::write_result(rows_affected, execution_time_ms);
    };

    QueryResult {
        columns: column_metadata(first),
        rows: rows.iter().map(row_to_json).collect(),
        rows_affected: Some(rows_affected),
        execution_time_ms,
    }
}

fn require_copy(statement: &str, direction: &str) -> DbResult<()> {
    let normalized = statement.trim().to_ascii_uppercase();
    if normalized.starts_with("COPY") && normalized.contains(direction) {
        Ok(())
    } else {
        Err(DbError::query(
            format!("Expected a COPY ... {} statement", direction),
            None,
        ))
    }
}

enum CopySource {
    Chunks(Vec<Vec<u8>>),
    Channel(mpsc::Receiver<Vec<u8>>),
}

/// Bulk import with `COPY ... FROM STDIN`. Resolves to the number of rows copied.
pub struct CopyIn {
    statement: String,
    source: CopySource,
}

impl CopyIn {
    /// Import pre-encoded chunks. An empty list finishes without contacting the server.
    pub fn from_chunks(statement: impl Into<String>, chunks: Vec<Vec<u8>>) -> Self {
        Self {
            statement: statement.into(),
            source: CopySource::Chunks(chunks),
        }
    }

    /// Import chunks as they arrive; the copy finishes when every sender is dropped.
    pub fn from_channel(statement: impl Into<String>, chunks: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            statement: statement.into(),
            source: CopySource::Channel(chunks),
        }
    }
}

impl Submittable<PgClient> for CopyIn {
    fn submit<'c>(self, client: &'c mut PgClient) -> DbResult<Option<Running<'c>>> {
        require_copy(&self.statement, "FROM STDIN")?;
        if matches!(&self.source, CopySource::Chunks(chunks) if chunks.is_empty()) {
            return Ok(None);
        }

        Ok(Some(Box::pin(async move {
            let mut copy = client
                .conn
                .copy_in_raw(&self.statement)
                .await
                .map_err(DbError::from_query_error)?;

            match self.source {
                CopySource::Chunks(chunks) => {
                    for chunk in chunks {
                        copy.send(chunk).await.map_err(DbError::from_query_error)?;
                    }
                }
                CopySource::Channel(mut chunks) => {
                    while let Some(chunk) = chunks.recv().await {
                        copy.send(chunk).await.map_err(DbError::from_query_error)?;
                    }
                }
            }

            copy.finish().await.map_err(DbError::from_query_error)
        })))
    }
}

/// Bulk export with `COPY ... TO STDOUT` into a channel. Resolves to the
/// number of bytes forwarded.
pub struct CopyOut {
    statement: String,
    sink: mpsc::Sender<Vec<u8>>,
}

impl CopyOut {
    pub fn new(statement: impl Into<String>, sink: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            statement: statement.into(),
            sink,
        }
    }
}

impl Submittable<PgClient> for CopyOut {
    fn submit<'c>(self, client: &'c mut PgClient) -> DbResult<Option<Running<'c>>> {
        require_copy(&self.statement, "TO STDOUT")?;

        Ok(Some(Box::pin(async move {
            let mut stream = client
                .conn
                .copy_out_raw(&self.statement)
                .await
                .map_err(DbError::from_query_error)?;

            let mut total = 0u64;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(DbError::from_query_error)?;
                total += chunk.len() as u64;
                if self.sink.send(chunk.to_vec()).await.is_err() {
                    return Err(DbError::query("Copy output receiver was dropped", None));
                }
            }
            Ok(total)
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_copy() {
        assert!(require_copy("copy items from stdin", "FROM STDIN").is_ok());
        assert!(require_copy("  COPY items TO STDOUT (FORMAT csv)", "TO STDOUT").is_ok());
        assert!(require_copy("SELECT 1", "FROM STDIN").is_err());
        assert!(require_copy("COPY items TO STDOUT", "FROM STDIN").is_err());
    }

    #[test]
    fn test_invalid_connection_string_is_configuration_error() {
        let options = ConnectOptions {
            host: "db1".to_string(),
            port: 5432,
            database: None,
            connection_string: "postgres://db1:notaport/app".to_string(),
            pool_options: Default::default(),
        };
        let err = PgDriver::new().create_pool(&options).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
