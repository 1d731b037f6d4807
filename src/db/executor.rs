//! Query execution.
//!
//! Queries come in two shapes (buffered and streaming) and run in one of two
//! scopes:
//! - [`UnboundExecutor`]: ad-hoc, acquires a client per query and always
//!   releases it, passing the error if the query failed
//! - [`BoundExecutor`]: transactional, reuses the transaction scope's client,
//!   never releases it, and records one outcome per query instead
//!
//! [`Executor`] is the selection made from the ambient transaction store.

use crate::db::context::{QueryOutcome, TransactionScope};
use crate::db::driver::{Client, Driver, Running, StreamHandle, Submittable};
use crate::db::pool_set::PoolSet;
use crate::error::{DbError, DbResult};
use crate::models::{Query, QueryResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    type Client: Client;

    /// Execute a buffered query.
    async fn query(&self, query: &Query) -> DbResult<QueryResult>;

    /// Start a streaming query.
    ///
    /// Returns once the operation has started, or with the start error. The
    /// handle resolves when the operation ends.
    async fn query_stream<S>(&self, submittable: S) -> DbResult<StreamHandle>
    where
        S: Submittable<Self::Client>;
}

/// Ad-hoc execution on a freshly acquired client.
pub struct UnboundExecutor<D: Driver> {
    pool_set: Arc<PoolSet<D>>,
}

impl<D: Driver> UnboundExecutor<D> {
    pub fn new(pool_set: Arc<PoolSet<D>>) -> Self {
        Self { pool_set }
    }

    pub fn instance(&self) -> &str {
        self.pool_set.instance()
    }
}

impl<D: Driver> Clone for UnboundExecutor<D> {
    fn clone(&self) -> Self {
        Self {
            pool_set: Arc::clone(&self.pool_set),
        }
    }
}

#[async_trait]
impl<D: Driver> QueryExecutor for UnboundExecutor<D> {
    type Client = D::Client;

    async fn query(&self, query: &Query) -> DbResult<QueryResult> {
        let mut client = self.pool_set.acquire().await?;

        let start = Instant::now();
        let result = client.query(query).await;
        debug!(
            instance = %self.instance(),
            sql = %query.sql,
            params = query.params.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "Executed ad-hoc query"
        );

        client.release(result.as_ref().err()).await;
        result
    }

    async fn query_stream<S>(&self, submittable: S) -> DbResult<StreamHandle>
    where
        S: Submittable<Self::Client>,
    {
        let mut client = self.pool_set.acquire().await?;
        let instance = self.instance().to_string();
        let (start_tx, start_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut start_tx = Some(start_tx);
            let outcome = run_submitted(submittable.submit(&mut client), &mut start_tx).await;

            match outcome {
                Err(err) => {
                    client.release(Some(&err)).await;
                    if let Some(start_tx) = start_tx {
                        let _ = start_tx.send(Err(err));
                    }
                }
                Ok(result) => {
                    if let Err(err) = &result {
                        warn!(instance = %instance, error = %err, "Streaming query failed");
                    }
                    client.release(result.as_ref().err()).await;
                    let _ = done_tx.send(result);
                }
            }
        });

        started(start_rx, done_rx).await
    }
}

/// Transactional execution on the client of an active transaction scope.
pub struct BoundExecutor<C: Client> {
    scope: Arc<TransactionScope<C>>,
}

impl<C: Client> BoundExecutor<C> {
    pub fn new(scope: Arc<TransactionScope<C>>) -> Self {
        Self { scope }
    }

    pub fn transaction_id(&self) -> &str {
        self.scope.transaction_id()
    }

    pub fn instance(&self) -> &str {
        self.scope.instance()
    }
}

impl<C: Client> Clone for BoundExecutor<C> {
    fn clone(&self) -> Self {
        Self {
            scope: Arc::clone(&self.scope),
        }
    }
}

#[async_trait]
impl<C: Client> QueryExecutor for BoundExecutor<C> {
    type Client = C;

    /// Records the outcome and also returns the error, so a caller that swallows
    /// it still fails the transaction.
    async fn query(&self, query: &Query) -> DbResult<QueryResult> {
        // Reserved up front so a settle that runs while the query waits
        // for the client still collects its outcome
        let outcome_tx = self.scope.pending().await;
        let result = {
            let mut slot = self.scope.client_slot().lock().await;
            match slot.as_mut() {
                Some(client) => client.query(query).await,
                None => Err(self.scope.closed_error()),
            }
        };
        debug!(
            transaction_id = %self.transaction_id(),
            instance = %self.instance(),
            sql = %query.sql,
            ok = result.is_ok(),
            "Executed transactional query"
        );

        let _ = outcome_tx.send(QueryOutcome::from_result(&result));
        result
    }

    async fn query_stream<S>(&self, submittable: S) -> DbResult<StreamHandle>
    where
        S: Submittable<Self::Client>,
    {
        let outcome_tx = self.scope.pending().await;
        let slot = Arc::clone(self.scope.client_slot());
        let closed = self.scope.closed_error();
        let transaction_id = self.transaction_id().to_string();
        let (start_tx, start_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut start_tx = Some(start_tx);
            let mut guard = slot.lock_owned().await;
            let outcome = match guard.as_mut() {
                Some(client) => run_submitted(submittable.submit(client), &mut start_tx).await,
                None => Err(closed),
            };
            drop(guard);

            match outcome {
                Err(err) => {
                    let _ = outcome_tx.send(QueryOutcome::Failed(err.clone()));
                    if let Some(start_tx) = start_tx {
                        let _ = start_tx.send(Err(err));
                    }
                }
                Ok(result) => {
                    if let Err(err) = &result {
                        warn!(
                            transaction_id = %transaction_id,
                            error = %err,
                            "Streaming query failed inside transaction"
                        );
                    }
                    let _ = outcome_tx.send(QueryOutcome::from_result(&result));
                    let _ = done_tx.send(result);
                }
            }
        });

        started(start_rx, done_rx).await
    }
}

/// Signals the start once submission succeeds, then waits for completion.
/// The outer error is a failed start; the inner result is the stream's own.
async fn run_submitted(
    submitted: DbResult<Option<Running<'_>>>,
    start_tx: &mut Option<oneshot::Sender<DbResult<()>>>,
) -> DbResult<DbResult<u64>> {
    let running = submitted?;
    if let Some(start_tx) = start_tx.take() {
        let _ = start_tx.send(Ok(()));
    }
    Ok(match running {
        Some(running) => running.await,
        None => Ok(0),
    })
}

async fn started(
    start_rx: oneshot::Receiver<DbResult<()>>,
    done_rx: oneshot::Receiver<DbResult<u64>>,
) -> DbResult<StreamHandle> {
    match start_rx.await {
        Ok(Ok(())) => Ok(StreamHandle::new(done_rx)),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(DbError::internal("Streaming task stopped before starting")),
    }
}

/// Executor chosen for one instance in the current call chain.
pub enum Executor<D: Driver> {
    Unbound(UnboundExecutor<D>),
    Bound(BoundExecutor<D::Client>),
}

impl<D: Driver> Executor<D> {
    pub fn is_transactional(&self) -> bool {
        matches!(self, Self::Bound(_))
    }
}

impl<D: Driver> Clone for Executor<D> {
    fn clone(&self) -> Self {
        match self {
            Self::Unbound(executor) => Self::Unbound(executor.clone()),
            Self::Bound(executor) => Self::Bound(executor.clone()),
        }
    }
}

#[async_trait]
impl<D: Driver> QueryExecutor for Executor<D> {
    type Client = D::Client;

    async fn query(&self, query: &Query) -> DbResult<QueryResult> {
        match self {
            Self::Unbound(executor) => executor.query(query).await,
            Self::Bound(executor) => executor.query(query).await,
        }
    }

    async fn query_stream<S>(&self, submittable: S) -> DbResult<StreamHandle>
    where
        S: Submittable<Self::Client>,
    {
        match self {
            Self::Unbound(executor) => executor.query_stream(submittable).await,
            Self::Bound(executor) => executor.query_stream(submittable).await,
        }
    }
}
