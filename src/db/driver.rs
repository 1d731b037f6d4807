//! Driver primitive boundary.
//!
//! The instance and transaction layers only talk to a database through these
//! traits:
//! - [`Driver`] builds one [`Pool`] per normalized connection option set
//! - [`Pool`] hands out exclusive [`Client`]s and reports connectivity error events
//! - [`Client`] runs buffered queries and is released with an optional error
//! - [`Submittable`] is a streaming operation started on a client, whose single
//!   completion future plays the role of the `end`/`error` events
//!
//! The PostgreSQL binding lives in [`crate::db::postgres`].

use crate::error::{DbError, DbResult};
use crate::models::{ConnectOptions, Query, QueryResult};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{broadcast, oneshot};

/// A live connection checked out of exactly one pool.
#[async_trait]
pub trait Client: Send + Sized + 'static {
    /// Execute a buffered statement and return its full result set.
    async fn query(&mut self, query: &Query) -> DbResult<QueryResult>;

    /// Give the client back. With an error, the connection must not be reused.
    async fn release(self, error: Option<&DbError>);
}

#[async_trait]
pub trait Pool: Send + Sync + 'static {
    type Client: Client;

    /// Check out a client, or fail with a classified connect error.
    async fn connect(&self) -> DbResult<Self::Client>;

    /// Close the pool. Calling it again must be harmless.
    async fn end(&self);

    /// Connectivity error events raised by idle clients or the pool itself.
    fn subscribe_errors(&self) -> Option<broadcast::Receiver<DbError>> {
        None
    }
}

/// Factory for pools of one database flavour.
pub trait Driver: Send + Sync + 'static {
    type Client: Client;
    type Pool: Pool<Client = Self::Client>;

    /// Build a pool for one normalized option set. Must not connect eagerly.
    fn create_pool(&self, options: &ConnectOptions) -> DbResult<Self::Pool>;
}

/// Completion of a started streaming operation.
pub type Running<'c> = BoxFuture<'c, DbResult<u64>>;

/// A streaming operation, e.g. a bulk copy, driven on a borrowed client.
///
/// `submit` mirrors handing the operation to the client:
/// - `Err` means it could not even start
/// - `Ok(None)` means it finished synchronously
/// - `Ok(Some(running))` means it is in flight; `running` resolves exactly once,
///   to the processed count on `end` or to the error
pub trait Submittable<C>: Send + 'static {
    fn submit<'c>(self, client: &'c mut C) -> DbResult<Option<Running<'c>>>;
}

/// Handle to an in-flight streaming operation.
///
/// Awaiting it yields the operation's final result. Dropping it does not cancel
/// the operation; the client is still released (or the outcome recorded) when
/// it completes.
#[derive(Debug)]
pub struct StreamHandle {
    done: oneshot::Receiver<DbResult<u64>>,
}

impl StreamHandle {
    pub(crate) fn new(done: oneshot::Receiver<DbResult<u64>>) -> Self {
        Self { done }
    }
}

impl Future for StreamHandle {
    type Output = DbResult<u64>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.done).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(DbError::internal(
                    "Streaming task stopped before reporting completion",
                ))
            })
        })
    }
}
