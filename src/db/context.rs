//! Context-local transaction store.
//!
//! While an orchestrated transaction runs, every participating instance has a
//! [`TransactionScope`] that is visible to everything the wrapped body calls,
//! across await points, without passing it down explicitly. The ambient value
//! is a tokio task-local [`ScopeMap`], keyed per instance, so a scope created
//! for one instance is never seen by another and concurrent call chains each
//! get their own isolated view.

use crate::db::driver::Client;
use crate::error::{DbError, DbResult};
use crate::models::Query;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, oneshot};
use tokio::task::futures::TaskLocalFuture;
use tracing::debug;

tokio::task_local! {
    static ACTIVE_SCOPES: ScopeMap;
}

static NEXT_STORE_KEY: AtomicU64 = AtomicU64::new(1);

/// Identity of one instance's store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreKey(u64);

impl StoreKey {
    fn next() -> Self {
        Self(NEXT_STORE_KEY.fetch_add(1, Ordering::Relaxed))
    }
}

/// Ambient scopes of one call chain, at most one per instance store.
#[derive(Clone, Default)]
pub struct ScopeMap {
    scopes: HashMap<StoreKey, Arc<dyn Any + Send + Sync>>,
}

impl ScopeMap {
    /// The scopes visible to the current call chain (empty outside any transaction).
    pub fn current() -> Self {
        ACTIVE_SCOPES
            .try_with(|scopes| scopes.clone())
            .unwrap_or_default()
    }

    pub fn insert<C: Client>(&mut self, key: StoreKey, scope: Arc<TransactionScope<C>>) {
        self.scopes.insert(key, scope);
    }

    pub fn contains(&self, key: StoreKey) -> bool {
        self.scopes.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    fn get<C: Client>(&self, key: StoreKey) -> Option<Arc<TransactionScope<C>>> {
        let scope = Arc::clone(self.scopes.get(&key)?);
        scope.downcast::<TransactionScope<C>>().ok()
    }

    /// Run `body` with these scopes as the ambient value.
    pub fn enter<F: Future>(self, body: F) -> TaskLocalFuture<ScopeMap, F> {
        ACTIVE_SCOPES.scope(self, body)
    }
}

impl std::fmt::Debug for ScopeMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.scopes.keys()).finish()
    }
}

/// Carry the caller's ambient scopes into a future that runs elsewhere,
/// typically one handed to `tokio::spawn`.
pub fn inherit<F: Future>(body: F) -> TaskLocalFuture<ScopeMap, F> {
    ScopeMap::current().enter(body)
}

/// Per-instance store slot. `C` is the instance's client type.
pub struct TransactionStore<C> {
    key: StoreKey,
    _client: PhantomData<fn() -> C>,
}

impl<C: Client> TransactionStore<C> {
    pub fn new() -> Self {
        Self {
            key: StoreKey::next(),
            _client: PhantomData,
        }
    }

    pub fn key(&self) -> StoreKey {
        self.key
    }

    /// The scope active for this instance in the current call chain, if any.
    pub fn current(&self) -> Option<Arc<TransactionScope<C>>> {
        ACTIVE_SCOPES
            .try_with(|scopes| scopes.get::<C>(self.key))
            .ok()
            .flatten()
    }

    /// Run `body` with `scope` active for this instance, keeping scopes of
    /// other instances that are already active.
    pub fn run<F: Future>(
        &self,
        scope: Arc<TransactionScope<C>>,
        body: F,
    ) -> TaskLocalFuture<ScopeMap, F> {
        let mut scopes = ScopeMap::current();
        scopes.insert(self.key, scope);
        scopes.enter(body)
    }
}

impl<C: Client> Default for TransactionStore<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> std::fmt::Debug for TransactionStore<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionStore")
            .field("key", &self.key)
            .finish()
    }
}

/// Result of one query issued inside a transaction scope.
#[derive(Debug, Clone)]
pub enum QueryOutcome {
    Success,
    Failed(DbError),
}

impl QueryOutcome {
    pub fn from_result<T>(result: &DbResult<T>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(err) => Self::Failed(err.clone()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn error(&self) -> Option<&DbError> {
        match self {
            Self::Success => None,
            Self::Failed(err) => Some(err),
        }
    }
}

enum OutcomeSlot {
    Settled(QueryOutcome),
    /// A streaming query still in flight.
    Pending(oneshot::Receiver<QueryOutcome>),
}

/// The in-use client of one instance for one orchestrated call, plus the
/// outcomes of every query issued against it.
pub struct TransactionScope<C> {
    transaction_id: String,
    instance: String,
    client: Arc<Mutex<Option<C>>>,
    outcomes: Mutex<Vec<OutcomeSlot>>,
}

impl<C: Client> TransactionScope<C> {
    pub fn new(transaction_id: impl Into<String>, instance: impl Into<String>, client: C) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            instance: instance.into(),
            client: Arc::new(Mutex::new(Some(client))),
            outcomes: Mutex::new(Vec::new()),
        }
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Shared slot of the scope's client; `None` once the scope is released.
    pub(crate) fn client_slot(&self) -> &Arc<Mutex<Option<C>>> {
        &self.client
    }

    pub(crate) fn closed_error(&self) -> DbError {
        DbError::transaction(
            format!("Transaction on instance '{}' has already finished", self.instance),
            &self.transaction_id,
            None,
        )
    }

    /// Append the outcome of a finished query.
    pub async fn record(&self, outcome: QueryOutcome) {
        self.outcomes.lock().await.push(OutcomeSlot::Settled(outcome));
    }

    /// Reserve an outcome slot for a query still running; the sender fills it once.
    pub async fn pending(&self) -> oneshot::Sender<QueryOutcome> {
        let (tx, rx) = oneshot::channel();
        self.outcomes.lock().await.push(OutcomeSlot::Pending(rx));
        tx
    }

    /// Wait for every recorded outcome, including streams still in flight.
    ///
    /// Drains repeatedly so outcomes appended while waiting are collected too.
    pub async fn settle(&self) -> Vec<QueryOutcome> {
        let mut settled = Vec::new();
        loop {
            let slots = std::mem::take(&mut *self.outcomes.lock().await);
            if slots.is_empty() {
                return settled;
            }
            for slot in slots {
                let outcome = match slot {
                    OutcomeSlot::Settled(outcome) => outcome,
                    OutcomeSlot::Pending(rx) => rx.await.unwrap_or_else(|_| {
                        QueryOutcome::Failed(DbError::internal(
                            "Query stopped without reporting an outcome",
                        ))
                    }),
                };
                settled.push(outcome);
            }
        }
    }

    /// Run a transaction control statement (BEGIN, COMMIT, ROLLBACK).
    /// Not recorded as an outcome.
    pub async fn execute_control(&self, sql: &str) -> DbResult<()> {
        let mut slot = self.client.lock().await;
        let client = slot.as_mut().ok_or_else(|| self.closed_error())?;
        debug!(
            transaction_id = %self.transaction_id,
            instance = %self.instance,
            statement = sql,
            "Transaction control"
        );
        client.query(&Query::new(sql)).await.map(|_| ())
    }

    /// Release the client with the transaction's final error. Later calls do nothing.
    pub async fn release(&self, error: Option<&DbError>) {
        let client = self.client.lock().await.take();
        if let Some(client) = client {
            client.release(error).await;
        }
    }
}

impl<C> std::fmt::Debug for TransactionScope<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionScope")
            .field("transaction_id", &self.transaction_id)
            .field("instance", &self.instance)
            .finish()
    }
}
