//! Cross-instance transactions.
//!
//! [`orchestrate`] runs a body inside one transaction per target instance and
//! commits or rolls back all of them together:
//!
//! 1. acquire a client on every instance concurrently
//! 2. if any acquisition fails, release the others unused and fail without BEGIN
//! 3. BEGIN everywhere, then run the body with every scope active
//! 4. wait for all recorded outcomes, including streams still in flight
//! 5. COMMIT everywhere if nothing failed, ROLLBACK everywhere otherwise
//! 6. release every client with the final error
//!
//! [`with_transaction`] turns a function into a [`Transactional`] that runs each
//! call through the orchestrator.

use crate::db::context::{QueryOutcome, ScopeMap, TransactionScope};
use crate::db::driver::{Client, Driver, StreamHandle, Submittable};
use crate::db::executor::{BoundExecutor, QueryExecutor};
use crate::db::instance::Instance;
use crate::db::registry::InstanceRegistry;
use crate::error::{DbError, DbResult};
use crate::models::{Query, QueryResult};
use futures_util::future::join_all;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Executors of one orchestrated call, handed to the body explicitly.
pub struct TransactionContext<D: Driver> {
    transaction_id: String,
    executors: Vec<BoundExecutor<D::Client>>,
}

impl<D: Driver> TransactionContext<D> {
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    /// Participating instance names, in target order.
    pub fn instances(&self) -> impl Iterator<Item = &str> {
        self.executors.iter().map(|executor| executor.instance())
    }

    /// The bound executor of a participating instance.
    pub fn executor(&self, instance: &str) -> DbResult<&BoundExecutor<D::Client>> {
        self.executors
            .iter()
            .find(|executor| executor.instance() == instance)
            .ok_or_else(|| {
                DbError::configuration(format!(
                    "Instance '{}' is not part of transaction {}",
                    instance, self.transaction_id
                ))
            })
    }

    pub async fn query(&self, instance: &str, query: impl Into<Query>) -> DbResult<QueryResult> {
        let query = query.into();
        self.executor(instance)?.query(&query).await
    }

    pub async fn query_stream<S>(&self, instance: &str, submittable: S) -> DbResult<StreamHandle>
    where
        S: Submittable<D::Client>,
    {
        self.executor(instance)?.query_stream(submittable).await
    }
}

impl<D: Driver> Clone for TransactionContext<D> {
    fn clone(&self) -> Self {
        Self {
            transaction_id: self.transaction_id.clone(),
            executors: self.executors.clone(),
        }
    }
}

impl<D: Driver> std::fmt::Debug for TransactionContext<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("transaction_id", &self.transaction_id)
            .field("instances", &self.instances().collect::<Vec<_>>())
            .finish()
    }
}

/// Generate a unique transaction ID.
fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

/// Run `body` in one transaction spanning `instances`.
///
/// Returns the body's value if it and every query recorded on the way
/// succeeded and every COMMIT went through. Otherwise every instance is
/// rolled back and the first error is returned: the body's own error, else
/// the first failed query outcome.
///
/// An instance that is already in a transaction in the current call chain is
/// rejected with a configuration error before any client is acquired.
pub async fn orchestrate<D, F, Fut, T>(instances: Vec<Arc<Instance<D>>>, body: F) -> DbResult<T>
where
    D: Driver,
    F: FnOnce(TransactionContext<D>) -> Fut,
    Fut: Future<Output = DbResult<T>>,
{
    if instances.is_empty() {
        return Err(DbError::configuration(
            "A transaction needs at least one instance",
        ));
    }
    let active = ScopeMap::current();
    if let Some(nested) = instances.iter().find(|i| active.contains(i.store().key())) {
        return Err(DbError::configuration(format!(
            "Instance '{}' is already in a transaction in this call chain",
            nested.name()
        )));
    }

    let transaction_id = generate_transaction_id();
    let names: Vec<&str> = instances.iter().map(|i| i.name()).collect();

    let acquired = join_all(instances.iter().map(|instance| instance.acquire())).await;
    let mut clients = Vec::with_capacity(acquired.len());
    let mut init_error = None;
    for (instance, result) in instances.iter().zip(acquired) {
        match result {
            Ok(client) => clients.push((instance.name(), client)),
            Err(err) => {
                if init_error.is_none() {
                    init_error = Some(DbError::initialization(instance.name(), err));
                }
            }
        }
    }
    if let Some(err) = init_error {
        for (_, client) in clients {
            client.release(None).await;
        }
        warn!(
            transaction_id = %transaction_id,
            instances = ?names,
            error = %err,
            "Transaction could not start"
        );
        return Err(err);
    }

    let scopes: Vec<Arc<TransactionScope<D::Client>>> = clients
        .into_iter()
        .map(|(name, client)| Arc::new(TransactionScope::new(&transaction_id, name, client)))
        .collect();

    let result = match begin(&scopes).await {
        Err(err) => Err(err),
        Ok(()) => {
            info!(
                transaction_id = %transaction_id,
                instances = ?names,
                "Transaction started"
            );
            let mut ambient = active;
            for (instance, scope) in instances.iter().zip(&scopes) {
                ambient.insert(instance.store().key(), Arc::clone(scope));
            }
            let context = TransactionContext {
                transaction_id: transaction_id.clone(),
                executors: scopes.iter().cloned().map(BoundExecutor::new).collect(),
            };
            ambient.enter(async move { body(context).await }).await
        }
    };

    // Outcomes recorded by queries whose errors the body swallowed still count.
    let mut result = result;
    for scope in &scopes {
        for outcome in scope.settle().await {
            if let QueryOutcome::Failed(err) = outcome {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
    }

    let result = match result {
        Ok(value) => commit(&transaction_id, &scopes).await.map(|()| value),
        Err(err) => {
            warn!(
                transaction_id = %transaction_id,
                error = %err,
                "Rolling back transaction"
            );
            for scope in &scopes {
                rollback(scope).await;
            }
            Err(err)
        }
    };

    for scope in &scopes {
        scope.release(result.as_ref().err()).await;
    }
    result
}

async fn begin<C: Client>(scopes: &[Arc<TransactionScope<C>>]) -> DbResult<()> {
    for scope in scopes {
        scope.execute_control("BEGIN").await?;
    }
    Ok(())
}

/// COMMIT in target order. On a failure at instance k, k and every later
/// instance are rolled back; the earlier ones stay committed.
async fn commit<C: Client>(transaction_id: &str, scopes: &[Arc<TransactionScope<C>>]) -> DbResult<()> {
    for (index, scope) in scopes.iter().enumerate() {
        let Err(err) = scope.execute_control("COMMIT").await else {
            continue;
        };

        if index > 0 {
            let committed: Vec<&str> = scopes[..index].iter().map(|s| s.instance()).collect();
            error!(
                transaction_id = %transaction_id,
                instance = %scope.instance(),
                committed = ?committed,
                error = %err,
                "Commit failed after other instances committed"
            );
        } else {
            warn!(
                transaction_id = %transaction_id,
                instance = %scope.instance(),
                error = %err,
                "Commit failed"
            );
        }
        for remaining in &scopes[index..] {
            rollback(remaining).await;
        }
        return Err(DbError::transaction(
            format!("Commit failed on instance '{}'", scope.instance()),
            transaction_id,
            Some(err),
        ));
    }

    info!(transaction_id = %transaction_id, "Transaction committed");
    Ok(())
}

async fn rollback<C: Client>(scope: &TransactionScope<C>) {
    if let Err(err) = scope.execute_control("ROLLBACK").await {
        warn!(
            transaction_id = %scope.transaction_id(),
            instance = %scope.instance(),
            error = %err,
            "Rollback failed"
        );
    }
}

/// A function whose every call runs in one transaction over a fixed set of
/// instances. Built by [`with_transaction`].
///
/// `Transactional` is not itself a function, so it cannot be wrapped a second
/// time:
///
/// ```compile_fail
/// use db_instance_tx::db::postgres::PgDriver;
/// use db_instance_tx::db::{InstanceRegistry, with_transaction};
///
/// let registry = InstanceRegistry::new(PgDriver::default());
/// let once = with_transaction(registry.clone(), &["orders"], |_tx, id: i64| async move { Ok(id) });
/// let twice = with_transaction(registry, &["orders"], once);
/// ```
pub struct Transactional<D: Driver, F, A> {
    registry: InstanceRegistry<D>,
    names: Vec<String>,
    f: F,
    _args: PhantomData<fn(A)>,
}

impl<D: Driver, F, A> Transactional<D, F, A> {
    /// Target instance names; empty means every registered instance.
    pub fn instance_names(&self) -> &[String] {
        &self.names
    }

    /// Invoke the wrapped function inside a new cross-instance transaction.
    pub async fn call<Fut, T>(&self, args: A) -> DbResult<T>
    where
        F: Fn(TransactionContext<D>, A) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        self.registry
            .run_in_transaction(&self.names, move |tx| (self.f)(tx, args))
            .await
    }
}

/// Wrap `f` so each call runs in a transaction over `names` (all registered
/// instances when empty). Names are resolved on every call.
pub fn with_transaction<D, F, A, Fut, T>(
    registry: InstanceRegistry<D>,
    names: &[&str],
    f: F,
) -> Transactional<D, F, A>
where
    D: Driver,
    F: Fn(TransactionContext<D>, A) -> Fut,
    Fut: Future<Output = DbResult<T>>,
{
    Transactional {
        registry,
        names: names.iter().map(|name| name.to_string()).collect(),
        f,
        _args: PhantomData,
    }
}
