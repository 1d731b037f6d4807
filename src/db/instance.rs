//! Named database instances.
//!
//! An [`Instance`] owns the pool set built from its configuration and the
//! transaction store slot its queries consult. `create` (re)builds the pools,
//! `dispose` ends them; queries pick the transactional or ad-hoc path on every
//! call depending on whether a transaction scope is active for the instance.

use crate::config::InstanceConfig;
use crate::db::context::TransactionStore;
use crate::db::driver::{Driver, StreamHandle, Submittable};
use crate::db::executor::{BoundExecutor, Executor, QueryExecutor, UnboundExecutor};
use crate::db::pool_set::PoolSet;
use crate::error::{DbError, DbResult};
use crate::models::{InstanceSummary, Query, QueryResult};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{info, warn};

struct InstanceState<D: Driver> {
    pool_set: Arc<PoolSet<D>>,
    listeners: Vec<JoinHandle<()>>,
}

pub struct Instance<D: Driver> {
    config: InstanceConfig,
    driver: Arc<D>,
    state: RwLock<Option<InstanceState<D>>>,
    store: TransactionStore<D::Client>,
}

impl<D: Driver> Instance<D> {
    /// Create an instance without pools. Call [`Instance::create`] before querying.
    pub fn new(config: InstanceConfig, driver: Arc<D>) -> Self {
        Self {
            config,
            driver,
            state: RwLock::new(None),
            store: TransactionStore::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn store(&self) -> &TransactionStore<D::Client> {
        &self.store
    }

    pub async fn is_created(&self) -> bool {
        self.state.read().await.is_some()
    }

    /// Build the pool set, disposing any previous one first.
    ///
    /// Fails with a configuration error when the options normalize to no host.
    pub async fn create(&self) -> DbResult<()> {
        let mut state = self.state.write().await;
        if let Some(previous) = state.take() {
            self.shutdown(previous).await;
        }

        let options = self.config.normalize()?;
        let pool_set = Arc::new(PoolSet::create(
            self.name(),
            self.driver.as_ref(),
            options,
            self.config.health_check.as_str(),
        )?);

        let listeners = pool_set
            .subscribe_errors()
            .into_iter()
            .map(|(host, events)| spawn_error_listener(self.name().to_string(), host, events))
            .collect();

        info!(
            instance = %self.name(),
            hosts = pool_set.len(),
            "Instance created"
        );
        *state = Some(InstanceState {
            pool_set,
            listeners,
        });
        Ok(())
    }

    /// End all pools and stop the error listeners. A second call does nothing.
    pub async fn dispose(&self) {
        let previous = self.state.write().await.take();
        if let Some(previous) = previous {
            self.shutdown(previous).await;
        }
    }

    async fn shutdown(&self, state: InstanceState<D>) {
        for listener in &state.listeners {
            listener.abort();
        }
        state.pool_set.end().await;
        info!(instance = %self.name(), "Instance disposed");
    }

    /// The current pool set.
    pub async fn pool_set(&self) -> DbResult<Arc<PoolSet<D>>> {
        self.state
            .read()
            .await
            .as_ref()
            .map(|state| Arc::clone(&state.pool_set))
            .ok_or_else(|| {
                DbError::configuration(format!("Instance '{}' is not created", self.name()))
            })
    }

    /// Acquire a verified client outside of any transaction scope.
    pub async fn acquire(&self) -> DbResult<D::Client> {
        self.pool_set().await?.acquire().await
    }

    /// Executor for the current call chain: bound to the active transaction
    /// scope of this instance if there is one, ad-hoc otherwise.
    pub async fn executor(&self) -> DbResult<Executor<D>> {
        match self.store.current() {
            Some(scope) => Ok(Executor::Bound(BoundExecutor::new(scope))),
            None => Ok(Executor::Unbound(UnboundExecutor::new(
                self.pool_set().await?,
            ))),
        }
    }

    /// Run a buffered query, joining the active transaction if any.
    pub async fn query(&self, query: impl Into<Query>) -> DbResult<QueryResult> {
        let query = query.into();
        self.executor().await?.query(&query).await
    }

    /// Start a streaming query, joining the active transaction if any.
    pub async fn query_stream<S>(&self, submittable: S) -> DbResult<StreamHandle>
    where
        S: Submittable<D::Client>,
    {
        self.executor().await?.query_stream(submittable).await
    }

    pub async fn summary(&self) -> InstanceSummary {
        let hosts = match self.config.normalize() {
            Ok(options) => options.iter().map(|o| o.address()).collect(),
            Err(_) => Vec::new(),
        };
        InstanceSummary {
            name: self.name().to_string(),
            hosts,
            created: self.is_created().await,
        }
    }
}

impl<D: Driver> std::fmt::Debug for Instance<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("name", &self.config.name)
            .field("store", &self.store)
            .finish()
    }
}

/// Log connectivity error events of one pool; they never affect the instance.
fn spawn_error_listener(
    instance: String,
    host: String,
    mut events: broadcast::Receiver<DbError>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(err) => warn!(
                    instance = %instance,
                    host = %host,
                    error = %err,
                    "Connection error event"
                ),
                Err(RecvError::Lagged(skipped)) => warn!(
                    instance = %instance,
                    host = %host,
                    skipped,
                    "Missed connection error events"
                ),
                Err(RecvError::Closed) => break,
            }
        }
    })
}
