//! Registry of named instances.
//!
//! The registry is the multi-instance handle application code holds. It keeps
//! instances in registration order, which is also the default target order of
//! a transaction over "all instances".

use crate::config::InstanceConfig;
use crate::db::driver::Driver;
use crate::db::instance::Instance;
use crate::db::transaction::{TransactionContext, orchestrate};
use crate::error::{DbError, DbResult};
use crate::models::InstanceSummary;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

pub struct InstanceRegistry<D: Driver> {
    driver: Arc<D>,
    instances: Arc<RwLock<Vec<Arc<Instance<D>>>>>,
}

impl<D: Driver> InstanceRegistry<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
            instances: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    /// Create an instance's pools and register it under its name.
    pub async fn register(&self, config: InstanceConfig) -> DbResult<Arc<Instance<D>>> {
        let name = config.name.clone();

        // Early check for existing instance
        if self.exists(&name).await {
            return Err(duplicate(&name));
        }

        let instance = Arc::new(Instance::new(config, Arc::clone(&self.driver)));
        instance.create().await?;

        // Re-check after async work; dispose the new pools outside the lock on a race
        let registered = {
            let mut instances = self.instances.write().await;
            if instances.iter().any(|i| i.name() == name) {
                false
            } else {
                instances.push(Arc::clone(&instance));
                true
            }
        };
        if !registered {
            instance.dispose().await;
            return Err(duplicate(&name));
        }

        info!(instance = %name, "Instance registered");
        Ok(instance)
    }

    pub async fn get(&self, name: &str) -> DbResult<Arc<Instance<D>>> {
        let instances = self.instances.read().await;
        instances
            .iter()
            .find(|i| i.name() == name)
            .cloned()
            .ok_or_else(|| unknown(name))
    }

    pub async fn exists(&self, name: &str) -> bool {
        let instances = self.instances.read().await;
        instances.iter().any(|i| i.name() == name)
    }

    /// Resolve transaction targets. No names means every registered instance;
    /// repeated names are kept once. Any unknown name fails the whole lookup.
    pub async fn resolve<N: AsRef<str>>(&self, names: &[N]) -> DbResult<Vec<Arc<Instance<D>>>> {
        let instances = self.instances.read().await;
        if names.is_empty() {
            return Ok(instances.clone());
        }

        let mut resolved: Vec<Arc<Instance<D>>> = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            if resolved.iter().any(|i| i.name() == name) {
                continue;
            }
            let instance = instances
                .iter()
                .find(|i| i.name() == name)
                .ok_or_else(|| unknown(name))?;
            resolved.push(Arc::clone(instance));
        }
        Ok(resolved)
    }

    /// Registered names, in registration order.
    pub async fn names(&self) -> Vec<String> {
        let instances = self.instances.read().await;
        instances.iter().map(|i| i.name().to_string()).collect()
    }

    pub async fn list(&self) -> Vec<InstanceSummary> {
        let instances = self.instances.read().await.clone();
        let mut summaries = Vec::with_capacity(instances.len());
        for instance in instances {
            summaries.push(instance.summary().await);
        }
        summaries
    }

    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }

    /// Unregister an instance and end its pools.
    pub async fn dispose(&self, name: &str) -> DbResult<()> {
        let removed = {
            let mut instances = self.instances.write().await;
            let index = instances
                .iter()
                .position(|i| i.name() == name)
                .ok_or_else(|| unknown(name))?;
            instances.remove(index)
        };
        removed.dispose().await;
        Ok(())
    }

    /// Dispose every instance.
    pub async fn dispose_all(&self) {
        let instances: Vec<_> = self.instances.write().await.drain(..).collect();
        for instance in instances {
            instance.dispose().await;
        }
        info!("All instances disposed");
    }

    /// Run `body` in one transaction over `names` (all instances when empty).
    ///
    /// Names are resolved before any connection work begins.
    pub async fn run_in_transaction<N, F, Fut, T>(&self, names: &[N], body: F) -> DbResult<T>
    where
        N: AsRef<str>,
        F: FnOnce(TransactionContext<D>) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let instances = self.resolve(names).await?;
        orchestrate(instances, body).await
    }
}

impl<D: Driver> Clone for InstanceRegistry<D> {
    fn clone(&self) -> Self {
        Self {
            driver: Arc::clone(&self.driver),
            instances: Arc::clone(&self.instances),
        }
    }
}

impl<D: Driver + Default> Default for InstanceRegistry<D> {
    fn default() -> Self {
        Self::new(D::default())
    }
}

fn duplicate(name: &str) -> DbError {
    DbError::configuration(format!("Instance '{}' is already registered", name))
}

fn unknown(name: &str) -> DbError {
    DbError::configuration(format!("Unknown instance '{}'", name))
}
