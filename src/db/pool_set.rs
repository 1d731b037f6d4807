//! Pool sets and client acquisition with host failover.
//!
//! A [`PoolSet`] holds one pool per normalized option set of an instance, in
//! failover order. [`PoolSet::acquire`] walks the pools in that order and only
//! moves on to the next host when the failure is a connectivity error.

use crate::db::driver::{Client, Driver, Pool};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectOptions, Query};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

struct PoolEntry<P> {
    pool: P,
    options: ConnectOptions,
}

/// Ordered, non-empty list of redundant pools for one instance.
pub struct PoolSet<D: Driver> {
    instance: String,
    entries: Vec<PoolEntry<D::Pool>>,
    health_check: Query,
    ended: AtomicBool,
}

impl<D: Driver> PoolSet<D> {
    /// Build one pool per option set. Fails if there is none.
    pub fn create(
        instance: impl Into<String>,
        driver: &D,
        options: Vec<ConnectOptions>,
        health_check: impl Into<Query>,
    ) -> DbResult<Self> {
        let instance = instance.into();
        if options.is_empty() {
            return Err(DbError::configuration(format!(
                "Instance '{}' has no usable connection options",
                instance
            )));
        }

        let mut entries = Vec::with_capacity(options.len());
        for options in options {
            let pool = driver.create_pool(&options)?;
            debug!(
                instance = %instance,
                host = %options.address(),
                "Created pool"
            );
            entries.push(PoolEntry { pool, options });
        }

        Ok(Self {
            instance,
            entries,
            health_check: health_check.into(),
            ended: AtomicBool::new(false),
        })
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Number of pools, which is also the attempt budget of one acquisition.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Option sets in failover order.
    pub fn options(&self) -> impl Iterator<Item = &ConnectOptions> {
        self.entries.iter().map(|entry| &entry.options)
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Acquire a verified client, failing over across hosts on connectivity errors.
    ///
    /// Every client is checked with the health-check query before it is returned.
    /// A client failing the check is released with that error, and the error is
    /// classified like a connect failure. Non-connectivity errors stop the search
    /// immediately and are returned as they are.
    pub async fn acquire(&self) -> DbResult<D::Client> {
        if self.is_ended() {
            return Err(DbError::configuration(format!(
                "Instance '{}' has been disposed",
                self.instance
            )));
        }

        let mut attempts = 0;
        let mut last_error = None;

        for entry in &self.entries {
            attempts += 1;
            let host = entry.options.address();

            let error = match entry.pool.connect().await {
                Ok(mut client) => match client.query(&self.health_check).await {
                    Ok(_) => {
                        debug!(instance = %self.instance, host = %host, attempts, "Client acquired");
                        return Ok(client);
                    }
                    Err(err) => {
                        warn!(
                            instance = %self.instance,
                            host = %host,
                            error = %err,
                            "Client failed verification"
                        );
                        client.release(Some(&err)).await;
                        err
                    }
                },
                Err(err) => err,
            };

            if !error.is_failover_eligible() {
                warn!(
                    instance = %self.instance,
                    host = %host,
                    error = %error,
                    "Connection rejected, not trying remaining hosts"
                );
                return Err(error);
            }

            warn!(
                instance = %self.instance,
                host = %host,
                attempt = attempts,
                hosts = self.entries.len(),
                error = %error,
                "Host unreachable, failing over"
            );
            last_error = Some(error);
        }

        Err(DbError::no_client_available(
            &self.instance,
            attempts,
            last_error,
        ))
    }

    /// Connectivity error event streams, labelled by host address.
    pub fn subscribe_errors(&self) -> Vec<(String, broadcast::Receiver<DbError>)> {
        self.entries
            .iter()
            .filter_map(|entry| {
                entry
                    .pool
                    .subscribe_errors()
                    .map(|events| (entry.options.address(), events))
            })
            .collect()
    }

    /// End every pool. Only the first call has an effect.
    pub async fn end(&self) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        for entry in &self.entries {
            entry.pool.end().await;
        }
        info!(instance = %self.instance, pools = self.entries.len(), "Pools ended");
    }
}

impl<D: Driver> std::fmt::Debug for PoolSet<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolSet")
            .field("instance", &self.instance)
            .field(
                "hosts",
                &self.options().map(|o| o.address()).collect::<Vec<_>>(),
            )
            .field("ended", &self.is_ended())
            .finish()
    }
}
