//! Scripted driver for integration tests.
//!
//! Every pool and client writes what it does to a shared event log:
//! - `connect <host>` for every connect attempt
//! - `<host>#<id>: <sql>` for every statement, health checks included
//! - `<host>#<id> release` / `<host>#<id> release(err)` for releases
//! - `end <host>` when a pool is ended
//!
//! Hosts behave normally unless scripted otherwise with [`HostBehavior`].

#![allow(dead_code)]

use async_trait::async_trait;
use db_instance_tx::config::InstanceConfig;
use db_instance_tx::db::{Client, Driver, InstanceRegistry, Pool, Running, Submittable};
use db_instance_tx::error::{DbError, DbResult};
use db_instance_tx::models::{ConnectOptions, Query, QueryResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

pub const HEALTH_CHECK: &str = "SELECT 1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectBehavior {
    #[default]
    Accept,
    /// Host unreachable.
    Refuse,
    /// Host reachable but rejects the credentials.
    Reject,
}

#[derive(Debug, Clone, Default)]
pub struct HostBehavior {
    pub connect: ConnectBehavior,
    /// The health-check query fails with a connectivity error.
    pub fail_verification: bool,
    /// Statements containing any of these fragments fail with a query error.
    pub failing_sql: Vec<String>,
    /// Statements containing any of these fragments take 30ms.
    pub slow_sql: Vec<String>,
}

impl HostBehavior {
    pub fn refuse() -> Self {
        Self {
            connect: ConnectBehavior::Refuse,
            ..Self::default()
        }
    }

    pub fn reject() -> Self {
        Self {
            connect: ConnectBehavior::Reject,
            ..Self::default()
        }
    }

    pub fn fail_verification() -> Self {
        Self {
            fail_verification: true,
            ..Self::default()
        }
    }

    pub fn failing(fragments: &[&str]) -> Self {
        Self {
            failing_sql: fragments.iter().map(|f| f.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn slow(mut self, fragments: &[&str]) -> Self {
        self.slow_sql = fragments.iter().map(|f| f.to_string()).collect();
        self
    }
}

#[derive(Default)]
struct Shared {
    log: Mutex<Vec<String>>,
    behaviors: Mutex<HashMap<String, HostBehavior>>,
    emitters: Mutex<HashMap<String, broadcast::Sender<DbError>>>,
    next_client: AtomicU64,
}

impl Shared {
    fn push(&self, event: String) {
        self.log.lock().unwrap().push(event);
    }

    fn behavior(&self, host: &str) -> HostBehavior {
        self.behaviors
            .lock()
            .unwrap()
            .get(host)
            .cloned()
            .unwrap_or_default()
    }
}

/// Cloneable handle; clones share the script and the log.
#[derive(Clone, Default)]
pub struct MockDriver {
    shared: Arc<Shared>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(self, host: &str, behavior: HostBehavior) -> Self {
        self.set_host(host, behavior);
        self
    }

    pub fn set_host(&self, host: &str, behavior: HostBehavior) {
        self.shared
            .behaviors
            .lock()
            .unwrap()
            .insert(host.to_string(), behavior);
    }

    /// Everything that happened, in order.
    pub fn log(&self) -> Vec<String> {
        self.shared.log.lock().unwrap().clone()
    }

    /// Statements other than health checks, as `<host>: <sql>`.
    pub fn statements(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter_map(|event| {
                let (client, sql) = event.split_once(": ")?;
                if sql == HEALTH_CHECK {
                    return None;
                }
                let host = client.split('#').next()?;
                Some(format!("{}: {}", host, sql))
            })
            .collect()
    }

    /// Release events as `<host> release` / `<host> release(err)`.
    pub fn releases(&self) -> Vec<String> {
        self.log()
            .into_iter()
            .filter(|event| event.contains(" release"))
            .filter_map(|event| {
                let (client, kind) = event.split_once(' ')?;
                let host = client.split('#').next()?;
                Some(format!("{} {}", host, kind))
            })
            .collect()
    }

    pub fn connects(&self, host: &str) -> usize {
        let expected = format!("connect {}", host);
        self.log().iter().filter(|event| **event == expected).count()
    }

    /// How often `<host>: <sql>` ran, on any client.
    pub fn ran(&self, statement: &str) -> usize {
        self.statements().iter().filter(|s| *s == statement).count()
    }

    pub fn count(&self, event: &str) -> usize {
        self.log().iter().filter(|e| *e == event).count()
    }

    /// Raise a connectivity error event on a host's pool.
    pub fn emit_error(&self, host: &str, error: DbError) -> bool {
        let emitters = self.shared.emitters.lock().unwrap();
        emitters
            .get(host)
            .map(|sender| sender.send(error).is_ok())
            .unwrap_or(false)
    }

    pub fn clear(&self) {
        self.shared.log.lock().unwrap().clear();
    }
}

impl Driver for MockDriver {
    type Client = MockClient;
    type Pool = MockPool;

    fn create_pool(&self, options: &ConnectOptions) -> DbResult<MockPool> {
        let (events, _) = broadcast::channel(16);
        self.shared
            .emitters
            .lock()
            .unwrap()
            .insert(options.host.clone(), events.clone());
        Ok(MockPool {
            host: options.host.clone(),
            shared: Arc::clone(&self.shared),
            events,
        })
    }
}

pub struct MockPool {
    host: String,
    shared: Arc<Shared>,
    events: broadcast::Sender<DbError>,
}

#[async_trait]
impl Pool for MockPool {
    type Client = MockClient;

    async fn connect(&self) -> DbResult<MockClient> {
        self.shared.push(format!("connect {}", self.host));
        tokio::task::yield_now().await;

        match self.shared.behavior(&self.host).connect {
            ConnectBehavior::Accept => {
                let id = self.shared.next_client.fetch_add(1, Ordering::Relaxed) + 1;
                Ok(MockClient {
                    label: format!("{}#{}", self.host, id),
                    host: self.host.clone(),
                    shared: Arc::clone(&self.shared),
                })
            }
            ConnectBehavior::Refuse => Err(DbError::connectivity(
                format!("connection refused by {}", self.host),
                Some("ConnectionRefused".to_string()),
            )),
            ConnectBehavior::Reject => Err(DbError::non_connectivity(
                format!("password authentication failed on {}", self.host),
                Some("28P01".to_string()),
            )),
        }
    }

    async fn end(&self) {
        self.shared.push(format!("end {}", self.host));
    }

    fn subscribe_errors(&self) -> Option<broadcast::Receiver<DbError>> {
        Some(self.events.subscribe())
    }
}

pub struct MockClient {
    label: String,
    host: String,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for MockClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockClient")
            .field("label", &self.label)
            .field("host", &self.host)
            .finish()
    }
}

impl MockClient {
    pub fn host(&self) -> &str {
        &self.host
    }

    fn record(&self, what: &str) {
        self.shared.push(format!("{}: {}", self.label, what));
    }
}

#[async_trait]
impl Client for MockClient {
    async fn query(&mut self, query: &Query) -> DbResult<QueryResult> {
        self.record(&query.sql);
        tokio::task::yield_now().await;

        let behavior = self.shared.behavior(&self.host);
        if behavior
            .slow_sql
            .iter()
            .any(|fragment| query.sql.contains(fragment.as_str()))
        {
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        if query.sql == HEALTH_CHECK && behavior.fail_verification {
            return Err(DbError::connectivity(
                format!("connection to {} terminated", self.host),
                Some("08006".to_string()),
            ));
        }
        if behavior
            .failing_sql
            .iter()
            .any(|fragment| query.sql.contains(fragment.as_str()))
        {
            return Err(DbError::query(
                format!("statement failed on {}", self.host),
                Some("XX000".to_string()),
            ));
        }
        Ok(QueryResult::write_result(1, 0))
    }

    async fn release(self, error: Option<&DbError>) {
        let kind = if error.is_some() {
            "release(err)"
        } else {
            "release"
        };
        self.shared.push(format!("{} {}", self.label, kind));
    }
}

/// Scripted streaming operations.
pub enum MockStream {
    /// The initial submit call fails.
    FailOnStart,
    /// Finishes synchronously without a completion future.
    FinishImmediately,
    /// Ends with `rows` after `delay`.
    Complete { rows: u64, delay: Duration },
    /// Fails after `delay`.
    FailAfter { delay: Duration },
}

impl MockStream {
    pub fn complete(rows: u64) -> Self {
        Self::Complete {
            rows,
            delay: Duration::from_millis(5),
        }
    }

    pub fn fail_after_ms(ms: u64) -> Self {
        Self::FailAfter {
            delay: Duration::from_millis(ms),
        }
    }
}

impl Submittable<MockClient> for MockStream {
    fn submit<'c>(self, client: &'c mut MockClient) -> DbResult<Option<Running<'c>>> {
        match self {
            Self::FailOnStart => {
                client.record("STREAM (start failed)");
                Err(DbError::query("stream could not start", None))
            }
            Self::FinishImmediately => {
                client.record("STREAM (finished)");
                Ok(None)
            }
            Self::Complete { rows, delay } => {
                client.record("STREAM");
                Ok(Some(Box::pin(async move {
                    tokio::time::sleep(delay).await;
                    client.record("STREAM end");
                    Ok(rows)
                })))
            }
            Self::FailAfter { delay } => {
                client.record("STREAM");
                Ok(Some(Box::pin(async move {
                    tokio::time::sleep(delay).await;
                    client.record("STREAM error");
                    Err(DbError::query("stream failed", Some("57014".to_string())))
                })))
            }
        }
    }
}

pub fn instance(name: &str, hosts: &str) -> InstanceConfig {
    InstanceConfig::new(name, format!("postgres://app:secret@{}/{}", hosts, name))
        .expect("valid instance config")
}

/// A registry with one instance per `(name, hosts)` pair.
pub async fn registry(
    driver: &MockDriver,
    instances: &[(&str, &str)],
) -> InstanceRegistry<MockDriver> {
    let registry = InstanceRegistry::new(driver.clone());
    for (name, hosts) in instances {
        registry
            .register(instance(name, hosts))
            .await
            .expect("instance registers");
    }
    registry
}
