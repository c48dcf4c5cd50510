//! Running connections and the setup flow.
//!
//! A running connection exists only in memory. It is created by setup or by
//! reconciliation, and removed when its transport closes or it is stopped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, OwnedMutexGuard};

use crate::config::{ConfigStore, ConfigStoreError, ConnectionConfig, Variant};
use crate::discovery::{DiscoveryError, ServerLookup};
use crate::events::{emit, ConnectionEvent, EVENT_CAPACITY};
use crate::factory::{FactoryError, TransportBuilder};
use crate::models::ServerDetail;
use crate::registries::RegistryCatalog;
use crate::transport::{wait_closed, Transport};

#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Factory(#[from] FactoryError),
    #[error(transparent)]
    Store(#[from] ConfigStoreError),
    #[error("Connection {0} is not running")]
    NotRunning(String),
}

#[derive(Debug)]
pub struct RunningConnection {
    pub config_id: String,
    pub server_id: String,
    pub server_name: String,
    pub transport: Transport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Running,
    Stopped,
}

/// One persisted configuration and whether it is live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigStatus {
    pub config_id: String,
    pub server_id: String,
    pub variant: String,
    pub status: Status,
}

struct ManagerInner {
    connections: Mutex<HashMap<String, Arc<RunningConnection>>>,
    server_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    events: broadcast::Sender<ConnectionEvent>,
}

/// Table of running connections, keyed by configuration id.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ManagerInner {
                connections: Mutex::new(HashMap::new()),
                server_locks: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    /// Serializes check-then-create sequences for one server.
    pub async fn lock_server(&self, server_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = lock(&self.inner.server_locks);
            Arc::clone(locks.entry(server_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    pub fn is_server_running(&self, server_id: &str) -> bool {
        lock(&self.inner.connections)
            .values()
            .any(|c| c.server_id == server_id)
    }

    pub fn is_running(&self, config_id: &str) -> bool {
        lock(&self.inner.connections).contains_key(config_id)
    }

    pub fn get(&self, config_id: &str) -> Option<Arc<RunningConnection>> {
        lock(&self.inner.connections).get(config_id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<RunningConnection>> {
        let mut all: Vec<_> = lock(&self.inner.connections).values().cloned().collect();
        all.sort_by(|a, b| a.config_id.cmp(&b.config_id));
        all
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Track a live transport. The entry is dropped when the transport closes.
    pub fn insert(&self, config: &ConnectionConfig, server: &ServerDetail, transport: Transport) -> Arc<RunningConnection> {
        let connection = Arc::new(RunningConnection {
            config_id: config.id(),
            server_id: server.id.clone(),
            server_name: server.name.clone(),
            transport,
        });
        let closed = connection.transport.close_watch();

        let replaced = lock(&self.inner.connections).insert(connection.config_id.clone(), Arc::clone(&connection));
        if let Some(old) = replaced {
            tracing::debug!(config_id = %old.config_id, "replacing running connection");
            tokio::spawn(async move { old.transport.close().await });
        }

        tracing::info!(
            config_id = %connection.config_id,
            server = %connection.server_name,
            transport = connection.transport.kind(),
            "connection started"
        );
        emit(
            &self.inner.events,
            ConnectionEvent::Started {
                config_id: connection.config_id.clone(),
                server_id: connection.server_id.clone(),
            },
        );

        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let watched = Arc::downgrade(&connection);
        let (config_id, server_id) = (connection.config_id.clone(), connection.server_id.clone());
        tokio::spawn(async move {
            let reason = wait_closed(closed).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            {
                let mut connections = lock(&inner.connections);
                if connections
                    .get(&config_id)
                    .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), watched.as_ptr()))
                {
                    connections.remove(&config_id);
                }
            }
            tracing::info!(config_id = %config_id, reason = %reason, "connection stopped");
            emit(
                &inner.events,
                ConnectionEvent::Stopped {
                    config_id,
                    server_id,
                    reason: reason.to_string(),
                },
            );
        });

        connection
    }

    /// Close a running connection. Returns false if it was not running.
    pub async fn stop(&self, config_id: &str) -> bool {
        let connection = lock(&self.inner.connections).get(config_id).cloned();
        match connection {
            Some(connection) => {
                connection.transport.close().await;
                let mut connections = lock(&self.inner.connections);
                if connections.get(config_id).is_some_and(|c| Arc::ptr_eq(c, &connection)) {
                    connections.remove(config_id);
                }
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        for connection in self.list() {
            self.stop(&connection.config_id).await;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Setup, start, stop and removal of server connections.
pub struct ConnectionService {
    catalog: RegistryCatalog,
    lookup: Arc<dyn ServerLookup>,
    builder: Arc<dyn TransportBuilder>,
    store: Arc<ConfigStore>,
    connections: ConnectionManager,
}

impl ConnectionService {
    pub fn new(
        catalog: RegistryCatalog,
        lookup: Arc<dyn ServerLookup>,
        builder: Arc<dyn TransportBuilder>,
        store: Arc<ConfigStore>,
        connections: ConnectionManager,
    ) -> Self {
        Self {
            catalog,
            lookup,
            builder,
            store,
            connections,
        }
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    /// Resolve a server across every known registry.
    pub async fn find_server(&self, server_id: &str) -> Result<ServerDetail, SetupError> {
        Ok(self
            .lookup
            .find_server(&self.catalog.discovery_urls(), server_id)
            .await?)
    }

    /// Connect to a server and persist the configuration.
    ///
    /// Nothing is stored unless the transport came up. Returns the configuration id.
    pub async fn setup(&self, config: ConnectionConfig) -> Result<String, SetupError> {
        let server = self.find_server(config.server_id()).await?;
        let _guard = self.connections.lock_server(&server.id).await;

        let transport = self.builder.build(&server, &config).await?;
        let connection = self.connections.insert(&config, &server, transport);

        if let Err(e) = self.store.add(config).await {
            self.connections.stop(&connection.config_id).await;
            return Err(e.into());
        }
        Ok(connection.config_id.clone())
    }

    /// Connect a stored configuration. Already-running configurations are left alone.
    pub async fn start(&self, server_id: &str, variant: Variant) -> Result<String, SetupError> {
        let config = self.store.get(server_id, variant).await?;
        let config_id = config.id();
        let _guard = self.connections.lock_server(server_id).await;
        if self.connections.is_running(&config_id) {
            return Ok(config_id);
        }
        let server = self.find_server(server_id).await?;
        let transport = self.builder.build(&server, &config).await?;
        self.connections.insert(&config, &server, transport);
        Ok(config_id)
    }

    pub async fn stop(&self, config_id: &str) -> Result<(), SetupError> {
        if self.connections.stop(config_id).await {
            Ok(())
        } else {
            Err(SetupError::NotRunning(config_id.to_string()))
        }
    }

    /// Stop the connection if running and delete its configuration.
    pub async fn remove(&self, server_id: &str, variant: Variant) -> Result<(), SetupError> {
        let config_id = crate::config::config_id(server_id, variant);
        let was_running = self.connections.stop(&config_id).await;
        let deleted = self.store.delete(server_id, variant).await?;
        if !deleted && !was_running {
            return Err(ConfigStoreError::NotFound {
                server_id: server_id.to_string(),
                variant,
            }
            .into());
        }
        tracing::info!(config_id = %config_id, "configuration removed");
        Ok(())
    }

    /// Every stored configuration with its running state.
    pub async fn statuses(&self) -> Result<Vec<ConfigStatus>, SetupError> {
        let configs = self.store.list().await?;
        Ok(configs
            .iter()
            .map(|config| {
                let config_id = config.id();
                let status = if self.connections.is_running(&config_id) {
                    Status::Running
                } else {
                    Status::Stopped
                };
                ConfigStatus {
                    config_id,
                    server_id: config.server_id().to_string(),
                    variant: config.variant().to_string(),
                    status,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use crate::config::RemoteConfig;
    use crate::transport::HttpTransport;

    fn server() -> ServerDetail {
        ServerDetail {
            id: "srv".to_string(),
            registry_url: "https://r.example".to_string(),
            name: "io.example/srv".to_string(),
            description: String::new(),
            version: "1".to_string(),
            remotes: vec![],
            packages: vec![],
            meta: Default::default(),
            valid_schema: true,
        }
    }

    fn config() -> ConnectionConfig {
        ConnectionConfig::Remote(RemoteConfig {
            server_id: "srv".to_string(),
            remote_id: 0,
            headers: BTreeMap::new(),
        })
    }

    fn transport() -> Transport {
        Transport::StreamableHttp(
            HttpTransport::new("http://127.0.0.1:1/mcp", &BTreeMap::new(), Duration::from_secs(1)).unwrap(),
        )
    }

    #[tokio::test]
    async fn stop_removes_and_emits() {
        let manager = ConnectionManager::new();
        let mut events = manager.subscribe();

        manager.insert(&config(), &server(), transport());
        assert!(manager.is_server_running("srv"));
        assert!(manager.is_running("srv:remote:0"));

        assert!(manager.stop("srv:remote:0").await);
        assert!(!manager.is_running("srv:remote:0"));
        assert!(!manager.stop("srv:remote:0").await);

        assert!(matches!(events.recv().await.unwrap(), ConnectionEvent::Started { .. }));
        match events.recv().await.unwrap() {
            ConnectionEvent::Stopped { config_id, reason, .. } => {
                assert_eq!(config_id, "srv:remote:0");
                assert_eq!(reason, "closed");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn reinsert_replaces_and_closes_old_transport() {
        let manager = ConnectionManager::new();
        let first = manager.insert(&config(), &server(), transport());
        let second = manager.insert(&config(), &server(), transport());

        first.transport.closed().await;
        assert_eq!(manager.list().len(), 1);
        assert!(Arc::ptr_eq(&manager.get("srv:remote:0").unwrap(), &second));
    }

    #[tokio::test]
    async fn server_lock_is_exclusive() {
        let manager = ConnectionManager::new();
        let guard = manager.lock_server("srv").await;
        let other = manager.clone();
        let waiter = tokio::spawn(async move {
            let _g = other.lock_server("srv").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }
}
