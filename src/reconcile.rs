//! Startup reconciliation of stored configurations against live connections.
//!
//! Each pass fetches fresh server details from one registry and connects every
//! stored configuration that matches, unless its server already has a running
//! connection. Configurations whose server is not listed are left in place.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::config::{ConfigStore, ConnectionConfig};
use crate::connect::ConnectionManager;
use crate::discovery::ServerLookup;
use crate::events::RegistryEvent;
use crate::factory::TransportBuilder;
use crate::registries::RegistryCatalog;

/// Outcome of one registry pass, as configuration ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<String>,
    pub already_running: Vec<String>,
    /// Stored for a server or variant this registry no longer lists.
    pub stale: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl ReconcileReport {
    fn merge(&mut self, other: ReconcileReport) {
        self.started.extend(other.started);
        self.already_running.extend(other.already_running);
        self.stale.extend(other.stale);
        self.failed.extend(other.failed);
    }
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<ConfigStore>,
    lookup: Arc<dyn ServerLookup>,
    builder: Arc<dyn TransportBuilder>,
    connections: ConnectionManager,
}

impl Reconciler {
    pub fn new(
        store: Arc<ConfigStore>,
        lookup: Arc<dyn ServerLookup>,
        builder: Arc<dyn TransportBuilder>,
        connections: ConnectionManager,
    ) -> Self {
        Self {
            store,
            lookup,
            builder,
            connections,
        }
    }

    /// Reconcile the configurations served by one registry.
    ///
    /// Never fails: discovery and storage errors are logged and produce an
    /// empty report, per-configuration errors are collected in `failed`.
    pub async fn reconcile_registry(&self, registry_url: &str) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let configs = match self.store.list().await {
            Ok(configs) => configs,
            Err(e) => {
                tracing::warn!(error = %e, "cannot read stored configurations");
                return report;
            }
        };
        if configs.is_empty() {
            return report;
        }
        tracing::debug!(registry = %registry_url, count = configs.len(), "found saved configurations");

        let servers = match self.lookup.list_registry(registry_url).await {
            Ok(servers) => servers,
            Err(e) => {
                tracing::warn!(registry = %registry_url, error = %e, "skipping reconciliation");
                return report;
            }
        };

        for config in configs {
            let config_id = config.id();
            let Some(server) = servers.iter().find(|s| s.id == config.server_id()) else {
                // Likely served by another registry.
                continue;
            };
            if !has_variant(server, &config) {
                report.stale.push(config_id);
                continue;
            }

            let _guard = self.connections.lock_server(&server.id).await;
            if self.connections.is_server_running(&server.id) {
                tracing::debug!(config_id = %config_id, "client already exists, skipping");
                report.already_running.push(config_id);
                continue;
            }

            match self.builder.build(server, &config).await {
                Ok(transport) => {
                    self.connections.insert(&config, server, transport);
                    report.started.push(config_id);
                }
                Err(e) => {
                    tracing::warn!(config_id = %config_id, error = %e, "failed to reconnect");
                    report.failed.push((config_id, e.to_string()));
                }
            }
        }

        tracing::info!(
            registry = %registry_url,
            started = report.started.len(),
            already_running = report.already_running.len(),
            stale = report.stale.len(),
            failed = report.failed.len(),
            "reconciled registry"
        );
        report
    }

    /// Reconcile every registry the catalog knows, concurrently.
    pub async fn run(&self, catalog: &RegistryCatalog) -> ReconcileReport {
        let urls = catalog.discovery_urls();
        let reports = join_all(urls.iter().map(|url| self.reconcile_registry(url))).await;
        let mut total = ReconcileReport::default();
        for report in reports {
            total.merge(report);
        }
        total
    }

    /// Reconcile each registry as it gets registered, until the catalog is dropped.
    pub fn watch(&self, catalog: &RegistryCatalog) -> JoinHandle<()> {
        let mut events = catalog.subscribe();
        let reconciler = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(RegistryEvent::Registered(registry)) => {
                        reconciler.reconcile_registry(&registry.server_url).await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "registry events lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

fn has_variant(server: &crate::models::ServerDetail, config: &ConnectionConfig) -> bool {
    match config {
        ConnectionConfig::Remote(c) => c.remote_id < server.remotes.len(),
        ConnectionConfig::Package(c) => c.package_id < server.packages.len(),
    }
}
