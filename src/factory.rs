//! Builds transports from a discovered server and a stored configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{ConnectionConfig, PackageConfig, RemoteConfig};
use crate::models::{Remote, RemoteType, ServerDetail};
use crate::spawn::{PackageSpawner, SpawnError};
use crate::template::{self, TemplateError};
use crate::transport::{HttpTransport, Transport, TransportError};

#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("Server {server_id} has no remote with index {index}")]
    RemoteNotFound { server_id: String, index: usize },
    #[error("Server {server_id} has no package with index {index}")]
    PackageNotFound { server_id: String, index: usize },
    #[error("Remote type '{0}' is not supported")]
    UnsupportedRemote(&'static str),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Seam between connection bookkeeping and transport construction.
#[async_trait]
pub trait TransportBuilder: Send + Sync {
    async fn build(&self, server: &ServerDetail, config: &ConnectionConfig) -> Result<Transport, FactoryError>;
}

pub struct TransportFactory {
    spawner: PackageSpawner,
    connect_timeout: Duration,
}

impl TransportFactory {
    pub fn new(spawner: PackageSpawner, connect_timeout: Duration) -> Self {
        Self {
            spawner,
            connect_timeout,
        }
    }

    async fn build_remote(&self, server: &ServerDetail, config: &RemoteConfig) -> Result<Transport, FactoryError> {
        let remote = server
            .remotes
            .get(config.remote_id)
            .ok_or_else(|| FactoryError::RemoteNotFound {
                server_id: server.id.clone(),
                index: config.remote_id,
            })?;

        // SSE remotes share the HTTP client.
        if remote.kind == RemoteType::Unknown {
            return Err(FactoryError::UnsupportedRemote(remote.kind.as_str()));
        }

        let headers = resolve_headers(remote, &config.headers)?;
        tracing::debug!(
            server_id = %server.id,
            url = %remote.url,
            headers = ?headers.keys().collect::<Vec<_>>(),
            "connecting to remote"
        );
        let transport = HttpTransport::connect(&remote.url, &headers, self.connect_timeout).await?;
        Ok(Transport::StreamableHttp(transport))
    }

    async fn build_package(&self, server: &ServerDetail, config: &PackageConfig) -> Result<Transport, FactoryError> {
        let package = server
            .packages
            .get(config.package_id)
            .ok_or_else(|| FactoryError::PackageNotFound {
                server_id: server.id.clone(),
                index: config.package_id,
            })?;
        let transport = self.spawner.spawn(package, config).await?;
        Ok(Transport::Stdio(transport))
    }
}

#[async_trait]
impl TransportBuilder for TransportFactory {
    async fn build(&self, server: &ServerDetail, config: &ConnectionConfig) -> Result<Transport, FactoryError> {
        match config {
            ConnectionConfig::Remote(remote) => self.build_remote(server, remote).await,
            ConnectionConfig::Package(package) => self.build_package(server, package).await,
        }
    }
}

/// Resolve the remote's declared headers, with stored values taking precedence.
///
/// Stored headers the remote does not declare are sent as-is. A header named
/// `Bearer` is sent as `Authorization: Bearer <value>`.
pub fn resolve_headers(
    remote: &Remote,
    stored: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, TemplateError> {
    let mut headers = BTreeMap::new();
    for input in &remote.headers {
        let Some(name) = input.name.as_deref() else {
            continue;
        };
        let value = stored.get(name).map(String::as_str);
        if let Some(resolved) = template::resolve_input(input, value)? {
            headers.insert(name.to_string(), resolved);
        }
    }
    for (name, value) in stored {
        if !headers.contains_key(name) && !value.is_empty() {
            headers.insert(name.clone(), value.clone());
        }
    }

    if let Some(token) = headers.remove("Bearer") {
        headers.insert("Authorization".to_string(), format!("Bearer {}", token));
    }
    Ok(headers)
}
