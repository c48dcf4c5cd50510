//! Persisted connection configurations.
//!
//! All configurations live in one JSON array under a single storage key. Every
//! operation is a read-modify-write of that array, serialized by a mutex so
//! that concurrent writers do not lose updates.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::storage::{SecretStorage, StorageError};

const STORAGE_KEY: &str = "configurations";

/// What the user chose when setting up a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionConfig {
    Remote(RemoteConfig),
    Package(PackageConfig),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    pub server_id: String,
    pub remote_id: usize,
    /// Header name to value. Values override the remote's declared inputs.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageConfig {
    pub server_id: String,
    pub package_id: usize,
    /// Argument index to value.
    #[serde(default)]
    pub runtime_arguments: BTreeMap<usize, String>,
    #[serde(default)]
    pub package_arguments: BTreeMap<usize, String>,
    /// Variable name to value.
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
}

/// Which connection variant of a server a configuration targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    Remote(usize),
    Package(usize),
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Remote(i) => write!(f, "remote:{}", i),
            Variant::Package(i) => write!(f, "package:{}", i),
        }
    }
}

impl std::str::FromStr for Variant {
    type Err = String;

    /// Parses `remote:<n>` or `package:<n>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, index) = s
            .split_once(':')
            .ok_or_else(|| format!("Invalid variant '{}': expected remote:<n> or package:<n>", s))?;
        let index: usize = index
            .parse()
            .map_err(|_| format!("Invalid variant index '{}'", index))?;
        match kind {
            "remote" => Ok(Variant::Remote(index)),
            "package" => Ok(Variant::Package(index)),
            _ => Err(format!("Unknown variant kind '{}'", kind)),
        }
    }
}

impl ConnectionConfig {
    pub fn server_id(&self) -> &str {
        match self {
            ConnectionConfig::Remote(c) => &c.server_id,
            ConnectionConfig::Package(c) => &c.server_id,
        }
    }

    pub fn variant(&self) -> Variant {
        match self {
            ConnectionConfig::Remote(c) => Variant::Remote(c.remote_id),
            ConnectionConfig::Package(c) => Variant::Package(c.package_id),
        }
    }

    /// Stable id of the configuration, `<serverId>:<variant>`.
    pub fn id(&self) -> String {
        config_id(self.server_id(), self.variant())
    }

    fn matches(&self, server_id: &str, variant: Variant) -> bool {
        self.server_id() == server_id && self.variant() == variant
    }

    /// Header and environment values, the places credentials are kept.
    pub fn credential_values(&self) -> Vec<&str> {
        let values = match self {
            ConnectionConfig::Remote(c) => c.headers.values(),
            ConnectionConfig::Package(c) => c.environment_variables.values(),
        };
        values.map(String::as_str).collect()
    }
}

pub fn config_id(server_id: &str, variant: Variant) -> String {
    format!("{}:{}", server_id, variant)
}

#[derive(Debug, Error)]
pub enum ConfigStoreError {
    #[error("Configuration not found for server {server_id} ({variant})")]
    NotFound { server_id: String, variant: Variant },
    #[error("Stored configurations are unreadable: {0}")]
    Corrupted(serde_json::Error),
    #[error("Failed to serialize configurations: {0}")]
    Serialize(serde_json::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Encrypted-at-rest store of [`ConnectionConfig`]s.
pub struct ConfigStore {
    storage: Arc<dyn SecretStorage>,
    write_lock: Mutex<()>,
}

impl ConfigStore {
    pub fn new(storage: Arc<dyn SecretStorage>) -> Self {
        Self {
            storage,
            write_lock: Mutex::new(()),
        }
    }

    /// Adds a configuration, replacing any existing one for the same server and variant.
    pub async fn add(&self, config: ConnectionConfig) -> Result<(), ConfigStoreError> {
        let _guard = self.write_lock.lock().await;
        let mut configs = self.read_all().await?;
        let (server_id, variant) = (config.server_id().to_string(), config.variant());
        configs.retain(|c| !c.matches(&server_id, variant));
        tracing::debug!(server_id = %server_id, variant = %variant, "saving configuration");
        configs.push(config);
        self.write_all(&configs).await
    }

    pub async fn get(&self, server_id: &str, variant: Variant) -> Result<ConnectionConfig, ConfigStoreError> {
        let _guard = self.write_lock.lock().await;
        self.read_all()
            .await?
            .into_iter()
            .find(|c| c.matches(server_id, variant))
            .ok_or_else(|| ConfigStoreError::NotFound {
                server_id: server_id.to_string(),
                variant,
            })
    }

    /// Deletes a configuration. Returns whether one was removed.
    pub async fn delete(&self, server_id: &str, variant: Variant) -> Result<bool, ConfigStoreError> {
        let _guard = self.write_lock.lock().await;
        let mut configs = self.read_all().await?;
        let before = configs.len();
        configs.retain(|c| !c.matches(server_id, variant));
        if configs.len() == before {
            return Ok(false);
        }
        self.write_all(&configs).await?;
        Ok(true)
    }

    pub async fn list(&self) -> Result<Vec<ConnectionConfig>, ConfigStoreError> {
        let _guard = self.write_lock.lock().await;
        self.read_all().await
    }

    /// Stored headers of a remote configuration.
    pub async fn credentials(
        &self,
        server_id: &str,
        remote_id: usize,
    ) -> Result<BTreeMap<String, String>, ConfigStoreError> {
        match self.get(server_id, Variant::Remote(remote_id)).await? {
            ConnectionConfig::Remote(c) => Ok(c.headers),
            ConnectionConfig::Package(_) => Err(ConfigStoreError::NotFound {
                server_id: server_id.to_string(),
                variant: Variant::Remote(remote_id),
            }),
        }
    }

    async fn read_all(&self) -> Result<Vec<ConnectionConfig>, ConfigStoreError> {
        match self.storage.get(STORAGE_KEY).await? {
            Some(raw) => serde_json::from_str(&raw).map_err(ConfigStoreError::Corrupted),
            None => Ok(Vec::new()),
        }
    }

    async fn write_all(&self, configs: &[ConnectionConfig]) -> Result<(), ConfigStoreError> {
        let raw = serde_json::to_string(configs).map_err(ConfigStoreError::Serialize)?;
        self.storage.store(STORAGE_KEY, &raw).await?;
        Ok(())
    }
}
