//! Durable key-value blob storage with encryption at rest.
//!
//! Callers own the encoding of their values; the storage only sees strings.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::crypto::{Cipher, CryptoError};

/// Namespace for keys owned by this crate.
const CORE_PREFIX: &str = "core";

#[async_trait]
pub trait SecretStorage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn store(&self, key: &str, value: &str) -> Result<(), StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// All keys currently stored.
    async fn keys(&self) -> Result<Vec<String>, StorageError>;
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to read secret storage {}: {}", .path.display(), .source)]
    ReadFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to write secret storage {}: {}", .path.display(), .source)]
    WriteFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to serialize secret storage: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Secret {key}: {source}")]
    Crypto { key: String, source: CryptoError },
}

/// Encrypted JSON file mapping `core.<key>` to base64(nonce || ciphertext).
///
/// The whole file is rewritten on every change.
pub struct EncryptedFileStorage {
    path: PathBuf,
    cipher: Cipher,
    data: Mutex<BTreeMap<String, String>>,
}

impl EncryptedFileStorage {
    /// Open (or create) the store at `path`.
    ///
    /// A file that is not valid JSON is copied to `<path>.backup-<ts>` and the
    /// store starts empty.
    pub async fn open(path: impl Into<PathBuf>, cipher: Cipher) -> Result<Self, StorageError> {
        let path = path.into();
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(content) => match serde_json::from_str::<BTreeMap<String, String>>(&content) {
                Ok(data) => data,
                Err(e) => {
                    let backup = backup_path(&path);
                    tracing::warn!(
                        path = %path.display(),
                        backup = %backup.display(),
                        error = %e,
                        "secret storage is corrupted, starting empty"
                    );
                    tokio::fs::copy(&path, &backup)
                        .await
                        .map_err(|source| StorageError::WriteFailed {
                            path: backup.clone(),
                            source,
                        })?;
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(StorageError::ReadFailed { path, source }),
        };

        Ok(Self {
            path,
            cipher,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, data: &BTreeMap<String, String>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StorageError::WriteFailed {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        let output = serde_json::to_string(data)?;
        tokio::fs::write(&self.path, output)
            .await
            .map_err(|source| StorageError::WriteFailed {
                path: self.path.clone(),
                source,
            })
    }
}

#[async_trait]
impl SecretStorage for EncryptedFileStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let data = self.data.lock().await;
        match data.get(&namespaced(key)) {
            Some(encrypted) => self
                .cipher
                .decrypt(encrypted)
                .map(Some)
                .map_err(|source| StorageError::Crypto {
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    async fn store(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let encrypted = self.cipher.encrypt(value).map_err(|source| StorageError::Crypto {
            key: key.to_string(),
            source,
        })?;
        let mut data = self.data.lock().await;
        data.insert(namespaced(key), encrypted);
        self.flush(&data).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut data = self.data.lock().await;
        if data.remove(&namespaced(key)).is_some() {
            self.flush(&data).await?;
        }
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let data = self.data.lock().await;
        Ok(data
            .keys()
            .filter_map(|k| k.strip_prefix(CORE_PREFIX).and_then(|k| k.strip_prefix('.')))
            .map(String::from)
            .collect())
    }
}

/// Process-local storage. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.data.lock().await.get(key).cloned())
    }

    async fn store(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.data.lock().await.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.data.lock().await.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys: Vec<_> = self.data.lock().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

fn namespaced(key: &str) -> String {
    format!("{}.{}", CORE_PREFIX, key)
}

fn backup_path(path: &Path) -> PathBuf {
    let ts = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".backup-{}", ts));
    PathBuf::from(name)
}
