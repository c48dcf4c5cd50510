//! Known discovery endpoints (registries).
//!
//! User-registered registries marked `persisted` are written to the registry
//! file; suggested ones only live for the session. The catalog is the single
//! owner of this state and is cheap to clone.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use sha2::{Digest, Sha512};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::events::{emit, RegistryEvent, EVENT_CAPACITY};
use crate::models::Registry;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Invalid or empty registry URL")]
    InvalidUrl,
    #[error("Registry {0} already exists")]
    AlreadyExists(String),
    #[error("Registry {0} was not found")]
    NotFound(String),
}

#[derive(Default)]
struct State {
    registries: Vec<Registry>,
    suggested: Vec<Registry>,
}

struct Inner {
    path: Option<PathBuf>,
    state: Mutex<State>,
    events: broadcast::Sender<RegistryEvent>,
    write_lock: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct RegistryCatalog {
    inner: Arc<Inner>,
}

impl RegistryCatalog {
    /// Catalog backed by the registry file at `path`.
    ///
    /// A missing file means no registries yet; an unreadable one is logged and
    /// treated as empty.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let registries = read_registry_file(&path).await;
        tracing::debug!(path = %path.display(), count = registries.len(), "loaded registries");
        Self::with_state(Some(path), registries)
    }

    /// Catalog that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self::with_state(None, Vec::new())
    }

    fn with_state(path: Option<PathBuf>, registries: Vec<Registry>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                path,
                state: Mutex::new(State {
                    registries,
                    suggested: Vec::new(),
                }),
                events,
                write_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Register a registry. Registering a URL that is already registered is a
    /// no-op and returns a handle whose dispose does nothing.
    pub async fn register(&self, registry: Registry) -> Result<RegistrationHandle, RegistryError> {
        let registry = normalized(registry)?;
        {
            let mut state = self.state();
            if state.registries.iter().any(|r| r.server_url == registry.server_url) {
                tracing::debug!(registry = %registry.server_url, "registry already registered, skipping");
                return Ok(RegistrationHandle::noop());
            }
            state.registries.push(registry.clone());
        }
        if registry.persisted {
            self.save().await;
        }
        tracing::info!(
            registry = %registry.server_url,
            hash = %registry_hash(&registry.server_url),
            "registered registry"
        );
        emit(&self.inner.events, RegistryEvent::Registered(registry.clone()));
        Ok(RegistrationHandle {
            target: Some((self.clone(), Target::Registered(registry))),
        })
    }

    /// User-facing registration: fails if the URL is known, and always persists.
    pub async fn create(&self, registry: Registry) -> Result<RegistrationHandle, RegistryError> {
        let registry = normalized(registry)?.persisted();
        if self.state().registries.iter().any(|r| r.server_url == registry.server_url) {
            return Err(RegistryError::AlreadyExists(registry.server_url));
        }
        self.register(registry).await
    }

    /// Offer a registry for this session only. Idempotent on the URL.
    pub fn suggest(&self, registry: Registry) -> Result<RegistrationHandle, RegistryError> {
        let mut registry = normalized(registry)?;
        registry.suggested = true;
        registry.persisted = false;
        {
            let mut state = self.state();
            if state.suggested.iter().any(|r| r.server_url == registry.server_url) {
                return Ok(RegistrationHandle::noop());
            }
            state.suggested.push(registry.clone());
        }
        emit(&self.inner.events, RegistryEvent::Registered(registry.clone()));
        Ok(RegistrationHandle {
            target: Some((self.clone(), Target::Suggested(registry))),
        })
    }

    pub async fn unregister(&self, server_url: &str) -> Result<(), RegistryError> {
        let server_url = normalize_url(server_url);
        let removed = {
            let mut state = self.state();
            let index = state
                .registries
                .iter()
                .position(|r| r.server_url == server_url)
                .ok_or_else(|| RegistryError::NotFound(server_url.to_string()))?;
            state.registries.remove(index)
        };
        if removed.persisted {
            self.save().await;
        }
        tracing::info!(registry = %removed.server_url, "unregistered registry");
        emit(&self.inner.events, RegistryEvent::Unregistered(removed));
        Ok(())
    }

    fn unsuggest(&self, server_url: &str) {
        let removed = {
            let mut state = self.state();
            let index = state.suggested.iter().position(|r| r.server_url == server_url);
            index.map(|i| state.suggested.remove(i))
        };
        if let Some(removed) = removed {
            emit(&self.inner.events, RegistryEvent::Unregistered(removed));
        }
    }

    /// Replace the display fields of a known registry.
    pub async fn update(&self, registry: Registry) -> Result<(), RegistryError> {
        let registry = normalized(registry)?;
        let (updated, persist) = {
            let mut state = self.state();
            let State {
                registries,
                suggested,
            } = &mut *state;
            let existing = registries
                .iter_mut()
                .chain(suggested.iter_mut())
                .find(|r| r.server_url == registry.server_url)
                .ok_or_else(|| RegistryError::NotFound(registry.server_url.clone()))?;
            existing.name = registry.name;
            existing.icon = registry.icon;
            existing.alias = registry.alias;
            (existing.clone(), existing.persisted)
        };
        if persist {
            self.save().await;
        }
        emit(&self.inner.events, RegistryEvent::Updated(updated));
        Ok(())
    }

    pub fn list(&self) -> Vec<Registry> {
        self.state().registries.clone()
    }

    pub fn list_suggested(&self) -> Vec<Registry> {
        self.state().suggested.clone()
    }

    /// Registered then suggested URLs, each at most once.
    pub fn discovery_urls(&self) -> Vec<String> {
        let state = self.state();
        let mut urls: Vec<String> = Vec::new();
        for registry in state.registries.iter().chain(state.suggested.iter()) {
            if !urls.contains(&registry.server_url) {
                urls.push(registry.server_url.clone());
            }
        }
        urls
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Rewrite the registry file. Failures are logged; memory stays authoritative.
    async fn save(&self) {
        let Some(path) = self.inner.path.as_ref() else {
            return;
        };
        let _guard = self.inner.write_lock.lock().await;
        let persisted: Vec<Registry> = self
            .state()
            .registries
            .iter()
            .filter(|r| r.persisted)
            .cloned()
            .collect();
        if let Err(e) = write_registry_file(path, &persisted).await {
            tracing::warn!(path = %path.display(), error = %e, "failed to save registries");
        }
    }
}

/// SHA-512 hex digest of a registry URL, for logs and telemetry.
pub fn registry_hash(server_url: &str) -> String {
    format!("{:x}", Sha512::digest(server_url.as_bytes()))
}

enum Target {
    Registered(Registry),
    Suggested(Registry),
}

/// Undoes a registration or suggestion.
#[must_use = "dropping the handle keeps the registration; call dispose() to undo it"]
pub struct RegistrationHandle {
    target: Option<(RegistryCatalog, Target)>,
}

impl RegistrationHandle {
    fn noop() -> Self {
        Self { target: None }
    }

    pub fn is_noop(&self) -> bool {
        self.target.is_none()
    }

    pub async fn dispose(self) {
        match self.target {
            Some((catalog, Target::Registered(registry))) => {
                if let Err(e) = catalog.unregister(&registry.server_url).await {
                    tracing::debug!(error = %e, "registration already gone");
                }
            }
            Some((catalog, Target::Suggested(registry))) => catalog.unsuggest(&registry.server_url),
            None => {}
        }
    }
}

/// Canonical form of a registry URL: surrounding whitespace and trailing
/// slashes removed. Server ids are derived from this form.
pub fn normalize_url(url: &str) -> &str {
    url.trim().trim_end_matches('/')
}

fn normalized(mut registry: Registry) -> Result<Registry, RegistryError> {
    registry.server_url = normalize_url(&registry.server_url).to_string();
    if registry.server_url.is_empty() {
        return Err(RegistryError::InvalidUrl);
    }
    Ok(registry)
}

async fn read_registry_file(path: &Path) -> Vec<Registry> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read registries");
            return Vec::new();
        }
    };
    match serde_json::from_str::<Vec<Registry>>(&content) {
        Ok(registries) => registries
            .into_iter()
            .filter_map(|r| normalized(r).ok())
            .map(Registry::persisted)
            .collect(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "registry file is malformed, ignoring it");
            Vec::new()
        }
    }
}

async fn write_registry_file(path: &Path, registries: &[Registry]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let output = serde_json::to_string_pretty(registries)?;
    tokio::fs::write(path, output).await
}
