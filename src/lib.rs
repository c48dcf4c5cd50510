//! mcpreg - MCP registry client
//!
//! Discovers servers in MCP registries, stores connection configurations
//! encrypted at rest, and keeps their transports running.

pub mod config;
pub mod connect;
pub mod crypto;
pub mod discovery;
pub mod events;
pub mod factory;
pub mod logging;
pub mod models;
pub mod paths;
pub mod reconcile;
pub mod redact;
pub mod registries;
pub mod settings;
pub mod spawn;
pub mod storage;
pub mod template;
pub mod transport;
pub mod validation;

pub use config::{ConfigStore, ConnectionConfig, PackageConfig, RemoteConfig, Variant};
pub use connect::{ConfigStatus, ConnectionManager, ConnectionService, RunningConnection, SetupError, Status};
pub use discovery::{DiscoveryClient, DiscoveryError, ServerLookup};
pub use events::{ConnectionEvent, RegistryEvent};
pub use factory::{TransportBuilder, TransportFactory};
pub use models::{Registry, ServerDetail, ServerList};
pub use paths::Paths;
pub use reconcile::{ReconcileReport, Reconciler};
pub use redact::SecretRedactor;
pub use registries::{RegistrationHandle, RegistryCatalog, RegistryError};
pub use settings::Settings;
pub use storage::{EncryptedFileStorage, MemoryStorage, SecretStorage};
pub use transport::{CloseReason, Transport};
