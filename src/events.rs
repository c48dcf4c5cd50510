//! Events exposed to UI and telemetry collaborators.

use tokio::sync::broadcast;

use crate::models::Registry;

/// Capacity of every event channel. Slow subscribers lag rather than block.
pub const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered(Registry),
    Updated(Registry),
    Unregistered(Registry),
}

impl RegistryEvent {
    pub fn registry(&self) -> &Registry {
        match self {
            RegistryEvent::Registered(r) | RegistryEvent::Updated(r) | RegistryEvent::Unregistered(r) => r,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Started { config_id: String, server_id: String },
    Stopped { config_id: String, server_id: String, reason: String },
}

/// Send without caring whether anyone listens.
pub(crate) fn emit<T: Clone>(tx: &broadcast::Sender<T>, event: T) {
    if tx.send(event).is_err() {
        tracing::trace!("event dropped: no subscribers");
    }
}
