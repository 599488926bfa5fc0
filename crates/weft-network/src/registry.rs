//! Service registry collaborator.
//!
//! The overlay only needs to list services and follow add/remove events.
//! [`MemoryRegistry`] is a complete in-process implementation used by tests
//! and the node binary.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::NetworkError;

/// Watch stream buffer per subscriber.
const WATCH_BUFFER: usize = 256;

/// One registered instance of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ServiceInstance {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            metadata: BTreeMap::new(),
        }
    }
}

/// A change in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Added(ServiceInstance),
    Removed(ServiceInstance),
}

impl RegistryEvent {
    pub fn instance(&self) -> &ServiceInstance {
        match self {
            RegistryEvent::Added(instance) | RegistryEvent::Removed(instance) => instance,
        }
    }
}

/// Where services are registered.
#[async_trait]
pub trait Registry: Send + Sync + 'static {
    /// Every registered instance.
    async fn list_services(&self) -> Result<Vec<ServiceInstance>, NetworkError>;

    /// Follow add/remove events, optionally for one service name only.
    /// The stream ends when the registry goes away.
    async fn watch(
        &self,
        service: Option<&str>,
    ) -> Result<mpsc::Receiver<RegistryEvent>, NetworkError>;
}

// ── In-memory registry ──────────────────────────────────────────────────

#[derive(Default)]
struct MemoryState {
    instances: Vec<ServiceInstance>,
    watchers: Vec<(Option<String>, mpsc::Sender<RegistryEvent>)>,
}

/// In-process registry. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryRegistry {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance. Returns false if it was already present.
    pub fn register(&self, instance: ServiceInstance) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state
            .instances
            .iter()
            .any(|i| i.name == instance.name && i.address == instance.address)
        {
            return false;
        }
        state.instances.push(instance.clone());
        notify(&mut state.watchers, RegistryEvent::Added(instance));
        true
    }

    /// Remove an instance by name and address. Returns false if absent.
    pub fn deregister(&self, name: &str, address: &str) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(pos) = state
            .instances
            .iter()
            .position(|i| i.name == name && i.address == address)
        else {
            return false;
        };
        let removed = state.instances.remove(pos);
        notify(&mut state.watchers, RegistryEvent::Removed(removed));
        true
    }
}

fn notify(watchers: &mut Vec<(Option<String>, mpsc::Sender<RegistryEvent>)>, event: RegistryEvent) {
    watchers.retain(|(filter, tx)| {
        if tx.is_closed() {
            return false;
        }
        if filter
            .as_deref()
            .is_some_and(|name| name != event.instance().name)
        {
            return true;
        }
        if let Err(e) = tx.try_send(event.clone()) {
            tracing::warn!("Registry watcher lagging, dropped event: {e}");
        }
        true
    });
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn list_services(&self) -> Result<Vec<ServiceInstance>, NetworkError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state.instances.clone())
    }

    async fn watch(
        &self,
        service: Option<&str>,
    ) -> Result<mpsc::Receiver<RegistryEvent>, NetworkError> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.watchers.push((service.map(str::to_string), tx));
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_and_list() {
        let registry = MemoryRegistry::new();
        assert!(registry.register(ServiceInstance::new("echo", "10.0.0.1:9000")));
        assert!(!registry.register(ServiceInstance::new("echo", "10.0.0.1:9000")));
        let listed = registry.list_services().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "echo");
    }

    #[tokio::test]
    async fn watch_sees_adds_and_removes() {
        let registry = MemoryRegistry::new();
        let mut events = registry.watch(None).await.unwrap();

        registry.register(ServiceInstance::new("echo", "10.0.0.1:9000"));
        assert!(registry.deregister("echo", "10.0.0.1:9000"));
        assert!(!registry.deregister("echo", "10.0.0.1:9000"));

        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::Added(ServiceInstance::new("echo", "10.0.0.1:9000"))
        );
        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::Removed(ServiceInstance::new("echo", "10.0.0.1:9000"))
        );
    }

    #[tokio::test]
    async fn watch_filter_by_service() {
        let registry = MemoryRegistry::new();
        let mut events = registry.watch(Some("echo")).await.unwrap();

        registry.register(ServiceInstance::new("other", "10.0.0.2:1"));
        registry.register(ServiceInstance::new("echo", "10.0.0.1:9000"));

        let event = events.recv().await.unwrap();
        assert_eq!(event.instance().name, "echo");
        assert!(events.try_recv().is_err());
    }
}
