use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream;
use gantry_core::config::DiscoverySpec;
use gantry_core::ServiceInstance;
use tokio::sync::watch;
use tracing::debug;

use super::{BackendFactory, BackendHandle, Discovery, Registrar, RegistryError, Watcher};

/// In-process registry for tests and single-process deployments.
///
/// Not part of the default backend table; add it with
/// [`BackendTable::register`](super::BackendTable::register) and
/// [`MemoryRegistry::factory`] so every resolution shares one instance.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    services: DashMap<String, watch::Sender<Vec<ServiceInstance>>>,
}

impl MemoryRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory that hands out views of this registry regardless of the spec.
    #[must_use]
    pub fn factory(self: &Arc<Self>) -> BackendFactory {
        let shared = Arc::clone(self);
        Arc::new(move |_spec: &DiscoverySpec, _timeout: Duration| {
            Ok(BackendHandle::from_backend(Arc::clone(&shared)))
        })
    }

    /// Current instances of `name`, in registration order.
    #[must_use]
    pub fn instances(&self, name: &str) -> Vec<ServiceInstance> {
        self.services
            .get(name)
            .map(|tx| tx.borrow().clone())
            .unwrap_or_default()
    }

    fn sender(&self, name: &str) -> watch::Sender<Vec<ServiceInstance>> {
        self.services
            .entry(name.to_string())
            .or_insert_with(|| watch::channel(Vec::new()).0)
            .clone()
    }
}

#[async_trait]
impl Registrar for MemoryRegistry {
    async fn register(&self, instance: &ServiceInstance) -> Result<(), RegistryError> {
        self.sender(&instance.name).send_modify(|set| {
            match set.iter_mut().find(|i| i.id == instance.id) {
                Some(existing) => *existing = instance.clone(),
                None => set.push(instance.clone()),
            }
        });
        debug!(service = %instance.name, id = %instance.id, "registered in memory");
        Ok(())
    }

    async fn deregister(&self, instance: &ServiceInstance) -> Result<(), RegistryError> {
        self.sender(&instance.name)
            .send_if_modified(|set| {
                let before = set.len();
                set.retain(|i| i.id != instance.id);
                set.len() != before
            });
        Ok(())
    }
}

#[async_trait]
impl Discovery for MemoryRegistry {
    async fn get_service(&self, name: &str) -> Result<Vec<ServiceInstance>, RegistryError> {
        Ok(self.instances(name))
    }

    async fn watch(&self, name: &str) -> Result<Watcher, RegistryError> {
        let rx = self.sender(name).subscribe();
        let updates = stream::unfold((rx, true), |(mut rx, first)| async move {
            if !first {
                rx.changed().await.ok()?;
            }
            let snapshot = rx.borrow_and_update().clone();
            Some((snapshot, (rx, false)))
        });
        Ok(Box::pin(updates))
    }
}
