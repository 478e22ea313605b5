//! Service registry integration.
//!
//! A backend publishes this process as a [`ServiceInstance`] ([`Registrar`])
//! and looks up peers ([`Discovery`]). Backends are chosen by the tag in
//! `app.discovery.type` through a [`BackendTable`].

pub mod consul;
pub mod etcd;
pub mod memory;

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::Stream;
use gantry_core::config::DiscoverySpec;
use gantry_core::constants::DEFAULT_REGISTRY_TIMEOUT_SECS;
use gantry_core::duration::parse_positive_timeout;
use gantry_core::ServiceInstance;
use thiserror::Error;
use tracing::debug;

pub use consul::ConsulRegistry;
pub use etcd::EtcdRegistry;
pub use memory::MemoryRegistry;

/// Backend tag reserved for a registry that is not available yet.
pub const RESERVED_NACOS: &str = "nacos";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid discovery configuration: {0}")]
    Configuration(String),

    #[error("unsupported registry type: {0}")]
    UnsupportedBackend(String),

    #[error("{0} registry not implemented yet")]
    NotImplemented(String),

    #[error("failed to create {backend} client: {reason}")]
    Connection { backend: String, reason: String },

    #[error("{backend} request failed: {reason}")]
    Request { backend: String, reason: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Stream of instance sets; each item is the complete current set.
pub type Watcher = Pin<Box<dyn Stream<Item = Vec<ServiceInstance>> + Send>>;

/// Publishes and withdraws service instances.
#[async_trait]
pub trait Registrar: Send + Sync {
    async fn register(&self, instance: &ServiceInstance) -> Result<(), RegistryError>;

    async fn deregister(&self, instance: &ServiceInstance) -> Result<(), RegistryError>;
}

/// Looks up instances of other services.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn get_service(&self, name: &str) -> Result<Vec<ServiceInstance>, RegistryError>;

    /// Emits the current set first, then every change.
    async fn watch(&self, name: &str) -> Result<Watcher, RegistryError>;
}

/// Both capability views of one backend connection.
#[derive(Clone)]
pub struct BackendHandle {
    pub registrar: Arc<dyn Registrar>,
    pub discovery: Arc<dyn Discovery>,
}

impl BackendHandle {
    pub fn from_backend<T>(backend: Arc<T>) -> Self
    where
        T: Registrar + Discovery + 'static,
    {
        let registrar: Arc<dyn Registrar> = Arc::clone(&backend) as Arc<dyn Registrar>;
        let discovery: Arc<dyn Discovery> = backend;
        Self {
            registrar,
            discovery,
        }
    }
}

impl fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendHandle").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// BackendTable
// ---------------------------------------------------------------------------

/// Builds a backend from its discovery settings and connection timeout.
pub type BackendFactory =
    Arc<dyn Fn(&DiscoverySpec, Duration) -> Result<BackendHandle, RegistryError> + Send + Sync>;

#[derive(Clone)]
enum Entry {
    Factory(BackendFactory),
    Reserved,
}

/// Capabilities resolved from one discovery spec.
#[derive(Clone, Default)]
pub struct Resolved {
    pub registrar: Option<Arc<dyn Registrar>>,
    pub discovery: Option<Arc<dyn Discovery>>,
}

impl fmt::Debug for Resolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolved")
            .field("registrar", &self.registrar.is_some())
            .field("discovery", &self.discovery.is_some())
            .finish()
    }
}

/// Registry backends by type tag.
///
/// Tags are matched case-insensitively. A reserved tag is known but has no
/// implementation, so selecting it fails with [`RegistryError::NotImplemented`].
pub struct BackendTable {
    entries: DashMap<String, Entry>,
}

impl BackendTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// `etcd` and `consul`, with `nacos` reserved.
    #[must_use]
    pub fn with_defaults() -> Self {
        let table = Self::new();
        table.register(etcd::BACKEND, Arc::new(etcd::factory));
        table.register(consul::BACKEND, Arc::new(consul::factory));
        table.reserve(RESERVED_NACOS);
        table
    }

    /// Adds or replaces the factory for `tag`.
    pub fn register(&self, tag: &str, factory: BackendFactory) {
        self.entries.insert(normalize_tag(tag), Entry::Factory(factory));
    }

    pub fn reserve(&self, tag: &str) {
        self.entries.insert(normalize_tag(tag), Entry::Reserved);
    }

    /// Known tags, sorted.
    #[must_use]
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        tags.sort();
        tags
    }

    /// Registrar for `spec`, if registration is enabled.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Configuration`] when registration is enabled without
    /// endpoints, otherwise whatever backend selection or construction reports.
    pub fn resolve_registrar(
        &self,
        spec: Option<&DiscoverySpec>,
    ) -> Result<Option<Arc<dyn Registrar>>, RegistryError> {
        let Some(spec) = spec.filter(|s| s.register) else {
            return Ok(None);
        };
        require_endpoints(spec)?;
        Ok(Some(self.construct(spec)?.registrar))
    }

    /// Discovery client for `spec`, if endpoints are configured.
    ///
    /// # Errors
    ///
    /// Backend selection or construction failures.
    pub fn resolve_discovery(
        &self,
        spec: Option<&DiscoverySpec>,
    ) -> Result<Option<Arc<dyn Discovery>>, RegistryError> {
        let Some(spec) = spec.filter(|s| !s.endpoints.is_empty()) else {
            return Ok(None);
        };
        Ok(Some(self.construct(spec)?.discovery))
    }

    /// Both capabilities over a single backend connection.
    ///
    /// # Errors
    ///
    /// Same as [`Self::resolve_registrar`] and [`Self::resolve_discovery`].
    pub fn resolve(&self, spec: Option<&DiscoverySpec>) -> Result<Resolved, RegistryError> {
        let Some(spec) = spec else {
            return Ok(Resolved::default());
        };
        if spec.register {
            require_endpoints(spec)?;
        }
        if spec.endpoints.is_empty() {
            return Ok(Resolved::default());
        }
        let handle = self.construct(spec)?;
        Ok(Resolved {
            registrar: spec.register.then(|| Arc::clone(&handle.registrar)),
            discovery: Some(handle.discovery),
        })
    }

    fn construct(&self, spec: &DiscoverySpec) -> Result<BackendHandle, RegistryError> {
        let tag = normalize_tag(&spec.backend);
        // Clone out of the map so the factory runs without holding a shard lock.
        let entry = self.entries.get(&tag).map(|e| e.value().clone());
        match entry {
            Some(Entry::Factory(factory)) => {
                let timeout = connect_timeout(spec);
                debug!(backend = %tag, endpoints = ?spec.endpoints, ?timeout, "constructing registry backend");
                factory(spec, timeout)
            }
            Some(Entry::Reserved) => Err(RegistryError::NotImplemented(tag)),
            None => Err(RegistryError::UnsupportedBackend(spec.backend.clone())),
        }
    }
}

impl Default for BackendTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for BackendTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendTable")
            .field("tags", &self.tags())
            .finish()
    }
}

/// `discovery.timeout` if positive, else 5 s.
#[must_use]
pub fn connect_timeout(spec: &DiscoverySpec) -> Duration {
    parse_positive_timeout(&spec.timeout)
        .unwrap_or(Duration::from_secs(DEFAULT_REGISTRY_TIMEOUT_SECS))
}

fn require_endpoints(spec: &DiscoverySpec) -> Result<(), RegistryError> {
    if spec.endpoints.is_empty() {
        return Err(RegistryError::Configuration(
            "endpoints cannot be empty when register is enabled".to_string(),
        ));
    }
    Ok(())
}

fn normalize_tag(tag: &str) -> String {
    tag.trim().to_ascii_lowercase()
}

/// Parses a registry endpoint, accepting bare `host:port`.
pub(crate) fn endpoint_url(backend: &str, endpoint: &str) -> Result<reqwest::Url, RegistryError> {
    let raw = endpoint.trim();
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("http://{raw}")
    };
    reqwest::Url::parse(&with_scheme).map_err(|e| RegistryError::Connection {
        backend: backend.to_string(),
        reason: format!("invalid endpoint {raw:?}: {e}"),
    })
}

pub(crate) fn http_client(backend: &str, timeout: Duration) -> Result<reqwest::Client, RegistryError> {
    reqwest::Client::builder()
        .connect_timeout(timeout)
        .build()
        .map_err(|e| RegistryError::Connection {
            backend: backend.to_string(),
            reason: e.to_string(),
        })
}
