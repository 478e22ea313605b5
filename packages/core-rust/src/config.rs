//! Service configuration schema, built-in defaults and override merging.
//!
//! Every section is `#[serde(default)]`: unknown keys are ignored and missing
//! keys take the zero value of their type. [`ServiceConfig::default`] is that
//! zero value (an "override" with nothing set); [`ServiceConfig::defaults`] is
//! the built-in baseline a service starts from.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_HTTP_ADDR, DEFAULT_LOG_LEVEL, DEFAULT_LOG_OUTPUT, DEFAULT_RPC_ADDR,
    DEFAULT_STOP_TIMEOUT, DEFAULT_VERSION,
};

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Complete configuration of one service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerSection,
    pub middleware: MiddlewareFlags,
    pub app: AppMeta,
    pub log: LogSpec,
}

/// Transport bind settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// RPC transport. Also accepted under the key `grpc`.
    #[serde(alias = "grpc")]
    pub rpc: EndpointConfig,
    pub http: EndpointConfig,
}

/// Bind address and per-call timeout of one transport.
///
/// An empty `addr` disables the transport. `timeout` is a duration string
/// (`"30s"`, `"1m"`); anything unparsable means "no explicit timeout".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub addr: String,
    pub timeout: String,
}

impl EndpointConfig {
    /// Whether a transport should be built for this endpoint.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.addr.trim().is_empty()
    }
}

/// Switches for the optional built-in middleware.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiddlewareFlags {
    pub enable_tracing: bool,
    pub enable_metrics: bool,
    /// Prometheus scrape address. Empty means no exporter is started.
    pub metrics_addr: String,
}

/// Application identity and lifecycle settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppMeta {
    pub version: String,
    pub stop_timeout: String,
    pub metadata: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discovery: Option<DiscoverySpec>,
}

/// Service registry settings.
///
/// With `register = true` the endpoint list must be non-empty; this is
/// checked when the registrar is resolved, not at parse time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySpec {
    /// Backend tag (`"etcd"`, `"consul"`, ...).
    #[serde(rename = "type")]
    pub backend: String,
    pub register: bool,
    pub endpoints: Vec<String>,
    pub timeout: String,
}

/// Log sink settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSpec {
    /// `stdout`, `stderr`, or a file path.
    pub output: String,
    pub level: String,
}

impl ServiceConfig {
    /// The built-in baseline: RPC on `:9000`, HTTP on `:8000`, version
    /// `v1.0.0`, a 10 s stop window and `info` logging to `logs/app.log`.
    #[must_use]
    pub fn defaults() -> Self {
        Self {
            server: ServerSection {
                rpc: EndpointConfig {
                    addr: DEFAULT_RPC_ADDR.to_string(),
                    timeout: String::new(),
                },
                http: EndpointConfig {
                    addr: DEFAULT_HTTP_ADDR.to_string(),
                    timeout: String::new(),
                },
            },
            middleware: MiddlewareFlags::default(),
            app: AppMeta {
                version: DEFAULT_VERSION.to_string(),
                stop_timeout: DEFAULT_STOP_TIMEOUT.to_string(),
                metadata: BTreeMap::new(),
                discovery: None,
            },
            log: LogSpec {
                output: DEFAULT_LOG_OUTPUT.to_string(),
                level: DEFAULT_LOG_LEVEL.to_string(),
            },
        }
    }

    /// Returns a copy of `self` with `overrides` merged on top.
    #[must_use]
    pub fn merged(&self, overrides: &ServiceConfig) -> Self {
        let mut out = self.clone();
        out.merge_from(overrides);
        out
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// Override-style deep merge.
///
/// Set values in `other` replace those in `self`: non-empty strings, `true`
/// booleans, non-empty lists, individual map entries and present optional
/// sections (merged recursively). Zero values in `other` leave `self`
/// untouched, so a zero override cannot clear a field. Merging the same
/// override twice is a no-op the second time.
pub trait Merge {
    fn merge_from(&mut self, other: &Self);
}

impl Merge for String {
    fn merge_from(&mut self, other: &Self) {
        if !other.is_empty() {
            self.clone_from(other);
        }
    }
}

impl Merge for bool {
    fn merge_from(&mut self, other: &Self) {
        if *other {
            *self = true;
        }
    }
}

impl<T: Clone> Merge for Vec<T> {
    fn merge_from(&mut self, other: &Self) {
        if !other.is_empty() {
            self.clone_from(other);
        }
    }
}

impl<V: Clone> Merge for BTreeMap<String, V> {
    fn merge_from(&mut self, other: &Self) {
        for (k, v) in other {
            self.insert(k.clone(), v.clone());
        }
    }
}

impl<T: Merge + Clone> Merge for Option<T> {
    fn merge_from(&mut self, other: &Self) {
        match (self.as_mut(), other) {
            (Some(mine), Some(theirs)) => mine.merge_from(theirs),
            (None, Some(theirs)) => *self = Some(theirs.clone()),
            (_, None) => {}
        }
    }
}

impl Merge for ServiceConfig {
    fn merge_from(&mut self, other: &Self) {
        self.server.merge_from(&other.server);
        self.middleware.merge_from(&other.middleware);
        self.app.merge_from(&other.app);
        self.log.merge_from(&other.log);
    }
}

impl Merge for ServerSection {
    fn merge_from(&mut self, other: &Self) {
        self.rpc.merge_from(&other.rpc);
        self.http.merge_from(&other.http);
    }
}

impl Merge for EndpointConfig {
    fn merge_from(&mut self, other: &Self) {
        self.addr.merge_from(&other.addr);
        self.timeout.merge_from(&other.timeout);
    }
}

impl Merge for MiddlewareFlags {
    fn merge_from(&mut self, other: &Self) {
        self.enable_tracing.merge_from(&other.enable_tracing);
        self.enable_metrics.merge_from(&other.enable_metrics);
        self.metrics_addr.merge_from(&other.metrics_addr);
    }
}

impl Merge for AppMeta {
    fn merge_from(&mut self, other: &Self) {
        self.version.merge_from(&other.version);
        self.stop_timeout.merge_from(&other.stop_timeout);
        self.metadata.merge_from(&other.metadata);
        self.discovery.merge_from(&other.discovery);
    }
}

impl Merge for DiscoverySpec {
    fn merge_from(&mut self, other: &Self) {
        self.backend.merge_from(&other.backend);
        self.register.merge_from(&other.register);
        self.endpoints.merge_from(&other.endpoints);
        self.timeout.merge_from(&other.timeout);
    }
}

impl Merge for LogSpec {
    fn merge_from(&mut self, other: &Self) {
        self.output.merge_from(&other.output);
        self.level.merge_from(&other.level);
    }
}
