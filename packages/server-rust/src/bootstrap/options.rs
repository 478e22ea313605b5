use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use gantry_core::ServiceConfig;

use crate::config::InlineConfig;
use crate::lifecycle::{HookFn, LifecycleOption};
use crate::middleware::Middleware;
use crate::registry::BackendFactory;
use crate::transport::{HttpHook, HttpOption, HttpServer, RpcHook, RpcOption, RpcServer};

/// One caller-supplied startup setting. Applied in the order given.
pub enum StartupOption {
    /// Configuration file, resolved against the search root.
    ConfigFile(PathBuf),
    /// Override merged over the file configuration.
    Config(InlineConfig),
    /// Treat an unparsable inline TOML override as fatal.
    StrictMerge,
    /// Directory the candidate files are searched in.
    SearchRoot(PathBuf),
    Middleware(Arc<dyn Middleware>),
    Rpc(RpcOption),
    Http(HttpOption),
    RpcRegister(RpcHook),
    HttpRegister(HttpHook),
    Lifecycle(LifecycleOption),
    RegistryBackend { tag: String, factory: BackendFactory },
}

impl fmt::Debug for StartupOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigFile(p) => f.debug_tuple("ConfigFile").field(p).finish(),
            Self::Config(c) => f.debug_tuple("Config").field(c).finish(),
            Self::StrictMerge => f.write_str("StrictMerge"),
            Self::SearchRoot(p) => f.debug_tuple("SearchRoot").field(p).finish(),
            Self::Middleware(m) => f.debug_tuple("Middleware").field(&m.name()).finish(),
            Self::Rpc(o) => f.debug_tuple("Rpc").field(o).finish(),
            Self::Http(o) => f.debug_tuple("Http").field(o).finish(),
            Self::RpcRegister(_) => f.write_str("RpcRegister(..)"),
            Self::HttpRegister(_) => f.write_str("HttpRegister(..)"),
            Self::Lifecycle(o) => f.debug_tuple("Lifecycle").field(o).finish(),
            Self::RegistryBackend { tag, .. } => {
                f.debug_struct("RegistryBackend").field("tag", tag).finish_non_exhaustive()
            }
        }
    }
}

/// All startup options folded together.
///
/// Single-valued settings keep the last value given; list settings keep
/// every value in order.
#[derive(Default)]
pub struct StartupOptions {
    pub config_file: Option<PathBuf>,
    pub inline: Option<InlineConfig>,
    pub strict_merge: bool,
    pub search_root: Option<PathBuf>,
    pub middleware: Vec<Arc<dyn Middleware>>,
    pub rpc_options: Vec<RpcOption>,
    pub http_options: Vec<HttpOption>,
    pub rpc_hooks: Vec<RpcHook>,
    pub http_hooks: Vec<HttpHook>,
    pub lifecycle: Vec<LifecycleOption>,
    pub registry_backends: Vec<(String, BackendFactory)>,
}

impl StartupOptions {
    #[must_use]
    pub fn from_options(options: impl IntoIterator<Item = StartupOption>) -> Self {
        let mut out = Self::default();
        for option in options {
            match option {
                StartupOption::ConfigFile(path) => out.config_file = Some(path),
                StartupOption::Config(inline) => out.inline = Some(inline),
                StartupOption::StrictMerge => out.strict_merge = true,
                StartupOption::SearchRoot(root) => out.search_root = Some(root),
                StartupOption::Middleware(m) => out.middleware.push(m),
                StartupOption::Rpc(o) => out.rpc_options.push(o),
                StartupOption::Http(o) => out.http_options.push(o),
                StartupOption::RpcRegister(hook) => out.rpc_hooks.push(hook),
                StartupOption::HttpRegister(hook) => out.http_hooks.push(hook),
                StartupOption::Lifecycle(o) => out.lifecycle.push(o),
                StartupOption::RegistryBackend { tag, factory } => {
                    out.registry_backends.push((tag, factory));
                }
            }
        }
        out
    }
}

impl fmt::Debug for StartupOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartupOptions")
            .field("config_file", &self.config_file)
            .field("inline", &self.inline.is_some())
            .field("strict_merge", &self.strict_merge)
            .field("search_root", &self.search_root)
            .field("middleware", &self.middleware.iter().map(|m| m.name()).collect::<Vec<_>>())
            .field("rpc_options", &self.rpc_options)
            .field("http_options", &self.http_options)
            .field("rpc_hooks", &self.rpc_hooks.len())
            .field("http_hooks", &self.http_hooks.len())
            .field("lifecycle", &self.lifecycle)
            .field(
                "registry_backends",
                &self.registry_backends.iter().map(|(t, _)| t).collect::<Vec<_>>(),
            )
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Constructors
// ---------------------------------------------------------------------------

pub fn with_config_file(path: impl Into<PathBuf>) -> StartupOption {
    StartupOption::ConfigFile(path.into())
}

/// Typed override; takes precedence over the file.
pub fn with_config(config: ServiceConfig) -> StartupOption {
    StartupOption::Config(InlineConfig::Structured(config))
}

/// TOML override; see [`with_strict_merge`] for how parse failures are handled.
pub fn with_toml_config(text: impl Into<String>) -> StartupOption {
    StartupOption::Config(InlineConfig::Toml(text.into()))
}

pub fn with_strict_merge() -> StartupOption {
    StartupOption::StrictMerge
}

pub fn with_search_root(root: impl Into<PathBuf>) -> StartupOption {
    StartupOption::SearchRoot(root.into())
}

/// Caller middleware, run inside the built-in chain.
pub fn with_middleware(middleware: Arc<dyn Middleware>) -> StartupOption {
    StartupOption::Middleware(middleware)
}

pub fn with_rpc_option(option: RpcOption) -> StartupOption {
    StartupOption::Rpc(option)
}

pub fn with_http_option(option: HttpOption) -> StartupOption {
    StartupOption::Http(option)
}

/// Registers RPC methods once the server exists.
pub fn with_rpc_service<F>(register: F) -> StartupOption
where
    F: FnOnce(&mut RpcServer) + Send + 'static,
{
    StartupOption::RpcRegister(Box::new(register))
}

/// Registers HTTP routes once the server exists.
pub fn with_http_router<F>(register: F) -> StartupOption
where
    F: FnOnce(&mut HttpServer) + Send + 'static,
{
    StartupOption::HttpRegister(Box::new(register))
}

pub fn with_lifecycle_option(option: LifecycleOption) -> StartupOption {
    StartupOption::Lifecycle(option)
}

pub fn with_instance_id(id: impl Into<String>) -> StartupOption {
    StartupOption::Lifecycle(LifecycleOption::Id(id.into()))
}

pub fn with_instance_metadata(metadata: BTreeMap<String, String>) -> StartupOption {
    StartupOption::Lifecycle(LifecycleOption::Metadata(metadata))
}

pub fn with_registrar_timeout(timeout: Duration) -> StartupOption {
    StartupOption::Lifecycle(LifecycleOption::RegistrarTimeout(timeout))
}

pub fn with_before_start(hook: HookFn) -> StartupOption {
    StartupOption::Lifecycle(LifecycleOption::BeforeStart(hook))
}

pub fn with_after_stop(hook: HookFn) -> StartupOption {
    StartupOption::Lifecycle(LifecycleOption::AfterStop(hook))
}

/// Makes `tag` selectable in `app.discovery.type`.
pub fn with_registry_backend(tag: impl Into<String>, factory: BackendFactory) -> StartupOption {
    StartupOption::RegistryBackend {
        tag: tag.into(),
        factory,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_single_values_win_and_lists_keep_order() {
        let opts = StartupOptions::from_options([
            with_config_file("a.toml"),
            with_http_option(HttpOption::BodyLimit(1)),
            with_config_file("b.toml"),
            with_http_option(HttpOption::BodyLimit(2)),
            with_http_router(|_server| {}),
            with_http_router(|_server| {}),
        ]);
        assert_eq!(opts.config_file, Some(PathBuf::from("b.toml")));
        assert_eq!(opts.http_options.len(), 2);
        assert!(matches!(opts.http_options[1], HttpOption::BodyLimit(2)));
        assert_eq!(opts.http_hooks.len(), 2);
        assert!(!opts.strict_merge);
    }

    #[test]
    fn lifecycle_shortcuts_land_in_lifecycle_list() {
        let opts = StartupOptions::from_options([
            with_instance_id("x"),
            with_registrar_timeout(Duration::from_secs(1)),
            with_strict_merge(),
        ]);
        assert_eq!(opts.lifecycle.len(), 2);
        assert!(opts.strict_merge);
    }
}
