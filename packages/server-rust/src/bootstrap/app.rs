use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use gantry_core::ServiceConfig;
use tracing::{info, warn, Instrument};

use super::options::{StartupOption, StartupOptions};
use crate::config::ConfigLoader;
use crate::error::BootError;
use crate::lifecycle::{self, RunnableApp};
use crate::logging::{init_logging, ServiceLogger};
use crate::middleware::metrics::install_prometheus_exporter;
use crate::middleware::{build_chain, MiddlewareChain};
use crate::registry::{BackendTable, Discovery};
use crate::transport::{build_http_server, build_rpc_server, Server};

/// A fully assembled service.
pub struct App {
    config: Arc<ServiceConfig>,
    logger: ServiceLogger,
    chain: MiddlewareChain,
    lifecycle: RunnableApp,
    discovery: Option<Arc<dyn Discovery>>,
    metrics_addr: Option<SocketAddr>,
}

impl App {
    /// Assembles `service` from its configuration and `options`.
    ///
    /// Nothing is bound or registered yet; that happens in [`App::run`].
    ///
    /// # Errors
    ///
    /// [`BootError::Config`] for unreadable or invalid configuration and
    /// [`BootError::Registry`] for an unusable discovery section.
    pub async fn initialize(service: &str, options: Vec<StartupOption>) -> Result<Self, BootError> {
        let opts = StartupOptions::from_options(options);

        let loader = opts
            .search_root
            .clone()
            .map_or_else(ConfigLoader::new, ConfigLoader::with_root)
            .strict_merge(opts.strict_merge);
        let loaded = loader.load(service, opts.config_file.as_deref(), opts.inline.as_ref())?;

        let logger = init_logging(service, &loaded.config.log);
        let root = logger.root_span();
        for warning in &loaded.warnings {
            warn!(parent: &root, warning = %warning, "configuration warning");
        }
        let config = Arc::new(loaded.config);

        let metrics_addr = if config.middleware.enable_metrics
            && !config.middleware.metrics_addr.trim().is_empty()
        {
            match install_prometheus_exporter(&config.middleware.metrics_addr) {
                Ok(addr) => {
                    info!(parent: &root, addr = %addr, "prometheus exporter listening");
                    Some(addr)
                }
                Err(reason) => {
                    warn!(parent: &root, reason = %reason, "prometheus exporter not started");
                    None
                }
            }
        } else {
            None
        };

        let chain = build_chain(&config.middleware, opts.middleware);

        let mut servers: Vec<Arc<dyn Server>> = Vec::new();
        if let Some(rpc) =
            build_rpc_server(&config.server.rpc, &chain, &opts.rpc_options, opts.rpc_hooks)
        {
            servers.push(Arc::new(rpc));
        }
        if let Some(http) =
            build_http_server(&config.server.http, &chain, &opts.http_options, opts.http_hooks)
        {
            servers.push(Arc::new(http));
        }

        let backends = BackendTable::with_defaults();
        for (tag, factory) in opts.registry_backends {
            backends.register(&tag, factory);
        }
        let resolved = backends.resolve(config.app.discovery.as_ref())?;

        let lifecycle = lifecycle::assemble(
            service,
            Arc::clone(&config),
            servers,
            resolved.registrar,
            opts.lifecycle,
        );
        info!(
            parent: &root,
            source = ?loaded.source,
            middleware = ?chain.names(),
            servers = ?lifecycle.servers().iter().map(|s| s.kind().as_str()).collect::<Vec<_>>(),
            registrar = lifecycle.has_registrar(),
            discovery = resolved.discovery.is_some(),
            "service assembled"
        );

        Ok(Self {
            config,
            logger,
            chain,
            lifecycle,
            discovery: resolved.discovery,
            metrics_addr,
        })
    }

    #[must_use]
    pub fn config(&self) -> &Arc<ServiceConfig> {
        &self.config
    }

    #[must_use]
    pub fn logger(&self) -> &ServiceLogger {
        &self.logger
    }

    #[must_use]
    pub fn middleware(&self) -> &MiddlewareChain {
        &self.chain
    }

    #[must_use]
    pub fn lifecycle(&self) -> &RunnableApp {
        &self.lifecycle
    }

    /// Discovery client for calling other services, when endpoints are configured.
    #[must_use]
    pub fn discovery(&self) -> Option<Arc<dyn Discovery>> {
        self.discovery.clone()
    }

    #[must_use]
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_addr
    }

    /// Runs until SIGINT or SIGTERM.
    ///
    /// # Errors
    ///
    /// See [`RunnableApp::run_until`].
    pub async fn run(&self) -> Result<(), BootError> {
        self.lifecycle.run().instrument(self.logger.root_span()).await
    }

    /// Runs until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// See [`RunnableApp::run_until`].
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), BootError>
    where
        F: Future<Output = ()> + Send,
    {
        self.lifecycle
            .run_until(shutdown)
            .instrument(self.logger.root_span())
            .await
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("lifecycle", &self.lifecycle)
            .field("middleware", &self.chain)
            .field("discovery", &self.discovery.is_some())
            .finish_non_exhaustive()
    }
}
