//! Runs assembled servers as one process: bind, serve, register, wait for
//! a shutdown trigger, then drain, deregister and return.

pub mod signals;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{join_all, select_all, BoxFuture};
use futures_util::FutureExt;
use gantry_core::constants::{DEFAULT_STOP_TIMEOUT, DEFAULT_VERSION};
use gantry_core::duration::parse_positive_timeout;
use gantry_core::{ServiceConfig, ServiceInstance};
use parking_lot::Mutex;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};

pub use signals::shutdown_signal;

use crate::error::BootError;
use crate::registry::{Registrar, RegistryError};
use crate::transport::{Server, TransportError, TransportKind};

/// Bound on `register` when no [`LifecycleOption::RegistrarTimeout`] is given.
pub const DEFAULT_REGISTRAR_TIMEOUT: Duration = Duration::from_secs(10);

/// How long serve loops get to return after their server stopped.
const SERVE_EXIT_GRACE: Duration = Duration::from_secs(1);

type ServeTask = (TransportKind, JoinHandle<Result<(), TransportError>>);

// ---------------------------------------------------------------------------
// Hooks and options
// ---------------------------------------------------------------------------

/// Lifecycle callback.
pub type HookFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wraps an async closure as a [`HookFn`].
pub fn hook<F, Fut>(f: F) -> HookFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    BeforeStart,
    AfterStart,
    BeforeStop,
    AfterStop,
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BeforeStart => "before-start",
            Self::AfterStart => "after-start",
            Self::BeforeStop => "before-stop",
            Self::AfterStop => "after-stop",
        })
    }
}

/// Per-application settings beyond the configuration file.
#[derive(Clone)]
pub enum LifecycleOption {
    /// Instance id; a random UUID otherwise.
    Id(String),
    /// Extra instance metadata, merged over `app.metadata`.
    Metadata(BTreeMap<String, String>),
    /// Advertised endpoints, replacing the ones derived from bound servers.
    Endpoints(Vec<String>),
    RegistrarTimeout(Duration),
    BeforeStart(HookFn),
    AfterStart(HookFn),
    BeforeStop(HookFn),
    AfterStop(HookFn),
}

impl fmt::Debug for LifecycleOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => f.debug_tuple("Id").field(id).finish(),
            Self::Metadata(m) => f.debug_tuple("Metadata").field(m).finish(),
            Self::Endpoints(e) => f.debug_tuple("Endpoints").field(e).finish(),
            Self::RegistrarTimeout(t) => f.debug_tuple("RegistrarTimeout").field(t).finish(),
            Self::BeforeStart(_) => f.write_str("BeforeStart(..)"),
            Self::AfterStart(_) => f.write_str("AfterStart(..)"),
            Self::BeforeStop(_) => f.write_str("BeforeStop(..)"),
            Self::AfterStop(_) => f.write_str("AfterStop(..)"),
        }
    }
}

#[derive(Default)]
struct Hooks {
    before_start: Vec<HookFn>,
    after_start: Vec<HookFn>,
    before_stop: Vec<HookFn>,
    after_stop: Vec<HookFn>,
}

// ---------------------------------------------------------------------------
// RunnableApp
// ---------------------------------------------------------------------------

/// A fully assembled service, ready to run once.
pub struct RunnableApp {
    id: String,
    name: String,
    version: String,
    metadata: BTreeMap<String, String>,
    endpoints: Option<Vec<String>>,
    stop_timeout: Duration,
    registrar_timeout: Duration,
    servers: Vec<Arc<dyn Server>>,
    registrar: Option<Arc<dyn Registrar>>,
    hooks: Hooks,
    instance: Mutex<Option<ServiceInstance>>,
}

/// Aggregates servers and the optional registrar into a [`RunnableApp`].
///
/// The version falls back to `v1.0.0`; a missing, zero or unparsable
/// `app.stop_timeout` means 10 seconds.
#[must_use]
pub fn assemble(
    service: &str,
    config: Arc<ServiceConfig>,
    servers: Vec<Arc<dyn Server>>,
    registrar: Option<Arc<dyn Registrar>>,
    options: Vec<LifecycleOption>,
) -> RunnableApp {
    let version = if config.app.version.trim().is_empty() {
        DEFAULT_VERSION.to_string()
    } else {
        config.app.version.clone()
    };
    let stop_timeout = parse_positive_timeout(&config.app.stop_timeout)
        .or_else(|| parse_positive_timeout(DEFAULT_STOP_TIMEOUT))
        .unwrap_or(Duration::from_secs(10));

    let mut app = RunnableApp {
        id: uuid::Uuid::new_v4().to_string(),
        name: service.to_string(),
        version,
        metadata: config.app.metadata.clone(),
        endpoints: None,
        stop_timeout,
        registrar_timeout: DEFAULT_REGISTRAR_TIMEOUT,
        servers,
        registrar,
        hooks: Hooks::default(),
        instance: Mutex::new(None),
    };
    for option in options {
        match option {
            LifecycleOption::Id(id) => app.id = id,
            LifecycleOption::Metadata(extra) => app.metadata.extend(extra),
            LifecycleOption::Endpoints(endpoints) => app.endpoints = Some(endpoints),
            LifecycleOption::RegistrarTimeout(timeout) => app.registrar_timeout = timeout,
            LifecycleOption::BeforeStart(h) => app.hooks.before_start.push(h),
            LifecycleOption::AfterStart(h) => app.hooks.after_start.push(h),
            LifecycleOption::BeforeStop(h) => app.hooks.before_stop.push(h),
            LifecycleOption::AfterStop(h) => app.hooks.after_stop.push(h),
        }
    }
    app
}

impl RunnableApp {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    #[must_use]
    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    #[must_use]
    pub fn servers(&self) -> &[Arc<dyn Server>] {
        &self.servers
    }

    #[must_use]
    pub fn has_registrar(&self) -> bool {
        self.registrar.is_some()
    }

    /// The published instance, available once every server is bound.
    #[must_use]
    pub fn instance(&self) -> Option<ServiceInstance> {
        self.instance.lock().clone()
    }

    /// Runs until SIGINT or SIGTERM. Signal handlers are in place before the
    /// first bind, so a signal during startup still leads to a graceful stop.
    ///
    /// # Errors
    ///
    /// See [`RunnableApp::run_until`].
    pub async fn run(&self) -> Result<(), BootError> {
        let shutdown = shutdown_signal();
        self.run_until(shutdown).await
    }

    /// Runs until `shutdown` resolves or a server exits on its own.
    ///
    /// A bind failure returns immediately without registering. Once serving
    /// has begun, shutdown always drains servers and deregisters; the first
    /// error encountered is returned afterwards.
    ///
    /// # Errors
    ///
    /// Hook failures, bind failures, registration failures and servers that
    /// exit before shutdown was requested.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<(), BootError>
    where
        F: Future<Output = ()> + Send,
    {
        run_hooks(HookStage::BeforeStart, &self.hooks.before_start).await?;

        let mut endpoints = Vec::with_capacity(self.servers.len());
        for (index, server) in self.servers.iter().enumerate() {
            if let Err(e) = server.bind().await {
                for bound in &self.servers[..index] {
                    bound.unbind();
                }
                return Err(e.into());
            }
            if let Some(endpoint) = server.endpoint() {
                endpoints.push(endpoint);
            }
        }
        let instance = self.build_instance(endpoints);
        *self.instance.lock() = Some(instance.clone());

        let mut serving: Vec<ServeTask> = self
            .servers
            .iter()
            .map(|server| {
                let server = Arc::clone(server);
                (server.kind(), tokio::spawn(async move { server.serve().await }))
            })
            .collect();
        info!(
            id = %instance.id,
            version = %instance.version,
            endpoints = ?instance.endpoints,
            "service started"
        );

        let mut outcome = Ok(());
        let mut registered = false;
        if let Some(registrar) = &self.registrar {
            match tokio::time::timeout(self.registrar_timeout, registrar.register(&instance)).await {
                Ok(Ok(())) => registered = true,
                Ok(Err(e)) => outcome = Err(BootError::from(e)),
                Err(_) => {
                    outcome = Err(BootError::from(RegistryError::Timeout {
                        operation: "register".to_string(),
                        after: self.registrar_timeout,
                    }));
                }
            }
        }
        if outcome.is_ok() {
            outcome = run_hooks(HookStage::AfterStart, &self.hooks.after_start).await;
        }

        if outcome.is_ok() {
            tokio::pin!(shutdown);
            let exited = {
                let first_exit = async {
                    if serving.is_empty() {
                        return std::future::pending().await;
                    }
                    let (joined, index, _) =
                        select_all(serving.iter_mut().map(|(_, task)| task)).await;
                    (index, joined)
                };
                tokio::select! {
                    () = &mut shutdown => {
                        info!("shutdown requested");
                        None
                    }
                    exit = first_exit => Some(exit),
                }
            };
            if let Some((index, joined)) = exited {
                let (kind, _) = serving.swap_remove(index);
                let err = server_exited(kind, joined);
                error!(error = %err, "server stopped on its own, shutting down");
                outcome = Err(err);
            }
        }

        let before_stop = run_hooks(HookStage::BeforeStop, &self.hooks.before_stop).await;
        self.stop_servers(serving).await;

        let mut deregistered = Ok(());
        if registered {
            if let Some(registrar) = &self.registrar {
                deregistered = match tokio::time::timeout(
                    self.registrar_timeout,
                    registrar.deregister(&instance),
                )
                .await
                {
                    Ok(result) => result.map_err(BootError::from),
                    Err(_) => Err(BootError::from(RegistryError::Timeout {
                        operation: "deregister".to_string(),
                        after: self.registrar_timeout,
                    })),
                };
                if let Err(e) = &deregistered {
                    warn!(error = %e, "deregistration failed");
                }
            }
        }

        let after_stop = run_hooks(HookStage::AfterStop, &self.hooks.after_stop).await;
        info!(id = %instance.id, "service stopped");
        outcome.and(before_stop).and(deregistered).and(after_stop)
    }

    async fn stop_servers(&self, mut serving: Vec<ServeTask>) {
        let drained = join_all(self.servers.iter().map(|s| s.stop(self.stop_timeout))).await;
        if drained.iter().any(|d| !d) {
            warn!(stop_timeout = ?self.stop_timeout, "not every server drained before the stop timeout");
        }

        let settled = tokio::time::timeout(
            SERVE_EXIT_GRACE,
            join_all(serving.iter_mut().map(|(_, task)| task)),
        )
        .await;
        match settled {
            Ok(results) => {
                for ((kind, _), result) in serving.iter().zip(results) {
                    if let Ok(Err(e)) = result {
                        warn!(kind = %kind, error = %e, "serve loop ended with an error");
                    }
                }
            }
            Err(_) => {
                warn!("aborting serve loops still running after stop");
                for (_, task) in &serving {
                    task.abort();
                }
            }
        }
    }

    fn build_instance(&self, bound: Vec<String>) -> ServiceInstance {
        ServiceInstance {
            id: self.id.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
            metadata: self.metadata.clone(),
            endpoints: self.endpoints.clone().unwrap_or(bound),
        }
    }
}

impl fmt::Debug for RunnableApp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnableApp")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("version", &self.version)
            .field("servers", &self.servers.iter().map(|s| s.kind()).collect::<Vec<_>>())
            .field("registrar", &self.registrar.is_some())
            .finish_non_exhaustive()
    }
}

async fn run_hooks(stage: HookStage, hooks: &[HookFn]) -> Result<(), BootError> {
    for hook in hooks {
        hook().await.map_err(|error| {
            error!(stage = %stage, error = %error, "lifecycle hook failed");
            BootError::Hook { stage, error }
        })?;
    }
    Ok(())
}

fn server_exited(kind: TransportKind, joined: Result<Result<(), TransportError>, JoinError>) -> BootError {
    let reason = match joined {
        Ok(Ok(())) => "serve loop returned".to_string(),
        Ok(Err(e)) => e.to_string(),
        Err(e) if e.is_panic() => "serve loop panicked".to_string(),
        Err(e) => e.to_string(),
    };
    BootError::ServerExited { kind, reason }
}
