//! Network transports sharing one middleware chain.
//!
//! Every transport follows the same two-phase protocol:
//! 1. `build_*_server()` -- applies config then options, runs registration hooks
//! 2. `Server::bind()` -- binds the listener and reports the bound address
//! 3. `Server::serve()` -- accepts calls until `Server::stop()` begins draining

pub mod gate;
pub mod http;
pub mod rpc;

use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gantry_core::config::EndpointConfig;
use gantry_core::duration::parse_positive_timeout;
use gantry_core::Status;
use thiserror::Error;
use tracing::debug;

use crate::middleware::{BoxHandler, CallContext, CallResult, Handler, MiddlewareChain, Payload};

pub use gate::{GateState, InFlightGuard, ServeGate};
pub use http::{HttpHook, HttpOption, HttpServer, HttpSettings};
pub use rpc::{RpcClient, RpcHook, RpcOption, RpcServer, RpcSettings};

/// Reason carried by calls rejected while a server drains.
pub const REASON_DRAINING: &str = "SERVER_DRAINING";

/// Reason carried by calls that exceed the transport timeout.
pub const REASON_TIMEOUT: &str = "TIMEOUT";

// ---------------------------------------------------------------------------
// TransportKind
// ---------------------------------------------------------------------------

/// Which transport a call arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Rpc,
    Http,
}

impl TransportKind {
    /// Label used in logs, metrics and endpoint URLs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rpc => "rpc",
            Self::Http => "http",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure of a transport outside a single call.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{kind} server failed to bind {addr}: {source}")]
    Bind {
        kind: TransportKind,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} server was not bound before serving")]
    NotBound(TransportKind),

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Server trait
// ---------------------------------------------------------------------------

/// A network-facing server driven by the lifecycle manager.
#[async_trait]
pub trait Server: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Binds the listener. Bind failures surface here, before anything is served.
    async fn bind(&self) -> Result<SocketAddr, TransportError>;

    /// Releases a bound listener that will not be served.
    fn unbind(&self);

    /// Serves until [`Server::stop`] is called or a fatal I/O error occurs.
    async fn serve(&self) -> Result<(), TransportError>;

    /// Stops accepting calls and waits up to `timeout` for in-flight calls.
    /// Returns `true` if everything drained.
    async fn stop(&self, timeout: Duration) -> bool;

    /// Advertised endpoint URL, available once bound.
    fn endpoint(&self) -> Option<String>;
}

// ---------------------------------------------------------------------------
// Factories
// ---------------------------------------------------------------------------

/// Builds the RPC server, or `None` when the configured address is empty.
///
/// Settings come from `cfg` first, then `options` in order (later wins).
/// `hooks` run last, in order, against the live server.
#[must_use]
pub fn build_rpc_server(
    cfg: &EndpointConfig,
    chain: &MiddlewareChain,
    options: &[RpcOption],
    hooks: Vec<RpcHook>,
) -> Option<RpcServer> {
    if !cfg.is_enabled() {
        debug!("rpc transport disabled by empty address");
        return None;
    }
    let mut settings = RpcSettings::from_config(cfg);
    for option in options {
        settings.apply(option);
    }
    let mut server = RpcServer::new(settings, chain.clone());
    for hook in hooks {
        hook(&mut server);
    }
    Some(server)
}

/// Builds the HTTP server, or `None` when the configured address is empty.
///
/// Same ordering rules as [`build_rpc_server`].
#[must_use]
pub fn build_http_server(
    cfg: &EndpointConfig,
    chain: &MiddlewareChain,
    options: &[HttpOption],
    hooks: Vec<HttpHook>,
) -> Option<HttpServer> {
    if !cfg.is_enabled() {
        debug!("http transport disabled by empty address");
        return None;
    }
    let mut settings = HttpSettings::from_config(cfg);
    for option in options {
        settings.apply(option);
    }
    let mut server = HttpServer::new(settings, chain.clone());
    for hook in hooks {
        hook(&mut server);
    }
    Some(server)
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Timeout from a config string; unparsable or zero means none.
pub(crate) fn config_timeout(cfg: &EndpointConfig) -> Option<Duration> {
    parse_positive_timeout(&cfg.timeout)
}

/// Expands the `":port"` shorthand to an all-interfaces address.
#[must_use]
pub fn normalize_bind_addr(addr: &str) -> String {
    let addr = addr.trim();
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

/// `<scheme>://<host>:<port>` for a bound address. An unspecified IP is
/// replaced by the host's outbound IP, or loopback if that cannot be found.
#[must_use]
pub fn endpoint_url(kind: TransportKind, addr: SocketAddr) -> String {
    let ip = if addr.ip().is_unspecified() {
        outbound_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
    } else {
        addr.ip()
    };
    format!("{}://{}", kind.as_str(), SocketAddr::new(ip, addr.port()))
}

// Connecting a UDP socket sends no packets; it only selects a route.
fn outbound_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket
        .local_addr()
        .ok()
        .map(|a| a.ip())
        .filter(|ip| !ip.is_unspecified())
}

/// Bounds `handler` by `timeout`. Transports apply this beneath the chain,
/// so every middleware layer observes the `504 TIMEOUT` outcome.
pub(crate) fn with_deadline(timeout: Option<Duration>, handler: BoxHandler) -> BoxHandler {
    match timeout {
        Some(limit) => Arc::new(Deadline {
            limit,
            inner: handler,
        }),
        None => handler,
    }
}

struct Deadline {
    limit: Duration,
    inner: BoxHandler,
}

#[async_trait]
impl Handler for Deadline {
    async fn call(&self, ctx: CallContext, payload: Payload) -> CallResult {
        call_with_timeout(Some(self.limit), self.inner.call(ctx, payload)).await
    }
}

/// Runs a call, bounded by `timeout` when one is set.
pub(crate) async fn call_with_timeout(
    timeout: Option<Duration>,
    call: impl Future<Output = CallResult>,
) -> CallResult {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
            Err(Status::gateway_timeout(
                REASON_TIMEOUT,
                format!("call exceeded {}ms", limit.as_millis()),
            ))
        }),
        None => call.await,
    }
}

pub(crate) fn draining_status() -> Status {
    Status::unavailable(REASON_DRAINING, "server is shutting down")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn empty_address_disables_transport() {
        let cfg = EndpointConfig {
            addr: "   ".into(),
            timeout: "1s".into(),
        };
        let chain = MiddlewareChain::default();
        assert!(build_http_server(&cfg, &chain, &[], Vec::new()).is_none());
        assert!(build_rpc_server(&cfg, &chain, &[], Vec::new()).is_none());
    }

    #[test]
    fn config_then_options_in_order() {
        let cfg = EndpointConfig {
            addr: ":8000".into(),
            timeout: "soon".into(),
        };
        let options = [
            HttpOption::Address("127.0.0.1:0".into()),
            HttpOption::Timeout(Duration::from_secs(1)),
            HttpOption::Timeout(Duration::from_secs(2)),
        ];
        let server =
            build_http_server(&cfg, &MiddlewareChain::default(), &options, Vec::new()).unwrap();
        assert_eq!(server.settings().addr, "127.0.0.1:0");
        assert_eq!(server.settings().timeout, Some(Duration::from_secs(2)));
    }

    #[test]
    fn unparsable_timeout_means_none() {
        let cfg = EndpointConfig {
            addr: ":9000".into(),
            timeout: "forever".into(),
        };
        let server = build_rpc_server(&cfg, &MiddlewareChain::default(), &[], Vec::new()).unwrap();
        assert_eq!(server.settings().timeout, None);
    }

    #[test]
    fn hooks_run_in_registration_order() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut hooks: Vec<RpcHook> = Vec::new();
        for i in 0..3 {
            let seen = Arc::clone(&seen);
            let calls = Arc::clone(&calls);
            hooks.push(Box::new(move |_server: &mut RpcServer| {
                calls.fetch_add(1, Ordering::SeqCst);
                seen.lock().push(i);
            }));
        }
        let cfg = EndpointConfig {
            addr: ":9000".into(),
            timeout: String::new(),
        };
        build_rpc_server(&cfg, &MiddlewareChain::default(), &[], hooks).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn bind_addr_shorthand() {
        assert_eq!(normalize_bind_addr(":9000"), "0.0.0.0:9000");
        assert_eq!(normalize_bind_addr("127.0.0.1:80"), "127.0.0.1:80");
    }

    #[test]
    fn endpoint_url_keeps_specific_ip() {
        let addr: SocketAddr = "10.1.2.3:8000".parse().unwrap();
        assert_eq!(endpoint_url(TransportKind::Http, addr), "http://10.1.2.3:8000");
    }

    #[test]
    fn endpoint_url_replaces_unspecified_ip() {
        let addr: SocketAddr = "0.0.0.0:9000".parse().unwrap();
        let url = endpoint_url(TransportKind::Rpc, addr);
        assert!(url.starts_with("rpc://"));
        assert!(url.ends_with(":9000"));
        assert!(!url.contains("0.0.0.0"));
    }

    #[tokio::test]
    async fn deadline_sits_beneath_the_chain() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let chain = MiddlewareChain::new(vec![crate::middleware::from_fn("observer", {
            let seen = Arc::clone(&seen);
            move |ctx, payload, next: crate::middleware::Next| {
                let seen = Arc::clone(&seen);
                async move {
                    let result = next.run(ctx, payload).await;
                    if let Err(status) = &result {
                        seen.lock().push((status.code, status.reason.clone()));
                    }
                    result
                }
            }
        })]);
        let slow = crate::middleware::handler_fn(|_ctx, _payload| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(serde_json::Value::Null)
        });
        let handler = chain.then(with_deadline(Some(Duration::from_millis(10)), slow));

        let ctx = CallContext::new(TransportKind::Rpc, "/slow/Call");
        let status = handler.call(ctx, Payload::Null).await.unwrap_err();
        assert_eq!(status.code, 504);
        assert_eq!(*seen.lock(), vec![(504, REASON_TIMEOUT.to_string())]);
    }

    #[tokio::test]
    async fn timeout_maps_to_gateway_timeout() {
        let result = call_with_timeout(Some(Duration::from_millis(10)), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(serde_json::Value::Null)
        })
        .await;
        let status = result.unwrap_err();
        assert_eq!(status.code, 504);
        assert_eq!(status.reason, REASON_TIMEOUT);
    }
}
