//! HTTP transport: an axum router whose every reply is a response [`Envelope`].
//!
//! Handlers registered through [`HttpServer::route`] see one JSON payload
//! built from the query string, then path parameters, then the JSON body.
//! The HTTP status line is always 200; the outcome is in the envelope.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{FromRequestParts, Query, RawPathParams, Request};
use axum::http::header::HeaderName;
use axum::http::{HeaderMap, Method, Uri};
use axum::routing::{on, MethodFilter};
use axum::{Json, Router};
use gantry_core::config::EndpointConfig;
use gantry_core::metadata::REQUEST_ID_HEADER;
use gantry_core::{Envelope, Metadata, Status};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tracing::{debug, info, warn};

use super::gate::ServeGate;
use super::{
    config_timeout, draining_status, endpoint_url, normalize_bind_addr, with_deadline, Server,
    TransportError, TransportKind,
};
use crate::middleware::{BoxHandler, CallContext, MiddlewareChain, Payload};

/// Request bodies larger than this are rejected unless overridden.
pub const DEFAULT_BODY_LIMIT: usize = 2 * 1024 * 1024;

/// Post-construction callback receiving the live HTTP server.
pub type HttpHook = Box<dyn FnOnce(&mut HttpServer) + Send>;

/// Programmatic HTTP settings, applied after the config values.
#[derive(Debug, Clone)]
pub enum HttpOption {
    Address(String),
    Timeout(Duration),
    BodyLimit(usize),
    /// Allowed CORS origins; `"*"` allows any. Empty disables CORS.
    CorsOrigins(Vec<String>),
}

/// Effective HTTP server settings.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub addr: String,
    pub timeout: Option<Duration>,
    pub body_limit: usize,
    pub cors_origins: Vec<String>,
}

impl HttpSettings {
    #[must_use]
    pub fn from_config(cfg: &EndpointConfig) -> Self {
        Self {
            addr: cfg.addr.trim().to_string(),
            timeout: config_timeout(cfg),
            body_limit: DEFAULT_BODY_LIMIT,
            cors_origins: Vec::new(),
        }
    }

    pub fn apply(&mut self, option: &HttpOption) {
        match option {
            HttpOption::Address(addr) => self.addr.clone_from(addr),
            HttpOption::Timeout(timeout) => self.timeout = Some(*timeout),
            HttpOption::BodyLimit(limit) => self.body_limit = *limit,
            HttpOption::CorsOrigins(origins) => self.cors_origins.clone_from(origins),
        }
    }
}

// ---------------------------------------------------------------------------
// HttpServer
// ---------------------------------------------------------------------------

/// HTTP server with deferred startup: construct, register routes, `bind()`, `serve()`.
pub struct HttpServer {
    settings: HttpSettings,
    chain: MiddlewareChain,
    routes: Router,
    raw: Router,
    gate: Arc<ServeGate>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl HttpServer {
    #[must_use]
    pub fn new(settings: HttpSettings, chain: MiddlewareChain) -> Self {
        Self {
            settings,
            chain,
            routes: Router::new(),
            raw: Router::new(),
            gate: ServeGate::new(),
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &HttpSettings {
        &self.settings
    }

    #[must_use]
    pub fn gate(&self) -> Arc<ServeGate> {
        Arc::clone(&self.gate)
    }

    /// Registers `handler` for `method` on `path` (axum syntax, e.g. `/users/{id}`).
    ///
    /// The handler is wrapped with the middleware chain; the path template is
    /// the operation name seen by middleware.
    ///
    /// # Panics
    ///
    /// Panics if the same method is registered twice for `path`.
    pub fn route(&mut self, method: MethodFilter, path: &str, handler: BoxHandler) -> &mut Self {
        let endpoint = Arc::new(RouteEndpoint {
            operation: path.to_string(),
            handler: self.chain.then(with_deadline(self.settings.timeout, handler)),
            gate: Arc::clone(&self.gate),
            body_limit: self.settings.body_limit,
        });
        let routes = std::mem::take(&mut self.routes);
        self.routes = routes.route(
            path,
            on(method, move |req: Request| {
                let endpoint = Arc::clone(&endpoint);
                async move { Json(endpoint.handle(req).await) }
            }),
        );
        self
    }

    pub fn get(&mut self, path: &str, handler: BoxHandler) -> &mut Self {
        self.route(MethodFilter::GET, path, handler)
    }

    pub fn post(&mut self, path: &str, handler: BoxHandler) -> &mut Self {
        self.route(MethodFilter::POST, path, handler)
    }

    pub fn put(&mut self, path: &str, handler: BoxHandler) -> &mut Self {
        self.route(MethodFilter::PUT, path, handler)
    }

    pub fn delete(&mut self, path: &str, handler: BoxHandler) -> &mut Self {
        self.route(MethodFilter::DELETE, path, handler)
    }

    /// Merges a plain axum router whose routes bypass the chain and envelope.
    pub fn merge_raw(&mut self, router: Router) -> &mut Self {
        let raw = std::mem::take(&mut self.raw);
        self.raw = raw.merge(router);
        self
    }

    /// Assembles the full application router.
    ///
    /// **Layer ordering (outermost to innermost):**
    /// 1. `SetRequestId` -- assigns a UUID v4 `x-request-id` when absent
    /// 2. `PropagateRequestId` -- copies `x-request-id` onto the response
    /// 3. `CORS` -- only when origins are configured
    #[must_use]
    pub fn router(&self) -> Router {
        let x_request_id = HeaderName::from_static(REQUEST_ID_HEADER);

        let mut app = Router::new()
            .merge(self.routes.clone())
            .merge(self.raw.clone())
            .method_not_allowed_fallback(method_not_allowed)
            .fallback(not_found);
        if let Some(cors) = build_cors_layer(&self.settings.cors_origins) {
            app = app.layer(cors);
        }
        app.layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
                .layer(PropagateRequestIdLayer::new(x_request_id)),
        )
    }
}

#[async_trait]
impl Server for HttpServer {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn bind(&self) -> Result<SocketAddr, TransportError> {
        let addr = normalize_bind_addr(&self.settings.addr);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| TransportError::Bind {
                kind: TransportKind::Http,
                addr: addr.clone(),
                source,
            })?;
        let local = listener.local_addr()?;
        info!(kind = "http", addr = %local, "listener bound");

        *self.listener.lock() = Some(listener);
        *self.local_addr.lock() = Some(local);
        Ok(local)
    }

    fn unbind(&self) {
        if self.listener.lock().take().is_some() {
            debug!(kind = "http", "listener released");
        }
        *self.local_addr.lock() = None;
    }

    async fn serve(&self) -> Result<(), TransportError> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or(TransportError::NotBound(TransportKind::Http))?;
        let app = self.router();

        self.gate.set_serving();
        info!(kind = "http", "serving");
        axum::serve(listener, app)
            .with_graceful_shutdown(self.gate.shutdown_signal())
            .await?;
        Ok(())
    }

    async fn stop(&self, timeout: Duration) -> bool {
        self.gate.begin_drain();
        let drained = self.gate.wait_for_drain(timeout).await;
        if drained {
            info!(kind = "http", "drained");
        } else {
            warn!(
                kind = "http",
                in_flight = self.gate.in_flight_count(),
                "drain timeout expired with calls in flight"
            );
        }
        drained
    }

    fn endpoint(&self) -> Option<String> {
        (*self.local_addr.lock()).map(|addr| endpoint_url(TransportKind::Http, addr))
    }
}

// ---------------------------------------------------------------------------
// Request handling
// ---------------------------------------------------------------------------

struct RouteEndpoint {
    operation: String,
    handler: BoxHandler,
    gate: Arc<ServeGate>,
    body_limit: usize,
}

impl RouteEndpoint {
    async fn handle(&self, req: Request) -> Envelope {
        let Some(_guard) = self.gate.try_enter() else {
            return Envelope::from_status(&draining_status());
        };
        Envelope::from(self.dispatch(req).await)
    }

    async fn dispatch(&self, req: Request) -> Result<Value, Status> {
        let (mut parts, body) = req.into_parts();

        let query = Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
            .map(|Query(q)| q)
            .map_err(|e| Status::bad_request("BAD_REQUEST", e.body_text()))?;
        let params: Vec<(String, String)> = RawPathParams::from_request_parts(&mut parts, &())
            .await
            .map(|raw| {
                raw.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        let body = axum::body::to_bytes(body, self.body_limit)
            .await
            .map_err(|e| Status::new(413, "PAYLOAD_TOO_LARGE", e.to_string()))?;

        let payload = assemble_payload(query, params, &body)?;
        let ctx = CallContext::new(TransportKind::Http, self.operation.clone())
            .with_headers(header_metadata(&parts.headers));

        self.handler.call(ctx, payload).await
    }
}

/// Query parameters, then path parameters, then the JSON body.
///
/// Object bodies are merged field by field (later sources win); any other
/// JSON body replaces the payload. An empty body adds nothing.
fn assemble_payload(
    query: HashMap<String, String>,
    params: Vec<(String, String)>,
    body: &Bytes,
) -> Result<Payload, Status> {
    let mut fields = Map::new();
    for (k, v) in query.into_iter().chain(params) {
        fields.insert(k, Value::String(v));
    }

    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(fields));
    }
    let parsed: Value = serde_json::from_slice(body)
        .map_err(|e| Status::bad_request("BAD_REQUEST", format!("invalid JSON body: {e}")))?;
    match parsed {
        Value::Object(object) => {
            fields.extend(object);
            Ok(Value::Object(fields))
        }
        other => Ok(other),
    }
}

fn header_metadata(headers: &HeaderMap) -> Metadata {
    headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v)))
        .collect()
}

async fn not_found(method: Method, uri: Uri) -> Json<Envelope> {
    Json(Envelope::from_status(&Status::not_found(
        "NOT_FOUND",
        format!("no route for {method} {}", uri.path()),
    )))
}

async fn method_not_allowed(method: Method, uri: Uri) -> Json<Envelope> {
    Json(Envelope::from_status(&Status::new(
        405,
        "METHOD_NOT_ALLOWED",
        format!("{method} not allowed on {}", uri.path()),
    )))
}

/// Builds the CORS layer from the configured list of allowed origins.
///
/// A wildcard `"*"` allows any origin. An empty list means no CORS layer.
fn build_cors_layer(origins: &[String]) -> Option<CorsLayer> {
    if origins.is_empty() {
        return None;
    }
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let parsed: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        AllowOrigin::list(parsed)
    };
    Some(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods(Any)
            .allow_headers(Any),
    )
}
