//! Transport-independent call pipeline.
//!
//! A call is a [`CallContext`] plus a JSON [`Payload`]; a [`Handler`] turns it
//! into a [`CallResult`]. A [`Middleware`] wraps a handler in another handler.
//! The [`MiddlewareChain`] built by [`build_chain`] is applied identically to
//! every handler registered on every transport.

pub mod context;
pub mod logging;
pub mod metadata;
pub mod metrics;
pub mod recovery;
pub mod trace;

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use gantry_core::config::MiddlewareFlags;
use gantry_core::Status;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use context::{CallContext, TraceContext};
pub use logging::RequestLogging;
pub use metadata::MetadataPropagation;
pub use metrics::RequestMetrics;
pub use recovery::Recovery;
pub use trace::Tracing;

/// Request and response body of every call.
pub type Payload = serde_json::Value;

/// Outcome of a call.
pub type CallResult = Result<Payload, Status>;

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Terminal or wrapped call processor.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, ctx: CallContext, payload: Payload) -> CallResult;
}

/// Shared, type-erased handler.
pub type BoxHandler = Arc<dyn Handler>;

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(CallContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CallResult> + Send + 'static,
{
    async fn call(&self, ctx: CallContext, payload: Payload) -> CallResult {
        (self.f)(ctx, payload).await
    }
}

/// Handler from an async closure over raw JSON.
pub fn handler_fn<F, Fut>(f: F) -> BoxHandler
where
    F: Fn(CallContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CallResult> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

struct TypedHandler<F, Req, Resp> {
    f: F,
    _types: PhantomData<fn(Req) -> Resp>,
}

#[async_trait]
impl<F, Fut, Req, Resp> Handler for TypedHandler<F, Req, Resp>
where
    F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    async fn call(&self, ctx: CallContext, payload: Payload) -> CallResult {
        let request: Req = serde_json::from_value(payload)
            .map_err(|e| Status::bad_request("INVALID_PAYLOAD", e.to_string()))?;
        let response = (self.f)(ctx, request).await?;
        serde_json::to_value(response).map_err(|e| Status::internal("ENCODE_FAILED", e.to_string()))
    }
}

/// Handler from an async closure over typed request and response values.
///
/// A payload that does not deserialize into `Req` fails with `400 INVALID_PAYLOAD`.
pub fn typed_handler<Req, Resp, F, Fut>(f: F) -> BoxHandler
where
    F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    Arc::new(TypedHandler {
        f,
        _types: PhantomData,
    })
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Wraps a handler with cross-cutting behavior.
pub trait Middleware: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn wrap(&self, next: BoxHandler) -> BoxHandler;
}

/// The rest of the chain, as seen from a [`from_fn`] middleware.
#[derive(Clone)]
pub struct Next {
    inner: BoxHandler,
}

impl Next {
    pub async fn run(self, ctx: CallContext, payload: Payload) -> CallResult {
        self.inner.call(ctx, payload).await
    }
}

struct FnMiddleware<F> {
    name: String,
    f: Arc<F>,
}

struct FnMiddlewareHandler<F> {
    f: Arc<F>,
    next: BoxHandler,
}

impl<F, Fut> Middleware for FnMiddleware<F>
where
    F: Fn(CallContext, Payload, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CallResult> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn wrap(&self, next: BoxHandler) -> BoxHandler {
        Arc::new(FnMiddlewareHandler {
            f: Arc::clone(&self.f),
            next,
        })
    }
}

#[async_trait]
impl<F, Fut> Handler for FnMiddlewareHandler<F>
where
    F: Fn(CallContext, Payload, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CallResult> + Send + 'static,
{
    async fn call(&self, ctx: CallContext, payload: Payload) -> CallResult {
        let next = Next {
            inner: Arc::clone(&self.next),
        };
        (self.f)(ctx, payload, next).await
    }
}

/// Middleware from an async closure receiving the rest of the chain.
///
/// ```
/// use gantry_server::middleware::{from_fn, Next};
///
/// let tenant_check = from_fn("tenant", |ctx, payload, next: Next| async move {
///     next.run(ctx, payload).await
/// });
/// assert_eq!(tenant_check.name(), "tenant");
/// ```
pub fn from_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn Middleware>
where
    F: Fn(CallContext, Payload, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CallResult> + Send + 'static,
{
    Arc::new(FnMiddleware {
        name: name.into(),
        f: Arc::new(f),
    })
}

// ---------------------------------------------------------------------------
// MiddlewareChain
// ---------------------------------------------------------------------------

/// Ordered middleware, outermost first.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    layers: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    #[must_use]
    pub fn new(layers: Vec<Arc<dyn Middleware>>) -> Self {
        Self { layers }
    }

    /// Middleware names, outermost first.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.layers.iter().map(|m| m.name()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Wraps `handler` so calls pass through every layer, first layer outermost.
    #[must_use]
    pub fn then(&self, handler: BoxHandler) -> BoxHandler {
        self.layers
            .iter()
            .rev()
            .fold(handler, |inner, layer| layer.wrap(inner))
    }
}

impl fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Builds the chain for `flags`.
///
/// **Ordering (outermost to innermost):**
/// 1. `Recovery` -- turns panics into `500 INTERNAL_ERROR`
/// 2. `Metadata` -- copies propagated headers into the call metadata
/// 3. `Tracing` -- only with `enable_tracing`
/// 4. `Logging` -- one event per call, latency covers everything inside
/// 5. `Metrics` -- only with `enable_metrics`
/// 6. `extra`, in the order given
#[must_use]
pub fn build_chain(flags: &MiddlewareFlags, extra: Vec<Arc<dyn Middleware>>) -> MiddlewareChain {
    let mut layers: Vec<Arc<dyn Middleware>> = vec![
        Arc::new(Recovery::new()),
        Arc::new(MetadataPropagation::default()),
    ];
    if flags.enable_tracing {
        layers.push(Arc::new(Tracing));
    }
    layers.push(Arc::new(RequestLogging));
    if flags.enable_metrics {
        layers.push(Arc::new(RequestMetrics));
    }
    layers.extend(extra);
    MiddlewareChain::new(layers)
}
