use std::sync::Arc;

use async_trait::async_trait;
use gantry_core::metadata::TRACEPARENT_HEADER;
use tracing::{info_span, Instrument};

use super::{BoxHandler, CallContext, CallResult, Handler, Middleware, Payload, TraceContext};

/// Continues the caller's W3C trace (or starts one) and runs the rest of
/// the chain inside a `call` span carrying `trace_id` and `span_id`.
#[derive(Debug, Clone, Copy)]
pub struct Tracing;

impl Middleware for Tracing {
    fn name(&self) -> &str {
        "tracing"
    }

    fn wrap(&self, next: BoxHandler) -> BoxHandler {
        Arc::new(TracingHandler { next })
    }
}

struct TracingHandler {
    next: BoxHandler,
}

#[async_trait]
impl Handler for TracingHandler {
    async fn call(&self, mut ctx: CallContext, payload: Payload) -> CallResult {
        let trace = ctx
            .headers
            .get(TRACEPARENT_HEADER)
            .and_then(TraceContext::parse_traceparent)
            .map_or_else(TraceContext::new_root, |parent| parent.child());

        let span = info_span!(
            "call",
            kind = %ctx.kind,
            operation = %ctx.operation,
            trace_id = %trace.trace_id,
            span_id = %trace.span_id,
        );
        ctx.trace = Some(trace);

        self.next.call(ctx, payload).instrument(span).await
    }
}
