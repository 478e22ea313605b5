use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use gantry_core::constants::SUCCESS_CODE;
use tracing::{error, info};

use super::{BoxHandler, CallContext, CallResult, Handler, Middleware, Payload};

/// Emits one structured event per call.
///
/// Success logs at `info` with `code=200`; failure logs at `error` with the
/// status code, reason and message. `latency` is in seconds and covers
/// every layer inside this one plus the handler.
#[derive(Debug, Clone, Copy)]
pub struct RequestLogging;

impl Middleware for RequestLogging {
    fn name(&self) -> &str {
        "logging"
    }

    fn wrap(&self, next: BoxHandler) -> BoxHandler {
        Arc::new(LoggingHandler { next })
    }
}

struct LoggingHandler {
    next: BoxHandler,
}

#[async_trait]
impl Handler for LoggingHandler {
    async fn call(&self, ctx: CallContext, payload: Payload) -> CallResult {
        let kind = ctx.kind;
        let operation = ctx.operation.clone();
        let trace_id = ctx.trace_id().unwrap_or_default().to_string();
        let request_id = ctx.request_id().unwrap_or_default().to_string();

        let start = Instant::now();
        let result = self.next.call(ctx, payload).await;
        let latency = start.elapsed().as_secs_f64();

        match &result {
            Ok(_) => info!(
                kind = %kind,
                operation = %operation,
                code = SUCCESS_CODE,
                reason = "",
                latency,
                trace_id = %trace_id,
                request_id = %request_id,
                "call completed"
            ),
            Err(status) => error!(
                kind = %kind,
                operation = %operation,
                code = status.code,
                reason = %status.reason,
                latency,
                trace_id = %trace_id,
                request_id = %request_id,
                error = %status.message,
                "call failed"
            ),
        }
        result
    }
}
