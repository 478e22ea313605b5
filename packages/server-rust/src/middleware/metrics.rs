//! Request metrics via the `metrics` facade, with an optional Prometheus exporter.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use gantry_core::constants::SUCCESS_CODE;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use super::{BoxHandler, CallContext, CallResult, Handler, Middleware, Payload};
use crate::transport::normalize_bind_addr;

/// Counter of finished calls, labelled `kind`, `operation`, `code`, `reason`.
pub const REQUESTS_TOTAL: &str = "server_requests_code_total";

/// Histogram of call latency in seconds, labelled `kind`, `operation`.
pub const REQUEST_SECONDS: &str = "server_requests_seconds";

/// Records [`REQUESTS_TOTAL`] and [`REQUEST_SECONDS`] for every call.
#[derive(Debug, Clone, Copy)]
pub struct RequestMetrics;

impl Middleware for RequestMetrics {
    fn name(&self) -> &str {
        "metrics"
    }

    fn wrap(&self, next: BoxHandler) -> BoxHandler {
        Arc::new(MetricsHandler { next })
    }
}

struct MetricsHandler {
    next: BoxHandler,
}

#[async_trait]
impl Handler for MetricsHandler {
    async fn call(&self, ctx: CallContext, payload: Payload) -> CallResult {
        let kind = ctx.kind.as_str();
        let operation = ctx.operation.clone();

        let start = Instant::now();
        let result = self.next.call(ctx, payload).await;
        let seconds = start.elapsed().as_secs_f64();

        let (code, reason) = match &result {
            Ok(_) => (SUCCESS_CODE.to_string(), String::new()),
            Err(status) => (status.code.to_string(), status.reason.clone()),
        };
        counter!(
            REQUESTS_TOTAL,
            "kind" => kind,
            "operation" => operation.clone(),
            "code" => code,
            "reason" => reason
        )
        .increment(1);
        histogram!(REQUEST_SECONDS, "kind" => kind, "operation" => operation).record(seconds);

        result
    }
}

/// Installs the global Prometheus recorder with a scrape listener on `addr`.
///
/// Must be called from within a tokio runtime.
///
/// # Errors
///
/// Returns a description if `addr` is not a socket address or the recorder
/// cannot be installed (for example, one is already set).
pub fn install_prometheus_exporter(addr: &str) -> Result<SocketAddr, String> {
    let socket: SocketAddr = normalize_bind_addr(addr)
        .parse()
        .map_err(|e| format!("invalid metrics address {addr:?}: {e}"))?;
    PrometheusBuilder::new()
        .with_http_listener(socket)
        .install()
        .map_err(|e| e.to_string())?;
    Ok(socket)
}
