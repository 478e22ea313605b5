use std::sync::Arc;

use async_trait::async_trait;
use gantry_core::metadata::{METADATA_PREFIX, REQUEST_ID_HEADER};

use super::{BoxHandler, CallContext, CallResult, Handler, Middleware, Payload};

/// Copies propagated headers into [`CallContext::metadata`].
///
/// Headers matching one of the configured prefixes (default `x-md-`) and the
/// `x-request-id` correlation header are carried over. Outbound RPC calls
/// made with the context forward this metadata to the next service.
#[derive(Debug, Clone)]
pub struct MetadataPropagation {
    prefixes: Arc<[String]>,
}

impl MetadataPropagation {
    #[must_use]
    pub fn with_prefixes(prefixes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            prefixes: prefixes
                .into_iter()
                .map(|p| p.into().to_ascii_lowercase())
                .collect(),
        }
    }
}

impl Default for MetadataPropagation {
    fn default() -> Self {
        Self::with_prefixes([METADATA_PREFIX])
    }
}

impl Middleware for MetadataPropagation {
    fn name(&self) -> &str {
        "metadata"
    }

    fn wrap(&self, next: BoxHandler) -> BoxHandler {
        Arc::new(MetadataHandler {
            prefixes: Arc::clone(&self.prefixes),
            next,
        })
    }
}

struct MetadataHandler {
    prefixes: Arc<[String]>,
    next: BoxHandler,
}

#[async_trait]
impl Handler for MetadataHandler {
    async fn call(&self, mut ctx: CallContext, payload: Payload) -> CallResult {
        let carried: Vec<(String, String)> = ctx
            .headers
            .with_prefixes(&self.prefixes)
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        for (k, v) in carried {
            ctx.metadata.insert(k, v);
        }
        if let Some(id) = ctx.headers.get(REQUEST_ID_HEADER).map(str::to_string) {
            ctx.metadata.insert(REQUEST_ID_HEADER, id);
        }
        self.next.call(ctx, payload).await
    }
}
