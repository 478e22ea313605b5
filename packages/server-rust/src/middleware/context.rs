use gantry_core::metadata::{Metadata, REQUEST_ID_HEADER};

use crate::transport::TransportKind;

/// Per-call context threaded through the middleware chain.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Transport the call arrived on.
    pub kind: TransportKind,
    /// Route template (HTTP) or `/<service>/<method>` (RPC).
    pub operation: String,
    /// Incoming transport headers, lower-cased.
    pub headers: Metadata,
    /// Metadata propagated to downstream calls.
    pub metadata: Metadata,
    /// Set by the tracing middleware.
    pub trace: Option<TraceContext>,
}

impl CallContext {
    #[must_use]
    pub fn new(kind: TransportKind, operation: impl Into<String>) -> Self {
        Self {
            kind,
            operation: operation.into(),
            headers: Metadata::new(),
            metadata: Metadata::new(),
            trace: None,
        }
    }

    #[must_use]
    pub fn with_headers(mut self, headers: Metadata) -> Self {
        self.headers = headers;
        self
    }

    /// Correlation id, from propagated metadata or the raw headers.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.metadata
            .get(REQUEST_ID_HEADER)
            .or_else(|| self.headers.get(REQUEST_ID_HEADER))
    }

    #[must_use]
    pub fn trace_id(&self) -> Option<&str> {
        self.trace.as_ref().map(|t| t.trace_id.as_str())
    }
}

/// W3C trace context of the current call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    /// 32 lowercase hex digits.
    pub trace_id: String,
    /// 16 lowercase hex digits identifying this call.
    pub span_id: String,
    /// Span id of the caller, when the call carried a `traceparent`.
    pub parent_span_id: Option<String>,
    pub sampled: bool,
}

impl TraceContext {
    /// Fresh trace with a random id.
    #[must_use]
    pub fn new_root() -> Self {
        Self {
            trace_id: format!("{:032x}", nonzero_u128()),
            span_id: new_span_id(),
            parent_span_id: None,
            sampled: true,
        }
    }

    /// Parses `version-traceid-parentid-flags`, rejecting all-zero ids.
    #[must_use]
    pub fn parse_traceparent(header: &str) -> Option<Self> {
        let mut parts = header.trim().split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let parent_id = parts.next()?;
        let flags = parts.next()?;

        let is_hex = |s: &str, len: usize| {
            s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit())
        };
        if !is_hex(version, 2) || version == "ff" || !is_hex(trace_id, 32) || !is_hex(parent_id, 16)
            || !is_hex(flags, 2)
        {
            return None;
        }
        if trace_id.bytes().all(|b| b == b'0') || parent_id.bytes().all(|b| b == b'0') {
            return None;
        }
        let sampled = u8::from_str_radix(flags, 16).ok()? & 0x01 == 1;

        Some(Self {
            trace_id: trace_id.to_ascii_lowercase(),
            span_id: parent_id.to_ascii_lowercase(),
            parent_span_id: None,
            sampled,
        })
    }

    /// Child span in the same trace.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: new_span_id(),
            parent_span_id: Some(self.span_id.clone()),
            sampled: self.sampled,
        }
    }

    /// `traceparent` header value identifying this span.
    #[must_use]
    pub fn to_traceparent(&self) -> String {
        format!(
            "00-{}-{}-{:02x}",
            self.trace_id,
            self.span_id,
            u8::from(self.sampled)
        )
    }
}

fn nonzero_u128() -> u128 {
    loop {
        let id: u128 = rand::random();
        if id != 0 {
            return id;
        }
    }
}

fn new_span_id() -> String {
    loop {
        let id: u64 = rand::random();
        if id != 0 {
            return format!("{id:016x}");
        }
    }
}
