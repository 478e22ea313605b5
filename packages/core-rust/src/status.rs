//! Structured request failure carried through the middleware chain.
//!
//! A `Status` is what handlers and middleware return instead of a bare error:
//! an HTTP-style numeric `code`, a machine-readable `reason` and a human
//! `message`. Both transports serialize it verbatim (RPC frames embed it, the
//! HTTP envelope copies `code` and `message`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::INTERNAL_ERROR_CODE;

/// Reason attached to faults caught by the recovery middleware.
pub const REASON_INTERNAL: &str = "INTERNAL_ERROR";

/// Structured failure of a single call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("error: code = {code} reason = {reason} message = {message}")]
pub struct Status {
    /// HTTP-style result code (`400`, `404`, `500`, ...).
    pub code: u16,
    /// Stable, machine-readable reason such as `"USER_NOT_FOUND"`.
    #[serde(default)]
    pub reason: String,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
    /// Optional key/value details.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Status {
    /// Creates a status with the given code, reason and message.
    pub fn new(code: u16, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            message: message.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// 400: the request payload could not be understood.
    pub fn bad_request(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(400, reason, message)
    }

    /// 401: the caller is not authenticated.
    pub fn unauthorized(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(401, reason, message)
    }

    /// 403: the caller may not perform the operation.
    pub fn forbidden(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(403, reason, message)
    }

    /// 404: the addressed resource or route does not exist.
    pub fn not_found(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(404, reason, message)
    }

    /// 409: the request conflicts with current state.
    pub fn conflict(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(409, reason, message)
    }

    /// 500: an unexpected server-side failure.
    pub fn internal(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR_CODE, reason, message)
    }

    /// 501: the operation is not served here.
    pub fn unimplemented(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(501, reason, message)
    }

    /// 503: the server cannot take the call right now.
    pub fn unavailable(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(503, reason, message)
    }

    /// 504: the call exceeded its deadline.
    pub fn gateway_timeout(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(504, reason, message)
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Unstructured errors become internal errors with the error chain as message.
impl From<anyhow::Error> for Status {
    fn from(err: anyhow::Error) -> Self {
        Self::internal("", format!("{err:#}"))
    }
}

impl From<serde_json::Error> for Status {
    fn from(err: serde_json::Error) -> Self {
        Self::bad_request("INVALID_PAYLOAD", err.to_string())
    }
}
