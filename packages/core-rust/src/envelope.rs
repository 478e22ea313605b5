//! Uniform JSON response body returned by the HTTP transport.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{SUCCESS_CODE, SUCCESS_MESSAGE};
use crate::status::Status;

/// `{ "code", "msg", "data"?, "error"? }` wrapper around every HTTP reply.
///
/// The HTTP status line is always 200; the outcome lives in `code`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub code: i32,
    pub msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    /// Wraps a successful reply. A `null` payload is omitted from the body.
    #[must_use]
    pub fn success(data: Value) -> Self {
        Self {
            code: SUCCESS_CODE,
            msg: SUCCESS_MESSAGE.to_string(),
            data: (!data.is_null()).then_some(data),
            error: None,
        }
    }

    /// Wraps a failed call. `msg` and `error` both carry the status message;
    /// `error` is omitted when the message is empty.
    #[must_use]
    pub fn from_status(status: &Status) -> Self {
        Self {
            code: i32::from(status.code),
            msg: status.message.clone(),
            data: None,
            error: (!status.message.is_empty()).then(|| status.message.clone()),
        }
    }

    /// Whether the envelope reports success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.code == SUCCESS_CODE
    }
}

impl From<Result<Value, Status>> for Envelope {
    fn from(result: Result<Value, Status>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(status) => Self::from_status(&status),
        }
    }
}
