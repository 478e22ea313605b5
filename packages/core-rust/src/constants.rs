//! Built-in defaults shared by the configuration loader, transports and lifecycle.

/// Version reported for a service whose configuration does not set one.
pub const DEFAULT_VERSION: &str = "v1.0.0";

/// Graceful shutdown window used when `app.stop_timeout` is unset or invalid.
pub const DEFAULT_STOP_TIMEOUT: &str = "10s";

/// Default bind address of the RPC transport.
pub const DEFAULT_RPC_ADDR: &str = ":9000";

/// Default bind address of the HTTP transport.
pub const DEFAULT_HTTP_ADDR: &str = ":8000";

/// Default log target. Relative paths are resolved against the working directory.
pub const DEFAULT_LOG_OUTPUT: &str = "logs/app.log";

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Connection timeout for registry backends when `discovery.timeout` is unset.
pub const DEFAULT_REGISTRY_TIMEOUT_SECS: u64 = 5;

/// `msg` field of every successful response envelope.
pub const SUCCESS_MESSAGE: &str = "success";

/// `code` field of every successful response envelope.
pub const SUCCESS_CODE: i32 = 200;

/// Code used for failures that carry no structured status.
pub const INTERNAL_ERROR_CODE: u16 = 500;
