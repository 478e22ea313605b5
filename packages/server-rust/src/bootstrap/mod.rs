//! Entry points that assemble and run a service from its name and options.
//!
//! ```no_run
//! use gantry_server::bootstrap::{self, with_http_router};
//! use gantry_server::middleware::handler_fn;
//!
//! # async fn main_() -> Result<(), gantry_server::BootError> {
//! bootstrap::run(
//!     "greeter",
//!     vec![with_http_router(|http| {
//!         http.get("/hello", handler_fn(|_ctx, _payload| async {
//!             Ok(serde_json::json!("hi"))
//!         }));
//!     })],
//! )
//! .await
//! # }
//! ```

mod app;
mod options;

pub use app::App;
pub use options::{
    with_after_stop, with_before_start, with_config, with_config_file, with_http_option,
    with_http_router, with_instance_id, with_instance_metadata, with_lifecycle_option,
    with_middleware, with_registrar_timeout, with_registry_backend, with_rpc_option,
    with_rpc_service, with_search_root, with_strict_merge, with_toml_config, StartupOption,
    StartupOptions,
};

use crate::error::BootError;

/// Loads configuration, installs logging and assembles every component.
///
/// # Errors
///
/// See [`App::initialize`].
pub async fn initialize(service: &str, options: Vec<StartupOption>) -> Result<App, BootError> {
    App::initialize(service, options).await
}

/// [`initialize`], then run until SIGINT or SIGTERM.
///
/// # Errors
///
/// Any assembly failure, or the first failure while running.
pub async fn run(service: &str, options: Vec<StartupOption>) -> Result<(), BootError> {
    initialize(service, options).await?.run().await
}
