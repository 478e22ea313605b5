//! Gantry Server assembles a configured service from config loading, logging,
//! middleware chain, RPC/HTTP transports, registry integration and graceful lifecycle.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod middleware;
pub mod registry;
pub mod transport;

pub use bootstrap::{initialize, run, App, StartupOption};
pub use error::BootError;
pub use gantry_core::{Metadata, ServiceConfig, ServiceInstance, Status};
