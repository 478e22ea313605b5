//! Gantry Core — service configuration schema and merge rules, duration
//! parsing, structured call status, response envelope and call metadata.

pub mod config;
pub mod constants;
pub mod duration;
pub mod envelope;
pub mod instance;
pub mod metadata;
pub mod status;

pub use config::{
    AppMeta, DiscoverySpec, EndpointConfig, LogSpec, Merge, MiddlewareFlags, ServerSection,
    ServiceConfig,
};
pub use envelope::Envelope;
pub use instance::ServiceInstance;
pub use metadata::Metadata;
pub use status::Status;
