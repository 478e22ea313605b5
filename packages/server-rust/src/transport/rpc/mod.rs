//! Minimal RPC transport: length-delimited MessagePack frames over TCP.
//!
//! Operations are named `/<service>/<method>`. A connection may carry many
//! concurrent calls; responses are matched to requests by id.

mod client;
mod server;
pub mod wire;

use std::time::Duration;

use gantry_core::config::EndpointConfig;

pub use client::RpcClient;
pub use server::RpcServer;

use super::config_timeout;

/// Largest accepted frame unless overridden.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

/// Post-construction callback receiving the live RPC server.
pub type RpcHook = Box<dyn FnOnce(&mut RpcServer) + Send>;

/// Programmatic RPC settings, applied after the config values.
#[derive(Debug, Clone)]
pub enum RpcOption {
    Address(String),
    Timeout(Duration),
    MaxFrameLength(usize),
}

/// Effective RPC server settings.
#[derive(Debug, Clone)]
pub struct RpcSettings {
    pub addr: String,
    pub timeout: Option<Duration>,
    pub max_frame_length: usize,
}

impl RpcSettings {
    #[must_use]
    pub fn from_config(cfg: &EndpointConfig) -> Self {
        Self {
            addr: cfg.addr.trim().to_string(),
            timeout: config_timeout(cfg),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    pub fn apply(&mut self, option: &RpcOption) {
        match option {
            RpcOption::Address(addr) => self.addr.clone_from(addr),
            RpcOption::Timeout(timeout) => self.timeout = Some(*timeout),
            RpcOption::MaxFrameLength(len) => self.max_frame_length = *len,
        }
    }
}

/// `/<service>/<method>`.
#[must_use]
pub fn operation_name(service: &str, method: &str) -> String {
    format!(
        "/{}/{}",
        service.trim_matches('/'),
        method.trim_matches('/')
    )
}
