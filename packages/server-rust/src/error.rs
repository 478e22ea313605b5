use thiserror::Error;

use crate::config::ConfigError;
use crate::lifecycle::HookStage;
use crate::registry::RegistryError;
use crate::transport::{TransportError, TransportKind};

/// Anything that stops a service from being assembled or from running.
#[derive(Debug, Error)]
pub enum BootError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{stage} hook failed: {error:#}")]
    Hook {
        stage: HookStage,
        error: anyhow::Error,
    },

    #[error("{kind} server exited unexpectedly: {reason}")]
    ServerExited { kind: TransportKind, reason: String },
}
