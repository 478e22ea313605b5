//! Configuration loading: candidate discovery, file overlay and inline overrides.

mod loader;

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

pub use loader::{ConfigLoader, InlineConfig, LoadedConfig, CONFIG_CANDIDATES};

/// Fatal configuration failure. Aborts startup before any server is built.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("failed to merge inline config: {0}")]
    Merge(String),
}

/// Non-fatal condition found while loading. Logged once logging is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// The explicitly requested file does not exist; defaults were used.
    MissingFile(PathBuf),
    /// The inline override could not be parsed and was ignored.
    MergeFailed(String),
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingFile(path) => {
                write!(f, "config file {} not found, using defaults", path.display())
            }
            Self::MergeFailed(reason) => {
                write!(f, "inline config ignored, merge failed: {reason}")
            }
        }
    }
}
