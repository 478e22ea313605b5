//! Process-wide structured logging.
//!
//! Installs a JSON `tracing-subscriber` formatter writing to stdout, stderr or
//! a date-suffixed file. `RUST_LOG` overrides the configured level.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{Local, NaiveDate};
use gantry_core::config::LogSpec;
use gantry_core::constants::DEFAULT_LOG_LEVEL;
use tracing::{info_span, Span};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    Stderr,
    /// Base path; the actual file carries a `-YYYY-MM-DD` suffix.
    File(PathBuf),
}

impl LogOutput {
    #[must_use]
    pub fn parse(output: &str) -> Self {
        match output.trim() {
            "" | "stdout" => Self::Stdout,
            "stderr" => Self::Stderr,
            path => Self::File(PathBuf::from(path)),
        }
    }
}

/// Handle to the installed logger.
///
/// Holds the root span carrying the service name; enter it (or instrument
/// futures with it) so every event is attributed to the service.
#[derive(Debug, Clone)]
pub struct ServiceLogger {
    level: String,
    output: LogOutput,
    root: Span,
}

impl ServiceLogger {
    /// Effective level directive (before any `RUST_LOG` override).
    #[must_use]
    pub fn level(&self) -> &str {
        &self.level
    }

    /// The sink actually in use. Falls back to stdout when a file could not be opened.
    #[must_use]
    pub fn output(&self) -> &LogOutput {
        &self.output
    }

    #[must_use]
    pub fn root_span(&self) -> Span {
        self.root.clone()
    }
}

/// Installs the global subscriber for `service` according to `spec`.
///
/// If a global subscriber is already installed (tests, embedding
/// applications) it is kept and only the root span is created.
#[must_use]
pub fn init_logging(service: &str, spec: &LogSpec) -> ServiceLogger {
    let level = normalize_level(&spec.level);
    let requested = LogOutput::parse(&spec.output);

    let (writer, output, open_error) = match &requested {
        LogOutput::Stdout => (BoxMakeWriter::new(std::io::stdout), LogOutput::Stdout, None),
        LogOutput::Stderr => (BoxMakeWriter::new(std::io::stderr), LogOutput::Stderr, None),
        LogOutput::File(base) => {
            let path = dated_path(base, Local::now().date_naive());
            match open_log_file(&path) {
                Ok(file) => (
                    BoxMakeWriter::new(Mutex::new(file)),
                    LogOutput::File(path),
                    None,
                ),
                Err(e) => (
                    BoxMakeWriter::new(std::io::stdout),
                    LogOutput::Stdout,
                    Some(format!("{}: {e}", path.display())),
                ),
            }
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let installed = tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_current_span(true)
        .try_init()
        .is_ok();

    if let Some(reason) = open_error {
        tracing::warn!(reason = %reason, "log file unavailable, logging to stdout");
    }
    if !installed {
        tracing::debug!("global subscriber already installed, keeping it");
    }

    ServiceLogger {
        level: level.to_string(),
        output,
        root: info_span!("service", name = %service),
    }
}

fn normalize_level(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => DEFAULT_LOG_LEVEL,
    }
}

fn open_log_file(path: &Path) -> std::io::Result<fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Inserts `-YYYY-MM-DD` before the extension: `logs/app.log` becomes
/// `logs/app-2024-03-07.log`.
#[must_use]
pub fn dated_path(base: &Path, date: NaiveDate) -> PathBuf {
    let stem = base
        .file_stem()
        .map_or_else(|| "app".into(), |s| s.to_string_lossy().into_owned());
    let day = date.format("%Y-%m-%d");
    let name = match base.extension() {
        Some(ext) => format!("{stem}-{day}.{}", ext.to_string_lossy()),
        None => format!("{stem}-{day}"),
    };
    base.with_file_name(name)
}
