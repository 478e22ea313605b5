use std::path::{Path, PathBuf};

use gantry_core::config::{Merge, ServiceConfig};
use toml::Value;

use super::{ConfigError, ConfigWarning};

/// Fixed candidates searched, in order, when no explicit file is given.
/// `configs/<service>.toml` is tried after these.
pub const CONFIG_CANDIDATES: [&str; 2] = ["config.toml", "configs/config.toml"];

/// Override applied on top of the file (or default) configuration.
#[derive(Debug, Clone)]
pub enum InlineConfig {
    /// Already-typed override. Merging it cannot fail.
    Structured(ServiceConfig),
    /// TOML text, parsed at load time.
    Toml(String),
}

/// Result of [`ConfigLoader::load`].
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: ServiceConfig,
    /// File the base configuration came from, if any.
    pub source: Option<PathBuf>,
    pub warnings: Vec<ConfigWarning>,
}

/// Resolves a service configuration from files and inline overrides.
///
/// Resolution order:
/// 1. Built-in defaults ([`ServiceConfig::defaults`])
/// 2. The explicit file, or the first existing candidate, overlaid key by key
/// 3. The inline override, merged with [`Merge`] semantics
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    root: PathBuf,
    strict_merge: bool,
}

impl ConfigLoader {
    /// Loader searching relative to the working directory.
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: PathBuf::from("."),
            strict_merge: false,
        }
    }

    /// Loader searching relative to `root`.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            strict_merge: false,
        }
    }

    /// Makes an unparsable inline override fatal instead of a warning.
    #[must_use]
    pub fn strict_merge(mut self, strict: bool) -> Self {
        self.strict_merge = strict;
        self
    }

    /// Candidate files for `service`, in priority order.
    #[must_use]
    pub fn candidates(&self, service: &str) -> Vec<PathBuf> {
        CONFIG_CANDIDATES
            .iter()
            .map(|c| self.root.join(c))
            .chain(std::iter::once(
                self.root.join("configs").join(format!("{service}.toml")),
            ))
            .collect()
    }

    /// Loads the configuration for `service`.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Io`] if a located file cannot be read
    /// - [`ConfigError::Parse`] if a file is not valid TOML or does not fit the schema
    /// - [`ConfigError::Merge`] if strict merging is on and the inline TOML is invalid
    pub fn load(
        &self,
        service: &str,
        explicit: Option<&Path>,
        inline: Option<&InlineConfig>,
    ) -> Result<LoadedConfig, ConfigError> {
        let mut warnings = Vec::new();

        let source = match explicit {
            Some(path) => {
                let path = self.root.join(path);
                if path.is_file() {
                    Some(path)
                } else {
                    warnings.push(ConfigWarning::MissingFile(path));
                    None
                }
            }
            None => self.candidates(service).into_iter().find(|p| p.is_file()),
        };

        let mut config = match &source {
            Some(path) => read_file(path)?,
            None => ServiceConfig::defaults(),
        };

        match inline {
            Some(InlineConfig::Structured(overrides)) => config.merge_from(overrides),
            Some(InlineConfig::Toml(text)) => match toml::from_str::<ServiceConfig>(text) {
                Ok(overrides) => config.merge_from(&overrides),
                Err(e) if self.strict_merge => return Err(ConfigError::Merge(e.to_string())),
                Err(e) => warnings.push(ConfigWarning::MergeFailed(e.to_string())),
            },
            None => {}
        }

        Ok(LoadedConfig {
            config,
            source,
            warnings,
        })
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads `path` and overlays it onto the serialized defaults.
///
/// Working on the raw TOML tree means a key present in the file always wins,
/// even when its value is empty (`addr = ""` disables a transport).
fn read_file(path: &Path) -> Result<ServiceConfig, ConfigError> {
    let parse_err = |message: String| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    };

    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut file: Value = toml::from_str(&text).map_err(|e| parse_err(e.to_string()))?;
    canonicalize_aliases(&mut file);
    let mut tree =
        Value::try_from(ServiceConfig::defaults()).map_err(|e| parse_err(e.to_string()))?;
    overlay(&mut tree, file);
    tree.try_into::<ServiceConfig>()
        .map_err(|e| parse_err(e.to_string()))
}

/// Renames `server.grpc` to `server.rpc` so the file lands on the same key
/// as the serialized defaults. A file naming both keeps both and fails to parse.
fn canonicalize_aliases(file: &mut Value) {
    let Some(server) = file.get_mut("server").and_then(Value::as_table_mut) else {
        return;
    };
    if server.contains_key("rpc") {
        return;
    }
    if let Some(grpc) = server.remove("grpc") {
        server.insert("rpc".to_string(), grpc);
    }
}

fn overlay(base: &mut Value, top: Value) {
    match (base, top) {
        (Value::Table(base), Value::Table(top)) => {
            for (key, value) in top {
                match base.get_mut(&key) {
                    Some(slot) => overlay(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    fn write(dir: &TempDir, rel: &str, body: &str) -> PathBuf {
        let path = dir.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn no_files_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let loaded = ConfigLoader::with_root(dir.path())
            .load("users", None, None)
            .unwrap();
        assert_eq!(loaded.config, ServiceConfig::defaults());
        assert!(loaded.source.is_none());
        assert!(loaded.warnings.is_empty());
    }

    #[test]
    fn candidates_are_searched_in_priority_order() {
        let dir = TempDir::new().unwrap();
        write(&dir, "configs/users.toml", "[app]\nversion = \"v3\"\n");
        write(&dir, "configs/config.toml", "[app]\nversion = \"v2\"\n");

        let loader = ConfigLoader::with_root(dir.path());
        let loaded = loader.load("users", None, None).unwrap();
        assert_eq!(loaded.config.app.version, "v2");

        write(&dir, "config.toml", "[app]\nversion = \"v1\"\n");
        let loaded = loader.load("users", None, None).unwrap();
        assert_eq!(loaded.config.app.version, "v1");
        assert_eq!(loaded.source, Some(dir.path().join("config.toml")));
    }

    #[test]
    fn service_specific_candidate_is_last_resort() {
        let dir = TempDir::new().unwrap();
        write(&dir, "configs/orders.toml", "[server.http]\naddr = \":8181\"\n");
        let loaded = ConfigLoader::with_root(dir.path())
            .load("orders", None, None)
            .unwrap();
        assert_eq!(loaded.config.server.http.addr, ":8181");
        assert_eq!(loaded.config.server.rpc.addr, ":9000");
    }

    #[test]
    fn file_overlay_keeps_explicit_empty_values() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "custom.toml",
            "[server.rpc]\naddr = \"\"\n\n[log]\nlevel = \"debug\"\n",
        );
        let loaded = ConfigLoader::new().load("users", Some(&path), None).unwrap();
        assert_eq!(loaded.config.server.rpc.addr, "");
        assert_eq!(loaded.config.server.http.addr, ":8000");
        assert_eq!(loaded.config.log.level, "debug");
        assert_eq!(loaded.config.log.output, "logs/app.log");
    }

    #[test]
    fn grpc_table_in_file_lands_on_rpc() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "config.toml",
            "[server.grpc]\naddr = \":9100\"\ntimeout = \"2s\"\n",
        );
        let loaded = ConfigLoader::with_root(dir.path())
            .load("svc", None, None)
            .unwrap();
        assert_eq!(loaded.config.server.rpc.addr, ":9100");
        assert_eq!(loaded.config.server.rpc.timeout, "2s");
        assert_eq!(loaded.config.server.http.addr, ":8000");
    }

    #[test]
    fn file_naming_both_rpc_and_grpc_is_rejected() {
        let dir = TempDir::new().unwrap();
        write(
            &dir,
            "config.toml",
            "[server.rpc]\naddr = \":9100\"\n\n[server.grpc]\naddr = \":9200\"\n",
        );
        let err = ConfigLoader::with_root(dir.path())
            .load("svc", None, None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn missing_explicit_file_warns_and_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let loaded = ConfigLoader::with_root(dir.path())
            .load("users", Some(Path::new("nope.toml")), None)
            .unwrap();
        assert_eq!(loaded.config, ServiceConfig::defaults());
        assert!(matches!(
            loaded.warnings.as_slice(),
            [ConfigWarning::MissingFile(_)]
        ));
    }

    #[test]
    fn malformed_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        write(&dir, "config.toml", "[server.http\naddr = 1");
        let err = ConfigLoader::with_root(dir.path())
            .load("users", None, None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn mistyped_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        write(&dir, "config.toml", "[middleware]\nenable_tracing = \"yes\"\n");
        let err = ConfigLoader::with_root(dir.path())
            .load("users", None, None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn structured_inline_override_merges() {
        let dir = TempDir::new().unwrap();
        let mut overrides = ServiceConfig::default();
        overrides.server.http.addr = "127.0.0.1:0".into();
        overrides.middleware.enable_metrics = true;

        let loaded = ConfigLoader::with_root(dir.path())
            .load("users", None, Some(&InlineConfig::Structured(overrides)))
            .unwrap();
        assert_eq!(loaded.config.server.http.addr, "127.0.0.1:0");
        assert_eq!(loaded.config.server.rpc.addr, ":9000");
        assert!(loaded.config.middleware.enable_metrics);
    }

    #[test]
    fn toml_inline_override_merges() {
        let dir = TempDir::new().unwrap();
        let inline = InlineConfig::Toml("[app]\nversion = \"v9\"\n".into());
        let loaded = ConfigLoader::with_root(dir.path())
            .load("users", None, Some(&inline))
            .unwrap();
        assert_eq!(loaded.config.app.version, "v9");
    }

    #[test]
    fn invalid_toml_override_is_lenient_by_default() {
        let dir = TempDir::new().unwrap();
        let inline = InlineConfig::Toml("[app\nversion".into());
        let loaded = ConfigLoader::with_root(dir.path())
            .load("users", None, Some(&inline))
            .unwrap();
        assert_eq!(loaded.config, ServiceConfig::defaults());
        assert!(matches!(
            loaded.warnings.as_slice(),
            [ConfigWarning::MergeFailed(_)]
        ));
    }

    #[test]
    fn invalid_toml_override_is_fatal_when_strict() {
        let dir = TempDir::new().unwrap();
        let inline = InlineConfig::Toml("[app\nversion".into());
        let err = ConfigLoader::with_root(dir.path())
            .strict_merge(true)
            .load("users", None, Some(&inline))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Merge(_)));
    }
}
