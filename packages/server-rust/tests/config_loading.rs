use std::fs;
use std::path::Path;

use gantry_core::ServiceConfig;
use gantry_server::config::{ConfigLoader, ConfigWarning, InlineConfig};

fn write(root: &Path, rel: &str, text: &str) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, text).unwrap();
}

#[test]
fn service_named_file_is_the_last_resort() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "configs/payments.toml",
        "[server.grpc]\naddr = \":9100\"\n\n[app.discovery]\ntype = \"etcd\"\nendpoints = [\"10.0.0.1:2379\"]\n",
    );

    let loaded = ConfigLoader::with_root(dir.path())
        .load("payments", None, None)
        .unwrap();
    let cfg = loaded.config;
    assert_eq!(cfg.server.rpc.addr, ":9100");
    assert_eq!(cfg.server.http.addr, ":8000");
    assert_eq!(cfg.app.stop_timeout, "10s");
    let discovery = cfg.app.discovery.unwrap();
    assert_eq!(discovery.backend, "etcd");
    assert!(!discovery.register);
}

#[test]
fn missing_explicit_file_falls_back_to_defaults_with_warning() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "config.toml", "[app]\nversion = \"ignored\"\n");

    let loaded = ConfigLoader::with_root(dir.path())
        .load("payments", Some(Path::new("nope.toml")), None)
        .unwrap();
    assert_eq!(loaded.config, ServiceConfig::defaults());
    assert_eq!(loaded.source, None);
    assert_eq!(
        loaded.warnings,
        vec![ConfigWarning::MissingFile(dir.path().join("nope.toml"))]
    );
}

#[test]
fn inline_override_is_applied_last() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "config.toml",
        "[server.http]\naddr = \":8080\"\n\n[app.metadata]\nzone = \"a\"\nteam = \"core\"\n",
    );

    let loaded = ConfigLoader::with_root(dir.path())
        .load(
            "payments",
            None,
            Some(&InlineConfig::Toml(
                "[server.http]\ntimeout = \"3s\"\n\n[app.metadata]\nzone = \"b\"\n".into(),
            )),
        )
        .unwrap();
    let cfg = loaded.config;
    assert_eq!(cfg.server.http.addr, ":8080");
    assert_eq!(cfg.server.http.timeout, "3s");
    assert_eq!(cfg.app.metadata.get("zone").map(String::as_str), Some("b"));
    assert_eq!(cfg.app.metadata.get("team").map(String::as_str), Some("core"));
    assert!(loaded.warnings.is_empty());
}
