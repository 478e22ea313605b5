//! Harness that runs a fully assembled service on ephemeral ports.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use gantry_core::config::{EndpointConfig, LogSpec, ServerSection};
use gantry_server::bootstrap::{self, with_config, with_search_root};
use gantry_server::{App, BootError, ServiceConfig, ServiceInstance, StartupOption};
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Both transports on loopback with OS-assigned ports; warnings only.
pub fn loopback_config() -> ServiceConfig {
    ServiceConfig {
        server: ServerSection {
            rpc: EndpointConfig {
                addr: "127.0.0.1:0".into(),
                timeout: String::new(),
            },
            http: EndpointConfig {
                addr: "127.0.0.1:0".into(),
                timeout: String::new(),
            },
        },
        log: LogSpec {
            output: "stderr".into(),
            level: "warn".into(),
        },
        ..ServiceConfig::default()
    }
}

pub struct Running {
    pub app: Arc<App>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), BootError>>,
    _root: TempDir,
}

impl Running {
    /// Initializes `service` with `config` plus `options` and runs it until
    /// [`Running::shutdown`]. Returns once every listener is bound.
    pub async fn start(service: &str, config: ServiceConfig, options: Vec<StartupOption>) -> Self {
        let root = tempfile::tempdir().unwrap();
        let mut all = vec![with_search_root(root.path()), with_config(config)];
        all.extend(options);

        let app = Arc::new(bootstrap::initialize(service, all).await.unwrap());
        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn({
            let app = Arc::clone(&app);
            async move {
                app.run_until(async {
                    let _ = stopped.await;
                })
                .await
            }
        });

        let running = Self {
            app,
            stop: Some(stop),
            task,
            _root: root,
        };
        running.wait_bound().await;
        running
    }

    async fn wait_bound(&self) {
        for _ in 0..500 {
            if self.app.lifecycle().instance().is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("service never bound its listeners");
    }

    pub fn instance(&self) -> ServiceInstance {
        self.app.lifecycle().instance().unwrap()
    }

    pub fn http_base(&self) -> String {
        format!("http://{}", self.instance().endpoint_for("http").unwrap())
    }

    pub fn rpc_addr(&self) -> String {
        self.instance().endpoint_for("rpc").unwrap().to_string()
    }

    pub async fn shutdown(mut self) -> Result<(), BootError> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio::time::timeout(Duration::from_secs(20), &mut self.task)
            .await
            .expect("service did not stop in time")
            .unwrap()
    }
}
