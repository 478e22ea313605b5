//! Consul backend over the agent HTTP API.
//!
//! Instances are registered as agent services with a TTL check that a
//! background task passes periodically. Every endpoint becomes a tagged
//! address keyed by its scheme, so lookups can rebuild the endpoint URLs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream;
use gantry_core::config::DiscoverySpec;
use gantry_core::ServiceInstance;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{endpoint_url, http_client, BackendHandle, Discovery, Registrar, RegistryError, Watcher};

pub const BACKEND: &str = "consul";

/// TTL of the health check attached to each registration.
pub const CHECK_TTL: &str = "15s";

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const DEREGISTER_CRITICAL_AFTER: &str = "1m";
const BLOCKING_WAIT: &str = "55s";
const BLOCKING_WAIT_SLACK: Duration = Duration::from_secs(60);
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);
const VERSION_META_KEY: &str = "version";
const CONSUL_INDEX_HEADER: &str = "x-consul-index";

pub(super) fn factory(
    spec: &DiscoverySpec,
    timeout: Duration,
) -> Result<BackendHandle, RegistryError> {
    let registry = ConsulRegistry::new(&spec.endpoints, timeout)?;
    Ok(BackendHandle::from_backend(Arc::new(registry)))
}

/// Registrar and discovery client for a Consul agent.
pub struct ConsulRegistry {
    client: Arc<AgentClient>,
    heartbeats: DashMap<String, JoinHandle<()>>,
}

impl ConsulRegistry {
    /// Uses the first endpoint; the rest are ignored.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Connection`] for a missing or unparsable endpoint.
    pub fn new(endpoints: &[String], timeout: Duration) -> Result<Self, RegistryError> {
        let first = endpoints.first().ok_or_else(|| RegistryError::Connection {
            backend: BACKEND.to_string(),
            reason: "consul endpoints cannot be empty".to_string(),
        })?;
        let base = endpoint_url(BACKEND, first)?
            .as_str()
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            client: Arc::new(AgentClient {
                http: http_client(BACKEND, timeout)?,
                base,
                timeout,
            }),
            heartbeats: DashMap::new(),
        })
    }
}

impl Drop for ConsulRegistry {
    fn drop(&mut self) {
        for task in self.heartbeats.iter() {
            task.abort();
        }
    }
}

#[async_trait]
impl Registrar for ConsulRegistry {
    async fn register(&self, instance: &ServiceInstance) -> Result<(), RegistryError> {
        let registration = Registration::from_instance(instance)?;
        self.client
            .put(&["v1", "agent", "service", "register"], Some(&registration))
            .await?;

        let check = check_id(&instance.id);
        self.client.pass_check(&check).await?;
        let heartbeat = tokio::spawn(heartbeat(Arc::clone(&self.client), check));
        if let Some(previous) = self.heartbeats.insert(instance.id.clone(), heartbeat) {
            previous.abort();
        }
        info!(backend = BACKEND, service = %instance.name, id = %instance.id, "instance registered");
        Ok(())
    }

    async fn deregister(&self, instance: &ServiceInstance) -> Result<(), RegistryError> {
        if let Some((_, task)) = self.heartbeats.remove(&instance.id) {
            task.abort();
        }
        self.client
            .put::<()>(&["v1", "agent", "service", "deregister", &instance.id], None)
            .await?;
        info!(backend = BACKEND, service = %instance.name, id = %instance.id, "instance deregistered");
        Ok(())
    }
}

#[async_trait]
impl Discovery for ConsulRegistry {
    async fn get_service(&self, name: &str) -> Result<Vec<ServiceInstance>, RegistryError> {
        self.client.healthy(name, None).await.map(|(instances, _)| instances)
    }

    /// Long-polls with Consul blocking queries, emitting when the set changes.
    async fn watch(&self, name: &str) -> Result<Watcher, RegistryError> {
        let (initial, index) = self.client.healthy(name, None).await?;
        let client = Arc::clone(&self.client);
        let name = name.to_string();

        let updates = stream::unfold(
            (client, name, initial, index, true),
            |(client, name, last, index, first)| async move {
                if first {
                    return Some((last.clone(), (client, name, last, index, false)));
                }
                let mut index = index;
                loop {
                    match client.healthy(&name, Some(index)).await {
                        Ok((current, reported)) => {
                            let (next, backoff) = next_blocking_index(index, reported);
                            index = next;
                            if current != last {
                                return Some((current.clone(), (client, name, current, index, false)));
                            }
                            if backoff {
                                tokio::time::sleep(WATCH_RETRY_DELAY).await;
                            }
                        }
                        Err(e) => {
                            warn!(backend = BACKEND, service = %name, error = %e, "blocking query failed");
                            tokio::time::sleep(WATCH_RETRY_DELAY).await;
                        }
                    }
                }
            },
        );
        Ok(Box::pin(updates))
    }
}

async fn heartbeat(client: Arc<AgentClient>, check: String) {
    loop {
        tokio::time::sleep(HEARTBEAT_INTERVAL).await;
        match client.pass_check(&check).await {
            Ok(()) => debug!(backend = BACKEND, check = %check, "ttl check passed"),
            Err(e) => warn!(backend = BACKEND, check = %check, error = %e, "ttl heartbeat failed"),
        }
    }
}

/// Index for the next blocking query and whether to pause before sending it.
///
/// An index that went backwards means the agent restarted, so the watch
/// starts over from 0. One that did not advance (or a missing header, read
/// as 0) makes the next query return at once.
fn next_blocking_index(previous: u64, reported: u64) -> (u64, bool) {
    let index = if reported < previous { 0 } else { reported };
    (index, reported <= previous)
}

fn check_id(instance_id: &str) -> String {
    format!("service:{instance_id}")
}

// ---------------------------------------------------------------------------
// Agent API
// ---------------------------------------------------------------------------

struct AgentClient {
    http: reqwest::Client,
    base: String,
    timeout: Duration,
}

impl AgentClient {
    /// Agent URL for `segments`, each percent-encoded as one path segment.
    fn url(&self, segments: &[&str]) -> Result<reqwest::Url, RegistryError> {
        let mut url = reqwest::Url::parse(&self.base).map_err(|e| RegistryError::Connection {
            backend: BACKEND.to_string(),
            reason: format!("invalid agent address {}: {e}", self.base),
        })?;
        url.path_segments_mut()
            .map_err(|()| RegistryError::Connection {
                backend: BACKEND.to_string(),
                reason: format!("agent address {} cannot carry a path", self.base),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn put<T: Serialize + ?Sized>(
        &self,
        segments: &[&str],
        body: Option<&T>,
    ) -> Result<(), RegistryError> {
        let url = self.url(segments)?;
        let path = url.path().to_string();
        let mut request = self.http.put(url).timeout(self.timeout);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(|e| self.send_error(&path, &e))?;
        if !response.status().is_success() {
            return Err(RegistryError::Request {
                backend: BACKEND.to_string(),
                reason: format!("{path} returned {}", response.status()),
            });
        }
        Ok(())
    }

    async fn pass_check(&self, check: &str) -> Result<(), RegistryError> {
        self.put::<()>(&["v1", "agent", "check", "pass", check], None).await
    }

    /// Passing instances of `name` and the `X-Consul-Index` of the answer.
    /// With `index`, blocks until the set changes or the wait expires.
    async fn healthy(
        &self,
        name: &str,
        index: Option<u64>,
    ) -> Result<(Vec<ServiceInstance>, u64), RegistryError> {
        let url = self.url(&["v1", "health", "service", name])?;
        let path = url.path().to_string();
        let mut request = self.http.get(url).query(&[("passing", "true")]);
        request = match index {
            Some(index) => request
                .query(&[("index", index.to_string().as_str()), ("wait", BLOCKING_WAIT)])
                .timeout(self.timeout + BLOCKING_WAIT_SLACK),
            None => request.timeout(self.timeout),
        };

        let response = request.send().await.map_err(|e| self.send_error(&path, &e))?;
        if !response.status().is_success() {
            return Err(RegistryError::Request {
                backend: BACKEND.to_string(),
                reason: format!("{path} returned {}", response.status()),
            });
        }
        let next_index = response
            .headers()
            .get(CONSUL_INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let entries: Vec<HealthEntry> = response.json().await.map_err(|e| RegistryError::Request {
            backend: BACKEND.to_string(),
            reason: format!("{path}: unexpected response: {e}"),
        })?;
        Ok((entries.into_iter().map(HealthEntry::into_instance).collect(), next_index))
    }

    fn send_error(&self, path: &str, e: &reqwest::Error) -> RegistryError {
        if e.is_timeout() {
            RegistryError::Timeout {
                operation: format!("consul {path}"),
                after: self.timeout,
            }
        } else {
            RegistryError::Request {
                backend: BACKEND.to_string(),
                reason: format!("{path}: {e}"),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TaggedAddress {
    address: String,
    port: u16,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Registration {
    #[serde(rename = "ID")]
    id: String,
    name: String,
    tags: Vec<String>,
    meta: BTreeMap<String, String>,
    address: String,
    port: u16,
    tagged_addresses: BTreeMap<String, TaggedAddress>,
    check: TtlCheck,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct TtlCheck {
    #[serde(rename = "CheckID")]
    check_id: String,
    #[serde(rename = "TTL")]
    ttl: String,
    deregister_critical_service_after: String,
}

impl Registration {
    fn from_instance(instance: &ServiceInstance) -> Result<Self, RegistryError> {
        let mut tagged = BTreeMap::new();
        for endpoint in &instance.endpoints {
            let url = reqwest::Url::parse(endpoint).map_err(|e| RegistryError::Configuration(
                format!("invalid instance endpoint {endpoint:?}: {e}"),
            ))?;
            let (Some(host), Some(port)) = (url.host_str(), url.port()) else {
                return Err(RegistryError::Configuration(format!(
                    "instance endpoint {endpoint:?} needs a host and port"
                )));
            };
            tagged.entry(url.scheme().to_string()).or_insert(TaggedAddress {
                address: host.to_string(),
                port,
            });
        }
        let primary = instance
            .endpoints
            .first()
            .and_then(|e| reqwest::Url::parse(e).ok())
            .and_then(|u| tagged.get(u.scheme()).cloned())
            .unwrap_or(TaggedAddress {
                address: String::new(),
                port: 0,
            });

        let mut meta = instance.metadata.clone();
        meta.insert(VERSION_META_KEY.to_string(), instance.version.clone());

        Ok(Self {
            id: instance.id.clone(),
            name: instance.name.clone(),
            tags: vec![format!("version={}", instance.version)],
            meta,
            address: primary.address,
            port: primary.port,
            tagged_addresses: tagged,
            check: TtlCheck {
                check_id: check_id(&instance.id),
                ttl: CHECK_TTL.to_string(),
                deregister_critical_service_after: DEREGISTER_CRITICAL_AFTER.to_string(),
            },
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    service: AgentService,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentService {
    #[serde(rename = "ID")]
    id: String,
    service: String,
    #[serde(default)]
    meta: Option<BTreeMap<String, String>>,
    #[serde(default)]
    tagged_addresses: Option<BTreeMap<String, TaggedAddress>>,
    #[serde(default)]
    address: String,
    #[serde(default)]
    port: u16,
}

impl HealthEntry {
    fn into_instance(self) -> ServiceInstance {
        let service = self.service;
        let mut metadata = service.meta.unwrap_or_default();
        let version = metadata.remove(VERSION_META_KEY).unwrap_or_default();

        // Consul adds lan/wan addresses of its own; those are not endpoints.
        let mut endpoints: Vec<String> = service
            .tagged_addresses
            .unwrap_or_default()
            .into_iter()
            .filter(|(scheme, _)| !scheme.starts_with("lan") && !scheme.starts_with("wan"))
            .map(|(scheme, addr)| format!("{scheme}://{}:{}", addr.address, addr.port))
            .collect();
        if endpoints.is_empty() && !service.address.is_empty() {
            endpoints.push(format!("http://{}:{}", service.address, service.port));
        }

        ServiceInstance {
            id: service.id,
            name: service.service,
            version,
            metadata,
            endpoints,
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::extract::{Path, State};
    use axum::http::HeaderMap;
    use axum::routing::{get, put};
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    use super::*;

    fn instance() -> ServiceInstance {
        ServiceInstance {
            id: "users-1".into(),
            name: "users".into(),
            version: "v1.2.0".into(),
            metadata: BTreeMap::from([("region".to_string(), "eu".to_string())]),
            endpoints: vec!["rpc://10.0.0.5:9000".into(), "http://10.0.0.5:8000".into()],
        }
    }

    #[test]
    fn registration_carries_endpoints_as_tagged_addresses() {
        let reg = serde_json::to_value(Registration::from_instance(&instance()).unwrap()).unwrap();
        assert_eq!(reg["ID"], "users-1");
        assert_eq!(reg["Name"], "users");
        assert_eq!(reg["Address"], "10.0.0.5");
        assert_eq!(reg["Port"], 9000);
        assert_eq!(reg["Meta"]["version"], "v1.2.0");
        assert_eq!(reg["Meta"]["region"], "eu");
        assert_eq!(reg["TaggedAddresses"]["http"], json!({"Address": "10.0.0.5", "Port": 8000}));
        assert_eq!(reg["Check"]["CheckID"], "service:users-1");
        assert_eq!(reg["Check"]["TTL"], "15s");
    }

    #[test]
    fn registration_rejects_endpoint_without_port() {
        let mut inst = instance();
        inst.endpoints = vec!["rpc://10.0.0.5".into()];
        assert!(matches!(
            Registration::from_instance(&inst),
            Err(RegistryError::Configuration(_))
        ));
    }

    #[test]
    fn health_entry_rebuilds_instance() {
        let entry: HealthEntry = serde_json::from_value(json!({
            "Service": {
                "ID": "users-1",
                "Service": "users",
                "Meta": {"version": "v1.2.0", "region": "eu"},
                "Address": "10.0.0.5",
                "Port": 9000,
                "TaggedAddresses": {
                    "http": {"Address": "10.0.0.5", "Port": 8000},
                    "rpc": {"Address": "10.0.0.5", "Port": 9000},
                    "lan_ipv4": {"Address": "10.0.0.5", "Port": 9000}
                }
            },
            "Checks": []
        }))
        .unwrap();
        assert_eq!(entry.into_instance(), instance_sorted());
    }

    fn instance_sorted() -> ServiceInstance {
        let mut inst = instance();
        inst.endpoints.sort();
        inst
    }

    #[derive(Clone, Default)]
    struct FakeAgent {
        services: Arc<Mutex<BTreeMap<String, Value>>>,
        passes: Arc<Mutex<Vec<String>>>,
    }

    async fn start_fake() -> (FakeAgent, String) {
        let fake = FakeAgent::default();
        let app = Router::new()
            .route(
                "/v1/agent/service/register",
                put(|State(f): State<FakeAgent>, Json(body): Json<Value>| async move {
                    let id = body["ID"].as_str().unwrap_or_default().to_string();
                    f.services.lock().insert(id, body);
                }),
            )
            .route(
                "/v1/agent/service/deregister/{id}",
                put(|State(f): State<FakeAgent>, Path(id): Path<String>| async move {
                    f.services.lock().remove(&id);
                }),
            )
            .route(
                "/v1/agent/check/pass/{check}",
                put(|State(f): State<FakeAgent>, Path(check): Path<String>| async move {
                    f.passes.lock().push(check);
                }),
            )
            .route(
                "/v1/health/service/{name}",
                get(|State(f): State<FakeAgent>, Path(name): Path<String>| async move {
                    let entries: Vec<Value> = f
                        .services
                        .lock()
                        .values()
                        .filter(|s| s["Name"] == name.as_str())
                        .map(|s| {
                            json!({"Service": {
                                "ID": s["ID"],
                                "Service": s["Name"],
                                "Meta": s["Meta"],
                                "Address": s["Address"],
                                "Port": s["Port"],
                                "TaggedAddresses": s["TaggedAddresses"],
                            }})
                        })
                        .collect();
                    let mut headers = HeaderMap::new();
                    headers.insert("X-Consul-Index", "7".parse().unwrap());
                    (headers, Json(entries))
                }),
            )
            .with_state(fake.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (fake, format!("http://{addr}"))
    }

    #[tokio::test]
    async fn register_lookup_deregister() {
        let (fake, addr) = start_fake().await;
        let registry = ConsulRegistry::new(&[addr], Duration::from_secs(2)).unwrap();

        registry.register(&instance()).await.unwrap();
        assert_eq!(fake.passes.lock().as_slice(), ["service:users-1"]);
        assert_eq!(registry.get_service("users").await.unwrap(), vec![instance_sorted()]);

        let (_, index) = registry.client.healthy("users", None).await.unwrap();
        assert_eq!(index, 7);

        registry.deregister(&instance()).await.unwrap();
        assert!(registry.get_service("users").await.unwrap().is_empty());
    }

    #[test]
    fn blocking_index_backs_off_unless_it_advances() {
        assert_eq!(next_blocking_index(7, 9), (9, false));
        assert_eq!(next_blocking_index(7, 7), (7, true));
        // Missing header reads as 0.
        assert_eq!(next_blocking_index(0, 0), (0, true));
        // Agent restart.
        assert_eq!(next_blocking_index(7, 3), (0, true));
    }

    #[test]
    fn service_names_are_encoded_as_one_segment() {
        let registry =
            ConsulRegistry::new(&["127.0.0.1:8500".to_string()], Duration::from_secs(1)).unwrap();
        let url = registry
            .client
            .url(&["v1", "health", "service", "a b/c"])
            .unwrap();
        assert!(url.as_str().ends_with("/v1/health/service/a%20b%2Fc"), "{url}");
    }

    #[test]
    fn empty_endpoints_rejected() {
        assert!(matches!(
            ConsulRegistry::new(&[], Duration::from_secs(1)),
            Err(RegistryError::Connection { .. })
        ));
    }
}
