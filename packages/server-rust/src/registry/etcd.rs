//! etcd v3 backend over the JSON gateway (`/v3/...`).
//!
//! Each instance is stored at `/microservices/<name>/<id>` as JSON, attached
//! to a lease that a background task keeps alive. Keys and values travel
//! base64-encoded, as the gateway requires.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use dashmap::DashMap;
use futures_util::stream;
use gantry_core::config::DiscoverySpec;
use gantry_core::ServiceInstance;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{endpoint_url, http_client, BackendHandle, Discovery, Registrar, RegistryError, Watcher};

pub const BACKEND: &str = "etcd";

/// Key prefix under which every service is stored.
pub const KEY_PREFIX: &str = "/microservices";

/// Lease TTL in seconds.
pub const LEASE_TTL_SECS: i64 = 15;

const WATCH_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub(super) fn factory(
    spec: &DiscoverySpec,
    timeout: Duration,
) -> Result<BackendHandle, RegistryError> {
    let registry = EtcdRegistry::new(&spec.endpoints, timeout)?;
    Ok(BackendHandle::from_backend(Arc::new(registry)))
}

/// Registrar and discovery client for etcd.
pub struct EtcdRegistry {
    client: Arc<GatewayClient>,
    leases: DashMap<String, Lease>,
}

struct Lease {
    /// Current lease id; the keepalive task swaps in a fresh one after expiry.
    id: Arc<ArcSwap<String>>,
    keepalive: JoinHandle<()>,
}

impl EtcdRegistry {
    /// Validates `endpoints`; no request is made until the first call.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Connection`] for an unparsable endpoint.
    pub fn new(endpoints: &[String], timeout: Duration) -> Result<Self, RegistryError> {
        let bases = endpoints
            .iter()
            .map(|e| endpoint_url(BACKEND, e).map(|u| u.as_str().trim_end_matches('/').to_string()))
            .collect::<Result<Vec<_>, _>>()?;
        if bases.is_empty() {
            return Err(RegistryError::Connection {
                backend: BACKEND.to_string(),
                reason: "etcd endpoints cannot be empty".to_string(),
            });
        }
        Ok(Self {
            client: Arc::new(GatewayClient {
                http: http_client(BACKEND, timeout)?,
                endpoints: bases,
                timeout,
            }),
            leases: DashMap::new(),
        })
    }
}

impl Drop for EtcdRegistry {
    fn drop(&mut self) {
        for lease in self.leases.iter() {
            lease.keepalive.abort();
        }
    }
}

#[async_trait]
impl Registrar for EtcdRegistry {
    async fn register(&self, instance: &ServiceInstance) -> Result<(), RegistryError> {
        let key = instance_key(&instance.name, &instance.id);
        let value = serde_json::to_string(instance).map_err(|e| RegistryError::Request {
            backend: BACKEND.to_string(),
            reason: e.to_string(),
        })?;

        let lease_id = self.client.grant_lease().await?;
        self.client.put(&key, &value, &lease_id).await?;

        let lease_id = Arc::new(ArcSwap::from_pointee(lease_id));
        let keepalive = tokio::spawn(keep_alive(
            Arc::clone(&self.client),
            key.clone(),
            value,
            Arc::clone(&lease_id),
        ));
        if let Some(previous) = self.leases.insert(
            instance.id.clone(),
            Lease {
                id: lease_id,
                keepalive,
            },
        ) {
            previous.keepalive.abort();
        }
        info!(backend = BACKEND, key = %key, "instance registered");
        Ok(())
    }

    async fn deregister(&self, instance: &ServiceInstance) -> Result<(), RegistryError> {
        let key = instance_key(&instance.name, &instance.id);
        let lease = self.leases.remove(&instance.id).map(|(_, lease)| lease);
        if let Some(lease) = &lease {
            lease.keepalive.abort();
        }

        self.client
            .post("/v3/kv/deleterange", &json!({ "key": BASE64.encode(&key) }))
            .await?;
        if let Some(lease) = lease {
            let id = lease.id.load_full();
            self.client
                .post("/v3/lease/revoke", &json!({ "ID": id.as_str() }))
                .await?;
        }
        info!(backend = BACKEND, key = %key, "instance deregistered");
        Ok(())
    }
}

#[async_trait]
impl Discovery for EtcdRegistry {
    async fn get_service(&self, name: &str) -> Result<Vec<ServiceInstance>, RegistryError> {
        self.client.range(name).await
    }

    /// Polls the service prefix every second and emits when the set changes.
    async fn watch(&self, name: &str) -> Result<Watcher, RegistryError> {
        let initial = self.client.range(name).await?;
        let client = Arc::clone(&self.client);
        let name = name.to_string();

        let updates = stream::unfold(
            (client, name, initial, true),
            |(client, name, last, first)| async move {
                if first {
                    return Some((last.clone(), (client, name, last, false)));
                }
                loop {
                    tokio::time::sleep(WATCH_POLL_INTERVAL).await;
                    match client.range(&name).await {
                        Ok(current) if current != last => {
                            return Some((current.clone(), (client, name, current, false)));
                        }
                        Ok(_) => {}
                        Err(e) => warn!(backend = BACKEND, service = %name, error = %e, "watch poll failed"),
                    }
                }
            },
        );
        Ok(Box::pin(updates))
    }
}

/// Refreshes the lease every third of its TTL.
async fn keep_alive(
    client: Arc<GatewayClient>,
    key: String,
    value: String,
    lease_id: Arc<ArcSwap<String>>,
) {
    #[allow(clippy::cast_sign_loss)]
    let period = Duration::from_secs((LEASE_TTL_SECS / 3).max(1) as u64);
    loop {
        tokio::time::sleep(period).await;
        renew(&client, &key, &value, &lease_id).await;
    }
}

/// One keepalive round. A lost lease is replaced, the key written again
/// under it, and the new id stored for later refreshes and revocation.
async fn renew(client: &GatewayClient, key: &str, value: &str, lease_id: &ArcSwap<String>) {
    let current = lease_id.load_full();
    match client.refresh_lease(&current).await {
        Ok(true) => debug!(backend = BACKEND, key = %key, "lease refreshed"),
        Ok(false) => {
            warn!(backend = BACKEND, key = %key, "lease expired, registering again");
            match client.grant_lease().await {
                Ok(fresh) => {
                    if let Err(e) = client.put(key, value, &fresh).await {
                        warn!(backend = BACKEND, key = %key, error = %e, "re-registration failed");
                    }
                    lease_id.store(Arc::new(fresh));
                }
                Err(e) => warn!(backend = BACKEND, error = %e, "lease grant failed"),
            }
        }
        Err(e) => warn!(backend = BACKEND, key = %key, error = %e, "lease keepalive failed"),
    }
}

// ---------------------------------------------------------------------------
// Gateway client
// ---------------------------------------------------------------------------

struct GatewayClient {
    http: reqwest::Client,
    endpoints: Vec<String>,
    timeout: Duration,
}

#[derive(Deserialize)]
struct GrantResponse {
    #[serde(rename = "ID")]
    id: Value,
}

#[derive(Deserialize)]
struct KeepAliveResponse {
    #[serde(default)]
    result: Option<KeepAliveResult>,
}

#[derive(Deserialize)]
struct KeepAliveResult {
    #[serde(rename = "TTL", default)]
    ttl: Option<Value>,
}

#[derive(Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Deserialize)]
struct KeyValue {
    key: String,
    #[serde(default)]
    value: String,
}

impl GatewayClient {
    /// Sends `body` to each endpoint in order until one answers successfully.
    async fn post(&self, path: &str, body: &Value) -> Result<Value, RegistryError> {
        let mut last_error = None;
        for base in &self.endpoints {
            let url = format!("{base}{path}");
            let sent = self
                .http
                .post(&url)
                .timeout(self.timeout)
                .json(body)
                .send()
                .await;
            match sent {
                Ok(response) if response.status().is_success() => {
                    return response.json().await.map_err(|e| request_error(path, &e));
                }
                Ok(response) => {
                    last_error = Some(RegistryError::Request {
                        backend: BACKEND.to_string(),
                        reason: format!("{path} returned {}", response.status()),
                    });
                }
                Err(e) if e.is_timeout() => {
                    last_error = Some(RegistryError::Timeout {
                        operation: format!("etcd {path}"),
                        after: self.timeout,
                    });
                }
                Err(e) => last_error = Some(request_error(path, &e)),
            }
        }
        Err(last_error.unwrap_or_else(|| RegistryError::Request {
            backend: BACKEND.to_string(),
            reason: "no endpoints".to_string(),
        }))
    }

    async fn grant_lease(&self) -> Result<String, RegistryError> {
        let body = self
            .post("/v3/lease/grant", &json!({ "TTL": LEASE_TTL_SECS }))
            .await?;
        let grant: GrantResponse = decode("/v3/lease/grant", body)?;
        Ok(match grant.id {
            Value::String(id) => id,
            other => other.to_string(),
        })
    }

    async fn put(&self, key: &str, value: &str, lease_id: &str) -> Result<(), RegistryError> {
        self.post(
            "/v3/kv/put",
            &json!({
                "key": BASE64.encode(key),
                "value": BASE64.encode(value),
                "lease": lease_id,
            }),
        )
        .await
        .map(drop)
    }

    /// `Ok(false)` when the lease no longer exists.
    async fn refresh_lease(&self, lease_id: &str) -> Result<bool, RegistryError> {
        let body = self
            .post("/v3/lease/keepalive", &json!({ "ID": lease_id }))
            .await?;
        let reply: KeepAliveResponse = decode("/v3/lease/keepalive", body)?;
        let ttl = reply
            .result
            .and_then(|r| r.ttl)
            .and_then(|ttl| match ttl {
                Value::String(s) => s.parse::<i64>().ok(),
                Value::Number(n) => n.as_i64(),
                _ => None,
            })
            .unwrap_or(0);
        Ok(ttl > 0)
    }

    async fn range(&self, name: &str) -> Result<Vec<ServiceInstance>, RegistryError> {
        let prefix = service_prefix(name);
        let body = self
            .post(
                "/v3/kv/range",
                &json!({
                    "key": BASE64.encode(&prefix),
                    "range_end": BASE64.encode(prefix_end(&prefix)),
                }),
            )
            .await?;
        let range: RangeResponse = decode("/v3/kv/range", body)?;
        Ok(decode_instances(&range.kvs))
    }
}

fn decode<T: serde::de::DeserializeOwned>(path: &str, body: Value) -> Result<T, RegistryError> {
    serde_json::from_value(body).map_err(|e| RegistryError::Request {
        backend: BACKEND.to_string(),
        reason: format!("{path}: unexpected response: {e}"),
    })
}

fn request_error(path: &str, e: &reqwest::Error) -> RegistryError {
    RegistryError::Request {
        backend: BACKEND.to_string(),
        reason: format!("{path}: {e}"),
    }
}

/// Instances from a range response, skipping entries that do not decode.
fn decode_instances(kvs: &[KeyValue]) -> Vec<ServiceInstance> {
    kvs.iter()
        .filter_map(|kv| {
            let raw = BASE64.decode(&kv.value).ok()?;
            match serde_json::from_slice::<ServiceInstance>(&raw) {
                Ok(instance) => Some(instance),
                Err(e) => {
                    let key = BASE64
                        .decode(&kv.key)
                        .map(|k| String::from_utf8_lossy(&k).into_owned())
                        .unwrap_or_default();
                    warn!(backend = BACKEND, key = %key, error = %e, "skipping undecodable instance");
                    None
                }
            }
        })
        .collect()
}

#[must_use]
pub fn instance_key(name: &str, id: &str) -> String {
    format!("{KEY_PREFIX}/{name}/{id}")
}

fn service_prefix(name: &str) -> String {
    format!("{KEY_PREFIX}/{name}/")
}

/// Smallest key greater than every key starting with `prefix`.
fn prefix_end(prefix: &str) -> Vec<u8> {
    let mut end = prefix.as_bytes().to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    vec![0]
}
