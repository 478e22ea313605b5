use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use gantry_core::metadata::TRACEPARENT_HEADER;
use gantry_core::{Metadata, Status};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use super::wire::{self, RpcRequest, RpcResponse};
use super::DEFAULT_MAX_FRAME_LENGTH;
use crate::middleware::{CallContext, CallResult, Payload};
use crate::transport::{normalize_bind_addr, TransportError, REASON_TIMEOUT};

const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Reason used when the connection fails underneath a call.
pub const REASON_UNAVAILABLE: &str = "UNAVAILABLE";

type Pending = Arc<DashMap<u64, oneshot::Sender<CallResult>>>;

/// Multiplexing client for [`RpcServer`](super::RpcServer).
///
/// Calls made through [`RpcClient::call`] forward the caller's propagated
/// metadata and trace, so correlation ids cross service boundaries.
pub struct RpcClient {
    next_id: AtomicU64,
    pending: Pending,
    outbound: mpsc::Sender<RpcRequest>,
    timeout: Option<Duration>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RpcClient {
    /// Connects to `addr` (`host:port`, `:port` or `rpc://host:port`).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Connect`] if the TCP connection fails.
    pub async fn connect(addr: &str) -> Result<Self, TransportError> {
        let target = normalize_bind_addr(addr.trim_start_matches("rpc://"));
        let stream = TcpStream::connect(&target)
            .await
            .map_err(|source| TransportError::Connect {
                addr: target.clone(),
                source,
            })?;
        let _ = stream.set_nodelay(true);

        let (mut sink, mut frames) =
            Framed::new(stream, wire::codec(DEFAULT_MAX_FRAME_LENGTH)).split();
        let (outbound, mut queue) = mpsc::channel::<RpcRequest>(OUTBOUND_QUEUE_CAPACITY);
        let pending: Pending = Arc::new(DashMap::new());

        let writer_pending = Arc::clone(&pending);
        let writer = tokio::spawn(async move {
            while let Some(request) = queue.recv().await {
                let id = request.id;
                let sent = match wire::encode(&request) {
                    Ok(frame) => sink.send(frame).await.map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                };
                if let Err(reason) = sent {
                    if let Some((_, waiter)) = writer_pending.remove(&id) {
                        let _ = waiter.send(Err(Status::unavailable(REASON_UNAVAILABLE, reason)));
                    }
                }
            }
        });

        let reader_pending = Arc::clone(&pending);
        let reader = tokio::spawn(async move {
            while let Some(frame) = frames.next().await {
                let bytes = match frame {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        debug!(error = %e, "rpc client read failed");
                        break;
                    }
                };
                match wire::decode::<RpcResponse>(&bytes) {
                    Ok(response) => {
                        if let Some((_, waiter)) = reader_pending.remove(&response.id) {
                            let _ = waiter.send(response.result);
                        }
                    }
                    Err(e) => warn!(error = %e, "dropping undecodable rpc response"),
                }
            }
            // Remaining waiters observe a closed channel.
            reader_pending.clear();
        });

        Ok(Self {
            next_id: AtomicU64::new(1),
            pending,
            outbound,
            timeout: None,
            reader,
            writer,
        })
    }

    /// Bounds every call made through this client.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Calls `operation`, forwarding `ctx.metadata` and a child `traceparent`.
    pub async fn call(&self, ctx: &CallContext, operation: &str, payload: Payload) -> CallResult {
        let mut metadata = ctx.metadata.clone();
        if let Some(trace) = &ctx.trace {
            metadata.insert(TRACEPARENT_HEADER, trace.to_traceparent());
        }
        self.invoke(operation, metadata, payload).await
    }

    /// Calls `operation` with explicit metadata.
    pub async fn invoke(&self, operation: &str, metadata: Metadata, payload: Payload) -> CallResult {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (waiter, response) = oneshot::channel();
        self.pending.insert(id, waiter);

        let request = RpcRequest {
            id,
            operation: operation.to_string(),
            metadata,
            payload,
        };
        if self.outbound.send(request).await.is_err() {
            self.pending.remove(&id);
            return Err(Status::unavailable(REASON_UNAVAILABLE, "connection closed"));
        }

        let outcome = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, response).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.pending.remove(&id);
                    return Err(Status::gateway_timeout(
                        REASON_TIMEOUT,
                        format!("call exceeded {}ms", limit.as_millis()),
                    ));
                }
            },
            None => response.await,
        };
        outcome.unwrap_or_else(|_| Err(Status::unavailable(REASON_UNAVAILABLE, "connection closed")))
    }

    /// Typed wrapper over [`RpcClient::invoke`] with empty metadata.
    ///
    /// # Errors
    ///
    /// Returns the remote status, or `400`/`500` if encoding either side fails.
    pub async fn invoke_typed<Req, Resp>(&self, operation: &str, request: &Req) -> Result<Resp, Status>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_value(request)
            .map_err(|e| Status::bad_request("INVALID_PAYLOAD", e.to_string()))?;
        let value = self.invoke(operation, Metadata::new(), payload).await?;
        serde_json::from_value(value).map_err(|e| Status::internal("DECODE_FAILED", e.to_string()))
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use gantry_core::config::MiddlewareFlags;
    use gantry_core::metadata::REQUEST_ID_HEADER;
    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::middleware::{build_chain, handler_fn, typed_handler};
    use crate::transport::rpc::{RpcServer, RpcSettings};
    use crate::transport::Server;

    #[derive(Deserialize)]
    struct Hello {
        name: String,
    }

    async fn start(timeout: Option<Duration>) -> (Arc<RpcServer>, String, JoinHandle<()>) {
        let settings = RpcSettings {
            addr: "127.0.0.1:0".into(),
            timeout,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        };
        let mut server = RpcServer::new(settings, build_chain(&MiddlewareFlags::default(), Vec::new()));
        server.method(
            "greeter",
            "SayHello",
            typed_handler(|_ctx, req: Hello| async move {
                Ok::<_, Status>(json!({ "message": format!("hello {}", req.name) }))
            }),
        );
        server.method(
            "meta",
            "Echo",
            handler_fn(|ctx: CallContext, _p| async move {
                Ok(serde_json::to_value(&ctx.metadata).unwrap_or_default())
            }),
        );
        server.method(
            "slow",
            "Sleep",
            handler_fn(|_ctx, payload: Payload| async move {
                let ms = payload["ms"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!(ms))
            }),
        );
        let server = Arc::new(server);
        let addr = server.bind().await.unwrap().to_string();
        let serving = tokio::spawn({
            let server = Arc::clone(&server);
            async move {
                let _ = server.serve().await;
            }
        });
        (server, addr, serving)
    }

    #[tokio::test]
    async fn round_trip_typed_call() {
        let (_server, addr, serving) = start(None).await;
        let client = RpcClient::connect(&addr).await.unwrap();

        let reply: serde_json::Value = client
            .invoke_typed("/greeter/SayHello", &json!({"name": "ada"}))
            .await
            .unwrap();
        assert_eq!(reply, json!({"message": "hello ada"}));
        serving.abort();
    }

    #[tokio::test]
    async fn unknown_operation_is_unimplemented() {
        let (_server, addr, serving) = start(None).await;
        let client = RpcClient::connect(&addr).await.unwrap();

        let status = client
            .invoke("/greeter/Nope", Metadata::new(), json!({}))
            .await
            .unwrap_err();
        assert_eq!(status.code, 501);
        assert_eq!(status.reason, "UNIMPLEMENTED");
        serving.abort();
    }

    #[tokio::test]
    async fn propagated_metadata_crosses_the_wire() {
        let (_server, addr, serving) = start(None).await;
        let client = RpcClient::connect(&format!("rpc://{addr}")).await.unwrap();

        let mut ctx = CallContext::new(crate::transport::TransportKind::Http, "/front");
        ctx.metadata.insert(REQUEST_ID_HEADER, "req-9");
        ctx.metadata.insert("x-md-tenant", "acme");

        let seen = client.call(&ctx, "/meta/Echo", json!(null)).await.unwrap();
        assert_eq!(seen, json!({"x-md-tenant": "acme", "x-request-id": "req-9"}));
        serving.abort();
    }

    #[tokio::test]
    async fn concurrent_calls_complete_out_of_order() {
        let (_server, addr, serving) = start(None).await;
        let client = RpcClient::connect(&addr).await.unwrap();

        let slow = client.invoke("/slow/Sleep", Metadata::new(), json!({"ms": 200}));
        let fast = client.invoke("/slow/Sleep", Metadata::new(), json!({"ms": 1}));
        let (slow, fast) = tokio::join!(slow, fast);
        assert_eq!(slow.unwrap(), json!(200));
        assert_eq!(fast.unwrap(), json!(1));
        serving.abort();
    }

    #[tokio::test]
    async fn server_timeout_maps_to_gateway_timeout() {
        let (_server, addr, serving) = start(Some(Duration::from_millis(20))).await;
        let client = RpcClient::connect(&addr).await.unwrap();

        let status = client
            .invoke("/slow/Sleep", Metadata::new(), json!({"ms": 2000}))
            .await
            .unwrap_err();
        assert_eq!(status.code, 504);
        serving.abort();
    }

    #[tokio::test]
    async fn drain_finishes_in_flight_and_rejects_new_calls() {
        let (server, addr, serving) = start(None).await;
        let client = Arc::new(RpcClient::connect(&addr).await.unwrap());

        let in_flight = tokio::spawn({
            let client = Arc::clone(&client);
            async move {
                client
                    .invoke("/slow/Sleep", Metadata::new(), json!({"ms": 150}))
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        let stopping = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.stop(Duration::from_secs(2)).await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;

        let rejected = client
            .invoke("/greeter/SayHello", Metadata::new(), json!({"name": "late"}))
            .await
            .unwrap_err();
        assert_eq!(rejected.code, 503);
        assert_eq!(rejected.reason, "SERVER_DRAINING");

        assert_eq!(in_flight.await.unwrap().unwrap(), json!(150));
        assert!(stopping.await.unwrap());
        tokio::time::timeout(Duration::from_secs(2), serving)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        assert!(matches!(
            RpcClient::connect(&addr).await,
            Err(TransportError::Connect { .. })
        ));
    }
}
