use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use gantry_core::Status;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::wire::{self, RpcRequest, RpcResponse};
use super::{operation_name, RpcSettings};
use crate::middleware::{BoxHandler, CallContext, CallResult, MiddlewareChain};
use crate::transport::gate::ServeGate;
use crate::transport::{
    draining_status, endpoint_url, normalize_bind_addr, with_deadline, Server, TransportError,
    TransportKind,
};

/// Bound on queued responses per connection before handlers wait.
const RESPONSE_QUEUE_CAPACITY: usize = 256;

/// Reason carried by calls to operations nobody registered.
pub const REASON_UNIMPLEMENTED: &str = "UNIMPLEMENTED";

/// RPC server with deferred startup: construct, register methods, `bind()`, `serve()`.
pub struct RpcServer {
    settings: RpcSettings,
    chain: MiddlewareChain,
    methods: HashMap<String, BoxHandler>,
    gate: Arc<ServeGate>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl RpcServer {
    #[must_use]
    pub fn new(settings: RpcSettings, chain: MiddlewareChain) -> Self {
        Self {
            settings,
            chain,
            methods: HashMap::new(),
            gate: ServeGate::new(),
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &RpcSettings {
        &self.settings
    }

    #[must_use]
    pub fn gate(&self) -> Arc<ServeGate> {
        Arc::clone(&self.gate)
    }

    /// Registers `handler` as `/<service>/<method>`, wrapped with the chain.
    /// Registering the same operation again replaces the earlier handler.
    pub fn method(&mut self, service: &str, method: &str, handler: BoxHandler) -> &mut Self {
        let operation = operation_name(service, method);
        let handler = with_deadline(self.settings.timeout, handler);
        self.methods.insert(operation, self.chain.then(handler));
        self
    }

    /// Registered operation names, sorted.
    #[must_use]
    pub fn operations(&self) -> Vec<String> {
        let mut ops: Vec<String> = self.methods.keys().cloned().collect();
        ops.sort();
        ops
    }
}

#[async_trait]
impl Server for RpcServer {
    fn kind(&self) -> TransportKind {
        TransportKind::Rpc
    }

    async fn bind(&self) -> Result<SocketAddr, TransportError> {
        let addr = normalize_bind_addr(&self.settings.addr);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| TransportError::Bind {
                kind: TransportKind::Rpc,
                addr: addr.clone(),
                source,
            })?;
        let local = listener.local_addr()?;
        info!(kind = "rpc", addr = %local, "listener bound");

        *self.listener.lock() = Some(listener);
        *self.local_addr.lock() = Some(local);
        Ok(local)
    }

    fn unbind(&self) {
        if self.listener.lock().take().is_some() {
            debug!(kind = "rpc", "listener released");
        }
        *self.local_addr.lock() = None;
    }

    /// Accepts connections until draining begins, then waits for open
    /// connections to finish. Connections close once the gate has stopped.
    async fn serve(&self) -> Result<(), TransportError> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or(TransportError::NotBound(TransportKind::Rpc))?;
        let shared = Arc::new(ConnectionShared {
            methods: self.methods.clone(),
            gate: Arc::clone(&self.gate),
            max_frame_length: self.settings.max_frame_length,
        });

        self.gate.set_serving();
        info!(kind = "rpc", operations = self.methods.len(), "serving");

        let shutdown = self.gate.shutdown_signal();
        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "rpc connection accepted");
                        connections.spawn(serve_connection(stream, peer, Arc::clone(&shared)));
                    }
                    Err(e) => warn!(error = %e, "rpc accept failed"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
        drop(listener);

        while connections.join_next().await.is_some() {}
        Ok(())
    }

    async fn stop(&self, timeout: Duration) -> bool {
        self.gate.begin_drain();
        let drained = self.gate.wait_for_drain(timeout).await;
        if drained {
            info!(kind = "rpc", "drained");
        } else {
            warn!(
                kind = "rpc",
                in_flight = self.gate.in_flight_count(),
                "drain timeout expired with calls in flight"
            );
        }
        drained
    }

    fn endpoint(&self) -> Option<String> {
        (*self.local_addr.lock()).map(|addr| endpoint_url(TransportKind::Rpc, addr))
    }
}

// ---------------------------------------------------------------------------
// Connection handling
// ---------------------------------------------------------------------------

struct ConnectionShared {
    methods: HashMap<String, BoxHandler>,
    gate: Arc<ServeGate>,
    max_frame_length: usize,
}

/// Reads requests until the peer disconnects or the gate stops.
///
/// Each admitted request runs on its own task; responses funnel through a
/// single writer task so they can complete out of order. While draining,
/// new requests are answered with `503 SERVER_DRAINING`.
async fn serve_connection(stream: TcpStream, peer: SocketAddr, shared: Arc<ConnectionShared>) {
    let (mut sink, mut frames) =
        Framed::new(stream, wire::codec(shared.max_frame_length)).split();
    let (tx, mut rx) = mpsc::channel::<RpcResponse>(RESPONSE_QUEUE_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            match wire::encode(&response) {
                Ok(frame) => {
                    if sink.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(id = response.id, error = %e, "failed to encode rpc response"),
            }
        }
    });

    let stopped = shared.gate.stopped_signal();
    tokio::pin!(stopped);
    loop {
        let frame = tokio::select! {
            () = &mut stopped => break,
            frame = frames.next() => frame,
        };
        let bytes = match frame {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                debug!(peer = %peer, error = %e, "rpc connection read failed");
                break;
            }
            None => break,
        };
        let request: RpcRequest = match wire::decode(&bytes) {
            Ok(request) => request,
            Err(e) => {
                warn!(peer = %peer, error = %e, "dropping undecodable rpc frame");
                continue;
            }
        };

        let tx = tx.clone();
        let Some(guard) = shared.gate.try_enter() else {
            let _ = tx
                .send(RpcResponse {
                    id: request.id,
                    result: Err(draining_status()),
                })
                .await;
            continue;
        };
        let shared = Arc::clone(&shared);
        tokio::spawn(async move {
            let id = request.id;
            let result = dispatch(&shared, request).await;
            let _ = tx.send(RpcResponse { id, result }).await;
            drop(guard);
        });
    }

    drop(tx);
    let _ = writer.await;
    debug!(peer = %peer, "rpc connection closed");
}

async fn dispatch(shared: &ConnectionShared, request: RpcRequest) -> CallResult {
    let Some(handler) = shared.methods.get(&request.operation) else {
        return Err(Status::unimplemented(
            REASON_UNIMPLEMENTED,
            format!("unknown operation {}", request.operation),
        ));
    };
    let ctx = CallContext::new(TransportKind::Rpc, request.operation).with_headers(request.metadata);
    handler.call(ctx, request.payload).await
}
