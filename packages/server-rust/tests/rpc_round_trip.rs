mod common;

use std::sync::Arc;
use std::time::Duration;

use gantry_core::config::EndpointConfig;
use gantry_core::{Envelope, Metadata};
use gantry_server::bootstrap::{with_http_router, with_middleware, with_rpc_service};
use gantry_server::middleware::{from_fn, handler_fn, typed_handler, CallContext, Next, Payload};
use gantry_server::transport::{HttpServer, RpcClient};
use gantry_server::Status;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use common::{loopback_config, Running};

#[derive(Debug, Serialize, Deserialize)]
struct Sum {
    a: i64,
    b: i64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Total {
    total: i64,
}

async fn calculator(seen: Arc<Mutex<Vec<String>>>) -> Running {
    let mut config = loopback_config();
    config.server.http = EndpointConfig::default();

    Running::start(
        "calculator",
        config,
        vec![
            with_middleware(from_fn("audit", move |ctx: CallContext, payload, next: Next| {
                seen.lock().push(ctx.operation.clone());
                next.run(ctx, payload)
            })),
            with_rpc_service(|rpc| {
                rpc.method(
                    "calc",
                    "Add",
                    typed_handler(|_ctx, req: Sum| async move { Ok(Total { total: req.a + req.b }) }),
                )
                .method(
                    "calc",
                    "Context",
                    handler_fn(|ctx, _payload: Payload| async move {
                        Ok(json!({
                            "tenant": ctx.metadata.get("x-md-tenant"),
                            "request_id": ctx.request_id(),
                            "traced": ctx.headers.contains_key("traceparent"),
                        }))
                    }),
                );
            }),
        ],
    )
    .await
}

#[tokio::test]
async fn typed_call_runs_through_the_chain() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let svc = calculator(Arc::clone(&seen)).await;
    assert!(svc.instance().endpoint_for("http").is_none());

    let client = RpcClient::connect(&svc.rpc_addr()).await.unwrap();
    let total: Total = client
        .invoke_typed("/calc/Add", &Sum { a: 2, b: 40 })
        .await
        .unwrap();
    assert_eq!(total, Total { total: 42 });
    assert_eq!(*seen.lock(), vec!["/calc/Add".to_string()]);

    drop(client);
    svc.shutdown().await.unwrap();
}

#[tokio::test]
async fn bad_payload_and_unknown_operation_map_to_statuses() {
    let svc = calculator(Arc::new(Mutex::new(Vec::new()))).await;
    let client = RpcClient::connect(&format!("rpc://{}", svc.rpc_addr()))
        .await
        .unwrap()
        .with_timeout(Duration::from_secs(5));

    let err = client
        .invoke("/calc/Add", Metadata::new(), json!({ "a": "two" }))
        .await
        .unwrap_err();
    assert_eq!(err.code, 400);

    let err = client
        .invoke("/calc/Multiply", Metadata::new(), json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.code, 501);

    drop(client);
    svc.shutdown().await.unwrap();
}

#[tokio::test]
async fn metadata_flows_from_http_edge_to_rpc_backend() {
    let backend = calculator(Arc::new(Mutex::new(Vec::new()))).await;
    let client = Arc::new(RpcClient::connect(&backend.rpc_addr()).await.unwrap());

    let mut config = loopback_config();
    config.server.rpc = EndpointConfig::default();
    config.middleware.enable_tracing = true;
    let edge = Running::start(
        "edge",
        config,
        vec![with_http_router({
            let client = Arc::clone(&client);
            move |http: &mut HttpServer| {
                http.get(
                    "/context",
                    handler_fn(move |ctx: CallContext, _payload| {
                        let client = Arc::clone(&client);
                        async move { client.call(&ctx, "/calc/Context", json!({})).await }
                    }),
                );
            }
        })],
    )
    .await;

    let resp = reqwest::Client::new()
        .get(format!("{}/context", edge.http_base()))
        .header("x-md-tenant", "acme")
        .header("x-request-id", "edge-1")
        .send()
        .await
        .unwrap();
    let env: Envelope = resp.json().await.unwrap();
    assert_eq!(
        env.data,
        Some(json!({ "tenant": "acme", "request_id": "edge-1", "traced": true }))
    );

    edge.shutdown().await.unwrap();
    drop(client);
    backend.shutdown().await.unwrap();
}

#[tokio::test]
async fn handler_errors_keep_their_code() {
    let mut config = loopback_config();
    config.server.http = EndpointConfig::default();
    let svc = Running::start(
        "strict",
        config,
        vec![with_rpc_service(|rpc| {
            rpc.method(
                "users",
                "Get",
                handler_fn(|_ctx, _payload: Payload| async {
                    Err(Status::not_found("USER_NOT_FOUND", "no user 7").with_metadata("id", "7"))
                }),
            );
        })],
    )
    .await;

    let client = RpcClient::connect(&svc.rpc_addr()).await.unwrap();
    let err = client
        .invoke("/users/Get", Metadata::new(), json!({ "id": 7 }))
        .await
        .unwrap_err();
    assert_eq!(err.code, 404);
    assert_eq!(err.reason, "USER_NOT_FOUND");
    assert_eq!(err.metadata.get("id").map(String::as_str), Some("7"));

    drop(client);
    svc.shutdown().await.unwrap();
}
