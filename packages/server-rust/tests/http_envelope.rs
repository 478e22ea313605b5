mod common;

use gantry_core::Envelope;
use gantry_server::bootstrap::with_http_router;
use gantry_server::middleware::{handler_fn, Payload};
use gantry_server::Status;
use serde_json::json;

use common::{loopback_config, Running};

async fn start() -> Running {
    Running::start(
        "envelopes",
        loopback_config(),
        vec![with_http_router(|http| {
            http.get(
                "/hello",
                handler_fn(|_ctx, payload: Payload| async move {
                    let name = payload["name"].as_str().unwrap_or("world").to_string();
                    Ok(json!({ "message": format!("hello {name}") }))
                }),
            )
            .post(
                "/users/{id}",
                handler_fn(|_ctx, payload: Payload| async move { Ok(payload) }),
            )
            .get(
                "/missing",
                handler_fn(|_ctx, _payload: Payload| async {
                    Err(Status::not_found("USER_NOT_FOUND", "no such user"))
                }),
            )
            .get(
                "/boom",
                handler_fn(|_ctx, _payload: Payload| async {
                    if std::hint::black_box(true) {
                        panic!("handler blew up");
                    }
                    Ok(json!(null))
                }),
            )
            .get(
                "/request-id",
                handler_fn(|ctx, _payload: Payload| async move {
                    Ok(json!(ctx.request_id().map(str::to_string)))
                }),
            );
        })],
    )
    .await
}

async fn envelope(resp: reqwest::Response) -> Envelope {
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    resp.json().await.unwrap()
}

#[tokio::test]
async fn success_is_wrapped_with_code_200() {
    let svc = start().await;
    let resp = reqwest::get(format!("{}/hello?name=ada", svc.http_base()))
        .await
        .unwrap();
    assert!(resp.headers().contains_key("x-request-id"));

    let env = envelope(resp).await;
    assert_eq!(env.code, 200);
    assert_eq!(env.msg, "success");
    assert_eq!(env.data, Some(json!({ "message": "hello ada" })));
    assert!(env.error.is_none());

    svc.shutdown().await.unwrap();
}

#[tokio::test]
async fn payload_merges_query_path_and_body() {
    let svc = start().await;
    let resp = reqwest::Client::new()
        .post(format!("{}/users/42?source=query&name=query", svc.http_base()))
        .json(&json!({ "name": "body" }))
        .send()
        .await
        .unwrap();

    let env = envelope(resp).await;
    assert_eq!(
        env.data,
        Some(json!({ "source": "query", "id": "42", "name": "body" }))
    );

    svc.shutdown().await.unwrap();
}

#[tokio::test]
async fn failures_keep_http_200_and_carry_the_code() {
    let svc = start().await;
    let base = svc.http_base();

    let env = envelope(reqwest::get(format!("{base}/missing")).await.unwrap()).await;
    assert_eq!(env.code, 404);
    assert_eq!(env.msg, "no such user");
    assert_eq!(env.error.as_deref(), Some("no such user"));
    assert!(env.data.is_none());

    let env = envelope(reqwest::get(format!("{base}/nowhere")).await.unwrap()).await;
    assert_eq!(env.code, 404);

    let resp = reqwest::Client::new()
        .post(format!("{base}/users/1"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(envelope(resp).await.code, 400);

    svc.shutdown().await.unwrap();
}

#[tokio::test]
async fn panicking_handler_yields_500_and_service_keeps_serving() {
    let svc = start().await;
    let base = svc.http_base();

    let env = envelope(reqwest::get(format!("{base}/boom")).await.unwrap()).await;
    assert_eq!(env.code, 500);

    let env = envelope(reqwest::get(format!("{base}/hello")).await.unwrap()).await;
    assert_eq!(env.data, Some(json!({ "message": "hello world" })));

    svc.shutdown().await.unwrap();
}

#[tokio::test]
async fn caller_request_id_reaches_handler_and_response() {
    let svc = start().await;
    let resp = reqwest::Client::new()
        .get(format!("{}/request-id", svc.http_base()))
        .header("x-request-id", "req-123")
        .send()
        .await
        .unwrap();
    assert_eq!(
        resp.headers().get("x-request-id").and_then(|v| v.to_str().ok()),
        Some("req-123")
    );
    assert_eq!(envelope(resp).await.data, Some(json!("req-123")));

    svc.shutdown().await.unwrap();
}
