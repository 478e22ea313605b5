//! Demo service wired entirely through `gantry_server::bootstrap`.
//!
//! HTTP: `GET /hello?name=`, `POST /echo`, `GET /slow?ms=`, `GET /divide?a=&b=`.
//! RPC: `/greeter/SayHello`.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use gantry_server::bootstrap::{self, with_config_file, with_http_router, with_rpc_service};
use gantry_server::middleware::{handler_fn, typed_handler, CallContext, Payload};
use gantry_server::{StartupOption, Status};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Parser)]
#[command(name = "gantry-demo", about = "Gantry demo service")]
struct Cli {
    /// Service name used for logging, config lookup and registration.
    #[arg(long, env = "GANTRY_SERVICE", default_value = "gantry-demo")]
    service: String,

    /// Configuration file; otherwise `config.toml`, `configs/config.toml`
    /// and `configs/<service>.toml` are searched.
    #[arg(long, env = "GANTRY_CONFIG")]
    config: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HelloRequest {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Serialize)]
struct HelloReply {
    message: String,
}

async fn say_hello(_ctx: CallContext, req: HelloRequest) -> Result<HelloReply, Status> {
    let name = if req.name.is_empty() { "world" } else { req.name.as_str() };
    Ok(HelloReply {
        message: format!("hello {name}"),
    })
}

/// Integer query or body field; query values arrive as strings.
fn int_param(payload: &Payload, key: &str) -> i64 {
    payload[key]
        .as_i64()
        .or_else(|| payload[key].as_str().and_then(|s| s.parse().ok()))
        .unwrap_or_default()
}

fn options(cli: &Cli) -> Vec<StartupOption> {
    let mut options = Vec::new();
    if let Some(path) = &cli.config {
        options.push(with_config_file(path));
    }
    options.push(with_http_router(|http| {
        http.get("/hello", typed_handler(say_hello))
            .post("/echo", handler_fn(|_ctx, payload: Payload| async move { Ok(payload) }))
            .get(
                "/slow",
                handler_fn(|_ctx, payload: Payload| async move {
                    let ms = u64::try_from(int_param(&payload, "ms")).unwrap_or_default();
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(json!({ "slept_ms": ms }))
                }),
            )
            .get(
                "/divide",
                handler_fn(|_ctx, payload: Payload| async move {
                    let a = int_param(&payload, "a");
                    let b = int_param(&payload, "b");
                    // Division by zero panics; the recovery middleware answers 500.
                    Ok(json!(a / b))
                }),
            );
    }));
    options.push(with_rpc_service(|rpc| {
        rpc.method("greeter", "SayHello", typed_handler(say_hello));
    }));
    options
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match bootstrap::run(&cli.service, options(&cli)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {e}", cli.service);
            ExitCode::FAILURE
        }
    }
}
