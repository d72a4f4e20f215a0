/// Common test utilities
use std::net::SocketAddr;
use std::sync::Once;

use edgeworker::{Engine, EngineConfig, Env, HttpRequest, WorkerResult};

static V8_INIT: Once = Once::new();
static TRACING_INIT: Once = Once::new();

/// Initializes V8 (and a RUST_LOG-driven subscriber) once per test binary
pub fn ensure_v8() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
    V8_INIT.call_once(edgeworker::initialize_v8);
}

/// Engine with default configuration
#[allow(dead_code)]
pub fn engine() -> Engine {
    engine_with(EngineConfig::default())
}

pub fn engine_with(config: EngineConfig) -> Engine {
    ensure_v8();
    Engine::new(config).expect("Failed to start engine")
}

/// Compiles `source` as site `site` (deploy key "v1")
pub fn compile(engine: &Engine, site: &str, source: &str) {
    engine
        .compile_and_cache(site, "v1", source)
        .unwrap_or_else(|e| panic!("Failed to compile {site}: {e}"));
}

/// Runs a GET for `url` against a freshly compiled worker
#[allow(dead_code)]
pub fn fetch(source: &str, url: &str) -> WorkerResult {
    let engine = engine();
    compile(&engine, "test", source);
    engine.execute_fetch("test", "v1", Env::new(), HttpRequest::get(url))
}

/// Response body of a successful fetch, panicking with the error otherwise
#[allow(dead_code)]
pub fn body_text(result: &WorkerResult) -> String {
    if let Some(err) = &result.error {
        panic!("worker failed: {err} (logs: {:?})", result.logs);
    }
    result.response.as_ref().expect("no response").text()
}

/// Resolved value of a successful function call
#[allow(dead_code)]
pub fn data(result: &WorkerResult) -> serde_json::Value {
    if let Some(err) = &result.error {
        panic!("worker failed: {err} (logs: {:?})", result.logs);
    }
    result.json().expect("no data")
}

/// Serves `router` on an ephemeral local port
#[allow(dead_code)]
pub async fn serve(router: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind mock server");
    let addr = listener.local_addr().expect("Failed to read mock server address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}
