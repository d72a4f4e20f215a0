/// End-to-end tests for outbound fetch against local axum mock servers
/// Execution blocks the calling thread, so these tests use the multi-threaded runtime

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect};
use axum::routing::{get, post};
use axum::{Json, Router};
use edgeworker::{EngineConfig, Env, ErrorKind, HeaderRule, HttpRequest, WorkerResult};
use serde_json::{json, Value};

mod common;
use common::{body_text, compile, data, engine_with, serve};

fn mock() -> Router {
    Router::new()
        .route("/json", get(|| async { Json(json!({ "hello": "world" })) }))
        .route(
            "/headers",
            get(|headers: HeaderMap| async move {
                let value = |name: &str| {
                    headers
                        .get(name)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string()
                };
                Json(json!({ "key": value("x-api-key"), "agent": value("user-agent"), "custom": value("x-custom") }))
            }),
        )
        .route("/echo", post(|body: String| async move { format!("echo:{body}") }))
        .route("/old", get(|| async { Redirect::temporary("/json") }))
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "too late"
            }),
        )
        .route(
            "/stream",
            get(|| async {
                let chunks = futures_util::stream::iter(vec![
                    Ok::<_, std::io::Error>("one,"),
                    Ok("two,"),
                    Ok("three"),
                ]);
                Body::from_stream(chunks)
            }),
        )
        .route("/teapot", get(|| async { (StatusCode::IM_A_TEAPOT, "short and stout").into_response() }))
}

const WORKER: &str = r#"
export default {
    fetch(request, env) {
        return fetch(`${env.BASE}/stream`);
    },

    async json(env) {
        const response = await fetch(`${env.BASE}/json`);
        return { status: response.status, ok: response.ok, body: await response.json(), type: response.headers.get('content-type') };
    },

    async headers(env) {
        const response = await fetch(`${env.BASE}/headers`, { headers: { 'X-Custom': 'yes' } });
        return response.json();
    },

    async echo(env) {
        const response = await fetch(`${env.BASE}/echo`, { method: 'POST', body: 'ping' });
        return response.text();
    },

    async redirects(env) {
        const followed = await fetch(`${env.BASE}/old`);
        const manual = await fetch(`${env.BASE}/old`, { redirect: 'manual' });
        let blocked = null;
        try {
            await fetch(`${env.BASE}/old`, { redirect: 'error' });
        } catch (e) {
            blocked = e.name;
        }
        return {
            redirected: followed.redirected,
            url: new URL(followed.url).pathname,
            body: await followed.json(),
            manualStatus: manual.status,
            location: manual.headers.get('location'),
            blocked,
        };
    },

    async abort(env) {
        const controller = new AbortController();
        setTimeout(() => controller.abort(), 50);
        try {
            await fetch(`${env.BASE}/slow`, { signal: controller.signal });
            return 'completed';
        } catch (e) {
            return e.name;
        }
    },

    async timerOutlivesAbort(env) {
        let fired = 0;
        const timer = new Promise((resolve) => setTimeout(() => { fired += 1; resolve(); }, 50));
        const controller = new AbortController();
        setTimeout(() => controller.abort(), 10);
        let failure = null;
        try {
            await fetch(`${env.BASE}/slow`, { signal: controller.signal });
        } catch (e) {
            failure = e.name;
        }
        const before = fired;
        await timer;
        return { failure, before, fired };
    },

    async chunks(env) {
        const response = await fetch(`${env.BASE}/stream`);
        const reader = response.body.getReader();
        const decoder = new TextDecoder();
        let text = '';
        for (;;) {
            const { value, done } = await reader.read();
            if (done) break;
            text += decoder.decode(value, { stream: true });
        }
        return { text, used: response.bodyUsed };
    },

    async status(env) {
        const response = await fetch(`${env.BASE}/teapot`);
        return { status: response.status, ok: response.ok, text: await response.text() };
    },

    async denied(env) {
        try {
            await fetch(`${env.BASE}/json`);
            return null;
        } catch (e) {
            return { name: e.name, message: e.message, cause: e.cause && e.cause.message };
        }
    },

    async unreachable() {
        const response = await fetch('http://127.0.0.1:1/');
        return response.status;
    },
};
"#;

fn env(addr: SocketAddr) -> Env {
    Env::new().with_var("BASE", format!("http://{addr}"))
}

fn call(config: EngineConfig, addr: SocketAddr, name: &str) -> WorkerResult {
    let engine = engine_with(config);
    compile(&engine, "fetcher", WORKER);
    engine.execute_function("fetcher", "v1", env(addr), name, Vec::new())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fetch_json() {
    let addr = serve(mock()).await;
    let out = data(&call(EngineConfig::default(), addr, "json"));
    assert_eq!(
        out,
        json!({ "status": 200, "ok": true, "body": { "hello": "world" }, "type": "application/json" })
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_header_rules_and_user_agent() {
    let addr = serve(mock()).await;
    let mut config = EngineConfig::default();
    config.user_agent = "edgeworker-test".into();
    config.fetch.header_rules = vec![
        HeaderRule::new("127.0.0.1", "x-api-key", "s3cret"),
        HeaderRule::new("*.elsewhere.example", "x-api-key", "wrong"),
    ];
    let out = data(&call(config, addr, "headers"));
    assert_eq!(out, json!({ "key": "s3cret", "agent": "edgeworker-test", "custom": "yes" }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_post_body_is_sent() {
    let addr = serve(mock()).await;
    let out = data(&call(EngineConfig::default(), addr, "echo"));
    assert_eq!(out, json!("echo:ping"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_redirect_modes() {
    let addr = serve(mock()).await;
    let out = data(&call(EngineConfig::default(), addr, "redirects"));
    assert_eq!(out["redirected"], json!(true));
    assert_eq!(out["url"], json!("/json"));
    assert_eq!(out["body"], json!({ "hello": "world" }));
    assert_eq!(out["manualStatus"], json!(307));
    assert_eq!(out["location"], json!("/json"));
    assert_eq!(out["blocked"], json!("TypeError"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abort_signal_cancels_fetch() {
    let addr = serve(mock()).await;
    let result = call(EngineConfig::default(), addr, "abort");
    assert_eq!(data(&result), json!("AbortError"));
    assert!(result.elapsed < Duration::from_secs(4), "{:?}", result.elapsed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timer_still_fires_after_fetch_abort() {
    let addr = serve(mock()).await;
    let out = data(&call(EngineConfig::default(), addr, "timerOutlivesAbort"));
    assert_eq!(out, json!({ "failure": "AbortError", "before": 0, "fired": 1 }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_streamed_bodies() {
    let addr = serve(mock()).await;
    let out = data(&call(EngineConfig::default(), addr, "chunks"));
    assert_eq!(out, json!({ "text": "one,two,three", "used": true }));

    let engine = engine_with(EngineConfig::default());
    compile(&engine, "proxy", WORKER);
    let result = engine.execute_fetch("proxy", "v1", env(addr), HttpRequest::get("https://example.com/"));
    assert_eq!(body_text(&result), "one,two,three");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_error_statuses_are_responses() {
    let addr = serve(mock()).await;
    let out = data(&call(EngineConfig::default(), addr, "status"));
    assert_eq!(out, json!({ "status": 418, "ok": false, "text": "short and stout" }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_policy_denies_unlisted_hosts() {
    let addr = serve(mock()).await;
    let mut config = EngineConfig::default();
    config.fetch.allowed_hosts = vec!["*.allowed.example".into()];
    let out: Value = data(&call(config, addr, "denied"));
    assert_eq!(out["name"], json!("TypeError"));
    assert_eq!(out["message"], json!("Failed to fetch"));
    assert!(
        out["cause"].as_str().unwrap_or_default().contains("not allowed"),
        "{out}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connection_failure_is_network_error() {
    let addr = serve(mock()).await;
    let result = call(EngineConfig::default(), addr, "unreachable");
    let err = result.error.expect("connection to port 1 must fail");
    assert_eq!(err.kind, ErrorKind::NetworkError);
}
