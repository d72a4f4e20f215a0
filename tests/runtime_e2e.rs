/// End-to-end tests for the site façade and the event loop
/// These tests compile real workers and drive them through the public Engine API

use std::thread;
use std::time::Duration;

use edgeworker::{
    binding, BindingValue, CancelToken, EngineConfig, EngineError, Env, ErrorKind, HttpRequest, LogLevel,
};
use serde_json::json;

mod common;
use common::{body_text, compile, data, engine, engine_with, fetch};

#[test]
fn test_fetch_handler_builds_response() {
    let result = fetch(
        r#"export default {
            async fetch(request) {
                const url = new URL(request.url);
                return new Response(`hello ${url.searchParams.get('name')}`, {
                    status: 201,
                    headers: { 'x-method': request.method },
                });
            },
        };"#,
        "https://example.com/greet?name=world",
    );
    assert_eq!(body_text(&result), "hello world");
    let response = result.response.unwrap();
    assert_eq!(response.status, 201);
    assert_eq!(response.header("x-method"), Some("GET"));
    assert_eq!(response.header("content-type"), Some("text/plain;charset=UTF-8"));
}

#[test]
fn test_request_body_and_headers_reach_the_handler() {
    let engine = engine();
    compile(
        &engine,
        "echo",
        r#"export default {
            async fetch(request) {
                const body = await request.json();
                return Response.json({ got: body.n * 2, auth: request.headers.get('Authorization') });
            },
        };"#,
    );
    let request = HttpRequest::post("https://example.com/echo", br#"{"n":21}"#.to_vec())
        .with_header("authorization", "Bearer t0ken");
    let result = engine.execute_fetch("echo", "v1", Env::new(), request);
    let body: serde_json::Value = serde_json::from_str(&body_text(&result)).unwrap();
    assert_eq!(body, json!({ "got": 42, "auth": "Bearer t0ken" }));
    assert_eq!(
        result.response.unwrap().header("content-type"),
        Some("application/json")
    );
}

#[test]
fn test_console_output_is_captured() {
    let result = fetch(
        r#"export default {
            fetch() {
                console.log('plain');
                console.warn('careful');
                console.error(new Error('broken'));
                return new Response('ok');
            },
        };"#,
        "https://example.com/",
    );
    assert_eq!(body_text(&result), "ok");
    let levels: Vec<LogLevel> = result.logs.iter().map(|l| l.level).collect();
    assert_eq!(levels, vec![LogLevel::Log, LogLevel::Warn, LogLevel::Error]);
    assert_eq!(result.logs[0].message, "plain");
    assert!(result.logs[2].message.contains("broken"), "{:?}", result.logs[2]);
}

#[test]
fn test_log_buffer_is_capped() {
    let mut config = EngineConfig::default();
    config.max_log_entries = 3;
    let engine = engine_with(config);
    compile(
        &engine,
        "chatty",
        r#"export default {
            fetch() {
                for (let i = 0; i < 10; i++) console.log(`line ${i}`);
                return new Response('ok');
            },
        };"#,
    );
    let result = engine.execute_fetch("chatty", "v1", Env::new(), HttpRequest::get("https://example.com/"));
    assert_eq!(result.logs.len(), 4);
    assert!(result.logs[3].message.contains("7 entries dropped"));
}

#[test]
fn test_named_functions_return_json() {
    let engine = engine();
    compile(
        &engine,
        "fns",
        r#"export default {
            fetch() { return new Response(''); },
            async add(env, a, b) { return { sum: a + b, region: env.REGION }; },
            nothing() {},
        };"#,
    );
    let env = Env::new().with_var("REGION", "eu");
    let result = engine.execute_function("fns", "v1", env, "add", vec![json!(2), json!(3)]);
    assert_eq!(data(&result), json!({ "sum": 5, "region": "eu" }));

    let result = engine.execute_function("fns", "v1", Env::new(), "nothing", Vec::new());
    assert_eq!(result.data.as_deref(), Some("null"));

    let result = engine.execute_function("fns", "v1", Env::new(), "missing", Vec::new());
    assert_eq!(result.error.unwrap().kind, ErrorKind::MissingExport);
}

#[test]
fn test_compile_errors_and_caching() {
    let engine = engine();
    let err = engine
        .compile_and_cache("broken", "v1", "export default { fetch( }")
        .unwrap_err();
    assert!(matches!(err, EngineError::Compile(ref e) if e.name == "SyntaxError"), "{err}");

    let err = engine.compile_and_cache("nodefault", "v1", "export const x = 1;").unwrap_err();
    assert!(matches!(err, EngineError::Compile(_)), "{err}");

    let source = "export default { fetch() { return new Response('v1'); } };";
    let first = engine.compile_and_cache("site", "v1", source).unwrap();
    let second = engine.compile_and_cache("site", "v1", "ignored while v1 is cached").unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), 64);
    assert_eq!(engine.stats().compiled, 1);

    engine
        .compile_and_cache("site", "v2", "export default { fetch() { return new Response('v2'); } };")
        .unwrap();
    let stats = engine.stats();
    assert_eq!(stats.contexts, 1);
    assert_eq!(stats.evictions, 1);

    let stale = engine.execute_fetch("site", "v1", Env::new(), HttpRequest::get("https://example.com/"));
    assert_eq!(stale.error.unwrap().kind, ErrorKind::HostError);
    let fresh = engine.execute_fetch("site", "v2", Env::new(), HttpRequest::get("https://example.com/"));
    assert_eq!(body_text(&fresh), "v2");

    let unknown = engine.execute_fetch("nope", "v1", Env::new(), HttpRequest::get("https://example.com/"));
    assert_eq!(unknown.error.unwrap().kind, ErrorKind::HostError);
}

#[test]
fn test_concurrent_compiles_share_one_context() {
    let engine = engine();
    let source = "export default { fetch() { return new Response('once'); } };";
    let digests: Vec<String> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..4)
            .map(|_| scope.spawn(|| engine.compile_and_cache("shared", "v1", source).unwrap()))
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });
    assert!(digests.windows(2).all(|pair| pair[0] == pair[1]));
    let stats = engine.stats();
    assert_eq!(stats.compiled, 1);
    assert_eq!(stats.contexts, 1);
    assert_eq!(stats.evictions, 0);
}

#[test]
fn test_lru_keeps_at_most_max_contexts() {
    let mut config = EngineConfig::default();
    config.max_contexts = 2;
    let engine = engine_with(config);
    let source = "export default { fetch() { return new Response('x'); } };";
    compile(&engine, "a", source);
    compile(&engine, "b", source);
    let _ = engine.execute_fetch("a", "v1", Env::new(), HttpRequest::get("https://example.com/"));
    compile(&engine, "c", source);

    assert_eq!(engine.stats().contexts, 2);
    let evicted = engine.execute_fetch("b", "v1", Env::new(), HttpRequest::get("https://example.com/"));
    assert_eq!(evicted.error.unwrap().kind, ErrorKind::HostError);
    let kept = engine.execute_fetch("a", "v1", Env::new(), HttpRequest::get("https://example.com/"));
    assert_eq!(body_text(&kept), "x");
    assert!(engine.evict("a"));
    assert!(!engine.evict("a"));
}

#[test]
fn test_timers_fire_in_order() {
    let result = fetch(
        r#"export default {
            async fetch() {
                const order = [];
                await new Promise((resolve) => {
                    setTimeout(() => order.push('b'), 20);
                    setTimeout(() => order.push('a1'), 0);
                    setTimeout(() => order.push('a2'), 0);
                    Promise.resolve().then(() => order.push('micro'));
                    const cancelled = setTimeout(() => order.push('never'), 5);
                    clearTimeout(cancelled);
                    let ticks = 0;
                    const interval = setInterval(() => {
                        if (++ticks === 3) { clearInterval(interval); resolve(); }
                    }, 10);
                });
                await new Promise((r) => setTimeout(r, 30));
                return new Response(order.join(','));
            },
        };"#,
        "https://example.com/",
    );
    assert_eq!(body_text(&result), "micro,a1,a2,b");
}

#[test]
fn test_deadline_aborts_request_signal() {
    let engine = engine();
    compile(
        &engine,
        "slow",
        r#"export default {
            fetch(request) {
                request.signal.addEventListener('abort', () => {
                    console.log(`aborted: ${request.signal.reason.name}`);
                });
                return new Promise(() => {});
            },
        };"#,
    );
    let env = Env::new().with_timeout(Duration::from_millis(100));
    let result = engine.execute_fetch("slow", "v1", env, HttpRequest::get("https://example.com/"));
    assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::TimeoutError);
    assert!(result.elapsed >= Duration::from_millis(100));
    assert!(
        result.logs.iter().any(|l| l.message == "aborted: TimeoutError"),
        "{:?}",
        result.logs
    );
}

#[test]
fn test_busy_loop_is_interrupted_and_context_reused() {
    let engine = engine();
    compile(
        &engine,
        "spin",
        r#"export default {
            fetch(request) {
                if (new URL(request.url).pathname === '/spin') { while (true) {} }
                return new Response('alive');
            },
        };"#,
    );
    let env = Env::new().with_timeout(Duration::from_millis(100));
    let result = engine.execute_fetch("spin", "v1", env, HttpRequest::get("https://example.com/spin"));
    assert_eq!(result.error.unwrap().kind, ErrorKind::TimeoutError);

    let result = engine.execute_fetch("spin", "v1", Env::new(), HttpRequest::get("https://example.com/"));
    assert_eq!(body_text(&result), "alive");
}

#[test]
fn test_host_cancellation() {
    let engine = engine();
    compile(
        &engine,
        "wait",
        r#"export default {
            fetch(request) {
                return new Promise((_, reject) => {
                    request.signal.addEventListener('abort', () => reject(request.signal.reason));
                });
            },
        };"#,
    );
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        trigger.cancel();
    });
    let env = Env::new().with_cancel(cancel);
    let result = engine.execute_fetch("wait", "v1", env, HttpRequest::get("https://example.com/"));
    canceller.join().unwrap();
    assert_eq!(result.error.unwrap().kind, ErrorKind::AbortError);
}

#[test]
fn test_errors_map_to_kinds() {
    let engine = engine();
    compile(
        &engine,
        "errors",
        r#"export default {
            fetch(request) {
                switch (new URL(request.url).pathname) {
                    case '/throw': throw new RangeError('out of range');
                    case '/type': return null;
                    case '/reject': {
                        Promise.reject(new Error('nobody listens'));
                        return new Response('ok');
                    }
                    case '/timer': {
                        setTimeout(() => { throw new Error('from timer'); }, 0);
                        return new Promise((r) => setTimeout(() => r(new Response('late')), 10));
                    }
                }
            },
        };"#,
    );
    let run = |path: &str| {
        engine.execute_fetch(
            "errors",
            "v1",
            Env::new(),
            HttpRequest::get(format!("https://example.com{path}")),
        )
    };

    let err = run("/throw").error.unwrap();
    assert_eq!(err.kind, ErrorKind::Exception);
    assert_eq!(err.message, "RangeError: out of range");
    assert!(err.stack.is_some());

    let err = run("/type").error.unwrap();
    assert_eq!(err.kind, ErrorKind::TypeError);

    let err = run("/reject").error.unwrap();
    assert_eq!(err.kind, ErrorKind::UnhandledRejection);
    assert!(err.message.contains("nobody listens"), "{}", err.message);

    let result = run("/timer");
    let err = result.error.unwrap();
    assert_eq!(err.message, "Error: from timer");
    assert!(result.logs.iter().any(|l| l.level == LogLevel::Error));
}

#[test]
fn test_custom_bindings() {
    let engine = engine();
    compile(
        &engine,
        "bindings",
        r#"export default {
            async fetch(request, env) {
                env.KV.put('greeting', `hello ${env.CONFIG.name}`);
                return new Response(env.KV.get('greeting'));
            },
        };"#,
    );
    let store = std::sync::Arc::new(std::sync::Mutex::new(std::collections::HashMap::new()));
    let kv = {
        let store = store.clone();
        binding(move |_| {
            let (put, get) = (store.clone(), store.clone());
            Ok(BindingValue::object()
                .method("put", move |args| {
                    let key = args[0].as_str().unwrap_or_default().to_string();
                    put.lock().unwrap().insert(key, args[1].clone());
                    Ok(serde_json::Value::Null)
                })
                .method("get", move |args| {
                    let key = args[0].as_str().unwrap_or_default();
                    Ok(get.lock().unwrap().get(key).cloned().unwrap_or_default())
                }))
        })
    };
    let env = Env::new()
        .with_binding("KV", kv)
        .with_binding("CONFIG", binding(|ctx| Ok(BindingValue::json(json!({ "name": ctx.site })))));
    let result = engine.execute_fetch("bindings", "v1", env, HttpRequest::get("https://example.com/"));
    assert_eq!(body_text(&result), "hello bindings");
    assert_eq!(store.lock().unwrap()["greeting"], json!("hello bindings"));

    let failing = Env::new().with_binding("DB", binding(|_| Err(anyhow::anyhow!("connection refused"))));
    let result = engine.execute_fetch("bindings", "v1", failing, HttpRequest::get("https://example.com/"));
    let err = result.error.unwrap();
    assert_eq!(err.kind, ErrorKind::HostError);
    assert_eq!(err.message, "custom binding DB: connection refused");
}

#[test]
fn test_wait_until_and_pass_through() {
    let engine = engine();
    compile(
        &engine,
        "ctx",
        r#"export default {
            fetch(request, env, ctx) {
                if (new URL(request.url).pathname === '/fail') {
                    ctx.passThroughOnException();
                    throw new Error('origin please');
                }
                ctx.waitUntil(new Promise((r) => setTimeout(() => { console.log('background done'); r(); }, 20)));
                return new Response('fast');
            },
        };"#,
    );
    let result = engine.execute_fetch("ctx", "v1", Env::new(), HttpRequest::get("https://example.com/"));
    assert_eq!(body_text(&result), "fast");
    assert!(result.logs.iter().any(|l| l.message == "background done"));
    assert!(!result.pass_through);

    let result = engine.execute_fetch("ctx", "v1", Env::new(), HttpRequest::get("https://example.com/fail"));
    assert!(result.error.is_some());
    assert!(result.pass_through);
}

#[test]
fn test_streaming_response_body_is_collected() {
    let result = fetch(
        r#"export default {
            fetch() {
                const { readable, writable } = new TransformStream({
                    transform(chunk, controller) { controller.enqueue(chunk.toUpperCase()); },
                });
                const writer = writable.getWriter();
                (async () => {
                    for (const part of ['a', 'b', 'c']) {
                        await new Promise((r) => setTimeout(r, 1));
                        await writer.write(part);
                    }
                    await writer.close();
                })();
                const encoded = readable.pipeThrough(new TextEncoderStream());
                return new Response(encoded);
            },
        };"#,
        "https://example.com/",
    );
    assert_eq!(body_text(&result), "ABC");
}

#[test]
fn test_readable_stream_piped_through_transform() {
    let result = fetch(
        r#"export default {
            fetch() {
                const source = ReadableStream.from(['He', 'll', 'o']);
                const upper = new TransformStream({
                    transform(chunk, controller) { controller.enqueue(chunk.toUpperCase()); },
                });
                return new Response(source.pipeThrough(upper).pipeThrough(new TextEncoderStream()));
            },
        };"#,
        "https://example.com/",
    );
    assert_eq!(body_text(&result), "HELLO");
}

#[test]
fn test_web_platform_globals() {
    let engine = engine();
    compile(
        &engine,
        "globals",
        r#"export default {
            fetch() { return new Response(''); },
            check() {
                const a = { name: 'x', when: new Date(0), list: [1, 2] };
                a.self = a;
                const copy = structuredClone(a);
                const params = new URLSearchParams('b=2&a=1&a=0');
                params.sort();
                const bytes = new TextEncoder().encode('héllo');
                const form = new FormData();
                form.append('k', 'v');
                return {
                    cycle: copy.self === copy && copy !== a,
                    date: copy.when instanceof Date,
                    params: params.toString(),
                    size: params.size,
                    b64: btoa('hi'),
                    roundTrip: atob(btoa('ÿ')) === 'ÿ',
                    utf8: bytes.length,
                    decoded: new TextDecoder().decode(bytes),
                    headers: new Headers([['Set-Cookie', 'a=1'], ['set-cookie', 'b=2']]).getSetCookie(),
                    form: form.get('k'),
                    abortable: typeof AbortSignal.any,
                    sliced: new Blob(['hello']).slice(1, 3).size,
                };
            },
        };"#,
    );
    let result = engine.execute_function("globals", "v1", Env::new(), "check", Vec::new());
    assert_eq!(
        data(&result),
        json!({
            "cycle": true,
            "date": true,
            "params": "a=1&a=0&b=2",
            "size": 3,
            "b64": "aGk=",
            "roundTrip": true,
            "utf8": 6,
            "decoded": "héllo",
            "headers": ["a=1", "b=2"],
            "form": "v",
            "abortable": "function",
            "sliced": 2,
        })
    );
}

#[test]
fn test_heap_limit_discards_context() {
    let mut config = EngineConfig::default();
    config.heap_memory_max_mb = 16;
    let engine = engine_with(config);
    compile(
        &engine,
        "hog",
        r#"export default {
            fetch() {
                const hoard = [];
                while (true) hoard.push(new Array(100000).fill('x'));
            },
        };"#,
    );
    let result = engine.execute_fetch("hog", "v1", Env::new(), HttpRequest::get("https://example.com/"));
    assert_eq!(result.error.unwrap().kind, ErrorKind::MemoryLimit);
    assert_eq!(engine.stats().contexts, 0);
}
