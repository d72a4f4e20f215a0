//! Request entry points and completion reporting.
//!
//! The host drives a request through four JS functions on `__edge`:
//! `beginRequest` (binds `__requestID`, the root `AbortController` and
//! `env`), `dispatchFetch` / `dispatchFunction` (call the default export and
//! report how its promise settled through the `op_complete_*` ops),
//! `abortRequest` (timeout or host cancellation) and `endRequest`.

use crate::engine::{native, JsEngine, OpReturn};
use crate::error::{JsError, OpError};
use crate::request_state::Completion;
use crate::result::HttpResponse;

use super::{with_request, SharedHost};

/// Global path the worker's default export is exposed at.
pub const WORKER_PATH: &str = "__edge.worker";

fn settle(state: &mut crate::request_state::RequestState, completion: Completion) {
    if !state.completion.is_settled() {
        state.completion = completion;
    }
}

pub fn install<E: JsEngine>(engine: &mut E, host: &SharedHost) -> Result<(), JsError> {
    let h = host.clone();
    engine.register_fn(
        "op_complete_response",
        native(move |args| {
            let headers: Vec<(String, String)> = args.parse(3)?;
            let response = HttpResponse {
                status: u16::try_from(args.u32(1)?).map_err(|_| OpError::range_error("status out of range"))?,
                status_text: args.string(2)?,
                headers,
                body: args.bytes(4)?,
            };
            with_request(&h, &args, 0, |state| {
                settle(state, Completion::Response(response));
                Ok(())
            })?;
            OpReturn::undefined()
        }),
    );

    let h = host.clone();
    engine.register_fn(
        "op_complete_data",
        native(move |args| {
            let data = args.string(1)?;
            with_request(&h, &args, 0, |state| {
                settle(state, Completion::Data(data));
                Ok(())
            })?;
            OpReturn::undefined()
        }),
    );

    let h = host.clone();
    engine.register_fn(
        "op_complete_error",
        native(move |args| {
            let err = JsError {
                name: args.string(1)?,
                message: args.string(2)?,
                stack: args.opt_string(3)?,
            };
            with_request(&h, &args, 0, |state| {
                settle(state, Completion::Failed(err));
                Ok(())
            })?;
            OpReturn::undefined()
        }),
    );

    let h = host.clone();
    engine.register_fn(
        "op_pass_through",
        native(move |args| {
            with_request(&h, &args, 0, |state| {
                state.pass_through = true;
                Ok(())
            })?;
            OpReturn::undefined()
        }),
    );

    let h = host.clone();
    engine.register_fn(
        "op_binding_call",
        native(move |args| {
            let binding = args.string(1)?;
            let method = args.string(2)?;
            let call_args: Vec<serde_json::Value> = args.parse(3)?;
            let f = h
                .borrow()
                .bindings
                .get(&(binding.clone(), method.clone()))
                .cloned()
                .ok_or_else(|| OpError::type_error(format!("{binding}.{method} is not a function")))?;
            let value = f(&call_args).map_err(|e| OpError::Generic(format!("custom binding {binding}: {e:#}")))?;
            OpReturn::value(value)
        }),
    );

    engine.eval("<dispatch-setup>", DISPATCH_JS)?;
    Ok(())
}

const DISPATCH_JS: &str = r#"
(function() {
    const ops = globalThis.__ops;
    const edge = globalThis.__edge;
    const roots = new Map();
    const envs = new Map();

    function buildEnv(rid, values, objects) {
        const env = { ...values };
        for (const name of Object.keys(objects)) {
            const target = {};
            for (const method of objects[name]) {
                target[method] = (...args) => ops.op_binding_call(rid, name, method, args);
            }
            env[name] = Object.freeze(target);
        }
        return env;
    }

    function run(rid, body) {
        (async () => body())().catch((err) => {
            const [name, message, stack] = edge.describeError(err);
            ops.op_complete_error(rid, name, message, stack);
        });
    }

    edge.beginRequest = function(rid, values, objects) {
        globalThis.__requestID = rid;
        roots.set(rid, new AbortController());
        envs.set(rid, buildEnv(rid, values || {}, objects || {}));
    };

    edge.dispatchFetch = function(rid, method, url, headers, body) {
        const root = roots.get(rid);
        const env = envs.get(rid);
        const hasBody = body !== null && method !== 'GET' && method !== 'HEAD';
        const ctx = Object.freeze({
            waitUntil(promise) {
                ops.op_pending_add(rid);
                Promise.resolve(promise)
                    .then(undefined, (err) => {
                        try { ops.op_console_write(rid, 'error', `Uncaught (in waitUntil) ${edge.inspect(err)}`); } catch (_) {}
                    })
                    .finally(() => { try { ops.op_pending_sub(rid); } catch (_) {} });
            },
            passThroughOnException() {
                ops.op_pass_through(rid);
            },
        });
        run(rid, async () => {
            const request = new Request(url, { method, headers, body: hasBody ? body : null, signal: root.signal });
            const worker = globalThis.__edge.worker;
            const response = await worker.fetch(request, env, ctx);
            const [status, statusText, list, bytes] = await edge.collectResponse(response);
            ops.op_complete_response(rid, status, statusText, list, bytes);
        });
    };

    edge.dispatchFunction = function(rid, name, args) {
        const env = envs.get(rid);
        run(rid, async () => {
            const worker = globalThis.__edge.worker;
            const value = await worker[name](env, ...args);
            const text = JSON.stringify(value);
            ops.op_complete_data(rid, text === undefined ? 'null' : text);
        });
    };

    edge.abortRequest = function(rid, name) {
        const root = roots.get(rid);
        if (!root || root.signal.aborted) return;
        const message = name === 'TimeoutError' ? 'The operation timed out.' : 'The operation was aborted.';
        root.abort(new DOMException(message, name));
    };

    edge.endRequest = function(rid) {
        roots.delete(rid);
        envs.delete(rid);
        edge.clearTimers();
        if (globalThis.__requestID === rid) globalThis.__requestID = 0;
    };
})();
"#;
