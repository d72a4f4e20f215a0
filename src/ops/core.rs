//! Context bootstrap: the hidden `__edge` namespace, `DOMException`,
//! `queueMicrotask`, `performance` and `navigator`.

use crate::engine::{native, JsEngine, OpReturn};
use crate::error::JsError;
use crate::result::LogLevel;

use super::SharedHost;

pub fn install<E: JsEngine>(engine: &mut E, host: &SharedHost) -> Result<(), JsError> {
    let h = host.clone();
    engine.register_fn(
        "op_now",
        native(move |_| {
            let elapsed = h.borrow().started.elapsed();
            OpReturn::value(elapsed.as_secs_f64() * 1000.0)
        }),
    );

    let h = host.clone();
    engine.register_fn(
        "op_user_agent",
        native(move |_| OpReturn::value(h.borrow().config.user_agent.clone())),
    );

    let h = host.clone();
    engine.register_fn(
        "op_report_uncaught",
        native(move |args| {
            let request_id = args.u64(0)?;
            let error = JsError {
                name: args.string(1)?,
                message: args.string(2)?,
                stack: args.opt_string(3)?,
            };
            let mut host = h.borrow_mut();
            match host.requests.get_mut(request_id) {
                Ok(state) => {
                    state.logs.push(request_id, LogLevel::Error, format!("Uncaught {error}"));
                    state.uncaught.get_or_insert(error);
                }
                Err(_) => tracing::warn!(request_id, %error, "uncaught error outside of a request"),
            }
            OpReturn::undefined()
        }),
    );

    engine.register_fn(
        "op_pending_add",
        native({
            let h = host.clone();
            move |args| {
                let request_id = args.u64(0)?;
                h.borrow_mut().requests.get_mut(request_id)?.pending_add();
                OpReturn::undefined()
            }
        }),
    );
    engine.register_fn(
        "op_pending_sub",
        native({
            let h = host.clone();
            move |args| {
                let request_id = args.u64(0)?;
                if let Ok(state) = h.borrow_mut().requests.get_mut(request_id) {
                    state.pending_sub();
                }
                OpReturn::undefined()
            }
        }),
    );

    engine.eval("<core-setup>", CORE_JS)?;
    Ok(())
}

const CORE_JS: &str = r#"
(function() {
    const ops = globalThis.__ops;
    const edge = {};
    Object.defineProperty(globalThis, '__edge', { value: edge, enumerable: false });
    Object.defineProperty(globalThis, '__requestID', { value: 0, writable: true, enumerable: false });

    edge.rid = () => globalThis.__requestID;

    edge.toBytes = function(data, what) {
        if (data instanceof Uint8Array) return data;
        if (ArrayBuffer.isView(data)) return new Uint8Array(data.buffer, data.byteOffset, data.byteLength);
        if (data instanceof ArrayBuffer) return new Uint8Array(data);
        throw new TypeError(`${what || 'argument'} must be an ArrayBuffer or ArrayBufferView`);
    };
    edge.isBufferSource = (data) => ArrayBuffer.isView(data) || data instanceof ArrayBuffer;
    edge.toArrayBuffer = (bytes) =>
        bytes.byteOffset === 0 && bytes.byteLength === bytes.buffer.byteLength ? bytes.buffer : bytes.slice().buffer;
    edge.concat = function(chunks) {
        let total = 0;
        for (const c of chunks) total += c.byteLength;
        const out = new Uint8Array(total);
        let offset = 0;
        for (const c of chunks) { out.set(c, offset); offset += c.byteLength; }
        return out;
    };

    edge.describeError = function(err) {
        if (err !== null && typeof err === 'object') {
            return [String(err.name || 'Error'), String(err.message === undefined ? '' : err.message),
                    err.stack === undefined ? null : String(err.stack)];
        }
        return ['Error', String(err), null];
    };
    edge.reportError = function(err) {
        const [name, message, stack] = edge.describeError(err);
        ops.op_report_uncaught(edge.rid(), name, message, stack);
    };

    // ── DOMException ──────────────────────────────────────────────────
    const codes = {
        IndexSizeError: 1, HierarchyRequestError: 3, WrongDocumentError: 4, InvalidCharacterError: 5,
        NoModificationAllowedError: 7, NotFoundError: 8, NotSupportedError: 9, InvalidStateError: 11,
        SyntaxError: 12, InvalidModificationError: 13, NamespaceError: 14, InvalidAccessError: 15,
        TypeMismatchError: 17, SecurityError: 18, NetworkError: 19, AbortError: 20, URLMismatchError: 21,
        QuotaExceededError: 22, TimeoutError: 23, InvalidNodeTypeError: 24, DataCloneError: 25,
    };
    class DOMException extends Error {
        constructor(message = '', name = 'Error') {
            super(String(message));
            Object.defineProperty(this, 'name', { value: String(name), writable: true, configurable: true });
        }
        get code() { return codes[this.name] || 0; }
    }
    DOMException.ABORT_ERR = 20;
    DOMException.TIMEOUT_ERR = 23;
    DOMException.DATA_CLONE_ERR = 25;
    globalThis.DOMException = DOMException;

    globalThis.queueMicrotask = function queueMicrotask(callback) {
        if (typeof callback !== 'function') {
            throw new TypeError("Failed to execute 'queueMicrotask': parameter 1 is not of type 'Function'");
        }
        Promise.resolve().then(() => {
            try { callback(); } catch (err) { edge.reportError(err); }
        });
    };

    const timeOrigin = Date.now();
    globalThis.performance = {
        timeOrigin,
        now: () => ops.op_now(),
        toJSON() { return { timeOrigin }; },
    };
    globalThis.navigator = Object.freeze({ userAgent: ops.op_user_agent() });
})();
"#;
