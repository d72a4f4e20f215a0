//! Console output capture.
//!
//! `console.*` calls are formatted in JS (printf-style substitutions plus a
//! small inspector) and handed to `op_console_write`, which appends them to
//! the current request's log buffer. Output produced outside of a request
//! (module top level) only goes to tracing.

use crate::engine::{native, JsEngine, OpReturn};
use crate::error::JsError;
use crate::result::LogLevel;

use super::SharedHost;

pub fn install<E: JsEngine>(engine: &mut E, host: &SharedHost) -> Result<(), JsError> {
    let h = host.clone();
    engine.register_fn(
        "op_console_write",
        native(move |args| {
            let request_id = args.u64(0)?;
            let level = LogLevel::parse(&args.string(1)?);
            let message = args.string(2)?;
            let mut host = h.borrow_mut();
            match host.requests.get_mut(request_id) {
                Ok(state) => state.logs.push(request_id, level, message),
                Err(_) => {
                    tracing::debug!(target: "edgeworker::console", level = level.as_str(), "{message}")
                }
            }
            OpReturn::undefined()
        }),
    );

    engine.eval("<console-setup>", CONSOLE_JS)?;
    Ok(())
}

const CONSOLE_JS: &str = r#"
(function() {
    const ops = globalThis.__ops;
    const edge = globalThis.__edge;
    const MAX_DEPTH = 2;
    const MAX_ITEMS = 100;

    function quoteKey(key) {
        return /^[A-Za-z_$][\w$]*$/.test(key) ? key : `'${key}'`;
    }

    function inspect(value, depth, seen) {
        switch (typeof value) {
            case 'string': return depth === 0 ? value : `'${value}'`;
            case 'number': return Object.is(value, -0) ? '-0' : String(value);
            case 'bigint': return `${value}n`;
            case 'undefined': return 'undefined';
            case 'boolean': return String(value);
            case 'symbol': return value.toString();
            case 'function': {
                const src = Function.prototype.toString.call(value);
                const kind = src.startsWith('class') ? 'class' : 'Function';
                return `[${kind}: ${value.name || '(anonymous)'}]`;
            }
        }
        if (value === null) return 'null';
        if (seen.includes(value)) return '[Circular]';
        if (value instanceof Error) return value.stack || `${value.name}: ${value.message}`;
        if (value instanceof Date) return isNaN(value.getTime()) ? 'Invalid Date' : value.toISOString();
        if (value instanceof RegExp) return String(value);
        if (value instanceof Promise) return 'Promise {}';
        if (value instanceof ArrayBuffer) return `ArrayBuffer { byteLength: ${value.byteLength} }`;
        if (depth > MAX_DEPTH) return Array.isArray(value) ? '[Array]' : '[Object]';

        seen.push(value);
        try {
            const list = (items, total) => {
                if (total > MAX_ITEMS) items.push(`... ${total - MAX_ITEMS} more items`);
                return items;
            };
            if (Array.isArray(value)) {
                const items = list(value.slice(0, MAX_ITEMS).map((v) => inspect(v, depth + 1, seen)), value.length);
                return items.length ? `[ ${items.join(', ')} ]` : '[]';
            }
            if (ArrayBuffer.isView(value) && !(value instanceof DataView)) {
                const items = list(Array.from(value.subarray(0, MAX_ITEMS), String), value.length);
                return `${value.constructor.name}(${value.length}) [ ${items.join(', ')} ]`;
            }
            if (value instanceof Map) {
                const items = [];
                for (const [k, v] of value) items.push(`${inspect(k, depth + 1, seen)} => ${inspect(v, depth + 1, seen)}`);
                return `Map(${value.size}) { ${items.join(', ')} }`;
            }
            if (value instanceof Set) {
                const items = [];
                for (const v of value) items.push(inspect(v, depth + 1, seen));
                return `Set(${value.size}) { ${items.join(', ')} }`;
            }
            const keys = Object.keys(value);
            const ctor = value.constructor && value.constructor.name;
            const prefix = ctor && ctor !== 'Object' ? `${ctor} ` : '';
            if (keys.length === 0) return `${prefix}{}`;
            const items = keys.map((k) => `${quoteKey(k)}: ${inspect(value[k], depth + 1, seen)}`);
            return `${prefix}{ ${items.join(', ')} }`;
        } finally {
            seen.pop();
        }
    }

    function format(args) {
        if (args.length === 0) return '';
        let rest = args;
        let head = '';
        if (typeof args[0] === 'string' && args[0].includes('%')) {
            const fmt = args[0];
            let i = 1;
            head = fmt.replace(/%[sdifjoOc%]/g, (spec) => {
                if (spec === '%%') return '%';
                if (i >= args.length) return spec;
                const arg = args[i++];
                switch (spec) {
                    case '%s': return typeof arg === 'string' ? arg : inspect(arg, 1, []);
                    case '%d':
                    case '%i': return typeof arg === 'bigint' ? `${arg}n` : String(spec === '%i' ? parseInt(arg) : Number(arg));
                    case '%f': return String(parseFloat(arg));
                    case '%j': try { return JSON.stringify(arg); } catch (e) { return '[Circular]'; }
                    case '%c': return '';
                    default: return inspect(arg, 1, []);
                }
            });
            rest = args.slice(i);
            return [head, ...rest.map((a) => inspect(a, 0, []))].join(' ');
        }
        return rest.map((a) => inspect(a, 0, [])).join(' ');
    }

    function writer(level) {
        return function(...args) {
            ops.op_console_write(edge.rid(), level, format(args));
        };
    }

    const counts = new Map();
    const timers = new Map();
    const console = {
        log: writer('log'),
        info: writer('info'),
        warn: writer('warn'),
        error: writer('error'),
        debug: writer('debug'),
        trace: writer('debug'),
        assert(condition, ...args) {
            if (condition) return;
            const rest = args.length ? format(args) : 'console.assert';
            ops.op_console_write(edge.rid(), 'error', `Assertion failed: ${rest}`);
        },
        count(label = 'default') {
            const n = (counts.get(label) || 0) + 1;
            counts.set(label, n);
            ops.op_console_write(edge.rid(), 'log', `${label}: ${n}`);
        },
        countReset(label = 'default') { counts.delete(label); },
        time(label = 'default') { timers.set(label, performance.now()); },
        timeEnd(label = 'default') {
            const start = timers.get(label);
            if (start === undefined) return;
            timers.delete(label);
            ops.op_console_write(edge.rid(), 'log', `${label}: ${(performance.now() - start).toFixed(3)}ms`);
        },
        timeLog(label = 'default', ...args) {
            const start = timers.get(label);
            if (start === undefined) return;
            const extra = args.length ? ` ${format(args)}` : '';
            ops.op_console_write(edge.rid(), 'log', `${label}: ${(performance.now() - start).toFixed(3)}ms${extra}`);
        },
    };
    edge.inspect = (value) => inspect(value, 0, []);
    globalThis.console = console;
})();
"#;
