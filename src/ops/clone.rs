//! `structuredClone` for the value types a worker can hold.

use crate::engine::JsEngine;
use crate::error::JsError;

use super::SharedHost;

pub fn install<E: JsEngine>(engine: &mut E, _host: &SharedHost) -> Result<(), JsError> {
    engine.eval("<clone-setup>", CLONE_JS)?;
    Ok(())
}

const CLONE_JS: &str = r#"
(function() {
    const TypedArray = Object.getPrototypeOf(Uint8Array);
    const ERRORS = { Error, EvalError, RangeError, ReferenceError, SyntaxError, TypeError, URIError };

    function uncloneable(what) {
        return new DOMException(`${what} could not be cloned.`, 'DataCloneError');
    }

    function cloneValue(value, memo) {
        if (value === null) return null;
        const type = typeof value;
        if (type === 'function') throw uncloneable(value.name ? `function ${value.name}` : 'function');
        if (type === 'symbol') throw uncloneable(String(value));
        if (type !== 'object') return value;
        if (memo.has(value)) return memo.get(value);

        let out;
        if (value instanceof Date) {
            out = new Date(value.getTime());
        } else if (value instanceof RegExp) {
            out = new RegExp(value.source, value.flags);
        } else if (value instanceof Boolean || value instanceof Number || value instanceof String) {
            out = Object(value.valueOf());
        } else if (value instanceof ArrayBuffer) {
            out = value.slice(0);
        } else if (value instanceof TypedArray) {
            const buffer = cloneValue(value.buffer, memo);
            out = new value.constructor(buffer, value.byteOffset, value.length);
        } else if (value instanceof DataView) {
            const buffer = cloneValue(value.buffer, memo);
            out = new DataView(buffer, value.byteOffset, value.byteLength);
        } else if (typeof File === 'function' && value instanceof File) {
            out = new File([value], value.name, { type: value.type, lastModified: value.lastModified });
        } else if (typeof Blob === 'function' && value instanceof Blob) {
            out = new Blob([value], { type: value.type });
        } else if (value instanceof Map) {
            out = new Map();
            memo.set(value, out);
            for (const [k, v] of value) out.set(cloneValue(k, memo), cloneValue(v, memo));
            return out;
        } else if (value instanceof Set) {
            out = new Set();
            memo.set(value, out);
            for (const v of value) out.add(cloneValue(v, memo));
            return out;
        } else if (value instanceof Error) {
            const Ctor = ERRORS[value.name] || Error;
            out = new Ctor(value.message);
            memo.set(value, out);
            if (value.stack !== undefined) out.stack = String(value.stack);
            if ('cause' in value) out.cause = cloneValue(value.cause, memo);
            return out;
        } else if (Array.isArray(value)) {
            out = new Array(value.length);
            memo.set(value, out);
            for (const key of Object.keys(value)) out[key] = cloneValue(value[key], memo);
            return out;
        } else {
            const proto = Object.getPrototypeOf(value);
            if (proto !== null && proto !== Object.prototype) {
                const name = proto.constructor && proto.constructor.name;
                throw uncloneable(name ? `#<${name}>` : 'object');
            }
            out = {};
            memo.set(value, out);
            for (const key of Object.keys(value)) out[key] = cloneValue(value[key], memo);
            return out;
        }
        memo.set(value, out);
        return out;
    }

    globalThis.structuredClone = function structuredClone(value, options) {
        if (arguments.length === 0) throw new TypeError("Failed to execute 'structuredClone': 1 argument required.");
        if (options && options.transfer && options.transfer.length) {
            throw uncloneable('transfer list');
        }
        return cloneValue(value, new Map());
    };
})();
"#;
