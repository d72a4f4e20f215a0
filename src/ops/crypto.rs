//! `crypto` global: `getRandomValues`, `randomUUID` and `crypto.subtle`.
//!
//! Subtle operations run synchronously on the engine thread against the
//! [`AlgorithmRegistry`](crate::crypto::AlgorithmRegistry); the JS methods are
//! `async` so every failure surfaces as a rejected promise. Keys live in the
//! request's key table and JS only ever holds their integer id.

use rand::RngCore;
use serde_json::Value as JsonValue;

use crate::crypto::jwk::JsonWebKey;
use crate::crypto::params::AlgorithmParams;
use crate::crypto::{ExportedKey, KeyData, KeyFormat};
use crate::engine::{native, JsEngine, OpArgs, OpReturn, OpValue};
use crate::error::{JsError, OpError};

use super::{with_request, SharedHost};

/// Largest buffer `getRandomValues` fills in one call.
pub const MAX_RANDOM_BYTES: usize = 65_536;

fn params(args: &OpArgs, index: usize) -> Result<AlgorithmParams, OpError> {
    Ok(AlgorithmParams::from_json(args.json(index))?)
}

fn usages(args: &OpArgs, index: usize) -> Result<Vec<String>, OpError> {
    args.parse(index)
}

fn format(args: &OpArgs, index: usize) -> Result<KeyFormat, OpError> {
    Ok(KeyFormat::parse(&args.string(index)?)?)
}

fn random_bytes(len: usize) -> Result<Vec<u8>, OpError> {
    if len > MAX_RANDOM_BYTES {
        return Err(OpError::dom(
            "QuotaExceededError",
            format!("The ArrayBufferView's byte length ({len}) exceeds the number of bytes of entropy available via this API ({MAX_RANDOM_BYTES})"),
        ));
    }
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    Ok(buf)
}

pub fn install<E: JsEngine>(engine: &mut E, host: &SharedHost) -> Result<(), JsError> {
    engine.register_fn(
        "op_crypto_random",
        native(|args| OpReturn::value(random_bytes(args.u64(0)? as usize)?)),
    );
    engine.register_fn(
        "op_crypto_uuid",
        native(|_args| OpReturn::value(uuid::Uuid::new_v4().to_string())),
    );

    let h = host.clone();
    engine.register_fn(
        "op_subtle_digest",
        native(move |args| {
            let registry = h.borrow().crypto.clone();
            let digest = registry.digest(&args.string(0)?, &args.bytes(1)?)?;
            OpReturn::value(digest)
        }),
    );

    let h = host.clone();
    engine.register_fn(
        "op_subtle_generate_key",
        native(move |args| {
            let registry = h.borrow().crypto.clone();
            let params = params(&args, 1)?;
            let usages = usages(&args, 3)?;
            let extractable = args.bool(2)?;
            let handle = with_request(&h, &args, 0, |state| {
                Ok(registry.generate_key(&mut state.keys, &params, extractable, &usages)?)
            })?;
            tracing::trace!(algorithm = %params.name, "generated key");
            OpReturn::value(handle.to_json())
        }),
    );

    let h = host.clone();
    engine.register_fn(
        "op_subtle_import_key",
        native(move |args| {
            let registry = h.borrow().crypto.clone();
            let format = format(&args, 1)?;
            let data = match format {
                KeyFormat::Jwk => KeyData::Jwk(JsonWebKey::from_json(args.json(2))?),
                _ => KeyData::Bytes(args.bytes(2)?),
            };
            let params = params(&args, 3)?;
            let extractable = args.bool(4)?;
            let usages = usages(&args, 5)?;
            let desc = with_request(&h, &args, 0, |state| {
                Ok(registry.import_key(&mut state.keys, format, &data, &params, extractable, &usages)?)
            })?;
            OpReturn::value(desc)
        }),
    );

    let h = host.clone();
    engine.register_fn(
        "op_subtle_export_key",
        native(move |args| {
            let registry = h.borrow().crypto.clone();
            let format = format(&args, 1)?;
            let key_id = args.u32(2)?;
            let exported = with_request(&h, &args, 0, |state| Ok(registry.export_key(&state.keys, format, key_id)?))?;
            match exported {
                ExportedKey::Bytes(bytes) => OpReturn::value(bytes),
                ExportedKey::Jwk(jwk) => OpReturn::value(jwk.to_json()),
            }
        }),
    );

    let h = host.clone();
    engine.register_fn(
        "op_subtle_sign",
        native(move |args| {
            let registry = h.borrow().crypto.clone();
            let params = params(&args, 1)?;
            let key_id = args.u32(2)?;
            let data = args.bytes(3)?;
            let sig = with_request(&h, &args, 0, |state| Ok(registry.sign(&state.keys, &params, key_id, &data)?))?;
            OpReturn::value(sig)
        }),
    );

    let h = host.clone();
    engine.register_fn(
        "op_subtle_verify",
        native(move |args| {
            let registry = h.borrow().crypto.clone();
            let params = params(&args, 1)?;
            let key_id = args.u32(2)?;
            let signature = args.bytes(3)?;
            let data = args.bytes(4)?;
            let ok = with_request(&h, &args, 0, |state| {
                Ok(registry.verify(&state.keys, &params, key_id, &signature, &data)?)
            })?;
            OpReturn::value(ok)
        }),
    );

    let h = host.clone();
    engine.register_fn(
        "op_subtle_encrypt",
        native(move |args| {
            let registry = h.borrow().crypto.clone();
            let params = params(&args, 1)?;
            let key_id = args.u32(2)?;
            let data = args.bytes(3)?;
            let out = with_request(&h, &args, 0, |state| Ok(registry.encrypt(&state.keys, &params, key_id, &data)?))?;
            OpReturn::value(out)
        }),
    );

    let h = host.clone();
    engine.register_fn(
        "op_subtle_decrypt",
        native(move |args| {
            let registry = h.borrow().crypto.clone();
            let params = params(&args, 1)?;
            let key_id = args.u32(2)?;
            let data = args.bytes(3)?;
            let out = with_request(&h, &args, 0, |state| Ok(registry.decrypt(&state.keys, &params, key_id, &data)?))?;
            OpReturn::value(out)
        }),
    );

    let h = host.clone();
    engine.register_fn(
        "op_subtle_derive_bits",
        native(move |args| {
            let registry = h.borrow().crypto.clone();
            let params = params(&args, 1)?;
            let key_id = args.u32(2)?;
            let length = if args.get(3).is_nullish() {
                None
            } else {
                Some(args.u64(3)? as usize)
            };
            let bits = with_request(&h, &args, 0, |state| {
                Ok(registry.derive_bits(&state.keys, &params, key_id, length)?)
            })?;
            OpReturn::value(bits)
        }),
    );

    let h = host.clone();
    engine.register_fn(
        "op_subtle_derive_key",
        native(move |args| {
            let registry = h.borrow().crypto.clone();
            let params = params(&args, 1)?;
            let base_id = args.u32(2)?;
            let derived = self::params(&args, 3)?;
            let extractable = args.bool(4)?;
            let usages = usages(&args, 5)?;
            let desc = with_request(&h, &args, 0, |state| {
                Ok(registry.derive_key(&mut state.keys, &params, base_id, &derived, extractable, &usages)?)
            })?;
            OpReturn::value(desc)
        }),
    );

    let h = host.clone();
    engine.register_fn(
        "op_subtle_wrap_key",
        native(move |args| {
            let registry = h.borrow().crypto.clone();
            let format = format(&args, 1)?;
            let key_id = args.u32(2)?;
            let wrapping_id = args.u32(3)?;
            let params = params(&args, 4)?;
            let wrapped = with_request(&h, &args, 0, |state| {
                Ok(registry.wrap_key(&state.keys, format, key_id, wrapping_id, &params)?)
            })?;
            OpReturn::value(wrapped)
        }),
    );

    let h = host.clone();
    engine.register_fn(
        "op_subtle_unwrap_key",
        native(move |args| {
            let registry = h.borrow().crypto.clone();
            let format = format(&args, 1)?;
            let wrapped = args.bytes(2)?;
            let unwrapping_id = args.u32(3)?;
            let params = params(&args, 4)?;
            let unwrapped = self::params(&args, 5)?;
            let extractable = args.bool(6)?;
            let usages = usages(&args, 7)?;
            let desc: JsonValue = with_request(&h, &args, 0, |state| {
                Ok(registry.unwrap_key(
                    &mut state.keys,
                    format,
                    &wrapped,
                    unwrapping_id,
                    &params,
                    &unwrapped,
                    extractable,
                    &usages,
                )?)
            })?;
            OpReturn::value(desc)
        }),
    );

    engine.eval("<crypto-setup>", CRYPTO_JS)?;
    Ok(())
}

const CRYPTO_JS: &str = r#"
(function() {
    const ops = globalThis.__ops;
    const edge = globalThis.__edge;
    const kIllegal = Symbol('illegal');
    const INTEGER_ARRAYS = [Int8Array, Uint8Array, Uint8ClampedArray, Int16Array, Uint16Array,
                            Int32Array, Uint32Array, BigInt64Array, BigUint64Array];

    function b64(bytes) {
        let s = '';
        for (let i = 0; i < bytes.length; i += 0x8000) {
            s += String.fromCharCode.apply(null, bytes.subarray(i, i + 0x8000));
        }
        return btoa(s);
    }

    class CryptoKey {
        #type; #extractable; #algorithm; #usages;

        constructor(token, desc, rid) {
            if (token !== kIllegal) throw new TypeError('Illegal constructor');
            Object.defineProperty(this, '_id', { value: desc.id });
            Object.defineProperty(this, '_rid', { value: rid });
            const algorithm = { ...desc.algorithm };
            if (Array.isArray(algorithm.publicExponent)) {
                algorithm.publicExponent = new Uint8Array(algorithm.publicExponent);
            }
            if (algorithm.hash) algorithm.hash = Object.freeze({ ...algorithm.hash });
            this.#type = desc.type;
            this.#extractable = desc.extractable;
            this.#algorithm = Object.freeze(algorithm);
            this.#usages = Object.freeze([...desc.usages]);
        }

        get type() { return this.#type; }
        get extractable() { return this.#extractable; }
        get algorithm() { return this.#algorithm; }
        get usages() { return this.#usages; }
        get [Symbol.toStringTag]() { return 'CryptoKey'; }
    }

    function makeKey(handle, rid) {
        if (handle && handle.publicKey) {
            return {
                publicKey: new CryptoKey(kIllegal, handle.publicKey, rid),
                privateKey: new CryptoKey(kIllegal, handle.privateKey, rid),
            };
        }
        return new CryptoKey(kIllegal, handle, rid);
    }

    function keyId(key, what) {
        if (!(key instanceof CryptoKey)) throw new TypeError(`${what} is not a CryptoKey`);
        if (key._rid !== edge.rid()) throw new TypeError(`${what} does not belong to the current request`);
        return key._id;
    }

    function normalize(algorithm) {
        if (typeof algorithm === 'string') return { name: algorithm };
        if (algorithm === null || typeof algorithm !== 'object') {
            throw new TypeError('Algorithm must be a string or an object');
        }
        if (typeof algorithm.name !== 'string') throw new TypeError("Algorithm: 'name' is required");
        const out = {};
        for (const key in algorithm) {
            const value = algorithm[key];
            if (value === undefined || value === null) continue;
            if (key === 'hash') {
                out.hash = typeof value === 'string' ? value : String(value.name);
            } else if (key === 'public') {
                out.public = keyId(value, "'public'");
            } else if (edge.isBufferSource(value)) {
                out[key] = b64(edge.toBytes(value));
            } else if (typeof value === 'number' || typeof value === 'string' || typeof value === 'boolean') {
                out[key] = value;
            } else {
                throw new TypeError(`Algorithm member '${key}' has an unsupported type`);
            }
        }
        return out;
    }

    function bytesOf(data, what) {
        if (!edge.isBufferSource(data)) throw new TypeError(`${what} must be an ArrayBuffer or ArrayBufferView`);
        return edge.toBytes(data);
    }

    function usageList(usages) {
        if (usages === null || typeof usages !== 'object' || typeof usages[Symbol.iterator] !== 'function') {
            throw new TypeError('keyUsages must be a sequence');
        }
        return Array.from(usages, String);
    }

    function plainJwk(jwk) {
        if (jwk === null || typeof jwk !== 'object') throw new TypeError('JWK key data must be an object');
        const out = {};
        for (const key of Object.keys(jwk)) {
            const value = jwk[key];
            if (typeof value === 'bigint' || typeof value === 'symbol' || typeof value === 'function') {
                throw new TypeError(`JWK member '${key}' has an unsupported type`);
            }
            out[key] = value;
        }
        return out;
    }

    const buffer = (bytes) => edge.toArrayBuffer(bytes);

    class SubtleCrypto {
        constructor(token) {
            if (token !== kIllegal) throw new TypeError('Illegal constructor');
        }

        async digest(algorithm, data) {
            const name = typeof algorithm === 'string' ? algorithm : normalize(algorithm).name;
            return buffer(ops.op_subtle_digest(name, bytesOf(data, 'data')));
        }

        async generateKey(algorithm, extractable, keyUsages) {
            const rid = edge.rid();
            return makeKey(ops.op_subtle_generate_key(rid, normalize(algorithm), !!extractable, usageList(keyUsages)), rid);
        }

        async importKey(format, keyData, algorithm, extractable, keyUsages) {
            const rid = edge.rid();
            format = String(format);
            const data = format === 'jwk' ? plainJwk(keyData) : bytesOf(keyData, 'keyData');
            return makeKey(ops.op_subtle_import_key(rid, format, data, normalize(algorithm), !!extractable, usageList(keyUsages)), rid);
        }

        async exportKey(format, key) {
            const id = keyId(key, 'key');
            const out = ops.op_subtle_export_key(edge.rid(), String(format), id);
            return String(format) === 'jwk' ? out : buffer(out);
        }

        async sign(algorithm, key, data) {
            const id = keyId(key, 'key');
            return buffer(ops.op_subtle_sign(edge.rid(), normalize(algorithm), id, bytesOf(data, 'data')));
        }

        async verify(algorithm, key, signature, data) {
            const id = keyId(key, 'key');
            return ops.op_subtle_verify(edge.rid(), normalize(algorithm), id,
                bytesOf(signature, 'signature'), bytesOf(data, 'data'));
        }

        async encrypt(algorithm, key, data) {
            const id = keyId(key, 'key');
            return buffer(ops.op_subtle_encrypt(edge.rid(), normalize(algorithm), id, bytesOf(data, 'data')));
        }

        async decrypt(algorithm, key, data) {
            const id = keyId(key, 'key');
            return buffer(ops.op_subtle_decrypt(edge.rid(), normalize(algorithm), id, bytesOf(data, 'data')));
        }

        async deriveBits(algorithm, baseKey, length) {
            const id = keyId(baseKey, 'baseKey');
            const bits = length === undefined || length === null ? null : Number(length);
            return buffer(ops.op_subtle_derive_bits(edge.rid(), normalize(algorithm), id, bits));
        }

        async deriveKey(algorithm, baseKey, derivedKeyAlgorithm, extractable, keyUsages) {
            const rid = edge.rid();
            const id = keyId(baseKey, 'baseKey');
            return makeKey(ops.op_subtle_derive_key(rid, normalize(algorithm), id,
                normalize(derivedKeyAlgorithm), !!extractable, usageList(keyUsages)), rid);
        }

        async wrapKey(format, key, wrappingKey, wrapAlgorithm) {
            const id = keyId(key, 'key');
            const wrappingId = keyId(wrappingKey, 'wrappingKey');
            return buffer(ops.op_subtle_wrap_key(edge.rid(), String(format), id, wrappingId, normalize(wrapAlgorithm)));
        }

        async unwrapKey(format, wrappedKey, unwrappingKey, unwrapAlgorithm, unwrappedKeyAlgorithm, extractable, keyUsages) {
            const rid = edge.rid();
            const id = keyId(unwrappingKey, 'unwrappingKey');
            return makeKey(ops.op_subtle_unwrap_key(rid, String(format), bytesOf(wrappedKey, 'wrappedKey'), id,
                normalize(unwrapAlgorithm), normalize(unwrappedKeyAlgorithm), !!extractable, usageList(keyUsages)), rid);
        }
    }

    const subtle = new SubtleCrypto(kIllegal);

    class Crypto {
        constructor(token) {
            if (token !== kIllegal) throw new TypeError('Illegal constructor');
        }
        get subtle() { return subtle; }
        getRandomValues(array) {
            if (!INTEGER_ARRAYS.some((T) => array instanceof T)) {
                throw new DOMException('The provided ArrayBufferView is not an integer array type', 'TypeMismatchError');
            }
            const bytes = ops.op_crypto_random(array.byteLength);
            new Uint8Array(array.buffer, array.byteOffset, array.byteLength).set(bytes);
            return array;
        }
        randomUUID() { return ops.op_crypto_uuid(); }
    }

    globalThis.CryptoKey = CryptoKey;
    globalThis.SubtleCrypto = SubtleCrypto;
    globalThis.Crypto = Crypto;
    globalThis.crypto = new Crypto(kIllegal);
})();
"#;
