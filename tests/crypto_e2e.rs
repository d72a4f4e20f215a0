/// End-to-end WebCrypto tests
/// Each test runs a named function export and checks what it resolved to

use edgeworker::{Engine, Env, ErrorKind, WorkerResult};
use serde_json::{json, Value};

mod common;
use common::{compile, data, engine};

const WORKER: &str = r#"
const enc = new TextEncoder();
const hex = (buf) => [...new Uint8Array(buf)].map((b) => b.toString(16).padStart(2, '0')).join('');
const same = (a, b) => hex(a) === hex(b);
let stashed = null;

export default {
    fetch() { return new Response(''); },

    async digest() {
        return hex(await crypto.subtle.digest('SHA-256', enc.encode('abc')));
    },

    async hmac() {
        const key = await crypto.subtle.importKey('raw', enc.encode('secret'), { name: 'HMAC', hash: 'SHA-256' }, true, ['sign', 'verify']);
        const sig = await crypto.subtle.sign('HMAC', key, enc.encode('message'));
        const jwk = await crypto.subtle.exportKey('jwk', key);
        const again = await crypto.subtle.importKey('jwk', jwk, { name: 'HMAC', hash: 'SHA-256' }, false, ['verify']);
        return {
            sig: hex(sig),
            ok: await crypto.subtle.verify('HMAC', again, sig, enc.encode('message')),
            tampered: await crypto.subtle.verify('HMAC', again, sig, enc.encode('massage')),
            kty: jwk.kty,
            alg: jwk.alg,
            algorithm: key.algorithm,
        };
    },

    async aesGcm() {
        const key = await crypto.subtle.generateKey({ name: 'AES-GCM', length: 256 }, false, ['encrypt', 'decrypt']);
        const iv = crypto.getRandomValues(new Uint8Array(12));
        const sealed = await crypto.subtle.encrypt({ name: 'AES-GCM', iv, additionalData: enc.encode('aad') }, key, enc.encode('plaintext'));
        const opened = await crypto.subtle.decrypt({ name: 'AES-GCM', iv, additionalData: enc.encode('aad') }, key, sealed);
        const broken = new Uint8Array(sealed);
        broken[0] ^= 1;
        let failure = null;
        try {
            await crypto.subtle.decrypt({ name: 'AES-GCM', iv, additionalData: enc.encode('aad') }, key, broken);
        } catch (e) {
            failure = e.name;
        }
        let exportFailure = null;
        try {
            await crypto.subtle.exportKey('raw', key);
        } catch (e) {
            exportFailure = e.name;
        }
        return {
            overhead: sealed.byteLength - 9,
            opened: new TextDecoder().decode(opened),
            failure,
            exportFailure,
        };
    },

    async ecdh() {
        const params = { name: 'ECDH', namedCurve: 'P-256' };
        const alice = await crypto.subtle.generateKey(params, true, ['deriveBits']);
        const bob = await crypto.subtle.generateKey(params, true, ['deriveBits']);
        const ab = await crypto.subtle.deriveBits({ name: 'ECDH', public: bob.publicKey }, alice.privateKey, 256);
        const ba = await crypto.subtle.deriveBits({ name: 'ECDH', public: alice.publicKey }, bob.privateKey, 256);
        const spki = await crypto.subtle.exportKey('spki', alice.publicKey);
        const reimported = await crypto.subtle.importKey('spki', spki, params, true, []);
        const ab2 = await crypto.subtle.deriveBits({ name: 'ECDH', public: reimported }, bob.privateKey, 256);
        return {
            agree: same(ab, ba),
            reimportedAgrees: same(ab2, ab),
            length: ab.byteLength,
            publicType: alice.publicKey.type,
            privateType: alice.privateKey.type,
        };
    },

    async signatures() {
        const ec = await crypto.subtle.generateKey({ name: 'ECDSA', namedCurve: 'P-384' }, false, ['sign', 'verify']);
        const ecSig = await crypto.subtle.sign({ name: 'ECDSA', hash: 'SHA-384' }, ec.privateKey, enc.encode('data'));
        const ed = await crypto.subtle.generateKey({ name: 'Ed25519' }, true, ['sign', 'verify']);
        const edSig = await crypto.subtle.sign('Ed25519', ed.privateKey, enc.encode('data'));
        let usageError = null;
        try {
            await crypto.subtle.sign('Ed25519', ed.publicKey, enc.encode('data'));
        } catch (e) {
            usageError = e.name;
        }
        return {
            ecdsa: await crypto.subtle.verify({ name: 'ECDSA', hash: 'SHA-384' }, ec.publicKey, ecSig, enc.encode('data')),
            ecdsaLength: ecSig.byteLength,
            ed25519: await crypto.subtle.verify('Ed25519', ed.publicKey, edSig, enc.encode('data')),
            ed25519Wrong: await crypto.subtle.verify('Ed25519', ed.publicKey, edSig, enc.encode('date')),
            usageError,
        };
    },

    async wrap() {
        const kek = await crypto.subtle.importKey('raw', new Uint8Array(16).fill(1), 'AES-KW', false, ['wrapKey', 'unwrapKey']);
        const secret = await crypto.subtle.importKey('raw', new Uint8Array(32).fill(7), { name: 'AES-GCM' }, true, ['encrypt']);
        const wrapped = await crypto.subtle.wrapKey('raw', secret, kek, 'AES-KW');
        const unwrapped = await crypto.subtle.unwrapKey('raw', wrapped, kek, 'AES-KW', 'AES-GCM', true, ['encrypt', 'decrypt']);
        const raw = await crypto.subtle.exportKey('raw', unwrapped);
        return { wrappedLength: wrapped.byteLength, restored: hex(raw) === '07'.repeat(32), usages: unwrapped.usages };
    },

    async derive() {
        const base = await crypto.subtle.importKey('raw', enc.encode('password'), 'PBKDF2', false, ['deriveBits', 'deriveKey']);
        const bits = await crypto.subtle.deriveBits(
            { name: 'PBKDF2', salt: enc.encode('salt'), iterations: 1, hash: 'SHA-1' }, base, 160);
        const key = await crypto.subtle.deriveKey(
            { name: 'PBKDF2', salt: enc.encode('salt'), iterations: 1000, hash: 'SHA-256' }, base,
            { name: 'AES-CBC', length: 128 }, false, ['encrypt']);
        return { bits: hex(bits), derived: key.algorithm };
    },

    random() {
        const bytes = crypto.getRandomValues(new Uint8Array(32));
        let quota = null;
        try {
            crypto.getRandomValues(new Uint8Array(65537));
        } catch (e) {
            quota = e.name;
        }
        return { uuid: crypto.randomUUID(), nonzero: bytes.some((b) => b !== 0), quota };
    },

    async stash() {
        stashed = await crypto.subtle.generateKey({ name: 'HMAC', hash: 'SHA-256' }, true, ['sign']);
        return stashed.type;
    },

    async reuse() {
        await crypto.subtle.sign('HMAC', stashed, enc.encode('leak?'));
        return 'leaked';
    },
};
"#;

fn run(engine: &Engine, name: &str) -> WorkerResult {
    engine.execute_function("crypto", "v1", Env::new(), name, Vec::new())
}

fn setup() -> Engine {
    let engine = engine();
    compile(&engine, "crypto", WORKER);
    engine
}

#[test]
fn test_sha256_digest() {
    let engine = setup();
    assert_eq!(
        data(&run(&engine, "digest")),
        json!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
    );
}

#[test]
fn test_hmac_sign_verify_and_jwk_round_trip() {
    let engine = setup();
    let out = data(&run(&engine, "hmac"));
    assert_eq!(
        out["sig"],
        json!("8b5f48702995c1598c573db1e21866a9b825d4a794d169d7060a03605796360b")
    );
    assert_eq!(out["ok"], json!(true));
    assert_eq!(out["tampered"], json!(false));
    assert_eq!(out["kty"], json!("oct"));
    assert_eq!(out["alg"], json!("HS256"));
    assert_eq!(out["algorithm"], json!({ "name": "HMAC", "hash": { "name": "SHA-256" }, "length": 48 }));
}

#[test]
fn test_aes_gcm_seals_and_detects_tampering() {
    let engine = setup();
    let out = data(&run(&engine, "aesGcm"));
    assert_eq!(out["overhead"], json!(16));
    assert_eq!(out["opened"], json!("plaintext"));
    assert_eq!(out["failure"], json!("OperationError"));
    assert_eq!(out["exportFailure"], json!("InvalidAccessError"));
}

#[test]
fn test_ecdh_parties_agree() {
    let engine = setup();
    let out = data(&run(&engine, "ecdh"));
    assert_eq!(
        out,
        json!({
            "agree": true,
            "reimportedAgrees": true,
            "length": 32,
            "publicType": "public",
            "privateType": "private",
        })
    );
}

#[test]
fn test_signature_algorithms() {
    let engine = setup();
    let out = data(&run(&engine, "signatures"));
    assert_eq!(out["ecdsa"], json!(true));
    assert_eq!(out["ecdsaLength"], json!(96));
    assert_eq!(out["ed25519"], json!(true));
    assert_eq!(out["ed25519Wrong"], json!(false));
    assert_eq!(out["usageError"], json!("TypeError"));
}

#[test]
fn test_aes_kw_wrap_unwrap() {
    let engine = setup();
    let out = data(&run(&engine, "wrap"));
    assert_eq!(out["wrappedLength"], json!(40));
    assert_eq!(out["restored"], json!(true));
    assert_eq!(out["usages"], json!(["encrypt", "decrypt"]));
}

#[test]
fn test_pbkdf2_derivation() {
    let engine = setup();
    let out = data(&run(&engine, "derive"));
    // RFC 6070 test vector 1
    assert_eq!(out["bits"], json!("0c60c80f961f0e71f3a9b524af6012062fe037a6"));
    assert_eq!(out["derived"], json!({ "name": "AES-CBC", "length": 128 }));
}

#[test]
fn test_random_values() {
    let engine = setup();
    let out = data(&run(&engine, "random"));
    let uuid = out["uuid"].as_str().unwrap();
    assert_eq!(uuid.len(), 36);
    assert_eq!(&uuid[14..15], "4");
    assert_eq!(out["nonzero"], json!(true));
    assert_eq!(out["quota"], json!("QuotaExceededError"));
}

#[test]
fn test_keys_do_not_outlive_their_request() {
    let engine = setup();
    assert_eq!(data(&run(&engine, "stash")), Value::from("secret"));
    let result = run(&engine, "reuse");
    let err = result.error.expect("stale key must not be usable");
    assert_eq!(err.kind, ErrorKind::TypeError);
    assert!(result.data.is_none());
}
