//! `Headers`, `Request` and `Response`.
//!
//! Pure JS. Bodies are either buffered bytes or a `ReadableStream`; reading a
//! body through any of the consuming methods marks it used. Internal hooks
//! for the fetch bridge and the dispatcher are published on `__edge` from
//! static blocks so the private fields stay private.

use crate::engine::JsEngine;
use crate::error::JsError;

use super::SharedHost;

pub fn install<E: JsEngine>(engine: &mut E, _host: &SharedHost) -> Result<(), JsError> {
    engine.eval("<http-setup>", HTTP_JS)?;
    Ok(())
}

const HTTP_JS: &str = r#"
(function() {
    const edge = globalThis.__edge;
    const encoder = new TextEncoder();
    const decoder = new TextDecoder();

    // ── Headers ───────────────────────────────────────────────────────
    const TOKEN = /^[!#$%&'*+\-.^_`|~0-9A-Za-z]+$/;

    function normalizeName(name) {
        name = String(name);
        if (!TOKEN.test(name)) throw new TypeError(`Invalid header name: "${name}"`);
        return name.toLowerCase();
    }
    function normalizeValue(value) {
        value = String(value).replace(/^[\t\n\r ]+|[\t\n\r ]+$/g, '');
        if (/[\0\r\n]/.test(value)) throw new TypeError(`Invalid header value: "${value}"`);
        return value;
    }

    class Headers {
        #list = [];
        #guard = 'none';

        static {
            edge.headerList = (h) => h.#list.map(([k, v]) => [k, v]);
            edge.freezeHeaders = (h) => { h.#guard = 'immutable'; return h; };
        }

        constructor(init) {
            if (init === undefined || init === null) return;
            if (init instanceof Headers) {
                this.#list = init.#list.map(([k, v]) => [k, v]);
            } else if (typeof init === 'object' && typeof init[Symbol.iterator] === 'function') {
                for (const pair of init) {
                    const p = [...pair];
                    if (p.length !== 2) throw new TypeError('Each header pair must be an iterable [name, value] tuple');
                    this.append(p[0], p[1]);
                }
            } else if (typeof init === 'object') {
                for (const key of Object.keys(init)) this.append(key, init[key]);
            } else {
                throw new TypeError("Failed to construct 'Headers': The provided value is not of type 'HeadersInit'");
            }
        }

        #check() {
            if (this.#guard === 'immutable') throw new TypeError("Can't modify immutable headers.");
        }

        append(name, value) {
            this.#check();
            this.#list.push([normalizeName(name), normalizeValue(value)]);
        }
        delete(name) {
            this.#check();
            const n = normalizeName(name);
            this.#list = this.#list.filter(([k]) => k !== n);
        }
        get(name) {
            const n = normalizeName(name);
            const values = this.#list.filter(([k]) => k === n).map(([, v]) => v);
            return values.length ? values.join(', ') : null;
        }
        getSetCookie() {
            return this.#list.filter(([k]) => k === 'set-cookie').map(([, v]) => v);
        }
        has(name) {
            const n = normalizeName(name);
            return this.#list.some(([k]) => k === n);
        }
        set(name, value) {
            this.#check();
            const n = normalizeName(name);
            const v = normalizeValue(value);
            const index = this.#list.findIndex(([k]) => k === n);
            if (index < 0) {
                this.#list.push([n, v]);
            } else {
                this.#list[index] = [n, v];
                this.#list = this.#list.filter(([k], i) => k !== n || i === index);
            }
        }
        forEach(callback, thisArg) {
            for (const [k, v] of this.entries()) callback.call(thisArg, v, k, this);
        }
        *entries() {
            const names = [...new Set(this.#list.map(([k]) => k))].sort();
            for (const name of names) {
                if (name === 'set-cookie') {
                    for (const v of this.getSetCookie()) yield [name, v];
                } else {
                    yield [name, this.get(name)];
                }
            }
        }
        *keys() { for (const [k] of this.entries()) yield k; }
        *values() { for (const [, v] of this.entries()) yield v; }
        [Symbol.iterator]() { return this.entries(); }
    }

    // ── Bodies ────────────────────────────────────────────────────────
    function extractBody(init) {
        if (init === null || init === undefined) return { bytes: null, stream: null, type: null };
        if (typeof init === 'string') {
            return { bytes: encoder.encode(init), stream: null, type: 'text/plain;charset=UTF-8' };
        }
        if (edge.isReadableStream(init)) {
            if (init.locked || edge.streamDisturbed(init)) throw new TypeError('ReadableStream body is locked or disturbed');
            return { bytes: null, stream: init, type: null };
        }
        if (init instanceof URLSearchParams) {
            return { bytes: encoder.encode(init.toString()), stream: null, type: 'application/x-www-form-urlencoded;charset=UTF-8' };
        }
        if (init instanceof FormData) {
            const { bytes, type } = edge.serializeFormData(init);
            return { bytes, stream: null, type };
        }
        if (init instanceof Blob) {
            return { bytes: edge.blobBytes(init), stream: null, type: init.type || null };
        }
        if (edge.isBufferSource(init)) {
            return { bytes: edge.toBytes(init).slice(), stream: null, type: null };
        }
        return { bytes: encoder.encode(String(init)), stream: null, type: 'text/plain;charset=UTF-8' };
    }

    class BodyState {
        constructor(init) {
            const { bytes, stream, type } = extractBody(init);
            this.bytes = bytes;
            this.stream = stream;
            this.type = type;
            this.consumed = false;
        }
        get isNull() { return this.bytes === null && this.stream === null; }
        get used() {
            return this.consumed || (this.stream !== null && edge.streamDisturbed(this.stream));
        }
        body() {
            if (this.isNull) return null;
            if (this.stream === null) {
                this.stream = edge.streamFromBytes(this.bytes);
                this.bytes = null;
            }
            return this.stream;
        }
        async consume() {
            if (this.used) throw new TypeError('Body has already been used. It can only be used once.');
            if (this.isNull) return new Uint8Array(0);
            if (this.stream === null) {
                this.consumed = true;
                return this.bytes;
            }
            if (this.stream.locked) throw new TypeError('The body stream is locked.');
            this.consumed = true;
            return edge.readAllBytes(this.stream);
        }
        clone() {
            if (this.used) throw new TypeError('Cannot clone a body that has already been used.');
            const copy = new BodyState(null);
            copy.type = this.type;
            if (this.stream !== null) {
                const [a, b] = this.stream.tee();
                this.stream = a;
                copy.stream = b;
            } else {
                copy.bytes = this.bytes;
            }
            return copy;
        }
    }

    function defineBody(cls, state) {
        const contentType = (self) => self.headers.get('content-type') || '';
        Object.defineProperties(cls.prototype, {
            body: { get() { return state(this).body(); }, configurable: true },
            bodyUsed: { get() { return state(this).used; }, configurable: true },
        });
        Object.assign(cls.prototype, {
            async arrayBuffer() { return edge.toArrayBuffer(await state(this).consume()); },
            async bytes() { return (await state(this).consume()).slice(); },
            async text() { return decoder.decode(await state(this).consume()); },
            async json() { return JSON.parse(decoder.decode(await state(this).consume())); },
            async blob() { return new Blob([await state(this).consume()], { type: contentType(this) }); },
            async formData() { return edge.parseFormData(await state(this).consume(), contentType(this)); },
        });
    }

    // ── Request ───────────────────────────────────────────────────────
    const METHODS = ['DELETE', 'GET', 'HEAD', 'OPTIONS', 'POST', 'PUT'];
    const FORBIDDEN_METHODS = ['CONNECT', 'TRACE', 'TRACK'];
    const REDIRECTS = ['follow', 'manual', 'error'];

    function normalizeMethod(method) {
        method = String(method);
        if (!TOKEN.test(method)) throw new TypeError(`'${method}' is not a valid HTTP method.`);
        const upper = method.toUpperCase();
        if (FORBIDDEN_METHODS.includes(upper)) throw new TypeError(`'${method}' HTTP method is unsupported.`);
        return METHODS.includes(upper) ? upper : method;
    }

    class Request {
        #method;
        #url;
        #headers;
        #body;
        #redirect;
        #signal;

        static {
            defineBody(Request, (r) => r.#body);
            edge.requestBody = (r) => r.#body;
        }

        constructor(input, init) {
            init = init || {};
            const base = input instanceof Request ? input : null;
            this.#url = base ? base.#url : new URL(String(input)).href;
            this.#method = init.method !== undefined ? normalizeMethod(init.method) : (base ? base.#method : 'GET');
            this.#headers = new Headers(init.headers !== undefined ? init.headers : (base ? base.#headers : undefined));
            const redirect = init.redirect !== undefined ? String(init.redirect) : (base ? base.#redirect : 'follow');
            if (!REDIRECTS.includes(redirect)) {
                throw new TypeError(`Invalid redirect value '${redirect}'; must be one of follow, manual, error`);
            }
            this.#redirect = redirect;
            const signal = init.signal !== undefined ? init.signal : (base ? base.#signal : null);
            if (signal !== null && !(signal instanceof AbortSignal)) {
                throw new TypeError("Failed to construct 'Request': member signal is not of type AbortSignal.");
            }
            this.#signal = signal || edge.createSignal();

            if (init.body !== undefined && init.body !== null) {
                if (this.#method === 'GET' || this.#method === 'HEAD') {
                    throw new TypeError('Request with a GET or HEAD method cannot have a body.');
                }
                this.#body = new BodyState(init.body);
                if (this.#body.type && !this.#headers.has('content-type')) {
                    this.#headers.set('content-type', this.#body.type);
                }
            } else if (base && init.body === undefined) {
                if (base.#body.used) throw new TypeError('Cannot construct a Request with a Request whose body is already used.');
                this.#body = base.#body;
            } else {
                this.#body = new BodyState(null);
            }
        }

        get method() { return this.#method; }
        get url() { return this.#url; }
        get headers() { return this.#headers; }
        get redirect() { return this.#redirect; }
        get signal() { return this.#signal; }
        get keepalive() { return false; }
        get cf() { return undefined; }

        clone() {
            const copy = new Request(this);
            copy.#body = this.#body.clone();
            return copy;
        }
    }

    // ── Response ──────────────────────────────────────────────────────
    const NULL_BODY_STATUS = [101, 204, 205, 304];
    const REDIRECT_STATUS = [301, 302, 303, 307, 308];

    class Response {
        #status;
        #statusText;
        #headers;
        #body;
        #type = 'default';
        #url = '';
        #redirected = false;

        static {
            defineBody(Response, (r) => r.#body);
            edge.responseBody = (r) => r.#body;
            edge.fetchedResponse = (status, statusText, headers, stream, url, redirected) => {
                const r = new Response(null, { headers });
                r.#status = status;
                r.#statusText = statusText;
                r.#body = new BodyState(NULL_BODY_STATUS.includes(status) ? null : stream);
                r.#type = 'basic';
                r.#url = url;
                r.#redirected = redirected;
                edge.freezeHeaders(r.#headers);
                return r;
            };
        }

        constructor(body, init) {
            init = init || {};
            const status = init.status === undefined ? 200 : Number(init.status);
            if (!Number.isInteger(status) || status < 100 || status > 599) {
                throw new RangeError(`Failed to construct 'Response': The status provided (${init.status}) is outside the range [100, 599].`);
            }
            const statusText = init.statusText === undefined ? '' : String(init.statusText);
            if (/[\r\n]/.test(statusText)) throw new TypeError('Invalid statusText');
            this.#status = status;
            this.#statusText = statusText;
            this.#headers = new Headers(init.headers);
            if (body !== null && body !== undefined) {
                if (NULL_BODY_STATUS.includes(status)) {
                    throw new TypeError(`Response with null body status (${status}) cannot have a body.`);
                }
                this.#body = new BodyState(body);
                if (this.#body.type && !this.#headers.has('content-type')) {
                    this.#headers.set('content-type', this.#body.type);
                }
            } else {
                this.#body = new BodyState(null);
            }
        }

        static json(data, init) {
            init = init || {};
            const text = JSON.stringify(data);
            if (text === undefined) throw new TypeError('Value is not JSON serializable');
            const headers = new Headers(init.headers);
            if (!headers.has('content-type')) headers.set('content-type', 'application/json');
            return new Response(text, { status: init.status, statusText: init.statusText, headers });
        }

        static redirect(url, status = 302) {
            if (!REDIRECT_STATUS.includes(status)) throw new RangeError(`Invalid status code ${status}`);
            const location = new URL(String(url)).href;
            return new Response(null, { status, headers: { location } });
        }

        static error() {
            const r = new Response(null);
            r.#status = 0;
            r.#type = 'error';
            edge.freezeHeaders(r.#headers);
            return r;
        }

        get status() { return this.#status; }
        get statusText() { return this.#statusText; }
        get ok() { return this.#status >= 200 && this.#status <= 299; }
        get headers() { return this.#headers; }
        get type() { return this.#type; }
        get url() { return this.#url; }
        get redirected() { return this.#redirected; }
        get webSocket() { return null; }

        clone() {
            const copy = new Response(null, { status: this.#status === 0 ? 200 : this.#status, headers: this.#headers });
            copy.#status = this.#status;
            copy.#statusText = this.#statusText;
            copy.#type = this.#type;
            copy.#url = this.#url;
            copy.#redirected = this.#redirected;
            copy.#body = this.#body.clone();
            return copy;
        }
    }

    // Collect a handler's response into [status, statusText, headers, bytes].
    edge.collectResponse = async function(response) {
        if (!(response instanceof Response)) {
            throw new TypeError('The fetch handler must return a Response');
        }
        if (response.type === 'error') throw new TypeError('The fetch handler returned Response.error()');
        const bytes = await edge.responseBody(response).consume();
        return [response.status, response.statusText, edge.headerList(response.headers), bytes];
    };

    globalThis.Headers = Headers;
    globalThis.Request = Request;
    globalThis.Response = Response;
})();
"#;
