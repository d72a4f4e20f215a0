//! WHATWG `URL` and `URLSearchParams` on top of the `url` crate.
//!
//! Parsing and every setter go through `url::quirks`, which implements the
//! URL Standard's API semantics. JS keeps a snapshot of the components and
//! re-reads them after each mutation.

use url::{form_urlencoded, quirks, Url};

use crate::engine::{native, JsEngine, OpReturn, OpValue};
use crate::error::{JsError, OpError};

use super::SharedHost;

pub fn install<E: JsEngine>(engine: &mut E, _host: &SharedHost) -> Result<(), JsError> {
    engine.register_fn(
        "op_url_parse",
        native(|args| {
            let input = args.string(0)?;
            let base = args.opt_string(1)?;
            let url = parse(&input, base.as_deref())?;
            OpReturn::value(components(&url))
        }),
    );
    engine.register_fn(
        "op_url_can_parse",
        native(|args| {
            let input = args.string(0)?;
            let base = args.opt_string(1)?;
            OpReturn::value(parse(&input, base.as_deref()).is_ok())
        }),
    );
    engine.register_fn(
        "op_url_set",
        native(|args| {
            let mut url = parse(&args.string(0)?, None)?;
            set(&mut url, &args.string(1)?, &args.string(2)?)?;
            OpReturn::value(components(&url))
        }),
    );
    engine.register_fn(
        "op_urlencoded_parse",
        native(|args| {
            let input = args.string(0)?;
            let pairs: Vec<OpValue> = form_urlencoded::parse(input.as_bytes())
                .map(|(k, v)| OpValue::List(vec![OpValue::from(k.into_owned()), OpValue::from(v.into_owned())]))
                .collect();
            OpReturn::value(OpValue::List(pairs))
        }),
    );
    engine.register_fn(
        "op_urlencoded_serialize",
        native(|args| {
            let pairs: Vec<(String, String)> = args.parse(0)?;
            let mut serializer = form_urlencoded::Serializer::new(String::new());
            for (k, v) in &pairs {
                serializer.append_pair(k, v);
            }
            OpReturn::value(serializer.finish())
        }),
    );

    engine.eval("<url-setup>", URL_JS)?;
    Ok(())
}

fn parse(input: &str, base: Option<&str>) -> Result<Url, OpError> {
    let invalid = || OpError::type_error(format!("Invalid URL: '{input}'"));
    let base = match base {
        Some(base) => Some(Url::parse(base).map_err(|_| invalid())?),
        None => None,
    };
    Url::options().base_url(base.as_ref()).parse(input).map_err(|_| invalid())
}

/// Apply a setter. Like the web API, only `href` reports failure; other
/// setters silently ignore invalid values.
fn set(url: &mut Url, field: &str, value: &str) -> Result<(), OpError> {
    match field {
        "href" => {
            quirks::set_href(url, value).map_err(|_| OpError::type_error(format!("Invalid URL: '{value}'")))?
        }
        "protocol" => {
            let _ = quirks::set_protocol(url, value);
        }
        "username" => {
            let _ = quirks::set_username(url, value);
        }
        "password" => {
            let _ = quirks::set_password(url, value);
        }
        "host" => {
            let _ = quirks::set_host(url, value);
        }
        "hostname" => {
            let _ = quirks::set_hostname(url, value);
        }
        "port" => {
            let _ = quirks::set_port(url, value);
        }
        "pathname" => quirks::set_pathname(url, value),
        "search" => quirks::set_search(url, value),
        "hash" => quirks::set_hash(url, value),
        other => return Err(OpError::type_error(format!("unknown URL component '{other}'"))),
    }
    Ok(())
}

fn components(url: &Url) -> OpValue {
    let origin = quirks::origin(url);
    let parts = [
        quirks::href(url),
        origin.as_str(),
        quirks::protocol(url),
        quirks::username(url),
        quirks::password(url),
        quirks::host(url),
        quirks::hostname(url),
        quirks::port(url),
        quirks::pathname(url),
        quirks::search(url),
        quirks::hash(url),
    ];
    OpValue::List(parts.iter().map(|s| OpValue::from(*s)).collect())
}

const URL_JS: &str = r#"
(function() {
    const ops = globalThis.__ops;
    const edge = globalThis.__edge;
    const kBind = Symbol('bind');
    const kReset = Symbol('reset');
    const FIELDS = ['href', 'origin', 'protocol', 'username', 'password', 'host',
                    'hostname', 'port', 'pathname', 'search', 'hash'];

    function toComponents(parts) {
        const c = {};
        FIELDS.forEach((f, i) => { c[f] = parts[i]; });
        return c;
    }

    class URLSearchParams {
        #list = [];
        #url = null;

        constructor(init = '') {
            if (init instanceof URLSearchParams) {
                this.#list = init.#list.map(([k, v]) => [k, v]);
            } else if (typeof init === 'object' && init !== null) {
                if (typeof init[Symbol.iterator] === 'function') {
                    for (const pair of init) {
                        const p = [...pair];
                        if (p.length !== 2) throw new TypeError('Each query pair must be an iterable [name, value] tuple');
                        this.#list.push([String(p[0]), String(p[1])]);
                    }
                } else {
                    for (const key of Object.keys(init)) this.#list.push([key, String(init[key])]);
                }
            } else {
                this[kReset](String(init));
            }
        }

        [kBind](url) { this.#url = url; }
        [kReset](query) {
            if (query.startsWith('?')) query = query.slice(1);
            this.#list = ops.op_urlencoded_parse(query);
        }
        #update() {
            if (this.#url) this.#url[kReset](this.toString());
        }

        get size() { return this.#list.length; }
        append(name, value) {
            this.#list.push([String(name), String(value)]);
            this.#update();
        }
        delete(name, value) {
            name = String(name);
            this.#list = this.#list.filter(([k, v]) => k !== name || (value !== undefined && v !== String(value)));
            this.#update();
        }
        get(name) {
            const entry = this.#list.find(([k]) => k === String(name));
            return entry ? entry[1] : null;
        }
        getAll(name) {
            return this.#list.filter(([k]) => k === String(name)).map(([, v]) => v);
        }
        has(name, value) {
            name = String(name);
            return this.#list.some(([k, v]) => k === name && (value === undefined || v === String(value)));
        }
        set(name, value) {
            name = String(name);
            value = String(value);
            const index = this.#list.findIndex(([k]) => k === name);
            if (index < 0) {
                this.#list.push([name, value]);
            } else {
                this.#list[index][1] = value;
                this.#list = this.#list.filter(([k], i) => k !== name || i === index);
            }
            this.#update();
        }
        sort() {
            this.#list = this.#list
                .map((entry, i) => [entry, i])
                .sort((a, b) => (a[0][0] < b[0][0] ? -1 : a[0][0] > b[0][0] ? 1 : a[1] - b[1]))
                .map(([entry]) => entry);
            this.#update();
        }
        forEach(callback, thisArg) {
            for (const [k, v] of this.#list) callback.call(thisArg, v, k, this);
        }
        *keys() { for (const [k] of this.#list) yield k; }
        *values() { for (const [, v] of this.#list) yield v; }
        *entries() { for (const [k, v] of this.#list) yield [k, v]; }
        [Symbol.iterator]() { return this.entries(); }
        toString() { return ops.op_urlencoded_serialize(this.#list); }
    }

    class URL {
        #c;
        #params = null;

        constructor(url, base) {
            if (arguments.length === 0) throw new TypeError("Failed to construct 'URL': 1 argument required.");
            this.#c = toComponents(ops.op_url_parse(String(url), base === undefined ? null : String(base)));
        }

        static canParse(url, base) {
            return ops.op_url_can_parse(String(url), base === undefined ? null : String(base));
        }
        static parse(url, base) {
            try { return new URL(url, base); } catch (e) { return null; }
        }

        #set(field, value) {
            this.#c = toComponents(ops.op_url_set(this.#c.href, field, String(value)));
            if (this.#params && (field === 'href' || field === 'search')) this.#params[kReset](this.#c.search);
        }
        [kReset](query) {
            this.#c = toComponents(ops.op_url_set(this.#c.href, 'search', query));
        }

        get href() { return this.#c.href; }
        set href(v) { this.#set('href', v); }
        get origin() { return this.#c.origin; }
        get protocol() { return this.#c.protocol; }
        set protocol(v) { this.#set('protocol', v); }
        get username() { return this.#c.username; }
        set username(v) { this.#set('username', v); }
        get password() { return this.#c.password; }
        set password(v) { this.#set('password', v); }
        get host() { return this.#c.host; }
        set host(v) { this.#set('host', v); }
        get hostname() { return this.#c.hostname; }
        set hostname(v) { this.#set('hostname', v); }
        get port() { return this.#c.port; }
        set port(v) { this.#set('port', v); }
        get pathname() { return this.#c.pathname; }
        set pathname(v) { this.#set('pathname', v); }
        get search() { return this.#c.search; }
        set search(v) { this.#set('search', v); }
        get hash() { return this.#c.hash; }
        set hash(v) { this.#set('hash', v); }
        get searchParams() {
            if (!this.#params) {
                this.#params = new URLSearchParams(this.#c.search);
                this.#params[kBind](this);
            }
            return this.#params;
        }
        toString() { return this.#c.href; }
        toJSON() { return this.#c.href; }
    }

    edge.urlComponents = (url) => toComponents(ops.op_url_parse(String(url), null));
    globalThis.URL = URL;
    globalThis.URLSearchParams = URLSearchParams;
})();
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn field(url: &Url, index: usize) -> String {
        match components(url) {
            OpValue::List(items) => items[index].as_str().unwrap_or_default().to_string(),
            _ => unreachable!(),
        }
    }

    #[test]
    fn resolves_against_base() {
        let url = parse("../b?x=1#f", Some("https://example.com/a/c")).unwrap();
        assert_eq!(url.as_str(), "https://example.com/b?x=1#f");
        assert_eq!(field(&url, 1), "https://example.com");
        assert_eq!(field(&url, 9), "?x=1");
        assert_eq!(field(&url, 10), "#f");
    }

    #[test]
    fn invalid_urls_are_type_errors() {
        let err = parse("not a url", None).unwrap_err();
        assert_eq!(err.js_name(), "TypeError");
        assert!(parse("/x", Some("also not")).is_err());
    }

    #[test]
    fn setters_follow_web_semantics() {
        let mut url = parse("https://example.com:8443/p", None).unwrap();
        set(&mut url, "port", "443").unwrap();
        assert_eq!(field(&url, 7), "");
        set(&mut url, "port", "nope").unwrap();
        assert_eq!(url.as_str(), "https://example.com/p");
        set(&mut url, "search", "a=b c").unwrap();
        assert_eq!(field(&url, 9), "?a=b%20c");
        assert!(set(&mut url, "href", "::").is_err());
    }
}
