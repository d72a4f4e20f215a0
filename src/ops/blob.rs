//! `Blob`, `File` and `FormData`, plus `multipart/form-data` parsing.

use crate::engine::{native, JsEngine, OpReturn, OpValue};
use crate::error::{JsError, OpError};

use super::SharedHost;

pub fn install<E: JsEngine>(engine: &mut E, _host: &SharedHost) -> Result<(), JsError> {
    engine.register_fn(
        "op_multipart_parse",
        native(|args| {
            let body = args.bytes(0)?;
            let boundary = args.string(1)?;
            let parts = parse_multipart(&body, &boundary)?
                .into_iter()
                .map(|part| {
                    OpValue::List(vec![
                        OpValue::String(part.name),
                        part.filename.map_or(OpValue::Null, OpValue::String),
                        part.content_type.map_or(OpValue::Null, OpValue::String),
                        OpValue::Bytes(part.data),
                    ])
                })
                .collect();
            OpReturn::value(OpValue::List(parts))
        }),
    );

    engine.eval("<blob-setup>", BLOB_JS)?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Part {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

fn malformed() -> OpError {
    OpError::type_error("Could not parse content as FormData.")
}

/// Parse a `multipart/form-data` body delimited by `boundary`.
pub fn parse_multipart(body: &[u8], boundary: &str) -> Result<Vec<Part>, OpError> {
    if boundary.is_empty() {
        return Err(malformed());
    }
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();
    let closing = [b"\r\n".as_slice(), delimiter].concat();

    let mut pos = find(body, delimiter, 0).ok_or_else(malformed)? + delimiter.len();
    let mut parts = Vec::new();
    loop {
        if body[pos..].starts_with(b"--") {
            return Ok(parts);
        }
        while pos < body.len() && matches!(body[pos], b' ' | b'\t') {
            pos += 1;
        }
        pos = match &body[pos..] {
            rest if rest.starts_with(b"\r\n") => pos + 2,
            rest if rest.starts_with(b"\n") => pos + 1,
            _ => return Err(malformed()),
        };
        let headers_end = find(body, b"\r\n\r\n", pos).ok_or_else(malformed)?;
        let headers = std::str::from_utf8(&body[pos..headers_end]).map_err(|_| malformed())?;
        let data_start = headers_end + 4;
        let data_end = find(body, &closing, data_start).ok_or_else(malformed)?;

        let mut part = Part {
            name: String::new(),
            filename: None,
            content_type: None,
            data: body[data_start..data_end].to_vec(),
        };
        let mut named = false;
        for line in headers.split("\r\n") {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            if key.trim().eq_ignore_ascii_case("content-disposition") {
                for (param, param_value) in disposition_params(value) {
                    match param.as_str() {
                        "name" => {
                            part.name = param_value;
                            named = true;
                        }
                        "filename" => part.filename = Some(param_value),
                        _ => {}
                    }
                }
            } else if key.trim().eq_ignore_ascii_case("content-type") {
                part.content_type = Some(value.to_string());
            }
        }
        if !named {
            return Err(malformed());
        }
        parts.push(part);
        pos = data_end + closing.len();
    }
}

/// `name="value"` parameters of a `Content-Disposition: form-data` header.
fn disposition_params(value: &str) -> Vec<(String, String)> {
    value
        .split(';')
        .skip(1)
        .filter_map(|param| {
            let (key, raw) = param.split_once('=')?;
            let raw = raw.trim();
            let unquoted = raw
                .strip_prefix('"')
                .and_then(|r| r.strip_suffix('"'))
                .unwrap_or(raw);
            let decoded = unquoted.replace("%22", "\"").replace("%0D", "\r").replace("%0A", "\n");
            Some((key.trim().to_ascii_lowercase(), decoded))
        })
        .collect()
}

const BLOB_JS: &str = r#"
(function() {
    const ops = globalThis.__ops;
    const edge = globalThis.__edge;
    const BLOB = new WeakMap();
    const encoder = new TextEncoder();
    const decoder = new TextDecoder();

    function normalizeType(type) {
        if (type === undefined) return '';
        type = String(type);
        return /^[\x20-\x7e]*$/.test(type) ? type.toLowerCase() : '';
    }

    class Blob {
        constructor(parts, options) {
            if (parts === undefined) parts = [];
            if (parts === null || typeof parts !== 'object' || typeof parts[Symbol.iterator] !== 'function') {
                throw new TypeError("Failed to construct 'Blob': The provided value cannot be converted to a sequence.");
            }
            const chunks = [];
            for (const part of parts) {
                if (part instanceof Blob) chunks.push(BLOB.get(part).bytes);
                else if (edge.isBufferSource(part)) chunks.push(edge.toBytes(part).slice());
                else chunks.push(encoder.encode(String(part)));
            }
            BLOB.set(this, { bytes: edge.concat(chunks), type: normalizeType(options && options.type) });
        }
        get size() { return BLOB.get(this).bytes.byteLength; }
        get type() { return BLOB.get(this).type; }
        slice(start, end, contentType) {
            const { bytes } = BLOB.get(this);
            const size = bytes.byteLength;
            const clamp = (v, dflt) => {
                if (v === undefined) return dflt;
                v = Math.trunc(Number(v)) || 0;
                return v < 0 ? Math.max(size + v, 0) : Math.min(v, size);
            };
            const from = clamp(start, 0);
            const to = Math.max(clamp(end, size), from);
            const blob = Object.create(Blob.prototype);
            BLOB.set(blob, { bytes: bytes.subarray(from, to), type: normalizeType(contentType) });
            return blob;
        }
        arrayBuffer() { return Promise.resolve(BLOB.get(this).bytes.slice().buffer); }
        bytes() { return Promise.resolve(BLOB.get(this).bytes.slice()); }
        text() { return Promise.resolve(decoder.decode(BLOB.get(this).bytes)); }
        stream() { return edge.streamFromBytes(BLOB.get(this).bytes.slice()); }
    }

    class File extends Blob {
        #name;
        #lastModified;
        constructor(parts, name, options) {
            if (arguments.length < 2) {
                throw new TypeError("Failed to construct 'File': 2 arguments required.");
            }
            super(parts, options);
            this.#name = String(name);
            this.#lastModified = options && options.lastModified !== undefined ? Number(options.lastModified) : Date.now();
        }
        get name() { return this.#name; }
        get lastModified() { return this.#lastModified; }
    }

    function toEntry(name, value, filename) {
        name = String(name);
        if (value instanceof Blob) {
            if (!(value instanceof File) || filename !== undefined) {
                const fileName = filename !== undefined ? String(filename) : (value instanceof File ? value.name : 'blob');
                const lastModified = value instanceof File ? value.lastModified : undefined;
                value = new File([value], fileName, { type: value.type, lastModified });
            }
            return [name, value];
        }
        return [name, String(value)];
    }

    class FormData {
        #entries = [];
        constructor(form) {
            if (form !== undefined) throw new TypeError("Failed to construct 'FormData': form elements are not supported");
        }
        append(name, value, filename) {
            if (arguments.length < 2) throw new TypeError("Failed to execute 'append' on 'FormData': 2 arguments required.");
            this.#entries.push(toEntry(name, value, filename));
        }
        delete(name) {
            name = String(name);
            this.#entries = this.#entries.filter(([k]) => k !== name);
        }
        get(name) {
            const entry = this.#entries.find(([k]) => k === String(name));
            return entry ? entry[1] : null;
        }
        getAll(name) {
            return this.#entries.filter(([k]) => k === String(name)).map(([, v]) => v);
        }
        has(name) {
            return this.#entries.some(([k]) => k === String(name));
        }
        set(name, value, filename) {
            if (arguments.length < 2) throw new TypeError("Failed to execute 'set' on 'FormData': 2 arguments required.");
            const entry = toEntry(name, value, filename);
            const index = this.#entries.findIndex(([k]) => k === entry[0]);
            if (index < 0) {
                this.#entries.push(entry);
            } else {
                this.#entries[index] = entry;
                this.#entries = this.#entries.filter(([k], i) => k !== entry[0] || i === index);
            }
        }
        forEach(callback, thisArg) {
            for (const [k, v] of this.#entries) callback.call(thisArg, v, k, this);
        }
        *keys() { for (const [k] of this.#entries) yield k; }
        *values() { for (const [, v] of this.#entries) yield v; }
        *entries() { for (const [k, v] of this.#entries) yield [k, v]; }
        [Symbol.iterator]() { return this.entries(); }
    }

    const escapeQuoted = (s) => s.replace(/"/g, '%22').replace(/\r/g, '%0D').replace(/\n/g, '%0A');

    edge.blobBytes = (blob) => BLOB.get(blob).bytes;

    edge.serializeFormData = function(form) {
        const boundary = '----edgeworker' + Math.random().toString(16).slice(2) + Date.now().toString(16);
        const chunks = [];
        for (const [name, value] of form) {
            let head = `--${boundary}\r\nContent-Disposition: form-data; name="${escapeQuoted(name)}"`;
            if (value instanceof File) {
                head += `; filename="${escapeQuoted(value.name)}"\r\nContent-Type: ${value.type || 'application/octet-stream'}`;
                chunks.push(encoder.encode(head + '\r\n\r\n'), BLOB.get(value).bytes, encoder.encode('\r\n'));
            } else {
                chunks.push(encoder.encode(`${head}\r\n\r\n${value}\r\n`));
            }
        }
        chunks.push(encoder.encode(`--${boundary}--\r\n`));
        return { bytes: edge.concat(chunks), type: `multipart/form-data; boundary=${boundary}` };
    };

    edge.parseFormData = function(bytes, contentType) {
        const type = String(contentType || '').toLowerCase();
        const form = new FormData();
        if (type.startsWith('multipart/form-data')) {
            const match = /boundary=(?:"([^"]+)"|([^;\s]+))/i.exec(String(contentType));
            if (!match) throw new TypeError('Could not parse content as FormData.');
            for (const [name, filename, partType, data] of ops.op_multipart_parse(bytes, match[1] || match[2])) {
                if (filename === null) form.append(name, decoder.decode(data));
                else form.append(name, new File([data], filename, { type: partType || '' }));
            }
            return form;
        }
        if (type.startsWith('application/x-www-form-urlencoded')) {
            for (const [k, v] of new URLSearchParams(decoder.decode(bytes))) form.append(k, v);
            return form;
        }
        throw new TypeError('Could not parse content as FormData.');
    };

    globalThis.Blob = Blob;
    globalThis.File = File;
    globalThis.FormData = FormData;
})();
"#;

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = b"--XyZ\r\n\
Content-Disposition: form-data; name=\"field\"\r\n\
\r\n\
value one\r\n\
--XyZ\r\n\
Content-Disposition: form-data; name=\"upload\"; filename=\"a \\\"b\\\".txt\"\r\n\
Content-Type: text/plain\r\n\
\r\n\
line1\r\nline2\r\n\
--XyZ--\r\n";

    #[test]
    fn parses_fields_and_files() {
        let parts = parse_multipart(BODY, "XyZ").unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].name, "field");
        assert_eq!(parts[0].data, b"value one");
        assert_eq!(parts[0].filename, None);
        assert_eq!(parts[1].name, "upload");
        assert_eq!(parts[1].content_type.as_deref(), Some("text/plain"));
        assert_eq!(parts[1].data, b"line1\r\nline2");
    }

    #[test]
    fn escaped_quotes_are_decoded() {
        let body = b"--b\r\nContent-Disposition: form-data; name=\"q%22x\"\r\n\r\nv\r\n--b--";
        let parts = parse_multipart(body, "b").unwrap();
        assert_eq!(parts[0].name, "q\"x");
    }

    #[test]
    fn rejects_malformed_bodies() {
        assert!(parse_multipart(b"no delimiter here", "b").is_err());
        assert!(parse_multipart(b"--b\r\nContent-Disposition: form-data\r\n\r\nv\r\n--b--", "b").is_err());
        assert!(parse_multipart(b"--b\r\nContent-Disposition: form-data; name=\"x\"\r\n\r\nunterminated", "b").is_err());
        assert!(parse_multipart(BODY, "").is_err());
    }

    #[test]
    fn empty_form() {
        assert!(parse_multipart(b"--b--\r\n", "b").unwrap().is_empty());
    }
}
