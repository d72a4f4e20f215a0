//! `TextEncoder`, `TextDecoder`, `atob` and `btoa`.
//!
//! Decoding goes through `encoding_rs`, so every WHATWG label is accepted.
//! A decoder used with `{stream: true}` keeps its state on the native side
//! under a handle until a non-streaming call flushes it.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;
use encoding_rs::{CoderResult, Decoder, DecoderResult, Encoding, REPLACEMENT};

use crate::engine::{native, JsEngine, OpReturn, OpValue};
use crate::error::{JsError, OpError};

use super::SharedHost;

/// Forgiving base64: padding has already been stripped and trailing bits
/// are discarded.
const FORGIVING: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::RequireNone)
        .with_decode_allow_trailing_bits(true),
);

pub fn install<E: JsEngine>(engine: &mut E, host: &SharedHost) -> Result<(), JsError> {
    engine.register_fn(
        "op_encoding_name",
        native(|args| {
            let label = args.string(0)?;
            OpReturn::value(lookup(&label)?.name().to_ascii_lowercase())
        }),
    );
    engine.register_fn(
        "op_encode_utf8",
        native(|args| OpReturn::value(args.string(0)?.into_bytes())),
    );
    engine.register_fn(
        "op_encode_into",
        native(|args| {
            let input = args.string(0)?;
            let capacity = args.u64(1)? as usize;
            let (bytes, read) = encode_into(&input, capacity);
            OpReturn::value(OpValue::List(vec![OpValue::Bytes(bytes), OpValue::Number(read as f64)]))
        }),
    );

    let h = host.clone();
    engine.register_fn(
        "op_decode",
        native(move |args| {
            let encoding = lookup(&args.string(0)?)?;
            let bytes = args.bytes(1)?;
            let fatal = args.bool(2)?;
            let ignore_bom = args.bool(3)?;
            let stream = args.bool(4)?;
            let handle = args.u32(5)?;

            let mut host = h.borrow_mut();
            let mut decoder = match host.decoders.remove(&handle) {
                Some(decoder) => decoder,
                None if ignore_bom => encoding.new_decoder_without_bom_handling(),
                None => encoding.new_decoder_with_bom_removal(),
            };
            let text = decode_chunk(&mut decoder, &bytes, fatal, !stream)?;
            let handle = if stream {
                let handle = if handle != 0 {
                    handle
                } else {
                    host.next_decoder = host.next_decoder.wrapping_add(1).max(1);
                    host.next_decoder
                };
                host.decoders.insert(handle, decoder);
                handle
            } else {
                0
            };
            OpReturn::value(OpValue::List(vec![OpValue::String(text), OpValue::from(handle)]))
        }),
    );

    engine.register_fn(
        "op_base64_encode",
        native(|args| {
            let input = args.string(0)?;
            let latin1 = input
                .chars()
                .map(|c| u8::try_from(u32::from(c)))
                .collect::<Result<Vec<u8>, _>>()
                .map_err(|_| {
                    OpError::dom(
                        "InvalidCharacterError",
                        "The string to be encoded contains characters outside of the Latin1 range.",
                    )
                })?;
            OpReturn::value(STANDARD.encode(latin1))
        }),
    );
    engine.register_fn(
        "op_base64_decode",
        native(|args| {
            let bytes = forgiving_decode(&args.string(0)?)?;
            OpReturn::value(bytes.into_iter().map(char::from).collect::<String>())
        }),
    );

    engine.eval("<encoding-setup>", ENCODING_JS)?;
    Ok(())
}

fn lookup(label: &str) -> Result<&'static Encoding, OpError> {
    match Encoding::for_label(label.trim().as_bytes()) {
        Some(encoding) if encoding != REPLACEMENT => Ok(encoding),
        _ => Err(OpError::range_error(format!(
            "The encoding label provided ('{label}') is invalid."
        ))),
    }
}

/// UTF-8 bytes of the longest prefix of `input` fitting in `capacity`, and
/// the number of UTF-16 code units consumed.
fn encode_into(input: &str, capacity: usize) -> (Vec<u8>, usize) {
    let mut written = 0;
    let mut read = 0;
    for c in input.chars() {
        if written + c.len_utf8() > capacity {
            break;
        }
        written += c.len_utf8();
        read += c.len_utf16();
    }
    (input.as_bytes()[..written].to_vec(), read)
}

fn decode_chunk(decoder: &mut Decoder, bytes: &[u8], fatal: bool, last: bool) -> Result<String, OpError> {
    let too_large = || OpError::range_error("input too large to decode");
    if fatal {
        let capacity = decoder
            .max_utf8_buffer_length_without_replacement(bytes.len())
            .ok_or_else(too_large)?;
        let mut out = String::with_capacity(capacity);
        let (result, _) = decoder.decode_to_string_without_replacement(bytes, &mut out, last);
        match result {
            DecoderResult::InputEmpty => Ok(out),
            DecoderResult::Malformed(_, _) => Err(OpError::type_error(format!(
                "The encoded data was not valid for encoding {}",
                decoder.encoding().name().to_ascii_lowercase()
            ))),
            DecoderResult::OutputFull => Err(too_large()),
        }
    } else {
        let capacity = decoder.max_utf8_buffer_length(bytes.len()).ok_or_else(too_large)?;
        let mut out = String::with_capacity(capacity);
        match decoder.decode_to_string(bytes, &mut out, last) {
            (CoderResult::InputEmpty, _, _) => Ok(out),
            (CoderResult::OutputFull, _, _) => Err(too_large()),
        }
    }
}

fn forgiving_decode(input: &str) -> Result<Vec<u8>, OpError> {
    let invalid = || OpError::dom("InvalidCharacterError", "The string to be decoded is not correctly encoded.");
    let mut data: Vec<u8> = input
        .bytes()
        .filter(|b| !matches!(b, b' ' | b'\t' | b'\n' | b'\x0c' | b'\r'))
        .collect();
    if data.len() % 4 == 0 {
        for _ in 0..2 {
            if data.last() == Some(&b'=') {
                data.pop();
            }
        }
    }
    if data.len() % 4 == 1 || !data.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'+' || *b == b'/') {
        return Err(invalid());
    }
    FORGIVING.decode(&data).map_err(|_| invalid())
}

const ENCODING_JS: &str = r#"
(function() {
    const ops = globalThis.__ops;
    const edge = globalThis.__edge;

    class TextEncoder {
        get encoding() { return 'utf-8'; }
        encode(input = '') {
            return ops.op_encode_utf8(String(input));
        }
        encodeInto(source, destination) {
            if (!(destination instanceof Uint8Array)) {
                throw new TypeError("Failed to execute 'encodeInto': parameter 2 is not of type 'Uint8Array'.");
            }
            const [bytes, read] = ops.op_encode_into(String(source), destination.length);
            destination.set(bytes);
            return { read, written: bytes.length };
        }
    }

    class TextDecoder {
        #encoding;
        #fatal;
        #ignoreBOM;
        #handle = 0;
        constructor(label = 'utf-8', options = {}) {
            this.#encoding = ops.op_encoding_name(String(label));
            this.#fatal = !!options.fatal;
            this.#ignoreBOM = !!options.ignoreBOM;
        }
        get encoding() { return this.#encoding; }
        get fatal() { return this.#fatal; }
        get ignoreBOM() { return this.#ignoreBOM; }
        decode(input, options = {}) {
            const bytes = input === undefined ? new Uint8Array(0) : edge.toBytes(input, 'input');
            const stream = !!options.stream;
            try {
                const [text, handle] = ops.op_decode(this.#encoding, bytes, this.#fatal, this.#ignoreBOM, stream, this.#handle);
                this.#handle = handle;
                return text;
            } catch (err) {
                this.#handle = 0;
                throw err;
            }
        }
    }

    globalThis.TextEncoder = TextEncoder;
    globalThis.TextDecoder = TextDecoder;
    globalThis.btoa = function btoa(data) {
        if (arguments.length === 0) throw new TypeError("Failed to execute 'btoa': 1 argument required.");
        return ops.op_base64_encode(String(data));
    };
    globalThis.atob = function atob(data) {
        if (arguments.length === 0) throw new TypeError("Failed to execute 'atob': 1 argument required.");
        return ops.op_base64_decode(String(data));
    };
})();
"#;
