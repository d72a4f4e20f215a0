//! Conversions between V8 values and [`OpValue`] / JSON.

use serde_json::Value as JsonValue;

use super::OpValue;
use crate::error::{JsError, OpError};

/// Convert a native-call argument.
pub fn from_v8(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> OpValue {
    if value.is_undefined() {
        OpValue::Undefined
    } else if value.is_null() {
        OpValue::Null
    } else if value.is_boolean() {
        OpValue::Bool(value.boolean_value(scope))
    } else if value.is_number() {
        OpValue::Number(value.number_value(scope).unwrap_or(f64::NAN))
    } else if value.is_string() {
        OpValue::String(to_rust_string(scope, value))
    } else if let Some(bytes) = bytes_from_v8(scope, value) {
        OpValue::Bytes(bytes)
    } else {
        OpValue::Json(v8_to_json(scope, value))
    }
}

/// `String(value)`, or empty if the conversion throws.
pub fn to_rust_string(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> String {
    if value.is_symbol() {
        return String::new();
    }
    value
        .to_string(scope)
        .map(|s| s.to_rust_string_lossy(scope))
        .unwrap_or_default()
}

/// Copy the contents of an `ArrayBuffer` or `ArrayBufferView`.
pub fn bytes_from_v8(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> Option<Vec<u8>> {
    if let Ok(view) = v8::Local::<v8::ArrayBufferView>::try_from(value) {
        let mut buf = vec![0u8; view.byte_length()];
        view.copy_contents(&mut buf);
        return Some(buf);
    }
    if let Ok(ab) = v8::Local::<v8::ArrayBuffer>::try_from(value) {
        let len = ab.byte_length();
        let view = v8::Uint8Array::new(scope, ab, 0, len)?;
        let mut buf = vec![0u8; len];
        view.copy_contents(&mut buf);
        return Some(buf);
    }
    None
}

/// Convert a native return value.
pub fn to_v8<'s>(scope: &mut v8::HandleScope<'s>, value: OpValue) -> v8::Local<'s, v8::Value> {
    match value {
        OpValue::Undefined => v8::undefined(scope).into(),
        OpValue::Null => v8::null(scope).into(),
        OpValue::Bool(b) => v8::Boolean::new(scope, b).into(),
        OpValue::Number(n) => v8::Number::new(scope, n).into(),
        OpValue::String(s) => string_to_v8(scope, &s),
        OpValue::Bytes(bytes) => bytes_to_v8(scope, bytes),
        OpValue::Json(json) => json_to_v8(scope, &json),
        OpValue::List(items) => {
            let array = v8::Array::new(scope, items.len() as i32);
            for (i, item) in items.into_iter().enumerate() {
                let v = to_v8(scope, item);
                array.set_index(scope, i as u32, v);
            }
            array.into()
        }
    }
}

fn string_to_v8<'s>(scope: &mut v8::HandleScope<'s>, s: &str) -> v8::Local<'s, v8::Value> {
    // Length-prefixed; embedded NULs survive.
    v8::String::new(scope, s)
        .map(|v| v.into())
        .unwrap_or_else(|| v8::undefined(scope).into())
}

/// A fresh `Uint8Array` owning `bytes`.
pub fn bytes_to_v8<'s>(scope: &mut v8::HandleScope<'s>, bytes: Vec<u8>) -> v8::Local<'s, v8::Value> {
    let len = bytes.len();
    let store = v8::ArrayBuffer::new_backing_store_from_vec(bytes).make_shared();
    let buffer = v8::ArrayBuffer::with_backing_store(scope, &store);
    match v8::Uint8Array::new(scope, buffer, 0, len) {
        Some(view) => view.into(),
        None => buffer.into(),
    }
}

/// Convert a V8 value to a JSON value
pub fn v8_to_json(scope: &mut v8::HandleScope, value: v8::Local<v8::Value>) -> JsonValue {
    if value.is_undefined() || value.is_null() {
        JsonValue::Null
    } else if value.is_boolean() {
        JsonValue::Bool(value.boolean_value(scope))
    } else if value.is_number() {
        let num = value.number_value(scope).unwrap_or(0.0);
        if num.fract() == 0.0 && num.abs() < 9_007_199_254_740_992.0 {
            JsonValue::Number(serde_json::Number::from(num as i64))
        } else {
            serde_json::Number::from_f64(num)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null)
        }
    } else if value.is_string() {
        JsonValue::String(to_rust_string(scope, value))
    } else if let Some(bytes) = bytes_from_v8(scope, value) {
        JsonValue::Array(bytes.into_iter().map(JsonValue::from).collect())
    } else if let Ok(array) = v8::Local::<v8::Array>::try_from(value) {
        let mut vec = Vec::with_capacity(array.length() as usize);
        for i in 0..array.length() {
            let elem = array
                .get_index(scope, i)
                .unwrap_or_else(|| v8::undefined(scope).into());
            vec.push(v8_to_json(scope, elem));
        }
        JsonValue::Array(vec)
    } else if value.is_function() || value.is_symbol() {
        JsonValue::Null
    } else if let Some(obj) = value.to_object(scope) {
        let mut map = serde_json::Map::new();
        if let Some(prop_names) = obj.get_own_property_names(scope, v8::GetPropertyNamesArgs::default()) {
            for i in 0..prop_names.length() {
                let Some(key) = prop_names.get_index(scope, i) else { continue };
                let key_str = to_rust_string(scope, key);
                if let Some(val) = obj.get(scope, key) {
                    if val.is_undefined() || val.is_function() {
                        continue;
                    }
                    map.insert(key_str, v8_to_json(scope, val));
                }
            }
        }
        JsonValue::Object(map)
    } else {
        JsonValue::Null
    }
}

/// Convert a JSON value to a V8 value
pub fn json_to_v8<'s>(scope: &mut v8::HandleScope<'s>, value: &JsonValue) -> v8::Local<'s, v8::Value> {
    match value {
        JsonValue::Null => v8::null(scope).into(),
        JsonValue::Bool(b) => v8::Boolean::new(scope, *b).into(),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64().and_then(|i| i32::try_from(i).ok()) {
                v8::Integer::new(scope, i).into()
            } else {
                v8::Number::new(scope, n.as_f64().unwrap_or(f64::NAN)).into()
            }
        }
        JsonValue::String(s) => string_to_v8(scope, s),
        JsonValue::Array(arr) => {
            let v8_array = v8::Array::new(scope, arr.len() as i32);
            for (i, elem) in arr.iter().enumerate() {
                let v8_elem = json_to_v8(scope, elem);
                v8_array.set_index(scope, i as u32, v8_elem);
            }
            v8_array.into()
        }
        JsonValue::Object(map) => {
            let v8_obj = v8::Object::new(scope);
            for (key, val) in map {
                let Some(v8_key) = v8::String::new(scope, key) else { continue };
                let v8_val = json_to_v8(scope, val);
                v8_obj.set(scope, v8_key.into(), v8_val);
            }
            v8_obj.into()
        }
    }
}

// ── Exceptions ───────────────────────────────────────────────────────────

fn get_string_prop(scope: &mut v8::HandleScope, obj: v8::Local<v8::Object>, name: &str) -> Option<String> {
    let key = v8::String::new(scope, name)?;
    let value = obj.get(scope, key.into())?;
    if value.is_undefined() || value.is_null() {
        return None;
    }
    Some(to_rust_string(scope, value))
}

/// Describe a thrown value (or rejection reason) as a [`JsError`].
pub fn exception_to_js_error(scope: &mut v8::HandleScope, exception: v8::Local<v8::Value>) -> JsError {
    if exception.is_object() && !exception.is_function() {
        if let Some(obj) = exception.to_object(scope) {
            let name = get_string_prop(scope, obj, "name").unwrap_or_else(|| "Error".to_string());
            let message = get_string_prop(scope, obj, "message").unwrap_or_default();
            let stack = get_string_prop(scope, obj, "stack");
            return JsError { name, message, stack };
        }
    }
    JsError::new("Error", to_rust_string(scope, exception))
}

/// Build the JS exception object for an [`OpError`].
pub fn op_error_to_v8<'s>(scope: &mut v8::HandleScope<'s>, err: &OpError) -> v8::Local<'s, v8::Value> {
    let message = err.message();
    let msg = v8::String::new(scope, &message).unwrap_or_else(|| v8::String::empty(scope));
    match err {
        OpError::Type(_) => v8::Exception::type_error(scope, msg),
        OpError::Range(_) => v8::Exception::range_error(scope, msg),
        OpError::Syntax(_) => v8::Exception::syntax_error(scope, msg),
        OpError::Generic(_) => v8::Exception::error(scope, msg),
        OpError::Network { cause } => {
            let exception = v8::Exception::type_error(scope, msg);
            if let (Some(obj), Some(key), Some(cause)) = (
                exception.to_object(scope),
                v8::String::new(scope, "cause"),
                v8::String::new(scope, cause),
            ) {
                let cause_err = v8::Exception::error(scope, cause);
                obj.set(scope, key.into(), cause_err);
            }
            exception
        }
        OpError::Dom { name, .. } => dom_exception(scope, msg, name).unwrap_or_else(|| v8::Exception::error(scope, msg)),
    }
}

/// `new DOMException(message, name)` using the global constructor.
fn dom_exception<'s>(
    scope: &mut v8::HandleScope<'s>,
    message: v8::Local<'s, v8::String>,
    name: &str,
) -> Option<v8::Local<'s, v8::Value>> {
    let context = scope.get_current_context();
    let global = context.global(scope);
    let key = v8::String::new(scope, "DOMException")?;
    let ctor = global.get(scope, key.into())?;
    let ctor = v8::Local::<v8::Function>::try_from(ctor).ok()?;
    let name = v8::String::new(scope, name)?;
    let instance = ctor.new_instance(scope, &[message.into(), name.into()])?;
    Some(instance.into())
}
