//! JS engine abstraction.
//!
//! Everything above this module talks to the engine through [`JsEngine`];
//! the only backend is [`v8_backend::V8Engine`]. Values cross the boundary as
//! [`OpValue`]s, native functions are [`NativeFn`] closures, and async native
//! work is handed back to the event loop as [`PendingOp`]s.

pub mod marshal;
pub mod module;
pub mod v8_backend;

use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::error::{JsError, OpError};

pub use v8_backend::{initialize_v8, V8Engine};

// ── Boundary values ──────────────────────────────────────────────────────

/// A value crossing the JS/native boundary.
///
/// Typed arrays and `ArrayBuffer`s arrive as `Bytes`; arrays and plain
/// objects arrive as `Json`. `Bytes` is handed to JS as a `Uint8Array`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum OpValue {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Bytes(Vec<u8>),
    Json(JsonValue),
    /// Returned as a JS array; elements are converted individually.
    List(Vec<OpValue>),
}

impl OpValue {
    pub fn is_nullish(&self) -> bool {
        matches!(self, OpValue::Undefined | OpValue::Null | OpValue::Json(JsonValue::Null))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            OpValue::String(s) => Some(s),
            OpValue::Json(JsonValue::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            OpValue::Number(n) => Some(*n),
            OpValue::Json(v) => v.as_f64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            OpValue::Bool(b) => Some(*b),
            OpValue::Json(JsonValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            OpValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// JSON view of the value; bytes become an array of numbers.
    pub fn to_json(&self) -> JsonValue {
        match self {
            OpValue::Undefined | OpValue::Null => JsonValue::Null,
            OpValue::Bool(b) => JsonValue::Bool(*b),
            OpValue::Number(n) => serde_json::Number::from_f64(*n).map(JsonValue::Number).unwrap_or(JsonValue::Null),
            OpValue::String(s) => JsonValue::String(s.clone()),
            OpValue::Bytes(b) => JsonValue::Array(b.iter().map(|x| JsonValue::from(*x)).collect()),
            OpValue::Json(v) => v.clone(),
            OpValue::List(items) => JsonValue::Array(items.iter().map(OpValue::to_json).collect()),
        }
    }
}

impl From<String> for OpValue {
    fn from(s: String) -> Self {
        OpValue::String(s)
    }
}

impl From<&str> for OpValue {
    fn from(s: &str) -> Self {
        OpValue::String(s.to_string())
    }
}

impl From<Vec<u8>> for OpValue {
    fn from(b: Vec<u8>) -> Self {
        OpValue::Bytes(b)
    }
}

impl From<bool> for OpValue {
    fn from(b: bool) -> Self {
        OpValue::Bool(b)
    }
}

impl From<f64> for OpValue {
    fn from(n: f64) -> Self {
        OpValue::Number(n)
    }
}

impl From<u32> for OpValue {
    fn from(n: u32) -> Self {
        OpValue::Number(n as f64)
    }
}

impl From<JsonValue> for OpValue {
    fn from(v: JsonValue) -> Self {
        OpValue::Json(v)
    }
}

// ── Op arguments ─────────────────────────────────────────────────────────

/// Arguments of one native call, with typed accessors that fail with a
/// `TypeError` naming the op.
pub struct OpArgs {
    op: Rc<str>,
    values: Vec<OpValue>,
}

impl OpArgs {
    pub fn new(op: impl Into<Rc<str>>, values: Vec<OpValue>) -> Self {
        Self { op: op.into(), values }
    }

    pub fn op_name(&self) -> &str {
        &self.op
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> &OpValue {
        static UNDEFINED: OpValue = OpValue::Undefined;
        self.values.get(index).unwrap_or(&UNDEFINED)
    }

    pub fn values(&self) -> &[OpValue] {
        &self.values
    }

    fn mismatch(&self, index: usize, expected: &str) -> OpError {
        OpError::type_error(format!("{}: argument {} must be {}", self.op, index, expected))
    }

    pub fn string(&self, index: usize) -> Result<String, OpError> {
        self.get(index).as_str().map(str::to_string).ok_or_else(|| self.mismatch(index, "a string"))
    }

    pub fn opt_string(&self, index: usize) -> Result<Option<String>, OpError> {
        if self.get(index).is_nullish() {
            return Ok(None);
        }
        self.string(index).map(Some)
    }

    pub fn number(&self, index: usize) -> Result<f64, OpError> {
        self.get(index).as_f64().ok_or_else(|| self.mismatch(index, "a number"))
    }

    pub fn u64(&self, index: usize) -> Result<u64, OpError> {
        let n = self.number(index)?;
        if n < 0.0 || n.fract() != 0.0 || !n.is_finite() {
            return Err(self.mismatch(index, "a non-negative integer"));
        }
        Ok(n as u64)
    }

    pub fn u32(&self, index: usize) -> Result<u32, OpError> {
        let n = self.u64(index)?;
        u32::try_from(n).map_err(|_| self.mismatch(index, "a 32-bit integer"))
    }

    pub fn bool(&self, index: usize) -> Result<bool, OpError> {
        match self.get(index) {
            OpValue::Undefined | OpValue::Null => Ok(false),
            v => v.as_bool().ok_or_else(|| self.mismatch(index, "a boolean")),
        }
    }

    pub fn bytes(&self, index: usize) -> Result<Vec<u8>, OpError> {
        match self.get(index) {
            OpValue::Bytes(b) => Ok(b.clone()),
            _ => Err(self.mismatch(index, "an ArrayBuffer or ArrayBufferView")),
        }
    }

    pub fn opt_bytes(&self, index: usize) -> Result<Option<Vec<u8>>, OpError> {
        if self.get(index).is_nullish() {
            return Ok(None);
        }
        self.bytes(index).map(Some)
    }

    pub fn json(&self, index: usize) -> JsonValue {
        self.get(index).to_json()
    }

    /// Deserialize a JSON-shaped argument.
    pub fn parse<T: serde::de::DeserializeOwned>(&self, index: usize) -> Result<T, OpError> {
        serde_json::from_value(self.json(index))
            .map_err(|e| OpError::type_error(format!("{}: argument {}: {}", self.op, index, e)))
    }
}

// ── Native functions ─────────────────────────────────────────────────────

pub type OpFuture = Pin<Box<dyn Future<Output = Result<OpValue, OpError>> + Send + 'static>>;

/// What a native function hands back to the engine.
pub enum OpReturn {
    /// Returned to JS synchronously.
    Value(OpValue),
    /// JS receives a promise; the future runs on the host runtime and its
    /// output settles the promise on the engine thread.
    Async { request_id: u64, future: OpFuture },
}

impl OpReturn {
    pub fn undefined() -> Result<Self, OpError> {
        Ok(OpReturn::Value(OpValue::Undefined))
    }

    pub fn value(v: impl Into<OpValue>) -> Result<Self, OpError> {
        Ok(OpReturn::Value(v.into()))
    }

    pub fn future<F>(request_id: u64, fut: F) -> Result<Self, OpError>
    where
        F: Future<Output = Result<OpValue, OpError>> + Send + 'static,
    {
        Ok(OpReturn::Async {
            request_id,
            future: Box::pin(fut),
        })
    }
}

pub type NativeFn = Rc<dyn Fn(OpArgs) -> Result<OpReturn, OpError>>;

pub fn native<F>(f: F) -> NativeFn
where
    F: Fn(OpArgs) -> Result<OpReturn, OpError> + 'static,
{
    Rc::new(f)
}

/// Identifies the promise handed to JS for an async op.
pub type PromiseId = u32;

/// An async op waiting to be spawned by the event loop.
pub struct PendingOp {
    pub promise: PromiseId,
    pub request_id: u64,
    pub future: OpFuture,
}

/// What the module's default export holds under a given key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Function,
    Other,
    Missing,
}

/// Thread-safe handle that interrupts running JS.
pub type InterruptHandle = Arc<dyn Fn() + Send + Sync>;

// ── Engine trait ─────────────────────────────────────────────────────────

/// One isolated JS context. Not `Send`: an engine lives on the thread that
/// created it.
pub trait JsEngine {
    /// Run a classic script in the global scope.
    fn eval(&mut self, name: &str, source: &str) -> Result<OpValue, JsError>;

    /// Compile, instantiate and evaluate the worker's ES module and keep its
    /// default export.
    fn compile_module(&mut self, name: &str, source: &str) -> Result<(), JsError>;

    /// Kind of `default[member]`, or `Missing` when there is no default export.
    fn export_kind(&mut self, member: &str) -> ExportKind;

    /// Make the default export reachable from JS at a dotted global path.
    fn expose_default_export(&mut self, path: &str) -> Result<(), JsError>;

    /// Expose a native function as `__ops[name]`.
    fn register_fn(&mut self, name: &str, f: NativeFn);

    /// Assign a fresh empty object at a dotted global path.
    fn new_object(&mut self, path: &str) -> Result<(), JsError>;

    /// Assign a value at a dotted global path.
    fn marshal_value(&mut self, path: &str, value: OpValue) -> Result<(), JsError>;

    /// Call the function at a dotted global path.
    fn call_function(&mut self, path: &str, args: Vec<OpValue>) -> Result<OpValue, JsError>;

    /// Start tracking promises rejected without a handler.
    fn install_unhandled_rejection_hook(&mut self);

    /// Rejections still unhandled since the last call.
    fn take_unhandled_rejections(&mut self) -> Vec<JsError>;

    fn pump_microtasks(&mut self);

    /// Async ops started by JS since the last call.
    fn take_pending_ops(&mut self) -> Vec<PendingOp>;

    /// Resolve or reject the promise of a finished async op. Unknown ids
    /// (already released) are ignored.
    fn settle_promise(&mut self, id: PromiseId, result: Result<OpValue, OpError>) -> Result<(), JsError>;

    /// Forget the promises still owned by a finished request.
    fn release_promises(&mut self, request_id: u64);

    fn interrupt_handle(&mut self) -> InterruptHandle;

    /// Clear a pending interrupt so JS can run again.
    fn cancel_interrupt(&mut self);

    /// Whether the heap limit was reached; the context is unusable afterwards.
    fn heap_exhausted(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_args_accessors() {
        let args = OpArgs::new(
            "op_test",
            vec![
                OpValue::Number(7.0),
                OpValue::String("x".into()),
                OpValue::Bytes(vec![1, 2]),
                OpValue::Null,
            ],
        );
        assert_eq!(args.u32(0).unwrap(), 7);
        assert_eq!(args.string(1).unwrap(), "x");
        assert_eq!(args.bytes(2).unwrap(), vec![1, 2]);
        assert_eq!(args.opt_string(3).unwrap(), None);
        assert!(!args.bool(4).unwrap());
        let err = args.string(0).unwrap_err();
        assert_eq!(err.js_name(), "TypeError");
        assert!(err.message().contains("op_test"));
    }

    #[test]
    fn rejects_fractional_integers() {
        let args = OpArgs::new("op", vec![OpValue::Number(1.5), OpValue::Number(-1.0)]);
        assert!(args.u64(0).is_err());
        assert!(args.u64(1).is_err());
    }

    #[test]
    fn json_view() {
        let v = OpValue::List(vec![OpValue::Bytes(vec![3]), OpValue::Bool(true)]);
        assert_eq!(v.to_json(), serde_json::json!([[3], true]));
    }
}
