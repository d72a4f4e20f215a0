//! V8 implementation of [`JsEngine`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};

use super::{
    marshal, module, ExportKind, InterruptHandle, JsEngine, NativeFn, OpArgs, OpReturn, OpValue, PendingOp, PromiseId,
};
use crate::error::{JsError, OpError};

// ── V8 initialization ───────────────────────────────────────────────────

static INIT: Once = Once::new();

pub fn initialize_v8() {
    INIT.call_once(|| {
        let platform = v8::new_default_platform(0, false).make_shared();
        v8::V8::initialize_platform(platform);
        v8::V8::initialize();
    });
}

// ── Heap limit ──────────────────────────────────────────────────────────

struct HeapLimitCallbackData {
    isolate_ptr: *mut v8::Isolate,
    oom_flag: Arc<AtomicBool>,
}

unsafe extern "C" fn near_heap_limit_callback(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    let cb_data = unsafe { &*(data as *const HeapLimitCallbackData) };
    cb_data.oom_flag.store(true, Ordering::SeqCst);
    let isolate = unsafe { &mut *cb_data.isolate_ptr };
    isolate.terminate_execution();
    // Headroom so V8 can unwind instead of aborting the process.
    current_heap_limit * 2
}

fn install_heap_limit_callback(isolate: &mut v8::Isolate, oom_flag: Arc<AtomicBool>) -> *mut HeapLimitCallbackData {
    let data = Box::new(HeapLimitCallbackData {
        isolate_ptr: isolate as *mut v8::Isolate,
        oom_flag,
    });
    let data_ptr = Box::into_raw(data);
    isolate.add_near_heap_limit_callback(near_heap_limit_callback, data_ptr as *mut std::ffi::c_void);
    data_ptr
}

// ── Backend state (isolate slot) ────────────────────────────────────────

struct Resolver {
    request_id: u64,
    resolver: v8::Global<v8::PromiseResolver>,
}

#[derive(Default)]
struct BackendState {
    ops: HashMap<String, NativeFn>,
    op_names: HashMap<String, Rc<str>>,
    resolvers: HashMap<PromiseId, Resolver>,
    next_promise: PromiseId,
    pending_ops: Vec<PendingOp>,
    track_rejections: bool,
    rejections: Vec<(v8::Global<v8::Promise>, v8::Global<v8::Value>)>,
}

type SharedState = Rc<RefCell<BackendState>>;

fn op_callback(scope: &mut v8::HandleScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let name = marshal::to_rust_string(scope, args.data());
    let Some(state) = scope.get_slot::<SharedState>().cloned() else {
        return;
    };
    let (op, op_name) = {
        let st = state.borrow();
        (st.ops.get(&name).cloned(), st.op_names.get(&name).cloned())
    };
    let (Some(op), Some(op_name)) = (op, op_name) else {
        let err = OpError::type_error(format!("native function '{name}' is not registered"));
        let exception = marshal::op_error_to_v8(scope, &err);
        scope.throw_exception(exception);
        return;
    };

    let mut values = Vec::with_capacity(args.length() as usize);
    for i in 0..args.length() {
        values.push(marshal::from_v8(scope, args.get(i)));
    }

    match op(OpArgs::new(op_name, values)) {
        Ok(OpReturn::Value(value)) => {
            let value = marshal::to_v8(scope, value);
            rv.set(value);
        }
        Ok(OpReturn::Async { request_id, future }) => {
            let Some(resolver) = v8::PromiseResolver::new(scope) else {
                return;
            };
            let promise = resolver.get_promise(scope);
            let resolver = v8::Global::new(scope, resolver);
            let mut st = state.borrow_mut();
            st.next_promise = st.next_promise.wrapping_add(1);
            let id = st.next_promise;
            st.resolvers.insert(id, Resolver { request_id, resolver });
            st.pending_ops.push(PendingOp {
                promise: id,
                request_id,
                future,
            });
            rv.set(promise.into());
        }
        Err(err) => {
            let exception = marshal::op_error_to_v8(scope, &err);
            scope.throw_exception(exception);
        }
    }
}

extern "C" fn promise_reject_callback(message: v8::PromiseRejectMessage) {
    let scope = &mut unsafe { v8::CallbackScope::new(&message) };
    let Some(state) = scope.get_slot::<SharedState>().cloned() else {
        return;
    };
    if !state.borrow().track_rejections {
        return;
    }
    let promise = message.get_promise();
    match message.get_event() {
        v8::PromiseRejectEvent::PromiseRejectWithNoHandler => {
            let reason = message.get_value().unwrap_or_else(|| v8::undefined(scope).into());
            let promise = v8::Global::new(scope, promise);
            let reason = v8::Global::new(scope, reason);
            state.borrow_mut().rejections.push((promise, reason));
        }
        v8::PromiseRejectEvent::PromiseHandlerAddedAfterReject => {
            let promise = v8::Global::new(scope, promise);
            state.borrow_mut().rejections.retain(|(p, _)| *p != promise);
        }
        _ => {}
    }
}

// ── Engine ──────────────────────────────────────────────────────────────

pub struct V8Engine {
    // Dropped before `isolate`.
    context: v8::Global<v8::Context>,
    default_export: Option<v8::Global<v8::Value>>,
    state: SharedState,
    oom_flag: Arc<AtomicBool>,
    heap_cb: *mut HeapLimitCallbackData,
    isolate: v8::OwnedIsolate,
}

impl V8Engine {
    pub fn new(heap_memory_max_bytes: usize) -> Self {
        initialize_v8();
        let params = v8::CreateParams::default().heap_limits(0, heap_memory_max_bytes);
        let mut isolate = v8::Isolate::new(params);
        isolate.set_microtasks_policy(v8::MicrotasksPolicy::Explicit);

        let oom_flag = Arc::new(AtomicBool::new(false));
        let heap_cb = install_heap_limit_callback(&mut isolate, oom_flag.clone());

        let state: SharedState = Rc::new(RefCell::new(BackendState::default()));
        isolate.set_slot(state.clone());
        isolate.set_promise_reject_callback(promise_reject_callback);

        let context = {
            let scope = &mut v8::HandleScope::new(&mut isolate);
            let context = v8::Context::new(scope, Default::default());
            let scope = &mut v8::ContextScope::new(scope, context);
            let global = context.global(scope);
            let ops = v8::Object::new(scope);
            if let Some(key) = v8::String::new(scope, "__ops") {
                global.define_own_property(scope, key.into(), ops.into(), v8::PropertyAttribute::DONT_ENUM);
            }
            v8::Global::new(scope, context)
        };

        Self {
            context,
            default_export: None,
            state,
            oom_flag,
            heap_cb,
            isolate,
        }
    }

    /// Run `f` inside a handle scope entered into the context.
    fn with_scope<R>(&mut self, f: impl FnOnce(&mut v8::HandleScope) -> R) -> R {
        let scope = &mut v8::HandleScope::new(&mut self.isolate);
        let context = v8::Local::new(scope, &self.context);
        let scope = &mut v8::ContextScope::new(scope, context);
        f(scope)
    }
}

impl Drop for V8Engine {
    fn drop(&mut self) {
        self.state.borrow_mut().resolvers.clear();
        self.state.borrow_mut().rejections.clear();
        self.default_export = None;
        // The callback data must outlive every GC of the isolate.
        let heap_cb = self.heap_cb;
        self.isolate.remove_near_heap_limit_callback(near_heap_limit_callback, 0);
        unsafe {
            let _ = Box::from_raw(heap_cb);
        }
    }
}

// ── Scope helpers ───────────────────────────────────────────────────────

fn caught(tc: &mut v8::TryCatch<v8::HandleScope>) -> JsError {
    if tc.has_terminated() || tc.is_execution_terminating() {
        return JsError::terminated();
    }
    match tc.exception() {
        Some(exception) => marshal::exception_to_js_error(tc, exception),
        None => JsError::new("Error", "unknown exception"),
    }
}

/// Resolve `a.b.c` from the global object. With `create`, missing
/// intermediate objects are created; the last segment is returned
/// separately so callers can assign to it.
fn resolve_parent<'s>(
    scope: &mut v8::HandleScope<'s>,
    path: &str,
    create: bool,
) -> Result<(v8::Local<'s, v8::Object>, v8::Local<'s, v8::String>), JsError> {
    let context = scope.get_current_context();
    let mut target = context.global(scope);
    let mut segments: Vec<&str> = path.split('.').collect();
    let last = segments.pop().filter(|s| !s.is_empty()).ok_or_else(|| JsError::new("TypeError", "empty path"))?;
    for segment in segments {
        let key = v8::String::new(scope, segment).ok_or_else(|| JsError::new("RangeError", "path too long"))?;
        let next = target.get(scope, key.into()).filter(|v| v.is_object());
        target = match next.and_then(|v| v.to_object(scope)) {
            Some(obj) => obj,
            None if create => {
                let obj = v8::Object::new(scope);
                target.set(scope, key.into(), obj.into());
                obj
            }
            None => return Err(JsError::new("TypeError", format!("{path}: '{segment}' is not an object"))),
        };
    }
    let last = v8::String::new(scope, last).ok_or_else(|| JsError::new("RangeError", "path too long"))?;
    Ok((target, last))
}

impl JsEngine for V8Engine {
    fn eval(&mut self, name: &str, source: &str) -> Result<OpValue, JsError> {
        self.with_scope(|scope| {
            let tc = &mut v8::TryCatch::new(scope);
            let code = v8::String::new(tc, source).ok_or_else(|| JsError::new("RangeError", "script too large"))?;
            let resource = v8::String::new(tc, name).ok_or_else(|| JsError::new("RangeError", "name too long"))?;
            let origin = v8::ScriptOrigin::new(tc, resource.into(), 0, 0, false, 0, None, false, false, false, None);
            let Some(script) = v8::Script::compile(tc, code, Some(&origin)) else {
                return Err(caught(tc));
            };
            match script.run(tc) {
                Some(value) => Ok(marshal::from_v8(tc, value)),
                None => Err(caught(tc)),
            }
        })
    }

    fn compile_module(&mut self, name: &str, source: &str) -> Result<(), JsError> {
        let default = self.with_scope(|scope| module::evaluate_module(scope, name, source))?;
        self.default_export = Some(default);
        Ok(())
    }

    fn export_kind(&mut self, member: &str) -> ExportKind {
        let Some(default) = self.default_export.clone() else {
            return ExportKind::Missing;
        };
        self.with_scope(|scope| {
            let default = v8::Local::new(scope, &default);
            let Some(obj) = default.to_object(scope) else {
                return ExportKind::Missing;
            };
            let Some(key) = v8::String::new(scope, member) else {
                return ExportKind::Missing;
            };
            match obj.get(scope, key.into()) {
                Some(v) if v.is_function() => ExportKind::Function,
                Some(v) if v.is_undefined() => ExportKind::Missing,
                Some(_) => ExportKind::Other,
                None => ExportKind::Missing,
            }
        })
    }

    fn expose_default_export(&mut self, path: &str) -> Result<(), JsError> {
        let default = self
            .default_export
            .clone()
            .ok_or_else(|| JsError::new("TypeError", "no module has been evaluated"))?;
        self.with_scope(|scope| {
            let (parent, key) = resolve_parent(scope, path, true)?;
            let value = v8::Local::new(scope, &default);
            parent.set(scope, key.into(), value);
            Ok(())
        })
    }

    fn register_fn(&mut self, name: &str, f: NativeFn) {
        {
            let mut st = self.state.borrow_mut();
            st.ops.insert(name.to_string(), f);
            st.op_names.insert(name.to_string(), Rc::from(name));
        }
        self.with_scope(|scope| {
            let context = scope.get_current_context();
            let global = context.global(scope);
            let (Some(ops_key), Some(fn_name)) = (v8::String::new(scope, "__ops"), v8::String::new(scope, name)) else {
                return;
            };
            let Some(ops) = global.get(scope, ops_key.into()).and_then(|v| v.to_object(scope)) else {
                return;
            };
            let template = v8::FunctionTemplate::builder(op_callback)
                .data(fn_name.into())
                .build(scope);
            if let Some(function) = template.get_function(scope) {
                function.set_name(fn_name);
                ops.set(scope, fn_name.into(), function.into());
            }
        });
    }

    fn new_object(&mut self, path: &str) -> Result<(), JsError> {
        self.with_scope(|scope| {
            let (parent, key) = resolve_parent(scope, path, true)?;
            let obj = v8::Object::new(scope);
            parent.set(scope, key.into(), obj.into());
            Ok(())
        })
    }

    fn marshal_value(&mut self, path: &str, value: OpValue) -> Result<(), JsError> {
        self.with_scope(|scope| {
            let (parent, key) = resolve_parent(scope, path, true)?;
            let value = marshal::to_v8(scope, value);
            parent.set(scope, key.into(), value);
            Ok(())
        })
    }

    fn call_function(&mut self, path: &str, args: Vec<OpValue>) -> Result<OpValue, JsError> {
        self.with_scope(|scope| {
            let tc = &mut v8::TryCatch::new(scope);
            let (parent, key) = resolve_parent(tc, path, false)?;
            let target = parent
                .get(tc, key.into())
                .and_then(|v| v8::Local::<v8::Function>::try_from(v).ok())
                .ok_or_else(|| JsError::new("TypeError", format!("{path} is not a function")))?;
            let argv: Vec<v8::Local<v8::Value>> = args.into_iter().map(|a| marshal::to_v8(tc, a)).collect();
            match target.call(tc, parent.into(), &argv) {
                Some(value) => Ok(marshal::from_v8(tc, value)),
                None => Err(caught(tc)),
            }
        })
    }

    fn install_unhandled_rejection_hook(&mut self) {
        self.state.borrow_mut().track_rejections = true;
    }

    fn take_unhandled_rejections(&mut self) -> Vec<JsError> {
        let rejections = std::mem::take(&mut self.state.borrow_mut().rejections);
        if rejections.is_empty() {
            return Vec::new();
        }
        self.with_scope(|scope| {
            rejections
                .into_iter()
                .map(|(_, reason)| {
                    let reason = v8::Local::new(scope, &reason);
                    marshal::exception_to_js_error(scope, reason)
                })
                .collect()
        })
    }

    fn pump_microtasks(&mut self) {
        self.with_scope(|scope| scope.perform_microtask_checkpoint());
    }

    fn take_pending_ops(&mut self) -> Vec<PendingOp> {
        std::mem::take(&mut self.state.borrow_mut().pending_ops)
    }

    fn settle_promise(&mut self, id: PromiseId, result: Result<OpValue, OpError>) -> Result<(), JsError> {
        let Some(entry) = self.state.borrow_mut().resolvers.remove(&id) else {
            return Ok(());
        };
        self.with_scope(|scope| {
            let tc = &mut v8::TryCatch::new(scope);
            let resolver = v8::Local::new(tc, &entry.resolver);
            let settled = match result {
                Ok(value) => {
                    let value = marshal::to_v8(tc, value);
                    resolver.resolve(tc, value)
                }
                Err(err) => {
                    let exception = marshal::op_error_to_v8(tc, &err);
                    resolver.reject(tc, exception)
                }
            };
            match settled {
                Some(_) => Ok(()),
                None => Err(caught(tc)),
            }
        })
    }

    fn release_promises(&mut self, request_id: u64) {
        let mut st = self.state.borrow_mut();
        st.resolvers.retain(|_, r| r.request_id != request_id);
        st.pending_ops.retain(|op| op.request_id != request_id);
        st.rejections.clear();
    }

    fn interrupt_handle(&mut self) -> InterruptHandle {
        let handle = self.isolate.thread_safe_handle();
        Arc::new(move || {
            handle.terminate_execution();
        })
    }

    fn cancel_interrupt(&mut self) {
        self.isolate.cancel_terminate_execution();
    }

    fn heap_exhausted(&self) -> bool {
        self.oom_flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::native;

    fn engine() -> V8Engine {
        V8Engine::new(64 * 1024 * 1024)
    }

    #[test]
    fn eval_returns_values() {
        let mut e = engine();
        assert_eq!(e.eval("t.js", "1 + 2").unwrap(), OpValue::Number(3.0));
        assert_eq!(e.eval("t.js", "'a\\0b'").unwrap(), OpValue::String("a\0b".into()));
        let err = e.eval("t.js", "throw new TypeError('nope')").unwrap_err();
        assert_eq!(err.name, "TypeError");
        assert_eq!(err.message, "nope");
    }

    #[test]
    fn registered_functions_round_trip_bytes() {
        let mut e = engine();
        e.register_fn(
            "op_reverse",
            native(|args| {
                let mut bytes = args.bytes(0)?;
                bytes.reverse();
                OpReturn::value(bytes)
            }),
        );
        let out = e
            .eval("t.js", "Array.from(__ops.op_reverse(new Uint8Array([1, 2, 3]))).join(',')")
            .unwrap();
        assert_eq!(out, OpValue::String("3,2,1".into()));
        let err = e.eval("t.js", "__ops.op_reverse('x')").unwrap_err();
        assert_eq!(err.name, "TypeError");
    }

    #[test]
    fn dom_errors_use_global_constructor() {
        let mut e = engine();
        e.eval(
            "dom.js",
            "globalThis.DOMException = class DOMException extends Error { constructor(m, n) { super(m); this.name = n; } }",
        )
        .unwrap();
        e.register_fn("op_fail", native(|_| Err(OpError::dom("DataError", "bad key"))));
        let out = e
            .eval("t.js", "try { __ops.op_fail() } catch (err) { `${err instanceof DOMException}:${err.name}` }")
            .unwrap();
        assert_eq!(out, OpValue::String("true:DataError".into()));
    }

    #[test]
    fn module_default_export() {
        let mut e = engine();
        e.compile_module("worker.js", "export default { fetch() {}, version: 1 }").unwrap();
        assert_eq!(e.export_kind("fetch"), ExportKind::Function);
        assert_eq!(e.export_kind("version"), ExportKind::Other);
        assert_eq!(e.export_kind("missing"), ExportKind::Missing);
        e.expose_default_export("__edge.worker").unwrap();
        assert_eq!(e.eval("t.js", "__edge.worker.version").unwrap(), OpValue::Number(1.0));
    }

    #[test]
    fn module_errors() {
        let mut e = engine();
        let err = e.compile_module("bad.js", "export default {").unwrap_err();
        assert_eq!(err.name, "SyntaxError");
        let err = e.compile_module("imp.js", "import x from './x.js'; export default {}").unwrap_err();
        assert!(err.message.contains("./x.js"));
        let err = e.compile_module("nodef.js", "export const a = 1;").unwrap_err();
        assert!(err.message.contains("default"));
    }

    #[test]
    fn marshal_and_call_paths() {
        let mut e = engine();
        e.new_object("__edge.env").unwrap();
        e.marshal_value("__edge.env.NAME", OpValue::String("edge".into())).unwrap();
        e.eval("t.js", "__edge.greet = (x) => `${x} ${__edge.env.NAME}`").unwrap();
        let out = e.call_function("__edge.greet", vec!["hello".into()]).unwrap();
        assert_eq!(out, OpValue::String("hello edge".into()));
        assert!(e.call_function("__edge.missing", vec![]).is_err());
    }

    #[test]
    fn unhandled_rejections_are_tracked() {
        let mut e = engine();
        e.install_unhandled_rejection_hook();
        e.eval("t.js", "Promise.reject(new Error('lost')); Promise.reject(1).catch(() => {});")
            .unwrap();
        e.pump_microtasks();
        let rejections = e.take_unhandled_rejections();
        assert_eq!(rejections.len(), 1);
        assert_eq!(rejections[0].message, "lost");
    }

    #[test]
    fn async_ops_settle_promises() {
        let mut e = engine();
        e.register_fn("op_later", native(|_| OpReturn::future(7, async { Ok(OpValue::Number(5.0)) })));
        e.eval("t.js", "globalThis.out = 0; __ops.op_later().then(v => { globalThis.out = v })")
            .unwrap();
        let ops = e.take_pending_ops();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].request_id, 7);
        e.settle_promise(ops[0].promise, Ok(OpValue::Number(5.0))).unwrap();
        e.pump_microtasks();
        assert_eq!(e.eval("t.js", "out").unwrap(), OpValue::Number(5.0));
    }
}
