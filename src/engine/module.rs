//! Worker module evaluation and default-export resolution.
//!
//! Worker source arrives as a single bundled ES module, so import
//! resolution always fails with a descriptive error.

use sha2::{Digest, Sha256};

use super::marshal;
use crate::error::JsError;

/// Hex SHA-256 of the worker source, returned by `compile_and_cache`.
pub fn source_digest(source: &str) -> String {
    let digest = Sha256::digest(source.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn resolve_unbundled<'a>(
    context: v8::Local<'a, v8::Context>,
    specifier: v8::Local<'a, v8::String>,
    _import_attributes: v8::Local<'a, v8::FixedArray>,
    _referrer: v8::Local<'a, v8::Module>,
) -> Option<v8::Local<'a, v8::Module>> {
    let scope = &mut unsafe { v8::CallbackScope::new(context) };
    let message = format!(
        "Cannot resolve module \"{}\": worker source must be a single bundled module",
        specifier.to_rust_string_lossy(scope)
    );
    let message = v8::String::new(scope, &message)?;
    let exception = v8::Exception::type_error(scope, message);
    scope.throw_exception(exception);
    None
}

fn caught(tc: &mut v8::TryCatch<v8::HandleScope>, fallback: &str) -> JsError {
    if tc.has_terminated() {
        return JsError::terminated();
    }
    match tc.exception() {
        Some(exception) => marshal::exception_to_js_error(tc, exception),
        None => JsError::new("Error", fallback),
    }
}

/// Compile, link and evaluate the worker module, returning its default
/// export. Top-level await must settle within the initial microtask drain.
pub(crate) fn evaluate_module(
    scope: &mut v8::HandleScope,
    name: &str,
    source: &str,
) -> Result<v8::Global<v8::Value>, JsError> {
    let tc = &mut v8::TryCatch::new(scope);

    let code = v8::String::new(tc, source).ok_or_else(|| JsError::new("RangeError", "module source is too large"))?;
    let resource = v8::String::new(tc, name).ok_or_else(|| JsError::new("RangeError", "module name is too large"))?;
    let origin = v8::ScriptOrigin::new(tc, resource.into(), 0, 0, false, 0, None, false, false, true, None);
    let mut compiler_source = v8::script_compiler::Source::new(code, Some(&origin));

    let Some(module) = v8::script_compiler::compile_module(tc, &mut compiler_source) else {
        return Err(caught(tc, "failed to compile module"));
    };
    if module.instantiate_module(tc, resolve_unbundled) != Some(true) {
        return Err(caught(tc, "failed to link module"));
    }
    let Some(completion) = module.evaluate(tc) else {
        return Err(caught(tc, "failed to evaluate module"));
    };
    tc.perform_microtask_checkpoint();

    if module.get_status() == v8::ModuleStatus::Errored {
        let exception = module.get_exception();
        return Err(marshal::exception_to_js_error(tc, exception));
    }
    if let Ok(promise) = v8::Local::<v8::Promise>::try_from(completion) {
        match promise.state() {
            v8::PromiseState::Rejected => {
                let reason = promise.result(tc);
                return Err(marshal::exception_to_js_error(tc, reason));
            }
            v8::PromiseState::Pending => {
                return Err(JsError::new(
                    "Error",
                    "top-level await did not settle during module evaluation",
                ));
            }
            v8::PromiseState::Fulfilled => {}
        }
    }

    let namespace = module.get_module_namespace();
    let namespace = namespace
        .to_object(tc)
        .ok_or_else(|| JsError::new("Error", "module namespace is not an object"))?;
    let key = v8::String::new(tc, "default").ok_or_else(|| JsError::new("Error", "allocation failed"))?;
    let default = namespace.get(tc, key.into()).filter(|v| v.is_object());
    match default {
        Some(default) => Ok(v8::Global::new(tc, default)),
        None => Err(JsError::new("SyntaxError", "worker module must export a default object")),
    }
}
