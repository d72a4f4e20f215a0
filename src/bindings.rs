//! Custom bindings: host values and callables exposed on the worker's `env`.
//!
//! A [`CustomBinding`] runs on the context thread while the request is being
//! set up. It either yields a JSON value, which becomes `env[name]`, or an
//! object of native methods that JS calls synchronously as
//! `env[name].method(...args)`. Arguments and return values cross as JSON.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::{Map, Value as JsonValue};

use crate::error::WorkerError;

/// A native method callable from JS. Errors are thrown into JS as
/// `Error("custom binding <name>: ...")`.
pub type BindingMethod = Arc<dyn Fn(&[JsonValue]) -> anyhow::Result<JsonValue> + Send + Sync>;

/// Produces the value of one `env` entry for a request.
pub type CustomBinding = Arc<dyn Fn(&BindingContext) -> anyhow::Result<BindingValue> + Send + Sync>;

/// What a binding is being resolved for.
#[derive(Debug, Clone)]
pub struct BindingContext {
    pub site: String,
    pub deploy_key: String,
    pub request_id: u64,
}

pub enum BindingValue {
    Json(JsonValue),
    Object(Vec<(String, BindingMethod)>),
}

impl BindingValue {
    pub fn json(value: impl Into<JsonValue>) -> Self {
        BindingValue::Json(value.into())
    }

    /// An empty object binding; add methods with [`BindingValue::method`].
    pub fn object() -> Self {
        BindingValue::Object(Vec::new())
    }

    pub fn method<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[JsonValue]) -> anyhow::Result<JsonValue> + Send + Sync + 'static,
    {
        let mut methods = match self {
            BindingValue::Object(methods) => methods,
            BindingValue::Json(_) => Vec::new(),
        };
        methods.push((name.into(), Arc::new(f)));
        BindingValue::Object(methods)
    }
}

/// Wrap a closure as a [`CustomBinding`].
pub fn binding<F>(f: F) -> CustomBinding
where
    F: Fn(&BindingContext) -> anyhow::Result<BindingValue> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Bindings resolved for one request.
#[derive(Default)]
pub struct ResolvedBindings {
    /// JSON entries of `env`, plain variables included.
    pub values: Map<String, JsonValue>,
    /// Method names of each object binding.
    pub objects: Map<String, JsonValue>,
    pub methods: HashMap<(String, String), BindingMethod>,
}

/// Run every binding for `ctx`, layered over the plain `vars`. The first
/// failing binding aborts setup with a `HostError`.
pub fn resolve(
    vars: &Map<String, JsonValue>,
    bindings: &BTreeMap<String, CustomBinding>,
    ctx: &BindingContext,
) -> Result<ResolvedBindings, WorkerError> {
    let mut resolved = ResolvedBindings {
        values: vars.clone(),
        ..Default::default()
    };
    for (name, binding) in bindings {
        let value = binding(ctx).map_err(|e| WorkerError::host(format!("custom binding {name}: {e:#}")))?;
        match value {
            BindingValue::Json(value) => {
                resolved.values.insert(name.clone(), value);
            }
            BindingValue::Object(methods) => {
                let names: Vec<JsonValue> = methods.iter().map(|(m, _)| JsonValue::String(m.clone())).collect();
                for (method, f) in methods {
                    resolved.methods.insert((name.clone(), method), f);
                }
                resolved.values.remove(name);
                resolved.objects.insert(name.clone(), JsonValue::Array(names));
            }
        }
    }
    tracing::trace!(
        request_id = ctx.request_id,
        values = resolved.values.len(),
        objects = resolved.objects.len(),
        "resolved bindings"
    );
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn ctx() -> BindingContext {
        BindingContext {
            site: "site".into(),
            deploy_key: "v1".into(),
            request_id: 7,
        }
    }

    #[test]
    fn json_bindings_override_vars() {
        let mut vars = Map::new();
        vars.insert("A".into(), json!("var"));
        vars.insert("B".into(), json!(1));
        let mut bindings = BTreeMap::new();
        bindings.insert("A".to_string(), binding(|c| Ok(BindingValue::json(c.request_id))));
        let resolved = resolve(&vars, &bindings, &ctx()).unwrap();
        assert_eq!(resolved.values["A"], json!(7));
        assert_eq!(resolved.values["B"], json!(1));
        assert!(resolved.objects.is_empty());
    }

    #[test]
    fn object_bindings_register_methods() {
        let mut bindings = BTreeMap::new();
        bindings.insert(
            "KV".to_string(),
            binding(|_| {
                Ok(BindingValue::object()
                    .method("get", |args| Ok(json!(format!("value:{}", args[0].as_str().unwrap_or_default()))))
                    .method("put", |_| Ok(JsonValue::Null)))
            }),
        );
        let resolved = resolve(&Map::new(), &bindings, &ctx()).unwrap();
        assert_eq!(resolved.objects["KV"], json!(["get", "put"]));
        let get = &resolved.methods[&("KV".to_string(), "get".to_string())];
        assert_eq!(get(&[json!("k")]).unwrap(), json!("value:k"));
    }

    #[test]
    fn failures_name_the_binding() {
        let mut bindings = BTreeMap::new();
        bindings.insert(
            "DB".to_string(),
            binding(|_| Err(anyhow::anyhow!("connection refused")).map_err(|e| e.context("opening pool"))),
        );
        let err = resolve(&Map::new(), &bindings, &ctx()).err().unwrap();
        assert_eq!(err.kind, ErrorKind::HostError);
        assert_eq!(err.message, "custom binding DB: opening pool: connection refused");
    }
}
