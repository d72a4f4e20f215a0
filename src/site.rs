//! Site façade: compiled contexts cached per site and the host-facing
//! execute calls.
//!
//! Every compiled site owns one OS thread holding its V8 isolate. Jobs reach
//! that thread over a channel, so executions for one site run strictly one
//! after another while different sites run in parallel. Outbound I/O runs on
//! a tokio runtime owned by the [`Engine`].

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

use crate::bindings::{self, BindingContext, CustomBinding};
use crate::config::EngineConfig;
use crate::crypto::AlgorithmRegistry;
use crate::engine::module::source_digest;
use crate::engine::v8_backend::V8Engine;
use crate::engine::{ExportKind, JsEngine, OpValue};
use crate::error::{EngineError, ErrorKind, JsError, WorkerError};
use crate::event_loop::{CancelToken, EventLoop, LoopExit};
use crate::ops::dispatch::WORKER_PATH;
use crate::ops::{self, HostState};
use crate::request_state::{Completion, LogBuffer, RequestState};
use crate::result::{HttpRequest, HttpResponse, WorkerResult};

const CONTEXT_STACK_SIZE: usize = 8 * 1024 * 1024;

// ── Env ──────────────────────────────────────────────────────────────────

/// Per-execution environment handed to the worker as `env`.
#[derive(Clone, Default)]
pub struct Env {
    /// Plain values copied onto `env`.
    pub vars: Map<String, JsonValue>,
    /// Entries resolved at request setup; they shadow `vars` of the same name.
    pub custom_bindings: BTreeMap<String, CustomBinding>,
    /// Overrides `EngineConfig::request_timeout_ms` for this call.
    pub timeout: Option<Duration>,
    pub cancel: Option<CancelToken>,
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Env")
            .field("vars", &self.vars)
            .field("custom_bindings", &self.custom_bindings.keys().collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .field("cancel", &self.cancel)
            .finish()
    }
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    pub fn with_binding(mut self, name: impl Into<String>, binding: CustomBinding) -> Self {
        self.custom_bindings.insert(name.into(), binding);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

// ── Stats ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Compiled contexts currently resident.
    pub contexts: usize,
    pub requests: u64,
    pub evictions: u64,
    pub compiled: u64,
}

#[derive(Default)]
struct Counters {
    requests: AtomicU64,
    evictions: AtomicU64,
    compiled: AtomicU64,
}

// ── Site cache ───────────────────────────────────────────────────────────

enum Call {
    Fetch(HttpRequest),
    Function { name: String, args: Vec<JsonValue> },
}

impl Call {
    fn member(&self) -> &str {
        match self {
            Call::Fetch(_) => "fetch",
            Call::Function { name, .. } => name,
        }
    }
}

struct Job {
    env: Env,
    call: Call,
    reply: mpsc::Sender<WorkerResult>,
}

struct SiteHandle {
    deploy_key: String,
    digest: String,
    /// Distinguishes a recompiled site from the context it replaced.
    context_id: u64,
    last_used: u64,
    jobs: mpsc::Sender<Job>,
}

/// Resident sites with LRU bookkeeping. Dropping a handle closes its job
/// channel; the context thread finishes its current job and exits.
#[derive(Default)]
struct Sites {
    map: HashMap<String, SiteHandle>,
    clock: u64,
}

impl Sites {
    fn touch(&mut self, site: &str) -> Option<&SiteHandle> {
        self.clock += 1;
        let clock = self.clock;
        let handle = self.map.get_mut(site)?;
        handle.last_used = clock;
        Some(handle)
    }

    fn insert(&mut self, site: String, mut handle: SiteHandle) {
        self.clock += 1;
        handle.last_used = self.clock;
        self.map.insert(site, handle);
    }

    /// Remove `site` only if it still holds the context `context_id`.
    fn remove_context(&mut self, site: &str, context_id: u64) -> bool {
        match self.map.get(site) {
            Some(handle) if handle.context_id == context_id => self.map.remove(site).is_some(),
            _ => false,
        }
    }

    /// Least recently used site other than `keep`.
    fn lru_victim(&self, keep: &str) -> Option<String> {
        self.map
            .iter()
            .filter(|(site, _)| site.as_str() != keep)
            .min_by_key(|(_, handle)| handle.last_used)
            .map(|(site, _)| site.clone())
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

// ── Engine ───────────────────────────────────────────────────────────────

/// Embeddable worker engine. Cheap to share behind an `Arc`; every method
/// takes `&self`.
pub struct Engine {
    config: Arc<EngineConfig>,
    crypto: Arc<AlgorithmRegistry>,
    http: reqwest::Client,
    runtime: Option<tokio::runtime::Runtime>,
    sites: Mutex<Sites>,
    /// One lock per site with a compile in flight.
    compiling: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    counters: Counters,
    next_request: Arc<AtomicU64>,
    next_context: AtomicU64,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        crate::engine::v8_backend::initialize_v8();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .thread_name("edgeworker-io")
            .enable_all()
            .build()
            .map_err(EngineError::Runtime)?;
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_millis(config.fetch.connect_timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()?;
        tracing::info!(
            max_contexts = config.max_contexts,
            request_timeout_ms = config.request_timeout_ms,
            heap_memory_max_mb = config.heap_memory_max_mb,
            "engine started"
        );
        Ok(Self {
            config: Arc::new(config),
            crypto: Arc::new(AlgorithmRegistry::with_defaults()),
            http,
            runtime: Some(runtime),
            sites: Mutex::new(Sites::default()),
            compiling: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            next_request: Arc::new(AtomicU64::new(1)),
            next_context: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn sites(&self) -> MutexGuard<'_, Sites> {
        self.sites.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Compile `source` for `site` and keep its context warm. Returns the
    /// hex SHA-256 of the source.
    ///
    /// Repeating the call with the same deploy key returns the cached
    /// context; a new deploy key tears the old context down first.
    ///
    /// Concurrent calls for one site compile once; later callers wait and
    /// see the cached context.
    pub fn compile_and_cache(&self, site: &str, deploy_key: &str, source: &str) -> Result<String, EngineError> {
        let slot = self
            .compiling
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(site.to_string())
            .or_default()
            .clone();
        let _compiling = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let result = self.compile_locked(site, deploy_key, source);
        let mut compiling = self.compiling.lock().unwrap_or_else(PoisonError::into_inner);
        // The map and this call hold the only references.
        if Arc::strong_count(&slot) <= 2 {
            compiling.remove(site);
        }
        result
    }

    fn compile_locked(&self, site: &str, deploy_key: &str, source: &str) -> Result<String, EngineError> {
        {
            let mut sites = self.sites();
            if let Some(handle) = sites.touch(site) {
                if handle.deploy_key == deploy_key {
                    return Ok(handle.digest.clone());
                }
                let previous = handle.deploy_key.clone();
                sites.map.remove(site);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::info!(site, deploy_key, previous, "deploy key changed; evicted old context");
            }
        }

        let started = Instant::now();
        let context_id = self.next_context.fetch_add(1, Ordering::Relaxed);
        let handle = self.spawn_context(site, deploy_key, source, context_id)?;
        let digest = handle.digest.clone();
        self.counters.compiled.fetch_add(1, Ordering::Relaxed);

        let mut sites = self.sites();
        sites.insert(site.to_string(), handle);
        while sites.len() > self.config.max_contexts.max(1) {
            let Some(victim) = sites.lru_victim(site) else { break };
            sites.map.remove(&victim);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(site = victim, "evicted least recently used context");
        }
        tracing::info!(
            site,
            deploy_key,
            digest,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "compiled site"
        );
        Ok(digest)
    }

    /// Run the default export's `fetch(request, env, ctx)`.
    pub fn execute_fetch(&self, site: &str, deploy_key: &str, env: Env, request: HttpRequest) -> WorkerResult {
        self.execute(site, deploy_key, env, Call::Fetch(request))
    }

    /// Run `default[name](env, ...args)` and return its resolved value as
    /// JSON text in `WorkerResult::data`.
    pub fn execute_function(
        &self,
        site: &str,
        deploy_key: &str,
        env: Env,
        name: &str,
        args: Vec<JsonValue>,
    ) -> WorkerResult {
        let call = Call::Function {
            name: name.to_string(),
            args,
        };
        self.execute(site, deploy_key, env, call)
    }

    /// Drop the cached context for `site`. Returns whether one existed.
    pub fn evict(&self, site: &str) -> bool {
        let removed = self.sites().map.remove(site).is_some();
        if removed {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(site, "evicted context");
        }
        removed
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            contexts: self.sites().len(),
            requests: self.counters.requests.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            compiled: self.counters.compiled.load(Ordering::Relaxed),
        }
    }

    fn execute(&self, site: &str, deploy_key: &str, env: Env, call: Call) -> WorkerResult {
        let started = Instant::now();
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        let (context_id, jobs) = {
            let mut sites = self.sites();
            match sites.touch(site) {
                Some(handle) if handle.deploy_key == deploy_key => (handle.context_id, handle.jobs.clone()),
                Some(handle) => {
                    let message = format!(
                        "site '{site}' is compiled for deploy key '{}', not '{deploy_key}'",
                        handle.deploy_key
                    );
                    return WorkerResult::failed(WorkerError::host(message), started.elapsed());
                }
                None => {
                    let message = format!("site '{site}' has not been compiled");
                    return WorkerResult::failed(WorkerError::host(message), started.elapsed());
                }
            }
        };

        let (reply, result) = mpsc::channel();
        let result = jobs
            .send(Job { env, call, reply })
            .ok()
            .and_then(|_| result.recv().ok());
        match result {
            Some(result) => {
                if result.error.as_ref().is_some_and(|e| e.kind == ErrorKind::MemoryLimit) {
                    self.forget(site, context_id);
                }
                result
            }
            None => {
                self.forget(site, context_id);
                let err = EngineError::ContextGone(site.to_string());
                WorkerResult::failed(WorkerError::host(err.to_string()), started.elapsed())
            }
        }
    }

    fn forget(&self, site: &str, context_id: u64) {
        if self.sites().remove_context(site, context_id) {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(site, "context discarded");
        }
    }

    fn spawn_context(
        &self,
        site: &str,
        deploy_key: &str,
        source: &str,
        context_id: u64,
    ) -> Result<SiteHandle, EngineError> {
        let Some(runtime) = self.runtime.as_ref() else {
            return Err(EngineError::ContextGone(site.to_string()));
        };
        let context = Context {
            site: site.to_string(),
            deploy_key: deploy_key.to_string(),
            config: self.config.clone(),
            crypto: self.crypto.clone(),
            http: self.http.clone(),
            runtime: runtime.handle().clone(),
            next_request: self.next_request.clone(),
        };
        let (jobs, inbox) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let source = source.to_string();
        std::thread::Builder::new()
            .name(format!("edgeworker-ctx-{context_id}"))
            .stack_size(CONTEXT_STACK_SIZE)
            .spawn(move || context.serve(&source, ready_tx, inbox))
            .map_err(EngineError::Spawn)?;
        let digest = ready_rx
            .recv()
            .map_err(|_| EngineError::ContextGone(site.to_string()))??;
        Ok(SiteHandle {
            deploy_key: deploy_key.to_string(),
            digest,
            context_id,
            last_used: 0,
            jobs,
        })
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.sites().map.clear();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

// ── Context thread ───────────────────────────────────────────────────────

struct Context {
    site: String,
    deploy_key: String,
    config: Arc<EngineConfig>,
    crypto: Arc<AlgorithmRegistry>,
    http: reqwest::Client,
    runtime: tokio::runtime::Handle,
    next_request: Arc<AtomicU64>,
}

impl Context {
    fn serve(self, source: &str, ready: mpsc::Sender<Result<String, EngineError>>, inbox: mpsc::Receiver<Job>) {
        let mut event_loop = match self.boot(source) {
            Ok(event_loop) => {
                let _ = ready.send(Ok(source_digest(source)));
                event_loop
            }
            Err(err) => {
                tracing::debug!(site = self.site, %err, "context failed to start");
                let _ = ready.send(Err(err));
                return;
            }
        };
        drop(ready);

        while let Ok(job) = inbox.recv() {
            let result = self.handle(&mut event_loop, job.env, job.call);
            let exhausted = result.error.as_ref().is_some_and(|e| e.kind == ErrorKind::MemoryLimit);
            let _ = job.reply.send(result);
            if exhausted {
                tracing::warn!(site = self.site, "heap limit reached; discarding context");
                break;
            }
        }
        tracing::debug!(site = self.site, deploy_key = self.deploy_key, "context thread exiting");
    }

    fn boot(&self, source: &str) -> Result<EventLoop<V8Engine>, EngineError> {
        let mut engine = V8Engine::new(self.config.heap_memory_max_bytes());
        let host = Rc::new(RefCell::new(HostState::new(
            self.config.clone(),
            self.crypto.clone(),
            self.http.clone(),
        )));
        ops::install_all(&mut engine, &host).map_err(EngineError::Setup)?;
        engine.install_unhandled_rejection_hook();
        engine
            .compile_module(&format!("{}.js", self.site), source)
            .map_err(EngineError::Compile)?;
        engine.expose_default_export(WORKER_PATH).map_err(EngineError::Setup)?;
        Ok(EventLoop::new(engine, host, self.runtime.clone()))
    }

    fn handle(&self, event_loop: &mut EventLoop<V8Engine>, env: Env, call: Call) -> WorkerResult {
        let started = Instant::now();
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);

        let member = call.member();
        if event_loop.engine.export_kind(member) != ExportKind::Function {
            let err = WorkerError::new(
                ErrorKind::MissingExport,
                format!("default export has no function named '{member}'"),
            );
            return WorkerResult::failed(err, started.elapsed());
        }

        let binding_ctx = BindingContext {
            site: self.site.clone(),
            deploy_key: self.deploy_key.clone(),
            request_id,
        };
        let resolved = match bindings::resolve(&env.vars, &env.custom_bindings, &binding_ctx) {
            Ok(resolved) => resolved,
            Err(err) => return WorkerResult::failed(err, started.elapsed()),
        };

        let timeout = env.timeout.unwrap_or_else(|| self.config.request_timeout());
        event_loop.engine.take_unhandled_rejections();
        {
            let mut host = event_loop.host.borrow_mut();
            host.bindings = resolved.methods;
            host.requests.begin(RequestState::new(
                request_id,
                started + timeout,
                self.config.max_log_entries,
            ));
        }

        let id = OpValue::Number(request_id as f64);
        let begin = vec![
            id.clone(),
            OpValue::Json(JsonValue::Object(resolved.values)),
            OpValue::Json(JsonValue::Object(resolved.objects)),
        ];
        let dispatch = match call {
            Call::Fetch(request) => (
                "__edge.dispatchFetch",
                vec![
                    id.clone(),
                    request.method.into(),
                    request.url.into(),
                    OpValue::Json(serde_json::to_value(&request.headers).unwrap_or_default()),
                    request.body.map_or(OpValue::Null, OpValue::Bytes),
                ],
            ),
            Call::Function { name, args } => (
                "__edge.dispatchFunction",
                vec![id.clone(), name.into(), OpValue::Json(JsonValue::Array(args))],
            ),
        };
        let entered = event_loop
            .enter(request_id, "__edge.beginRequest", begin)
            .and_then(|_| event_loop.enter(request_id, dispatch.0, dispatch.1));
        let setup_error = match entered {
            Ok(_) => None,
            // Interrupted at the deadline; the loop reports the timeout.
            Err(err) if err.is_terminated() => None,
            Err(err) => Some(err),
        };

        let cancel = env.cancel.unwrap_or_default();
        let exit = match setup_error {
            Some(_) => LoopExit::Completed,
            None => event_loop.run(request_id, &cancel),
        };

        let mut rejections = Vec::new();
        if exit != LoopExit::OutOfMemory {
            rejections = event_loop.engine.take_unhandled_rejections();
            let _ = event_loop.engine.call_function("__edge.endRequest", vec![id]);
            event_loop.teardown(request_id);
        }
        let state = {
            let mut host = event_loop.host.borrow_mut();
            host.bindings.clear();
            host.decoders.clear();
            host.requests.end(request_id)
        };
        let Some(mut state) = state else {
            return WorkerResult::failed(WorkerError::host("request state vanished"), started.elapsed());
        };

        let mut completion = std::mem::replace(&mut state.completion, Completion::Pending);
        if let Some(err) = setup_error {
            completion = Completion::Failed(err);
        }
        let outcome = settle(exit, completion, state.uncaught.take(), rejections);
        let logs = std::mem::replace(&mut state.logs, LogBuffer::new(0)).into_entries();
        let elapsed = started.elapsed();

        let mut result = WorkerResult {
            logs,
            elapsed,
            ..Default::default()
        };
        match outcome {
            Ok(Output::Response(response)) => result.response = Some(response),
            Ok(Output::Data(data)) => result.data = Some(data),
            Err(err) => {
                result.pass_through = state.pass_through;
                result.error = Some(err);
            }
        }
        tracing::debug!(
            site = self.site,
            deploy_key = self.deploy_key,
            request_id,
            elapsed_ms = elapsed.as_millis() as u64,
            ?exit,
            error = ?result.error.as_ref().map(|e| e.kind),
            "request finished"
        );
        result
    }
}

enum Output {
    Response(HttpResponse),
    Data(String),
}

/// Fold how the loop exited and what JS reported into the envelope outcome.
///
/// Loop exits win over anything JS reported; then the handler's own
/// rejection, an uncaught macrotask error and finally an unhandled rejection.
fn settle(
    exit: LoopExit,
    completion: Completion,
    uncaught: Option<JsError>,
    rejections: Vec<JsError>,
) -> Result<Output, WorkerError> {
    match exit {
        LoopExit::OutOfMemory => {
            return Err(WorkerError::new(
                ErrorKind::MemoryLimit,
                "worker exceeded its memory limit",
            ))
        }
        LoopExit::TimedOut => {
            return Err(WorkerError::new(
                ErrorKind::TimeoutError,
                "worker exceeded its time limit",
            ))
        }
        LoopExit::Cancelled => {
            return Err(WorkerError::new(
                ErrorKind::AbortError,
                "execution was cancelled by the host",
            ))
        }
        LoopExit::Completed => {}
    }
    if let Completion::Failed(err) = completion {
        return Err(WorkerError::from_js(err));
    }
    if let Some(err) = uncaught {
        return Err(WorkerError::from_js(err));
    }
    if let Some(err) = rejections.into_iter().next() {
        return Err(WorkerError {
            kind: ErrorKind::UnhandledRejection,
            message: format!("Uncaught (in promise) {err}"),
            stack: err.stack,
        });
    }
    match completion {
        Completion::Response(response) => Ok(Output::Response(response)),
        Completion::Data(data) => Ok(Output::Data(data)),
        Completion::Pending | Completion::Failed(_) => Err(WorkerError::host("worker finished without a result")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(context_id: u64) -> SiteHandle {
        let (jobs, _) = mpsc::channel();
        SiteHandle {
            deploy_key: "v1".into(),
            digest: String::new(),
            context_id,
            last_used: 0,
            jobs,
        }
    }

    #[test]
    fn lru_victim_is_least_recently_touched() {
        let mut sites = Sites::default();
        sites.insert("a".into(), handle(1));
        sites.insert("b".into(), handle(2));
        sites.insert("c".into(), handle(3));
        sites.touch("a");
        assert_eq!(sites.lru_victim("c").as_deref(), Some("b"));
        sites.touch("b");
        assert_eq!(sites.lru_victim("c").as_deref(), Some("a"));
        assert_eq!(sites.lru_victim("a").as_deref(), Some("c"));
    }

    #[test]
    fn stale_context_is_not_removed() {
        let mut sites = Sites::default();
        sites.insert("a".into(), handle(1));
        sites.insert("a".into(), handle(2));
        assert!(!sites.remove_context("a", 1));
        assert_eq!(sites.len(), 1);
        assert!(sites.remove_context("a", 2));
        assert_eq!(sites.len(), 0);
    }

    fn response() -> Completion {
        Completion::Response(HttpResponse {
            status: 200,
            status_text: "OK".into(),
            headers: Vec::new(),
            body: b"ok".to_vec(),
        })
    }

    #[test]
    fn loop_exit_takes_precedence() {
        let err = settle(LoopExit::TimedOut, response(), None, Vec::new()).err().unwrap();
        assert_eq!(err.kind, ErrorKind::TimeoutError);
        let err = settle(LoopExit::Cancelled, Completion::Pending, None, Vec::new())
            .err()
            .unwrap();
        assert_eq!(err.kind, ErrorKind::AbortError);
        let err = settle(LoopExit::OutOfMemory, response(), None, Vec::new()).err().unwrap();
        assert_eq!(err.kind, ErrorKind::MemoryLimit);
    }

    #[test]
    fn handler_errors_precede_unhandled_rejections() {
        let failed = Completion::Failed(JsError::new("TypeError", "bad"));
        let rejection = vec![JsError::new("Error", "late")];
        let err = settle(LoopExit::Completed, failed, None, rejection.clone()).err().unwrap();
        assert_eq!(err.kind, ErrorKind::TypeError);
        assert_eq!(err.message, "bad");

        let err = settle(LoopExit::Completed, response(), None, rejection).err().unwrap();
        assert_eq!(err.kind, ErrorKind::UnhandledRejection);
        assert_eq!(err.message, "Uncaught (in promise) Error: late");
    }

    #[test]
    fn uncaught_timer_errors_fail_the_request() {
        let uncaught = Some(JsError::new("RangeError", "tick"));
        let err = settle(LoopExit::Completed, response(), uncaught, Vec::new()).err().unwrap();
        assert_eq!(err.kind, ErrorKind::Exception);
        assert_eq!(err.message, "RangeError: tick");
    }

    #[test]
    fn settled_values_pass_through() {
        let out = settle(LoopExit::Completed, Completion::Data("42".into()), None, Vec::new());
        assert!(matches!(out, Ok(Output::Data(d)) if d == "42"));
        assert!(matches!(
            settle(LoopExit::Completed, response(), None, Vec::new()),
            Ok(Output::Response(r)) if r.status == 200
        ));
        let err = settle(LoopExit::Completed, Completion::Pending, None, Vec::new())
            .err()
            .unwrap();
        assert_eq!(err.kind, ErrorKind::HostError);
    }

    #[test]
    fn env_debug_lists_binding_names() {
        let env = Env::new()
            .with_var("A", "1")
            .with_binding("KV", crate::bindings::binding(|_| Ok(crate::bindings::BindingValue::json(1))));
        let text = format!("{env:?}");
        assert!(text.contains("KV"));
        assert!(text.contains("\"A\""));
    }
}
