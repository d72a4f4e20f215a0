//! Native ops and the JS shims built on them.
//!
//! Each submodule owns one Web Platform area: it registers its native
//! functions under `__ops` and evaluates a JS wrapper that builds the public
//! globals on top of them. [`install_all`] runs them in dependency order on a
//! fresh context.

pub mod blob;
pub mod clone;
pub mod console;
pub mod core;
pub mod crypto;
pub mod dispatch;
pub mod encoding;
pub mod events;
pub mod fetch;
pub mod http;
pub mod rewriter;
pub mod streams;
pub mod timers;
pub mod url;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use crate::bindings::BindingMethod;
use crate::config::EngineConfig;
use crate::crypto::AlgorithmRegistry;
use crate::engine::{JsEngine, OpArgs};
use crate::error::{JsError, OpError};
use crate::event_loop::TimerQueue;
use crate::request_state::{RequestState, RequestTable};

/// Native state shared by every op of one context.
pub struct HostState {
    pub requests: RequestTable,
    pub timers: TimerQueue,
    pub crypto: Arc<AlgorithmRegistry>,
    pub config: Arc<EngineConfig>,
    pub http: reqwest::Client,
    /// Origin of `performance.now()`.
    pub started: Instant,
    /// Streaming `TextDecoder` states by handle.
    pub decoders: HashMap<u32, encoding_rs::Decoder>,
    pub next_decoder: u32,
    /// Methods of object-valued custom bindings for the current request,
    /// keyed by `(binding, method)`.
    pub bindings: HashMap<(String, String), BindingMethod>,
}

impl HostState {
    pub fn new(config: Arc<EngineConfig>, crypto: Arc<AlgorithmRegistry>, http: reqwest::Client) -> Self {
        Self {
            requests: RequestTable::default(),
            timers: TimerQueue::default(),
            crypto,
            config,
            http,
            started: Instant::now(),
            decoders: HashMap::new(),
            next_decoder: 0,
            bindings: HashMap::new(),
        }
    }
}

pub type SharedHost = Rc<RefCell<HostState>>;

/// Run `f` against the state of the request named by argument `index`.
pub(crate) fn with_request<R>(
    host: &SharedHost,
    args: &OpArgs,
    index: usize,
    f: impl FnOnce(&mut RequestState) -> Result<R, OpError>,
) -> Result<R, OpError> {
    let request_id = args.u64(index)?;
    let mut host = host.borrow_mut();
    let state = host.requests.get_mut(request_id)?;
    f(state)
}

/// Install every shim on a fresh context.
pub fn install_all<E: JsEngine>(engine: &mut E, host: &SharedHost) -> Result<(), JsError> {
    core::install(engine, host)?;
    events::install(engine, host)?;
    console::install(engine, host)?;
    timers::install(engine, host)?;
    encoding::install(engine, host)?;
    url::install(engine, host)?;
    streams::install(engine, host)?;
    blob::install(engine, host)?;
    http::install(engine, host)?;
    fetch::install(engine, host)?;
    clone::install(engine, host)?;
    crypto::install(engine, host)?;
    rewriter::install(engine, host)?;
    dispatch::install(engine, host)?;
    Ok(())
}
