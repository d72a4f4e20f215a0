//! Per-request scratch state.
//!
//! A [`RequestState`] is created when a request enters a context and dropped
//! when it leaves. Everything JS refers to by id (crypto keys, fetch bodies,
//! cancel handles, rewriters) lives here, so a stale id from a finished
//! request can never resolve to anything.

use std::collections::HashMap;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::crypto::key::KeyTable;
use crate::error::{ErrorKind, JsError, OpError};
use crate::ops::fetch::FetchBody;
use crate::result::{HttpResponse, LogEntry, LogLevel};
use crate::rewriter::Rewriter;

// ── Resources ────────────────────────────────────────────────────────────

/// A request-scoped native object JS holds by integer id.
pub enum Resource {
    /// Host-level cancellation for one outbound fetch.
    Cancel(CancellationToken),
    FetchBody(FetchBody),
    Rewriter(Box<Rewriter>),
}

// ── Logs ─────────────────────────────────────────────────────────────────

pub struct LogBuffer {
    entries: Vec<LogEntry>,
    max_entries: usize,
    dropped: usize,
}

impl LogBuffer {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_entries,
            dropped: 0,
        }
    }

    pub fn push(&mut self, request_id: u64, level: LogLevel, message: String) {
        match level {
            LogLevel::Error => tracing::warn!(target: "edgeworker::console", request_id, level = level.as_str(), "{message}"),
            _ => tracing::debug!(target: "edgeworker::console", request_id, level = level.as_str(), "{message}"),
        }
        if self.entries.len() >= self.max_entries {
            self.dropped += 1;
            return;
        }
        self.entries.push(LogEntry::now(level, message));
    }

    /// Captured entries, with a trailing warning if any were dropped.
    pub fn into_entries(mut self) -> Vec<LogEntry> {
        if self.dropped > 0 {
            self.entries.push(LogEntry::now(
                LogLevel::Warn,
                format!("log limit reached: {} entries dropped", self.dropped),
            ));
        }
        self.entries
    }
}

// ── Completion ───────────────────────────────────────────────────────────

/// How the request's top-level promise settled.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Pending,
    Response(HttpResponse),
    Data(String),
    Failed(JsError),
}

impl Completion {
    pub fn is_settled(&self) -> bool {
        !matches!(self, Completion::Pending)
    }
}

// ── RequestState ─────────────────────────────────────────────────────────

pub struct RequestState {
    pub id: u64,
    pub deadline: Instant,
    /// Root cancellation; every op spawned for this request observes a child.
    pub cancel: CancellationToken,
    pub keys: KeyTable,
    pub logs: LogBuffer,
    pub completion: Completion,
    /// Native async work in flight (timers, fetches, body reads, waitUntil).
    pub pending: usize,
    pub abort_reason: Option<ErrorKind>,
    /// First exception thrown by a timer callback or other macrotask.
    pub uncaught: Option<JsError>,
    /// Set by `ctx.passThroughOnException()`.
    pub pass_through: bool,
    resources: HashMap<u32, Resource>,
    next_rid: u32,
}

impl RequestState {
    pub fn new(id: u64, deadline: Instant, max_log_entries: usize) -> Self {
        Self {
            id,
            deadline,
            cancel: CancellationToken::new(),
            keys: KeyTable::default(),
            logs: LogBuffer::new(max_log_entries),
            completion: Completion::Pending,
            pending: 0,
            abort_reason: None,
            uncaught: None,
            pass_through: false,
            resources: HashMap::new(),
            next_rid: 0,
        }
    }

    pub fn add_resource(&mut self, resource: Resource) -> u32 {
        self.next_rid += 1;
        self.resources.insert(self.next_rid, resource);
        self.next_rid
    }

    pub fn resource(&self, rid: u32) -> Result<&Resource, OpError> {
        self.resources
            .get(&rid)
            .ok_or_else(|| OpError::type_error(format!("bad resource id {rid}")))
    }

    pub fn resource_mut(&mut self, rid: u32) -> Result<&mut Resource, OpError> {
        self.resources
            .get_mut(&rid)
            .ok_or_else(|| OpError::type_error(format!("bad resource id {rid}")))
    }

    pub fn take_resource(&mut self, rid: u32) -> Option<Resource> {
        self.resources.remove(&rid)
    }

    pub fn pending_add(&mut self) {
        self.pending += 1;
    }

    pub fn pending_sub(&mut self) {
        self.pending = self.pending.saturating_sub(1);
    }

    /// Abort everything observing the root token (once).
    pub fn abort(&mut self, reason: ErrorKind) {
        if self.abort_reason.is_none() {
            self.abort_reason = Some(reason);
        }
        self.cancel.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.abort_reason.is_some()
    }
}

impl Drop for RequestState {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── Table ────────────────────────────────────────────────────────────────

/// Live request states on one context thread.
#[derive(Default)]
pub struct RequestTable {
    states: HashMap<u64, RequestState>,
}

impl RequestTable {
    pub fn begin(&mut self, state: RequestState) {
        self.states.insert(state.id, state);
    }

    pub fn end(&mut self, id: u64) -> Option<RequestState> {
        self.states.remove(&id)
    }

    pub fn get(&self, id: u64) -> Result<&RequestState, OpError> {
        self.states.get(&id).ok_or_else(|| OpError::no_request_state(id))
    }

    pub fn get_mut(&mut self, id: u64) -> Result<&mut RequestState, OpError> {
        self.states.get_mut(&id).ok_or_else(|| OpError::no_request_state(id))
    }

    pub fn contains(&self, id: u64) -> bool {
        self.states.contains_key(&id)
    }
}
