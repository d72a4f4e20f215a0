//! Cooperative event loop driving one request on a context thread.
//!
//! All JS runs on the thread that owns the loop. Async op futures run on the
//! shared tokio runtime and post their results back over a channel; timers
//! are kept in a min-heap and fired by the loop itself. Microtasks are
//! drained after every macrotask.

use std::cell::RefCell;
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::engine::{InterruptHandle, JsEngine, OpValue, PromiseId};
use crate::error::{ErrorKind, JsError, OpError};
use crate::ops::HostState;

/// Grace period for abort listeners after the deadline has passed.
const ABORT_GRACE: Duration = Duration::from_millis(250);
const MIN_INTERVAL: Duration = Duration::from_millis(1);

// ── Timers ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerEntry {
    pub due: Instant,
    pub seq: u64,
    pub id: u32,
    pub request_id: u64,
    pub interval: Option<Duration>,
    /// Ref'd timers keep the request alive (count as pending work).
    pub refed: bool,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of timers keyed by `(due, insertion order)`. Cancelled timers
/// stay in the heap and are skipped when they surface.
#[derive(Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    active: HashMap<u32, (u64, bool)>,
    next_id: u32,
    next_seq: u64,
}

impl TimerQueue {
    pub fn schedule(&mut self, request_id: u64, delay: Duration, repeat: bool, refed: bool) -> u32 {
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let id = self.next_id;
        let interval = repeat.then(|| delay.max(MIN_INTERVAL));
        self.push(TimerEntry {
            due: Instant::now() + delay,
            seq: 0,
            id,
            request_id,
            interval,
            refed,
        });
        id
    }

    fn push(&mut self, mut entry: TimerEntry) {
        self.next_seq += 1;
        entry.seq = self.next_seq;
        self.active.insert(entry.id, (entry.seq, entry.refed));
        self.heap.push(Reverse(entry));
    }

    /// Cancel a timer. Returns `Some(refed)` if it was still active.
    pub fn cancel(&mut self, id: u32) -> Option<bool> {
        self.active.remove(&id).map(|(_, refed)| refed)
    }

    pub fn is_active(&self, id: u32) -> bool {
        self.active.contains_key(&id)
    }

    fn is_live(&self, entry: &TimerEntry) -> bool {
        self.active.get(&entry.id).map(|(seq, _)| *seq) == Some(entry.seq)
    }

    fn discard_stale(&mut self) {
        while let Some(Reverse(top)) = self.heap.peek() {
            if self.is_live(top) {
                break;
            }
            self.heap.pop();
        }
    }

    pub fn next_due(&mut self) -> Option<Instant> {
        self.discard_stale();
        self.heap.peek().map(|Reverse(e)| e.due)
    }

    /// Pop the earliest timer if it is due. One-shot timers become inactive;
    /// intervals are re-armed before their callback runs.
    pub fn pop_due(&mut self, now: Instant) -> Option<TimerEntry> {
        self.discard_stale();
        if self.heap.peek()?.0.due > now {
            return None;
        }
        let Reverse(entry) = self.heap.pop()?;
        match entry.interval {
            Some(interval) => {
                let mut next = entry.clone();
                next.due = now + interval;
                self.push(next);
            }
            None => {
                self.active.remove(&entry.id);
            }
        }
        Some(entry)
    }

    pub fn clear_request(&mut self, request_id: u64) {
        self.heap.retain(|Reverse(e)| e.request_id != request_id);
        let live: std::collections::HashSet<u32> = self.heap.iter().map(|Reverse(e)| e.id).collect();
        self.active.retain(|id, _| live.contains(id));
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

// ── Host cancellation ────────────────────────────────────────────────────

pub(crate) enum Message {
    OpDone {
        promise: PromiseId,
        request_id: u64,
        result: Result<OpValue, OpError>,
    },
    Wake,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    waker: Mutex<Option<mpsc::Sender<Message>>>,
}

/// Host-side cancellation for one execution. Cancelling aborts the
/// request's root signal with `AbortError`.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        if let Ok(waker) = self.inner.waker.lock() {
            if let Some(tx) = waker.as_ref() {
                let _ = tx.send(Message::Wake);
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    fn attach(&self, tx: mpsc::Sender<Message>) {
        if let Ok(mut waker) = self.inner.waker.lock() {
            *waker = Some(tx);
        }
    }

    fn detach(&self) {
        if let Ok(mut waker) = self.inner.waker.lock() {
            *waker = None;
        }
    }
}

// ── Watchdog ─────────────────────────────────────────────────────────────

/// Interrupts JS that is still running at the deadline. Dropping the guard
/// disarms it.
struct Watchdog {
    _disarm: mpsc::Sender<()>,
}

impl Watchdog {
    fn arm(interrupt: InterruptHandle, deadline: Instant, fired: Arc<AtomicBool>) -> Self {
        let (tx, rx) = mpsc::channel::<()>();
        std::thread::spawn(move || {
            let wait = deadline.saturating_duration_since(Instant::now());
            if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(wait) {
                fired.store(true, Ordering::SeqCst);
                interrupt();
            }
        });
        Self { _disarm: tx }
    }
}

// ── Loop ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Top-level promise settled and no work is pending.
    Completed,
    TimedOut,
    Cancelled,
    /// The heap limit was hit; the context must be discarded.
    OutOfMemory,
}

pub struct EventLoop<E: JsEngine> {
    pub engine: E,
    pub host: Rc<RefCell<HostState>>,
    runtime: tokio::runtime::Handle,
    tx: mpsc::Sender<Message>,
    rx: mpsc::Receiver<Message>,
    arrived: VecDeque<(Instant, Message)>,
}

enum Step {
    Timer(crate::event_loop::TimerEntry),
    Arrival(Message),
    Wait(Duration),
}

impl<E: JsEngine> EventLoop<E> {
    pub fn new(engine: E, host: Rc<RefCell<HostState>>, runtime: tokio::runtime::Handle) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            engine,
            host,
            runtime,
            tx,
            rx,
            arrived: VecDeque::new(),
        }
    }

    /// Drive `request_id` until it completes, times out or is cancelled.
    pub fn run(&mut self, request_id: u64, cancel: &CancelToken) -> LoopExit {
        let Some(deadline) = self.host.borrow().requests.get(request_id).ok().map(|s| s.deadline) else {
            return LoopExit::Completed;
        };
        cancel.attach(self.tx.clone());
        let watchdog_fired = Arc::new(AtomicBool::new(false));
        let watchdog = Watchdog::arm(self.engine.interrupt_handle(), deadline, watchdog_fired.clone());

        let exit = loop {
            self.engine.pump_microtasks();
            self.spawn_pending_ops();

            if self.engine.heap_exhausted() {
                break LoopExit::OutOfMemory;
            }
            if cancel.is_cancelled() {
                break LoopExit::Cancelled;
            }
            let now = Instant::now();
            if now >= deadline || watchdog_fired.load(Ordering::SeqCst) {
                break LoopExit::TimedOut;
            }
            if self.is_complete(request_id) {
                break LoopExit::Completed;
            }

            match self.next_step(now, deadline) {
                Step::Timer(timer) => self.fire_timer(timer),
                Step::Arrival(message) => self.dispatch(message),
                Step::Wait(timeout) => match self.rx.recv_timeout(timeout) {
                    Ok(message) => self.arrived.push_back((Instant::now(), message)),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break LoopExit::Completed,
                },
            }
        };
        drop(watchdog);
        cancel.detach();

        match exit {
            LoopExit::TimedOut => self.abort(request_id, ErrorKind::TimeoutError),
            LoopExit::Cancelled => self.abort(request_id, ErrorKind::AbortError),
            LoopExit::Completed | LoopExit::OutOfMemory => {}
        }
        tracing::debug!(request_id, ?exit, "event loop finished");
        exit
    }

    /// Call into JS on behalf of `request_id`, interrupted if it is still
    /// running at the request's deadline.
    pub fn enter(&mut self, request_id: u64, path: &str, args: Vec<OpValue>) -> Result<OpValue, JsError> {
        let deadline = self
            .host
            .borrow()
            .requests
            .get(request_id)
            .map(|s| s.deadline)
            .map_err(|e| JsError::new(e.js_name(), e.message()))?;
        let fired = Arc::new(AtomicBool::new(false));
        let watchdog = Watchdog::arm(self.engine.interrupt_handle(), deadline, fired.clone());
        let result = self.engine.call_function(path, args);
        drop(watchdog);
        if fired.load(Ordering::SeqCst) {
            self.engine.cancel_interrupt();
        }
        result
    }

    fn is_complete(&self, request_id: u64) -> bool {
        let host = self.host.borrow();
        match host.requests.get(request_id) {
            Ok(state) => state.completion.is_settled() && state.pending == 0,
            Err(_) => true,
        }
    }

    /// Earliest of: a due timer, an arrived completion (FIFO by time), or
    /// a wait until the next timer or the deadline.
    fn next_step(&mut self, now: Instant, deadline: Instant) -> Step {
        while let Ok(message) = self.rx.try_recv() {
            self.arrived.push_back((Instant::now(), message));
        }
        let next_timer = self.host.borrow_mut().timers.next_due();
        let next_arrival = self.arrived.front().map(|(at, _)| *at);

        let timer_first = match (next_timer, next_arrival) {
            (Some(due), Some(at)) => due <= now && due <= at,
            (Some(due), None) => due <= now,
            (None, _) => false,
        };
        if timer_first {
            if let Some(timer) = self.host.borrow_mut().timers.pop_due(now) {
                return Step::Timer(timer);
            }
        }
        if let Some((_, message)) = self.arrived.pop_front() {
            return Step::Arrival(message);
        }
        let wake_at = next_timer.map_or(deadline, |due| due.min(deadline));
        Step::Wait(wake_at.saturating_duration_since(now))
    }

    fn spawn_pending_ops(&mut self) {
        for op in self.engine.take_pending_ops() {
            let token = {
                let mut host = self.host.borrow_mut();
                match host.requests.get_mut(op.request_id) {
                    Ok(state) => {
                        state.pending_add();
                        Some(state.cancel.child_token())
                    }
                    Err(_) => None,
                }
            };
            let Some(token) = token else {
                let _ = self
                    .engine
                    .settle_promise(op.promise, Err(OpError::no_request_state(op.request_id)));
                continue;
            };
            let tx = self.tx.clone();
            let (promise, request_id, future) = (op.promise, op.request_id, op.future);
            self.runtime.spawn(async move {
                let result = tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(OpError::abort("The operation was aborted")),
                    result = future => result,
                };
                let _ = tx.send(Message::OpDone {
                    promise,
                    request_id,
                    result,
                });
            });
        }
    }

    fn dispatch(&mut self, message: Message) {
        let Message::OpDone {
            promise,
            request_id,
            result,
        } = message
        else {
            return;
        };
        {
            let mut host = self.host.borrow_mut();
            match host.requests.get_mut(request_id) {
                Ok(state) => state.pending_sub(),
                Err(_) => return,
            }
        }
        if let Err(err) = self.engine.settle_promise(promise, result) {
            tracing::debug!(request_id, %err, "settling op promise failed");
        }
    }

    fn fire_timer(&mut self, timer: TimerEntry) {
        {
            let mut host = self.host.borrow_mut();
            let Ok(state) = host.requests.get_mut(timer.request_id) else {
                return;
            };
            if timer.interval.is_none() && timer.refed {
                state.pending_sub();
            }
        }
        if let Err(err) = self.engine.call_function("__edge.runTimer", vec![OpValue::from(timer.id)]) {
            if err.is_terminated() {
                return;
            }
            let mut host = self.host.borrow_mut();
            if let Ok(state) = host.requests.get_mut(timer.request_id) {
                state
                    .logs
                    .push(timer.request_id, crate::result::LogLevel::Error, format!("Uncaught {err}"));
                state.uncaught.get_or_insert(err);
            }
        }
    }

    /// Abort the request's root signal and let listeners observe it.
    fn abort(&mut self, request_id: u64, reason: ErrorKind) {
        self.engine.cancel_interrupt();
        {
            let mut host = self.host.borrow_mut();
            match host.requests.get_mut(request_id) {
                Ok(state) => state.abort(reason),
                Err(_) => return,
            }
        }
        let name = match reason {
            ErrorKind::TimeoutError => "TimeoutError",
            _ => "AbortError",
        };
        let grace = Watchdog::arm(
            self.engine.interrupt_handle(),
            Instant::now() + ABORT_GRACE,
            Arc::new(AtomicBool::new(false)),
        );
        let _ = self
            .engine
            .call_function("__edge.abortRequest", vec![OpValue::Number(request_id as f64), name.into()]);
        self.engine.pump_microtasks();
        drop(grace);
        self.engine.cancel_interrupt();
    }

    /// Forget everything the request left behind on this context.
    pub fn teardown(&mut self, request_id: u64) {
        self.host.borrow_mut().timers.clear_request(request_id);
        self.engine.release_promises(request_id);
        self.arrived.retain(|(_, message)| match message {
            Message::OpDone { request_id: id, .. } => *id != request_id,
            Message::Wake => false,
        });
        while let Ok(message) = self.rx.try_recv() {
            if let Message::OpDone { request_id: id, .. } = &message {
                if *id != request_id {
                    self.arrived.push_back((Instant::now(), message));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_fire_in_due_then_insertion_order() {
        let mut q = TimerQueue::default();
        let a = q.schedule(1, Duration::ZERO, false, true);
        let b = q.schedule(1, Duration::ZERO, false, true);
        let c = q.schedule(1, Duration::from_secs(60), false, true);
        let later = Instant::now() + Duration::from_millis(5);
        assert_eq!(q.pop_due(later).map(|t| t.id), Some(a));
        assert_eq!(q.pop_due(later).map(|t| t.id), Some(b));
        assert_eq!(q.pop_due(later), None);
        assert!(q.is_active(c));
    }

    #[test]
    fn cancelled_timers_are_skipped() {
        let mut q = TimerQueue::default();
        let a = q.schedule(1, Duration::ZERO, false, true);
        let b = q.schedule(1, Duration::ZERO, false, false);
        assert_eq!(q.cancel(a), Some(true));
        assert_eq!(q.cancel(a), None);
        let later = Instant::now() + Duration::from_millis(1);
        assert_eq!(q.pop_due(later).map(|t| t.id), Some(b));
        assert!(q.is_empty());
    }

    #[test]
    fn intervals_rearm_until_cleared() {
        let mut q = TimerQueue::default();
        let id = q.schedule(1, Duration::from_millis(10), true, true);
        let now = Instant::now() + Duration::from_millis(20);
        let first = q.pop_due(now).unwrap();
        assert_eq!(first.id, id);
        assert!(q.is_active(id));
        assert!(q.next_due().unwrap() > now);
        q.cancel(id);
        assert_eq!(q.next_due(), None);
    }

    #[test]
    fn clear_request_drops_its_timers() {
        let mut q = TimerQueue::default();
        q.schedule(1, Duration::from_secs(1), false, true);
        let keep = q.schedule(2, Duration::from_secs(1), true, true);
        q.clear_request(1);
        assert_eq!(q.len(), 1);
        assert!(q.is_active(keep));
    }

    #[test]
    fn cancel_token_wakes_attached_loop() {
        let token = CancelToken::new();
        let (tx, rx) = mpsc::channel();
        token.attach(tx);
        token.clone().cancel();
        assert!(token.is_cancelled());
        assert!(matches!(rx.try_recv(), Ok(Message::Wake)));
    }
}
