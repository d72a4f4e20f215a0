//! `setTimeout` / `setInterval` and friends.
//!
//! Timers live in the context's [`TimerQueue`](crate::event_loop::TimerQueue)
//! and are fired by the event loop through `__edge.runTimer`. The callbacks
//! themselves stay on the JS side, keyed by timer id. A ref'd timer counts as
//! pending work for its request until it fires or is cleared.

use std::time::Duration;

use crate::engine::{native, JsEngine, OpReturn};
use crate::error::JsError;

use super::SharedHost;

/// Longest delay honoured; larger values fire after this long.
const MAX_DELAY_MS: f64 = 2_147_483_647.0;

pub fn install<E: JsEngine>(engine: &mut E, host: &SharedHost) -> Result<(), JsError> {
    let h = host.clone();
    engine.register_fn(
        "op_timer_start",
        native(move |args| {
            let request_id = args.u64(0)?;
            let delay = clamp_delay(args.number(1)?);
            let repeat = args.bool(2)?;
            let refed = args.bool(3)?;
            let mut host = h.borrow_mut();
            let host = &mut *host;
            let state = host.requests.get_mut(request_id)?;
            if refed {
                state.pending_add();
            }
            let id = host.timers.schedule(request_id, delay, repeat, refed);
            OpReturn::value(id)
        }),
    );

    let h = host.clone();
    engine.register_fn(
        "op_timer_clear",
        native(move |args| {
            let request_id = args.u64(0)?;
            let id = args.u32(1)?;
            let mut host = h.borrow_mut();
            if let Some(true) = host.timers.cancel(id) {
                if let Ok(state) = host.requests.get_mut(request_id) {
                    state.pending_sub();
                }
            }
            OpReturn::undefined()
        }),
    );

    engine.eval("<timers-setup>", TIMERS_JS)?;
    Ok(())
}

fn clamp_delay(ms: f64) -> Duration {
    if ms.is_nan() || ms <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(ms.min(MAX_DELAY_MS) / 1000.0)
}

const TIMERS_JS: &str = r#"
(function() {
    const ops = globalThis.__ops;
    const edge = globalThis.__edge;
    const callbacks = new Map();

    function start(callback, ms, args, repeat, refed) {
        if (typeof callback !== 'function') {
            throw new TypeError('The "callback" argument must be of type function');
        }
        ms = Number(ms);
        if (!(ms >= 0)) ms = 0;
        const id = ops.op_timer_start(edge.rid(), ms, repeat, refed);
        callbacks.set(id, { callback, args, repeat });
        return id;
    }

    function clear(id) {
        id = Number(id);
        if (!callbacks.has(id)) return;
        callbacks.delete(id);
        ops.op_timer_clear(edge.rid(), id);
    }

    globalThis.setTimeout = (callback, ms, ...args) => start(callback, ms, args, false, true);
    globalThis.setInterval = (callback, ms, ...args) => start(callback, ms, args, true, true);
    globalThis.clearTimeout = clear;
    globalThis.clearInterval = clear;

    // Timer that does not keep the request alive.
    edge.setTimer = (callback, ms, refed) => start(callback, ms, [], false, refed !== false);
    edge.runTimer = function(id) {
        const timer = callbacks.get(id);
        if (!timer) return;
        if (!timer.repeat) callbacks.delete(id);
        timer.callback.apply(globalThis, timer.args);
    };
    edge.clearTimers = () => callbacks.clear();
})();
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_are_clamped() {
        assert_eq!(clamp_delay(f64::NAN), Duration::ZERO);
        assert_eq!(clamp_delay(-5.0), Duration::ZERO);
        assert_eq!(clamp_delay(250.0), Duration::from_millis(250));
        assert_eq!(clamp_delay(1e12), Duration::from_secs_f64(MAX_DELAY_MS / 1000.0));
    }
}
