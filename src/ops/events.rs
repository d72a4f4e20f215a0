//! `Event`, `EventTarget`, `AbortController` and `AbortSignal`.
//!
//! Pure JS: listeners run synchronously inside `dispatchEvent`, and an
//! exception thrown by one listener is reported without stopping the rest.

use crate::engine::JsEngine;
use crate::error::JsError;

use super::SharedHost;

pub fn install<E: JsEngine>(engine: &mut E, _host: &SharedHost) -> Result<(), JsError> {
    engine.eval("<events-setup>", EVENTS_JS)?;
    Ok(())
}

const EVENTS_JS: &str = r#"
(function() {
    const edge = globalThis.__edge;

    const kTarget = Symbol('target');
    const kCurrent = Symbol('currentTarget');
    const kPhase = Symbol('phase');
    const kStop = Symbol('stop');
    const kStopImmediate = Symbol('stopImmediate');
    const kPassive = Symbol('passive');
    const kCanceled = Symbol('canceled');
    const kInit = Symbol('init');

    class Event {
        constructor(type, init) {
            if (arguments.length === 0) {
                throw new TypeError("Failed to construct 'Event': 1 argument required, but only 0 present.");
            }
            init = init || {};
            this[kInit] = {
                type: String(type),
                bubbles: !!init.bubbles,
                cancelable: !!init.cancelable,
                composed: !!init.composed,
                timeStamp: performance.now(),
            };
            this[kTarget] = null;
            this[kCurrent] = null;
            this[kPhase] = 0;
            this[kStop] = false;
            this[kStopImmediate] = false;
            this[kPassive] = false;
            this[kCanceled] = false;
        }
        get type() { return this[kInit].type; }
        get bubbles() { return this[kInit].bubbles; }
        get cancelable() { return this[kInit].cancelable; }
        get composed() { return this[kInit].composed; }
        get timeStamp() { return this[kInit].timeStamp; }
        get target() { return this[kTarget]; }
        get srcElement() { return this[kTarget]; }
        get currentTarget() { return this[kCurrent]; }
        get eventPhase() { return this[kPhase]; }
        get isTrusted() { return false; }
        get defaultPrevented() { return this[kCanceled]; }
        get returnValue() { return !this[kCanceled]; }
        get cancelBubble() { return this[kStop]; }
        set cancelBubble(v) { if (v) this[kStop] = true; }
        preventDefault() {
            if (this[kInit].cancelable && !this[kPassive]) this[kCanceled] = true;
        }
        stopPropagation() { this[kStop] = true; }
        stopImmediatePropagation() { this[kStop] = true; this[kStopImmediate] = true; }
        composedPath() { return this[kCurrent] ? [this[kCurrent]] : []; }
    }
    Event.NONE = 0;
    Event.CAPTURING_PHASE = 1;
    Event.AT_TARGET = 2;
    Event.BUBBLING_PHASE = 3;

    class CustomEvent extends Event {
        constructor(type, init) {
            super(type, init);
            this._detail = init && init.detail !== undefined ? init.detail : null;
        }
        get detail() { return this._detail; }
    }

    function flatten(options) {
        if (typeof options === 'boolean') return { capture: options };
        return options || {};
    }

    class EventTarget {
        #listeners = new Map();

        addEventListener(type, callback, options) {
            if (callback === null || callback === undefined) return;
            const opts = flatten(options);
            const capture = !!opts.capture;
            const signal = opts.signal;
            if (signal !== undefined && signal.aborted) return;
            type = String(type);
            let list = this.#listeners.get(type);
            if (!list) {
                list = [];
                this.#listeners.set(type, list);
            }
            if (list.some((l) => l.callback === callback && l.capture === capture)) return;
            list.push({ callback, capture, once: !!opts.once, passive: !!opts.passive, removed: false });
            if (signal !== undefined) {
                signal.addEventListener('abort', () => this.removeEventListener(type, callback, { capture }), { once: true });
            }
        }

        removeEventListener(type, callback, options) {
            const capture = !!flatten(options).capture;
            const list = this.#listeners.get(String(type));
            if (!list) return;
            const index = list.findIndex((l) => l.callback === callback && l.capture === capture);
            if (index >= 0) {
                list[index].removed = true;
                list.splice(index, 1);
            }
        }

        dispatchEvent(event) {
            if (!(event instanceof Event)) {
                throw new TypeError("Failed to execute 'dispatchEvent': parameter 1 is not of type 'Event'.");
            }
            const list = (this.#listeners.get(event.type) || []).slice();
            event[kTarget] = this;
            event[kCurrent] = this;
            event[kPhase] = 2;
            for (const listener of list) {
                if (listener.removed) continue;
                if (listener.once) this.removeEventListener(event.type, listener.callback, { capture: listener.capture });
                event[kPassive] = listener.passive;
                try {
                    if (typeof listener.callback === 'function') {
                        listener.callback.call(this, event);
                    } else if (typeof listener.callback.handleEvent === 'function') {
                        listener.callback.handleEvent(event);
                    }
                } catch (err) {
                    edge.reportError(err);
                }
                event[kPassive] = false;
                if (event[kStopImmediate]) break;
            }
            event[kCurrent] = null;
            event[kPhase] = 0;
            return !event.defaultPrevented;
        }
    }

    // ── Abort ─────────────────────────────────────────────────────────
    const kAborted = Symbol('aborted');
    const kReason = Symbol('reason');
    const token = Symbol('illegal');

    class AbortSignal extends EventTarget {
        constructor(key) {
            if (key !== token) throw new TypeError('Illegal constructor');
            super();
            this[kAborted] = false;
            this[kReason] = undefined;
            this.onabort = null;
        }
        get aborted() { return this[kAborted]; }
        get reason() { return this[kReason]; }
        throwIfAborted() {
            if (this[kAborted]) throw this[kReason];
        }
        static abort(reason) {
            const signal = createSignal();
            signalAbort(signal, reason);
            return signal;
        }
        static timeout(ms) {
            const signal = createSignal();
            edge.setTimer(() => {
                signalAbort(signal, new DOMException('The operation was aborted due to timeout', 'TimeoutError'));
            }, ms, false);
            return signal;
        }
        static any(signals) {
            const signal = createSignal();
            for (const s of signals) {
                if (s.aborted) {
                    signalAbort(signal, s.reason);
                    return signal;
                }
            }
            for (const s of signals) {
                s.addEventListener('abort', () => signalAbort(signal, s.reason), { once: true });
            }
            return signal;
        }
    }

    function createSignal() {
        return new AbortSignal(token);
    }

    function signalAbort(signal, reason) {
        if (signal[kAborted]) return;
        signal[kAborted] = true;
        signal[kReason] = reason === undefined
            ? new DOMException('This operation was aborted', 'AbortError')
            : reason;
        const event = new Event('abort');
        if (typeof signal.onabort === 'function') {
            try { signal.onabort.call(signal, event); } catch (err) { edge.reportError(err); }
        }
        signal.dispatchEvent(event);
    }

    class AbortController {
        #signal = createSignal();
        get signal() { return this.#signal; }
        abort(reason) { signalAbort(this.#signal, reason); }
    }

    edge.createSignal = createSignal;
    edge.signalAbort = signalAbort;

    globalThis.Event = Event;
    globalThis.CustomEvent = CustomEvent;
    globalThis.EventTarget = EventTarget;
    globalThis.AbortSignal = AbortSignal;
    globalThis.AbortController = AbortController;
})();
"#;
