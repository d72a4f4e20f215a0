//! WHATWG Streams: `ReadableStream`, `WritableStream`, `TransformStream`.
//!
//! Implemented in JS over internal slot records kept in `WeakMap`s, so user
//! code cannot reach stream internals. Byte streams are accepted but behave
//! as default streams; BYOB readers are not supported.
//!
//! Native code never touches stream objects directly: fetch bodies and the
//! rewriter feed streams through `pull` callbacks that await async ops.

use crate::engine::JsEngine;
use crate::error::JsError;

use super::SharedHost;

pub fn install<E: JsEngine>(engine: &mut E, _host: &SharedHost) -> Result<(), JsError> {
    engine.eval("<streams-setup>", STREAMS_JS)?;
    Ok(())
}

const STREAMS_JS: &str = r#"
(function() {
    const edge = globalThis.__edge;
    const illegal = Symbol('illegal');
    const RS = new WeakMap();
    const RD = new WeakMap();
    const WS = new WeakMap();
    const WR = new WeakMap();

    function deferred() {
        let resolve, reject;
        const promise = new Promise((res, rej) => { resolve = res; reject = rej; });
        return { promise, resolve, reject };
    }
    function handled(d) {
        d.promise.catch(() => {});
        return d;
    }
    function invoke(fn, thisArg, args) {
        try {
            return Promise.resolve(typeof fn === 'function' ? fn.apply(thisArg, args) : undefined);
        } catch (e) {
            return Promise.reject(e);
        }
    }
    function strategyOf(strategy, defaultHwm) {
        strategy = strategy || {};
        const hwm = strategy.highWaterMark === undefined ? defaultHwm : Number(strategy.highWaterMark);
        if (Number.isNaN(hwm) || hwm < 0) throw new RangeError('highWaterMark must be a non-negative number');
        const size = typeof strategy.size === 'function' ? strategy.size : () => 1;
        return { hwm, size };
    }

    // ── ReadableStream internals ──────────────────────────────────────
    function readerOf(s) {
        return s.reader ? RD.get(s.reader) : null;
    }
    function rsDesiredSize(s) {
        if (s.state === 'errored') return null;
        if (s.state === 'closed') return 0;
        return s.hwm - s.queueSize;
    }
    function rsEnqueue(s, chunk) {
        if (s.closeRequested || s.state !== 'readable') {
            throw new TypeError('Cannot enqueue a chunk into a closed or errored stream');
        }
        const reader = readerOf(s);
        if (reader && reader.requests.length > 0) {
            reader.requests.shift().resolve({ value: chunk, done: false });
        } else {
            let size;
            try {
                size = Number(s.size(chunk));
            } catch (e) {
                rsError(s, e);
                throw e;
            }
            s.queue.push({ chunk, size });
            s.queueSize += size;
        }
        rsPullIfNeeded(s);
    }
    function rsClose(s) {
        if (s.closeRequested || s.state !== 'readable') throw new TypeError('The stream is already closing');
        s.closeRequested = true;
        if (s.queue.length === 0) rsFinalizeClose(s);
    }
    function rsFinalizeClose(s) {
        s.state = 'closed';
        const reader = readerOf(s);
        if (reader) {
            for (const r of reader.requests.splice(0)) r.resolve({ value: undefined, done: true });
            reader.closed.resolve();
        }
    }
    function rsError(s, e) {
        if (s.state !== 'readable') return;
        s.state = 'errored';
        s.storedError = e;
        s.queue = [];
        s.queueSize = 0;
        const reader = readerOf(s);
        if (reader) {
            for (const r of reader.requests.splice(0)) r.reject(e);
            reader.closed.reject(e);
        }
    }
    function rsShouldPull(s) {
        if (!s.started || s.state !== 'readable' || s.closeRequested) return false;
        const reader = readerOf(s);
        if (reader && reader.requests.length > 0) return true;
        return rsDesiredSize(s) > 0;
    }
    function rsPullIfNeeded(s) {
        if (!rsShouldPull(s)) return;
        if (s.pulling) {
            s.pullAgain = true;
            return;
        }
        s.pulling = true;
        invoke(s.source.pull, s.source, [s.controller]).then(() => {
            s.pulling = false;
            if (s.pullAgain) {
                s.pullAgain = false;
                rsPullIfNeeded(s);
            }
        }, (e) => rsError(s, e));
    }
    function rsRead(s, reader) {
        s.disturbed = true;
        if (s.state === 'closed') return Promise.resolve({ value: undefined, done: true });
        if (s.state === 'errored') return Promise.reject(s.storedError);
        if (s.queue.length > 0) {
            const { chunk, size } = s.queue.shift();
            s.queueSize -= size;
            if (s.closeRequested && s.queue.length === 0) rsFinalizeClose(s);
            else rsPullIfNeeded(s);
            return Promise.resolve({ value: chunk, done: false });
        }
        const d = deferred();
        reader.requests.push(d);
        rsPullIfNeeded(s);
        return d.promise;
    }
    function rsCancel(s, reason) {
        s.disturbed = true;
        if (s.state === 'closed') return Promise.resolve();
        if (s.state === 'errored') return Promise.reject(s.storedError);
        s.queue = [];
        s.queueSize = 0;
        rsFinalizeClose(s);
        return invoke(s.source.cancel, s.source, [reason]).then(() => undefined);
    }

    class ReadableStreamDefaultController {
        #s;
        constructor(key, s) {
            if (key !== illegal) throw new TypeError('Illegal constructor');
            this.#s = s;
        }
        get desiredSize() { return rsDesiredSize(this.#s); }
        enqueue(chunk) { rsEnqueue(this.#s, chunk); }
        close() { rsClose(this.#s); }
        error(e) { rsError(this.#s, e); }
    }

    class ReadableStreamDefaultReader {
        constructor(stream) {
            const s = RS.get(stream);
            if (!s) throw new TypeError("Failed to construct 'ReadableStreamDefaultReader': parameter 1 is not a ReadableStream");
            if (s.reader) throw new TypeError('ReadableStream is locked');
            const r = { stream: s, requests: [], closed: handled(deferred()) };
            RD.set(this, r);
            s.reader = this;
            if (s.state === 'closed') r.closed.resolve();
            else if (s.state === 'errored') r.closed.reject(s.storedError);
        }
        get closed() { return RD.get(this).closed.promise; }
        read() {
            const r = RD.get(this);
            if (!r.stream) return Promise.reject(new TypeError('This reader has been released'));
            return rsRead(r.stream, r);
        }
        cancel(reason) {
            const r = RD.get(this);
            if (!r.stream) return Promise.reject(new TypeError('This reader has been released'));
            return rsCancel(r.stream, reason);
        }
        releaseLock() {
            const r = RD.get(this);
            if (!r.stream) return;
            const err = new TypeError('This reader has been released');
            for (const req of r.requests.splice(0)) req.reject(err);
            if (r.stream.state !== 'readable') r.closed = handled(deferred());
            r.closed.reject(err);
            r.stream.reader = null;
            r.stream = null;
        }
    }

    class ReadableStream {
        constructor(source, strategy) {
            source = source || {};
            const { hwm, size } = strategyOf(strategy, source.type === 'bytes' ? 0 : 1);
            const s = {
                state: 'readable', queue: [], queueSize: 0, hwm, size, source,
                controller: null, started: false, pulling: false, pullAgain: false,
                closeRequested: false, storedError: undefined, reader: null, disturbed: false,
            };
            RS.set(this, s);
            s.controller = new ReadableStreamDefaultController(illegal, s);
            invoke(source.start, source, [s.controller]).then(() => {
                s.started = true;
                rsPullIfNeeded(s);
            }, (e) => rsError(s, e));
        }

        get locked() { return RS.get(this).reader !== null; }

        getReader(options) {
            if (options && options.mode === 'byob') throw new TypeError('BYOB readers are not supported');
            return new ReadableStreamDefaultReader(this);
        }

        cancel(reason) {
            const s = RS.get(this);
            if (s.reader) return Promise.reject(new TypeError('Cannot cancel a locked ReadableStream'));
            return rsCancel(s, reason);
        }

        tee() {
            const reader = this.getReader();
            let c1, c2, reason1, reason2;
            let canceled1 = false, canceled2 = false, reading = false, readAgain = false;
            const cancelled = handled(deferred());
            const pull = () => {
                if (reading) {
                    readAgain = true;
                    return Promise.resolve();
                }
                reading = true;
                reader.read().then(({ value, done }) => {
                    reading = false;
                    if (done) {
                        if (!canceled1) c1.close();
                        if (!canceled2) c2.close();
                        cancelled.resolve();
                        return;
                    }
                    if (!canceled1) c1.enqueue(value);
                    if (!canceled2) c2.enqueue(value);
                    if (readAgain) {
                        readAgain = false;
                        pull();
                    }
                }, (e) => {
                    reading = false;
                    c1.error(e);
                    c2.error(e);
                    cancelled.resolve();
                });
                return Promise.resolve();
            };
            const maybeCancel = () => {
                if (canceled1 && canceled2) reader.cancel([reason1, reason2]).then(cancelled.resolve, cancelled.reject);
                return cancelled.promise;
            };
            const branch1 = new ReadableStream({
                start(c) { c1 = c; },
                pull,
                cancel(reason) { canceled1 = true; reason1 = reason; return maybeCancel(); },
            });
            const branch2 = new ReadableStream({
                start(c) { c2 = c; },
                pull,
                cancel(reason) { canceled2 = true; reason2 = reason; return maybeCancel(); },
            });
            return [branch1, branch2];
        }

        pipeTo(dest, options) {
            if (!(dest instanceof WritableStream)) {
                return Promise.reject(new TypeError("Failed to execute 'pipeTo': parameter 1 is not a WritableStream"));
            }
            if (this.locked) return Promise.reject(new TypeError('Cannot pipe a locked ReadableStream'));
            if (dest.locked) return Promise.reject(new TypeError('Cannot pipe to a locked WritableStream'));
            const { preventClose = false, preventAbort = false, preventCancel = false, signal } = options || {};
            const reader = this.getReader();
            const writer = dest.getWriter();

            return new Promise((resolve, reject) => {
                let shuttingDown = false;
                const finish = (error, failed) => {
                    if (signal) signal.removeEventListener('abort', onAbort);
                    reader.releaseLock();
                    writer.releaseLock();
                    if (failed) reject(error); else resolve();
                };
                const shutdown = (action, error, failed) => {
                    if (shuttingDown) return;
                    shuttingDown = true;
                    invoke(action, null, []).then(
                        () => finish(error, failed),
                        (e) => finish(failed ? error : e, true));
                };
                const onAbort = () => {
                    const reason = signal.reason;
                    shutdown(() => Promise.all([
                        preventAbort ? undefined : writer.abort(reason),
                        preventCancel ? undefined : reader.cancel(reason),
                    ]), reason, true);
                };
                if (signal) {
                    if (signal.aborted) {
                        onAbort();
                        return;
                    }
                    signal.addEventListener('abort', onAbort);
                }
                writer.closed.catch((e) => {
                    shutdown(() => preventCancel ? undefined : reader.cancel(e), e, true);
                });
                const onSourceError = (e) => {
                    shutdown(() => preventAbort ? undefined : writer.abort(e), e, true);
                };
                const step = () => {
                    if (shuttingDown) return;
                    writer.ready.then(() => {
                        if (shuttingDown) return;
                        reader.read().then(({ value, done }) => {
                            if (shuttingDown) return;
                            if (done) {
                                shutdown(() => preventClose ? undefined : writer.close(), undefined, false);
                                return;
                            }
                            writer.write(value).catch(() => {});
                            step();
                        }, onSourceError);
                    }, () => {});
                };
                step();
            });
        }

        pipeThrough(transform, options) {
            if (!transform || !(transform.readable instanceof ReadableStream) || !(transform.writable instanceof WritableStream)) {
                throw new TypeError("Failed to execute 'pipeThrough': parameter 1 must have readable and writable streams");
            }
            this.pipeTo(transform.writable, options).catch(() => {});
            return transform.readable;
        }

        values(options) {
            const preventCancel = !!(options && options.preventCancel);
            const reader = this.getReader();
            let finished = false;
            return {
                next() {
                    if (finished) return Promise.resolve({ value: undefined, done: true });
                    return reader.read().then((result) => {
                        if (result.done) {
                            finished = true;
                            reader.releaseLock();
                        }
                        return result;
                    }, (e) => {
                        finished = true;
                        reader.releaseLock();
                        throw e;
                    });
                },
                return(value) {
                    if (finished) return Promise.resolve({ value, done: true });
                    finished = true;
                    const cancelled = preventCancel ? Promise.resolve() : reader.cancel(value);
                    reader.releaseLock();
                    return cancelled.then(() => ({ value, done: true }));
                },
                [Symbol.asyncIterator]() { return this; },
            };
        }

        [Symbol.asyncIterator](options) {
            return this.values(options);
        }

        static from(iterable) {
            if (iterable instanceof ReadableStream) return iterable;
            let it;
            if (iterable != null && typeof iterable[Symbol.asyncIterator] === 'function') {
                it = iterable[Symbol.asyncIterator]();
            } else if (iterable != null && typeof iterable[Symbol.iterator] === 'function') {
                it = iterable[Symbol.iterator]();
            } else {
                throw new TypeError('ReadableStream.from: argument is not iterable');
            }
            return new ReadableStream({
                pull(c) {
                    return Promise.resolve(it.next()).then((r) => {
                        if (r.done) {
                            c.close();
                            return;
                        }
                        return Promise.resolve(r.value).then((v) => c.enqueue(v));
                    });
                },
                cancel(reason) {
                    if (typeof it.return === 'function') {
                        return Promise.resolve(it.return(reason)).then(() => undefined);
                    }
                },
            }, { highWaterMark: 0 });
        }
    }

    // ── WritableStream internals ──────────────────────────────────────
    function writerOf(s) {
        return s.writer ? WR.get(s.writer) : null;
    }
    function wsDesiredSize(s) {
        if (s.state === 'errored') return null;
        if (s.state === 'closed') return 0;
        return s.hwm - s.queueSize;
    }
    function wsUpdateReady(s) {
        const w = writerOf(s);
        if (!w || s.state !== 'writable' || s.closeRequest) return;
        const desired = wsDesiredSize(s);
        if (desired <= 0 && !w.backpressure) {
            w.backpressure = true;
            w.ready = handled(deferred());
        } else if (desired > 0 && w.backpressure) {
            w.backpressure = false;
            w.ready.resolve();
        }
    }
    function wsError(s, e) {
        if (s.state !== 'writable') return;
        s.state = 'errored';
        s.storedError = e;
        for (const q of s.queue.splice(0)) q.d.reject(e);
        s.queueSize = 0;
        if (s.closeRequest) s.closeRequest.reject(e);
        const w = writerOf(s);
        if (w) {
            w.closed.reject(e);
            if (!w.backpressure) w.ready = handled(deferred());
            w.backpressure = false;
            w.ready.reject(e);
        }
    }
    function wsAdvance(s) {
        if (!s.started || s.inFlight || s.state !== 'writable') return;
        if (s.queue.length === 0) {
            if (s.closeRequest && !s.closing) {
                s.closing = true;
                s.inFlight = true;
                invoke(s.sink.close, s.sink, []).then(() => {
                    s.inFlight = false;
                    if (s.state !== 'writable') return;
                    s.state = 'closed';
                    s.closeRequest.resolve();
                    const w = writerOf(s);
                    if (w) w.closed.resolve();
                }, (e) => {
                    s.inFlight = false;
                    wsError(s, e);
                });
            }
            return;
        }
        const q = s.queue[0];
        s.inFlight = true;
        invoke(s.sink.write, s.sink, [q.chunk, s.controller]).then(() => {
            s.inFlight = false;
            if (s.state !== 'writable') return;
            s.queue.shift();
            s.queueSize -= q.size;
            q.d.resolve();
            wsUpdateReady(s);
            wsAdvance(s);
        }, (e) => {
            s.inFlight = false;
            wsError(s, e);
        });
    }
    function wsWrite(s, chunk) {
        if (s.state === 'errored') return Promise.reject(s.storedError);
        if (s.state === 'closed' || s.closeRequest) {
            return Promise.reject(new TypeError('Cannot write to a closing or closed WritableStream'));
        }
        let size;
        try {
            size = Number(s.size(chunk));
        } catch (e) {
            wsError(s, e);
            return Promise.reject(e);
        }
        const d = deferred();
        s.queue.push({ chunk, size, d });
        s.queueSize += size;
        wsUpdateReady(s);
        wsAdvance(s);
        return d.promise;
    }
    function wsClose(s) {
        if (s.state !== 'writable' || s.closeRequest) {
            return Promise.reject(new TypeError('Cannot close a closing, closed or errored WritableStream'));
        }
        s.closeRequest = deferred();
        const w = writerOf(s);
        if (w && w.backpressure) {
            w.backpressure = false;
            w.ready.resolve();
        }
        wsAdvance(s);
        return s.closeRequest.promise;
    }
    function wsAbort(s, reason) {
        if (s.state !== 'writable') return Promise.resolve();
        s.abort.abort(reason);
        wsError(s, reason);
        return invoke(s.sink.abort, s.sink, [reason]).then(() => undefined);
    }

    class WritableStreamDefaultController {
        #s;
        constructor(key, s) {
            if (key !== illegal) throw new TypeError('Illegal constructor');
            this.#s = s;
        }
        get signal() { return this.#s.abort.signal; }
        error(e) { wsError(this.#s, e); }
    }

    class WritableStreamDefaultWriter {
        constructor(stream) {
            const s = WS.get(stream);
            if (!s) throw new TypeError("Failed to construct 'WritableStreamDefaultWriter': parameter 1 is not a WritableStream");
            if (s.writer) throw new TypeError('WritableStream is locked');
            const w = { stream: s, closed: handled(deferred()), ready: handled(deferred()), backpressure: false };
            WR.set(this, w);
            s.writer = this;
            if (s.state === 'closed') {
                w.closed.resolve();
                w.ready.resolve();
            } else if (s.state === 'errored') {
                w.closed.reject(s.storedError);
                w.ready.reject(s.storedError);
            } else {
                w.ready.resolve();
                wsUpdateReady(s);
            }
        }
        #state() {
            const w = WR.get(this);
            if (!w.stream) throw new TypeError('This writer has been released');
            return w.stream;
        }
        get closed() { return WR.get(this).closed.promise; }
        get ready() { return WR.get(this).ready.promise; }
        get desiredSize() { return wsDesiredSize(this.#state()); }
        write(chunk) {
            try { return wsWrite(this.#state(), chunk); } catch (e) { return Promise.reject(e); }
        }
        close() {
            try { return wsClose(this.#state()); } catch (e) { return Promise.reject(e); }
        }
        abort(reason) {
            try { return wsAbort(this.#state(), reason); } catch (e) { return Promise.reject(e); }
        }
        releaseLock() {
            const w = WR.get(this);
            if (!w.stream) return;
            const err = new TypeError('This writer has been released');
            if (w.stream.state !== 'writable') w.closed = handled(deferred());
            w.closed.reject(err);
            w.stream.writer = null;
            w.stream = null;
        }
    }

    class WritableStream {
        constructor(sink, strategy) {
            sink = sink || {};
            const { hwm, size } = strategyOf(strategy, 1);
            const s = {
                state: 'writable', sink, controller: null, hwm, size, queue: [], queueSize: 0,
                inFlight: false, closeRequest: null, closing: false, started: false,
                storedError: undefined, writer: null, abort: new AbortController(),
            };
            WS.set(this, s);
            s.controller = new WritableStreamDefaultController(illegal, s);
            invoke(sink.start, sink, [s.controller]).then(() => {
                s.started = true;
                wsAdvance(s);
            }, (e) => wsError(s, e));
        }
        get locked() { return WS.get(this).writer !== null; }
        getWriter() { return new WritableStreamDefaultWriter(this); }
        close() {
            const s = WS.get(this);
            if (s.writer) return Promise.reject(new TypeError('Cannot close a locked WritableStream'));
            return wsClose(s);
        }
        abort(reason) {
            const s = WS.get(this);
            if (s.writer) return Promise.reject(new TypeError('Cannot abort a locked WritableStream'));
            return wsAbort(s, reason);
        }
    }

    // ── TransformStream ───────────────────────────────────────────────
    class TransformStreamDefaultController {
        #ops;
        constructor(key, ops) {
            if (key !== illegal) throw new TypeError('Illegal constructor');
            this.#ops = ops;
        }
        get desiredSize() { return this.#ops.desiredSize(); }
        enqueue(chunk) { this.#ops.enqueue(chunk); }
        error(e) { this.#ops.error(e); }
        terminate() { this.#ops.terminate(); }
    }

    class TransformStream {
        #readable;
        #writable;
        constructor(transformer, writableStrategy, readableStrategy) {
            transformer = transformer || {};
            let rc;
            let writable;
            const readable = new ReadableStream({
                start(c) { rc = c; },
                cancel(reason) {
                    wsError(WS.get(writable), reason);
                    return invoke(transformer.cancel, transformer, [reason]);
                },
            }, readableStrategy || { highWaterMark: 0 });
            const controller = new TransformStreamDefaultController(illegal, {
                desiredSize: () => rc.desiredSize,
                enqueue: (chunk) => rc.enqueue(chunk),
                error: (e) => {
                    rc.error(e);
                    wsError(WS.get(writable), e);
                },
                terminate: () => {
                    try { rc.close(); } catch (e) { /* already closed */ }
                    wsError(WS.get(writable), new TypeError('The TransformStream has been terminated'));
                },
            });
            const transform = typeof transformer.transform === 'function'
                ? (chunk) => invoke(transformer.transform, transformer, [chunk, controller])
                : (chunk) => {
                    try {
                        controller.enqueue(chunk);
                        return Promise.resolve();
                    } catch (e) {
                        return Promise.reject(e);
                    }
                };
            writable = new WritableStream({
                start() { return invoke(transformer.start, transformer, [controller]); },
                write(chunk) { return transform(chunk); },
                close() {
                    return invoke(transformer.flush, transformer, [controller]).then(() => {
                        try { rc.close(); } catch (e) { /* terminated */ }
                    });
                },
                abort(reason) {
                    rc.error(reason);
                    return invoke(transformer.cancel, transformer, [reason]);
                },
            }, writableStrategy);
            this.#readable = readable;
            this.#writable = writable;
        }
        get readable() { return this.#readable; }
        get writable() { return this.#writable; }
    }

    // ── Strategies and text streams ───────────────────────────────────
    class CountQueuingStrategy {
        constructor({ highWaterMark }) { this.highWaterMark = highWaterMark; }
        size() { return 1; }
    }
    class ByteLengthQueuingStrategy {
        constructor({ highWaterMark }) { this.highWaterMark = highWaterMark; }
        size(chunk) { return chunk.byteLength; }
    }

    class TextEncoderStream {
        #inner;
        constructor() {
            const encoder = new TextEncoder();
            this.#inner = new TransformStream({
                transform(chunk, c) {
                    const bytes = encoder.encode(String(chunk));
                    if (bytes.byteLength) c.enqueue(bytes);
                },
            });
        }
        get encoding() { return 'utf-8'; }
        get readable() { return this.#inner.readable; }
        get writable() { return this.#inner.writable; }
    }
    class TextDecoderStream {
        #inner;
        #decoder;
        constructor(label = 'utf-8', options = {}) {
            const decoder = new TextDecoder(label, options);
            this.#decoder = decoder;
            this.#inner = new TransformStream({
                transform(chunk, c) {
                    const text = decoder.decode(chunk, { stream: true });
                    if (text) c.enqueue(text);
                },
                flush(c) {
                    const text = decoder.decode();
                    if (text) c.enqueue(text);
                },
            });
        }
        get encoding() { return this.#decoder.encoding; }
        get fatal() { return this.#decoder.fatal; }
        get ignoreBOM() { return this.#decoder.ignoreBOM; }
        get readable() { return this.#inner.readable; }
        get writable() { return this.#inner.writable; }
    }

    // ── Helpers for body handling ─────────────────────────────────────
    const encoder = new TextEncoder();
    edge.isReadableStream = (value) => RS.has(value);
    edge.streamDisturbed = (stream) => RS.get(stream).disturbed;
    edge.chunkBytes = function(chunk) {
        if (typeof chunk === 'string') return encoder.encode(chunk);
        return edge.toBytes(chunk, 'ReadableStream chunk');
    };
    edge.streamFromBytes = function(bytes) {
        return new ReadableStream({
            start(c) {
                if (bytes.byteLength > 0) c.enqueue(bytes);
                c.close();
            },
        });
    };
    edge.readAllBytes = async function(stream) {
        const reader = stream.getReader();
        const chunks = [];
        try {
            for (;;) {
                const { value, done } = await reader.read();
                if (done) break;
                chunks.push(edge.chunkBytes(value));
            }
        } finally {
            reader.releaseLock();
        }
        return edge.concat(chunks);
    };

    globalThis.ReadableStream = ReadableStream;
    globalThis.ReadableStreamDefaultReader = ReadableStreamDefaultReader;
    globalThis.ReadableStreamDefaultController = ReadableStreamDefaultController;
    globalThis.WritableStream = WritableStream;
    globalThis.WritableStreamDefaultWriter = WritableStreamDefaultWriter;
    globalThis.WritableStreamDefaultController = WritableStreamDefaultController;
    globalThis.TransformStream = TransformStream;
    globalThis.TransformStreamDefaultController = TransformStreamDefaultController;
    globalThis.CountQueuingStrategy = CountQueuingStrategy;
    globalThis.ByteLengthQueuingStrategy = ByteLengthQueuingStrategy;
    globalThis.TextEncoderStream = TextEncoderStream;
    globalThis.TextDecoderStream = TextDecoderStream;
})();
"#;
