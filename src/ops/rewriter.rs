//! `HTMLRewriter` on top of the native streaming [`Rewriter`].
//!
//! The native side owns tokenizing, selector matching and serialization. JS
//! pulls one [`Event`](crate::rewriter::Event) at a time, runs the user's
//! handlers (awaiting them if they are async), and hands the collected
//! [`Mutations`] back before the rewriter advances.

use crate::engine::{native, JsEngine, OpReturn, OpValue};
use crate::error::{JsError, OpError};
use crate::request_state::{RequestState, Resource};
use crate::rewriter::{DocumentHandlers, Mutations, Rewriter, RewriterError, RouteSpec};

use super::{with_request, SharedHost};

impl From<RewriterError> for OpError {
    fn from(err: RewriterError) -> Self {
        OpError::type_error(err.to_string())
    }
}

fn rewriter(state: &mut RequestState, rid: u32) -> Result<&mut Rewriter, OpError> {
    match state.resource_mut(rid)? {
        Resource::Rewriter(rw) => Ok(rw),
        _ => Err(OpError::type_error(format!("resource {rid} is not an HTMLRewriter"))),
    }
}

pub fn install<E: JsEngine>(engine: &mut E, host: &SharedHost) -> Result<(), JsError> {
    let h = host.clone();
    engine.register_fn(
        "op_rewriter_new",
        native(move |args| {
            let routes: Vec<RouteSpec> = args.parse(1)?;
            let document: DocumentHandlers = args.parse(2)?;
            let rw = Rewriter::new(routes, document)?;
            let rid = with_request(&h, &args, 0, |state| Ok(state.add_resource(Resource::Rewriter(Box::new(rw)))))?;
            OpReturn::value(rid)
        }),
    );

    let h = host.clone();
    engine.register_fn(
        "op_rewriter_write",
        native(move |args| {
            let rid = args.u32(1)?;
            let chunk = args.bytes(2)?;
            with_request(&h, &args, 0, |state| Ok(rewriter(state, rid)?.write(&chunk)?))?;
            OpReturn::undefined()
        }),
    );

    let h = host.clone();
    engine.register_fn(
        "op_rewriter_end",
        native(move |args| {
            let rid = args.u32(1)?;
            with_request(&h, &args, 0, |state| {
                rewriter(state, rid)?.end();
                Ok(())
            })?;
            OpReturn::undefined()
        }),
    );

    let h = host.clone();
    engine.register_fn(
        "op_rewriter_next",
        native(move |args| {
            let rid = args.u32(1)?;
            let event = with_request(&h, &args, 0, |state| Ok(rewriter(state, rid)?.next_event()?))?;
            match event {
                Some(event) => {
                    let json = serde_json::to_value(&event).map_err(|e| OpError::Generic(e.to_string()))?;
                    OpReturn::value(json)
                }
                None => OpReturn::value(OpValue::Null),
            }
        }),
    );

    let h = host.clone();
    engine.register_fn(
        "op_rewriter_apply",
        native(move |args| {
            let rid = args.u32(1)?;
            let mutations: Mutations = args.parse(2)?;
            let opened = with_request(&h, &args, 0, |state| Ok(rewriter(state, rid)?.apply(mutations)?))?;
            match opened {
                Some(frame) => OpReturn::value(frame as f64),
                None => OpReturn::value(OpValue::Null),
            }
        }),
    );

    let h = host.clone();
    engine.register_fn(
        "op_rewriter_output",
        native(move |args| {
            let rid = args.u32(1)?;
            let out = with_request(&h, &args, 0, |state| Ok(rewriter(state, rid)?.take_output()))?;
            OpReturn::value(out)
        }),
    );

    let h = host.clone();
    engine.register_fn(
        "op_rewriter_done",
        native(move |args| {
            let rid = args.u32(1)?;
            let done = with_request(&h, &args, 0, |state| Ok(rewriter(state, rid)?.is_finished()))?;
            OpReturn::value(done)
        }),
    );

    let h = host.clone();
    engine.register_fn(
        "op_rewriter_close",
        native(move |args| {
            let rid = args.u32(1)?;
            let request_id = args.u64(0)?;
            if let Ok(state) = h.borrow_mut().requests.get_mut(request_id) {
                state.take_resource(rid);
            }
            OpReturn::undefined()
        }),
    );

    engine.eval("<rewriter-setup>", REWRITER_JS)?;
    Ok(())
}

const REWRITER_JS: &str = r#"
(function() {
    const ops = globalThis.__ops;
    const edge = globalThis.__edge;
    const kIllegal = Symbol('illegal');

    function content(value, options) {
        return { content: String(value), html: !!(options && options.html) };
    }

    function newMutations() {
        return {
            before: [], after: [], prepend: [], append: [],
            inner: null, replace: null, removed: false, keepContent: false,
            tagName: null, attrs: null, text: null, endTagHandlers: false,
        };
    }

    class Element {
        #event; #m; #attrs; #endTag;

        constructor(token, event, m, endTag) {
            if (token !== kIllegal) throw new TypeError('Illegal constructor');
            this.#event = event;
            this.#m = m;
            this.#attrs = m.attrs || event.attrs.map(([k, v]) => [k, v]);
            this.#endTag = endTag;
        }

        get tagName() { return this.#m.tagName || this.#event.tagName; }
        set tagName(name) { this.#m.tagName = String(name).toLowerCase(); }
        get namespaceURI() { return this.#event.namespaceURI; }
        get selfClosing() { return this.#event.selfClosing; }
        get canHaveContent() { return this.#event.canHaveContent; }
        get removed() { return this.#m.removed; }
        get attributes() { return this.#attrs.map(([k, v]) => [k, v])[Symbol.iterator](); }

        getAttribute(name) {
            const entry = this.#attrs.find(([k]) => k === String(name).toLowerCase());
            return entry ? entry[1] : null;
        }
        hasAttribute(name) {
            return this.#attrs.some(([k]) => k === String(name).toLowerCase());
        }
        setAttribute(name, value) {
            name = String(name).toLowerCase();
            const entry = this.#attrs.find(([k]) => k === name);
            if (entry) entry[1] = String(value);
            else this.#attrs.push([name, String(value)]);
            this.#m.attrs = this.#attrs;
            return this;
        }
        removeAttribute(name) {
            name = String(name).toLowerCase();
            const index = this.#attrs.findIndex(([k]) => k === name);
            if (index >= 0) this.#attrs.splice(index, 1);
            this.#m.attrs = this.#attrs;
            return this;
        }

        before(value, options) { this.#m.before.push(content(value, options)); return this; }
        after(value, options) { this.#m.after.unshift(content(value, options)); return this; }
        prepend(value, options) { this.#m.prepend.unshift(content(value, options)); return this; }
        append(value, options) { this.#m.append.push(content(value, options)); return this; }
        setInnerContent(value, options) {
            this.#m.inner = content(value, options);
            this.#m.prepend = [];
            this.#m.append = [];
            return this;
        }
        replace(value, options) {
            this.#m.before.push(content(value, options));
            this.#m.removed = true;
            return this;
        }
        remove() { this.#m.removed = true; return this; }
        removeAndKeepContent() { this.#m.keepContent = true; return this; }
        onEndTag(handler) {
            if (typeof handler !== 'function') throw new TypeError('onEndTag handler must be a function');
            if (!this.#event.canHaveContent) throw new TypeError('Void and self-closing elements have no end tag');
            this.#endTag.push(handler);
            this.#m.endTagHandlers = true;
        }
    }

    class EndTag {
        #event; #m;
        constructor(token, event, m) {
            if (token !== kIllegal) throw new TypeError('Illegal constructor');
            this.#event = event;
            this.#m = m;
        }
        get name() { return this.#m.tagName || this.#event.name; }
        set name(name) { this.#m.tagName = String(name).toLowerCase(); }
        before(value, options) { this.#m.before.push(content(value, options)); return this; }
        after(value, options) { this.#m.after.unshift(content(value, options)); return this; }
        remove() { this.#m.removed = true; return this; }
    }

    class Text {
        #event; #m;
        constructor(token, event, m) {
            if (token !== kIllegal) throw new TypeError('Illegal constructor');
            this.#event = event;
            this.#m = m;
        }
        get text() { return this.#event.text; }
        get lastInTextNode() { return this.#event.lastInTextNode; }
        get removed() { return this.#m.removed; }
        before(value, options) { this.#m.before.push(content(value, options)); return this; }
        after(value, options) { this.#m.after.unshift(content(value, options)); return this; }
        replace(value, options) { this.#m.replace = content(value, options); return this; }
        remove() { this.#m.removed = true; return this; }
    }

    class Comment {
        #event; #m;
        constructor(token, event, m) {
            if (token !== kIllegal) throw new TypeError('Illegal constructor');
            this.#event = event;
            this.#m = m;
        }
        get text() { return this.#m.text === null ? this.#event.text : this.#m.text; }
        set text(value) { this.#m.text = String(value); }
        get removed() { return this.#m.removed; }
        before(value, options) { this.#m.before.push(content(value, options)); return this; }
        after(value, options) { this.#m.after.unshift(content(value, options)); return this; }
        replace(value, options) { this.#m.replace = content(value, options); return this; }
        remove() { this.#m.removed = true; return this; }
    }

    class Doctype {
        #event; #m;
        constructor(token, event, m) {
            if (token !== kIllegal) throw new TypeError('Illegal constructor');
            this.#event = event;
            this.#m = m;
        }
        get name() { return this.#event.name; }
        get publicId() { return this.#event.publicId; }
        get systemId() { return this.#event.systemId; }
        get removed() { return this.#m.removed; }
        remove() { this.#m.removed = true; return this; }
    }

    class DocumentEnd {
        #m;
        constructor(token, m) {
            if (token !== kIllegal) throw new TypeError('Illegal constructor');
            this.#m = m;
        }
        append(value, options) { this.#m.append.push(content(value, options)); return this; }
    }

    const handlerOf = (handlers, kind) => (handlers && typeof handlers[kind] === 'function' ? handlers : null);

    class HTMLRewriter {
        #routes = [];
        #document = [];

        on(selector, handlers) {
            if (handlers === null || typeof handlers !== 'object') throw new TypeError('handlers must be an object');
            this.#routes.push({ selector: String(selector), handlers });
            return this;
        }

        onDocument(handlers) {
            if (handlers === null || typeof handlers !== 'object') throw new TypeError('handlers must be an object');
            this.#document.push(handlers);
            return this;
        }

        transform(response) {
            if (!(response instanceof Response)) throw new TypeError('HTMLRewriter.transform expects a Response');
            const type = response.headers.get('content-type') || '';
            if (!/text\/html/i.test(type) || response.body === null) return response;

            const routes = this.#routes.slice();
            const documents = this.#document.slice();
            const anyDocument = (kind) => documents.some((h) => handlerOf(h, kind));
            const rid = edge.rid();
            const rw = ops.op_rewriter_new(rid,
                routes.map(({ selector, handlers }) => ({
                    selector,
                    element: !!handlerOf(handlers, 'element'),
                    text: !!handlerOf(handlers, 'text'),
                    comments: !!handlerOf(handlers, 'comments'),
                })),
                {
                    doctype: anyDocument('doctype'),
                    text: anyDocument('text'),
                    comments: anyDocument('comments'),
                    end: anyDocument('end'),
                });

            const endTags = new Map();
            const reader = response.body.getReader();
            let inputDone = false;
            let closed = false;
            const close = () => {
                if (!closed) { closed = true; ops.op_rewriter_close(rid, rw); }
            };

            async function runAll(list, kind, wrap) {
                for (const handlers of list) {
                    if (handlerOf(handlers, kind)) await handlers[kind](wrap);
                }
            }

            async function dispatch(event, m) {
                switch (event.type) {
                    case 'element': {
                        const pending = [];
                        const el = new Element(kIllegal, event, m, pending);
                        await runAll(event.routes.map((i) => routes[i].handlers), 'element', el);
                        return pending;
                    }
                    case 'text': {
                        const chunk = new Text(kIllegal, event, m);
                        await runAll(event.routes.map((i) => routes[i].handlers), 'text', chunk);
                        if (event.document) await runAll(documents, 'text', chunk);
                        return null;
                    }
                    case 'comment': {
                        const comment = new Comment(kIllegal, event, m);
                        await runAll(event.routes.map((i) => routes[i].handlers), 'comments', comment);
                        if (event.document) await runAll(documents, 'comments', comment);
                        return null;
                    }
                    case 'doctype':
                        await runAll(documents, 'doctype', new Doctype(kIllegal, event, m));
                        return null;
                    case 'endTag': {
                        const handlers = endTags.get(event.frame) || [];
                        endTags.delete(event.frame);
                        const tag = new EndTag(kIllegal, event, m);
                        for (const handler of handlers) await handler(tag);
                        return null;
                    }
                    case 'end':
                        await runAll(documents, 'end', new DocumentEnd(kIllegal, m));
                        return null;
                    default:
                        throw new TypeError(`unknown rewriter event '${event.type}'`);
                }
            }

            // Handle every ready event and emit what was produced.
            async function drain(controller) {
                for (;;) {
                    const event = ops.op_rewriter_next(rid, rw);
                    if (event === null) break;
                    const m = newMutations();
                    const pending = await dispatch(event, m);
                    const frame = ops.op_rewriter_apply(rid, rw, m);
                    if (frame !== null && pending && pending.length) endTags.set(frame, pending);
                }
                const out = ops.op_rewriter_output(rid, rw);
                if (out.byteLength === 0) return false;
                controller.enqueue(out);
                return true;
            }

            const body = new ReadableStream({
                async pull(controller) {
                    try {
                        for (;;) {
                            if (await drain(controller)) return;
                            if (inputDone || ops.op_rewriter_done(rid, rw)) {
                                close();
                                controller.close();
                                return;
                            }
                            const { value, done } = await reader.read();
                            if (done) {
                                inputDone = true;
                                ops.op_rewriter_end(rid, rw);
                            } else {
                                ops.op_rewriter_write(rid, rw, edge.chunkBytes(value));
                            }
                        }
                    } catch (err) {
                        close();
                        reader.cancel(err).catch(() => {});
                        throw err;
                    }
                },
                cancel(reason) {
                    close();
                    return reader.cancel(reason);
                },
            }, { highWaterMark: 0 });

            const headers = new Headers(response.headers);
            headers.delete('content-length');
            return new Response(body, { status: response.status, statusText: response.statusText, headers });
        }
    }

    globalThis.HTMLRewriter = HTMLRewriter;
})();
"#;
