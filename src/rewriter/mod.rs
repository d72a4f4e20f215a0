//! Streaming HTML rewriter.
//!
//! The rewriter is a pull-driven state machine: the caller feeds bytes, then
//! asks for the next [`Event`] that needs a handler. Tokens nobody listens to
//! are copied to the output without stopping. When an event is returned the
//! rewriter waits for the matching [`Mutations`] before tokenizing further,
//! which lets handlers run asynchronously between the two calls.
//!
//! Content inserted with `html: true` is queued as a nested input and goes
//! through the same matching as the document, so routes also fire on
//! elements a handler inserted.

pub mod selector;
pub mod tokenizer;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use selector::{ElementInfo, Selector, SiblingTree};
use tokenizer::{escape_attr, escape_text, Attribute, Token, Tokenizer};

const VOID_ELEMENTS: [&str; 14] = [
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source", "track", "wbr",
];

const HTML_NS: &str = "http://www.w3.org/1999/xhtml";
const SVG_NS: &str = "http://www.w3.org/2000/svg";
const MATHML_NS: &str = "http://www.w3.org/1998/Math/MathML";

#[derive(Debug, Error)]
pub enum RewriterError {
    #[error("invalid selector '{selector}': {reason}")]
    InvalidSelector { selector: String, reason: String },
    #[error("a handler event is still waiting for its result")]
    EventPending,
    #[error("no handler event is waiting for a result")]
    NoPendingEvent,
    #[error("the rewriter input has already ended")]
    Ended,
}

/// A selector plus the handler kinds registered for it.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteSpec {
    pub selector: String,
    #[serde(default)]
    pub element: bool,
    #[serde(default)]
    pub text: bool,
    #[serde(default)]
    pub comments: bool,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct DocumentHandlers {
    #[serde(default)]
    pub doctype: bool,
    #[serde(default)]
    pub text: bool,
    #[serde(default)]
    pub comments: bool,
    #[serde(default)]
    pub end: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    Element {
        routes: Vec<usize>,
        #[serde(rename = "tagName")]
        tag_name: String,
        attrs: Vec<(String, String)>,
        #[serde(rename = "selfClosing")]
        self_closing: bool,
        #[serde(rename = "canHaveContent")]
        can_have_content: bool,
        #[serde(rename = "namespaceURI")]
        namespace_uri: &'static str,
    },
    Text {
        routes: Vec<usize>,
        document: bool,
        text: String,
        #[serde(rename = "lastInTextNode")]
        last_in_text_node: bool,
    },
    Comment {
        routes: Vec<usize>,
        document: bool,
        text: String,
    },
    Doctype {
        name: Option<String>,
        #[serde(rename = "publicId")]
        public_id: Option<String>,
        #[serde(rename = "systemId")]
        system_id: Option<String>,
    },
    EndTag {
        frame: u64,
        name: String,
    },
    End,
}

/// Inserted content; escaped unless `html` is set.
#[derive(Debug, Clone, Deserialize)]
pub struct Content {
    pub content: String,
    #[serde(default)]
    pub html: bool,
}

impl Content {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            html: false,
        }
    }

    pub fn html(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            html: true,
        }
    }
}

/// What the handlers did with the last event.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Mutations {
    pub before: Vec<Content>,
    pub after: Vec<Content>,
    pub prepend: Vec<Content>,
    pub append: Vec<Content>,
    pub inner: Option<Content>,
    pub replace: Option<Content>,
    pub removed: bool,
    pub keep_content: bool,
    pub tag_name: Option<String>,
    pub attrs: Option<Vec<(String, String)>>,
    /// New comment text.
    pub text: Option<String>,
    pub end_tag_handlers: bool,
}

/// Input source id of the document itself.
const DOCUMENT: u64 = 0;

/// Injected markup nested deeper than this is written verbatim.
const MAX_INJECTION_DEPTH: usize = 64;

#[derive(Debug)]
struct Frame {
    id: u64,
    /// Name as parsed, used to match the end tag.
    name: String,
    /// Name written to the output.
    out_name: String,
    routes: Vec<usize>,
    namespace: &'static str,
    /// Input the start tag came from; only its end tags close the frame.
    source: u64,
    removed: bool,
    suppress_children: bool,
    suppress_end: bool,
    end_tag_handlers: bool,
    append: Vec<Content>,
    after: Vec<Content>,
}

impl Frame {
    fn plain(id: u64, name: String, routes: Vec<usize>, namespace: &'static str, source: u64) -> Self {
        Self {
            id,
            out_name: name.clone(),
            name,
            routes,
            namespace,
            source,
            removed: false,
            suppress_children: false,
            suppress_end: false,
            end_tag_handlers: false,
            append: Vec::new(),
            after: Vec::new(),
        }
    }
}

#[derive(Debug)]
enum Pending {
    Element {
        name: String,
        attrs: Vec<Attribute>,
        self_closing: bool,
        raw: String,
        routes: Vec<usize>,
        namespace: &'static str,
        source: u64,
        void: bool,
    },
    Text(String),
    Comment(String),
    Doctype(String),
    EndTag { frame: Frame, raw: String },
    End,
}

/// Work queued ahead of the document tokenizer. The last entry runs first.
enum Input {
    /// Serialized output.
    Raw(String),
    /// Injected `html` content, tokenized and matched like the document.
    Markup { source: u64, tokenizer: Tokenizer },
    Open(Frame),
    /// Close the innermost frame, with its end tag as written if it had one.
    Close(Option<String>),
}

pub struct Rewriter {
    routes: Vec<(Selector, RouteSpec)>,
    document: DocumentHandlers,
    tokenizer: Tokenizer,
    tree: SiblingTree,
    stack: Vec<Frame>,
    out: String,
    inputs: Vec<Input>,
    /// Output produced while handling one token or result, in order. Moved
    /// onto `inputs` before the next token is read.
    staged: Vec<Input>,
    /// Sources with a handled text node that has not seen its last chunk.
    open_text: Vec<u64>,
    pending: Option<Pending>,
    next_frame: u64,
    next_source: u64,
    end_handled: bool,
    finished: bool,
}

impl Rewriter {
    pub fn new(routes: Vec<RouteSpec>, document: DocumentHandlers) -> Result<Self, RewriterError> {
        let routes = routes
            .into_iter()
            .map(|spec| Ok((Selector::parse(&spec.selector)?, spec)))
            .collect::<Result<Vec<_>, RewriterError>>()?;
        Ok(Self {
            routes,
            document,
            tokenizer: Tokenizer::new(),
            tree: SiblingTree::default(),
            stack: Vec::new(),
            out: String::new(),
            inputs: Vec::new(),
            staged: Vec::new(),
            open_text: Vec::new(),
            pending: None,
            next_frame: 1,
            next_source: DOCUMENT + 1,
            end_handled: false,
            finished: false,
        })
    }

    pub fn write(&mut self, chunk: &[u8]) -> Result<(), RewriterError> {
        if self.tokenizer.is_ended() {
            return Err(RewriterError::Ended);
        }
        self.tokenizer.feed(chunk);
        Ok(())
    }

    pub fn end(&mut self) {
        self.tokenizer.end();
    }

    /// True once the input has ended and every event has been handled.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out).into_bytes()
    }

    fn frame_id(&mut self) -> u64 {
        let id = self.next_frame;
        self.next_frame += 1;
        id
    }

    /// Whether tokens from `source` fall inside a removed or replaced element.
    fn suppressed_in(&self, source: u64) -> bool {
        self.stack.iter().any(|f| f.suppress_children && f.source == source)
    }

    fn content_routes(&self, want: impl Fn(&RouteSpec) -> bool) -> Vec<usize> {
        let mut routes: Vec<usize> = Vec::new();
        for frame in &self.stack {
            for &r in &frame.routes {
                if want(&self.routes[r].1) && !routes.contains(&r) {
                    routes.push(r);
                }
            }
        }
        routes
    }

    fn emit(&mut self, s: &str) {
        if s.is_empty() {
            return;
        }
        if self.staged.is_empty() {
            self.out.push_str(s);
        } else {
            self.staged.push(Input::Raw(s.to_string()));
        }
    }

    fn inject(&mut self, items: &[Content]) {
        for item in items {
            if !item.html {
                self.emit(&escape_text(&item.content));
                continue;
            }
            if item.content.is_empty() {
                continue;
            }
            let depth = self.inputs.iter().filter(|i| matches!(i, Input::Markup { .. })).count();
            if depth >= MAX_INJECTION_DEPTH {
                self.emit(&item.content);
                continue;
            }
            let source = self.next_source;
            self.next_source += 1;
            self.staged.push(Input::Markup {
                source,
                tokenizer: Tokenizer::complete(&item.content),
            });
        }
    }

    fn inject_inside(&mut self, prepend: &[Content], inner: Option<Content>) {
        self.inject(prepend);
        if let Some(inner) = inner {
            self.inject(&[inner]);
        }
    }

    fn open(&mut self, frame: Frame) {
        if self.staged.is_empty() {
            self.stack.push(frame);
        } else {
            self.staged.push(Input::Open(frame));
        }
    }

    fn unread(&mut self, source: u64, token: Token) {
        if source == DOCUMENT {
            self.tokenizer.unread(token);
        } else if let Some(Input::Markup { tokenizer, .. }) = self.inputs.last_mut() {
            tokenizer.unread(token);
        }
    }

    /// Close the text node open in `source` with an empty last chunk.
    fn end_text_node(&mut self, source: u64) -> Option<Event> {
        let at = self.open_text.iter().rposition(|&s| s == source)?;
        self.open_text.remove(at);
        self.pending = Some(Pending::Text(String::new()));
        Some(Event::Text {
            routes: self.content_routes(|r| r.text),
            document: self.document.text,
            text: String::new(),
            last_in_text_node: true,
        })
    }

    /// Advance to the next event that needs a handler. `None` means more
    /// input is required, or the document is finished.
    pub fn next_event(&mut self) -> Result<Option<Event>, RewriterError> {
        if self.pending.is_some() {
            return Err(RewriterError::EventPending);
        }
        while !self.finished {
            while let Some(input) = self.staged.pop() {
                self.inputs.push(input);
            }
            let (token, source) = match self.inputs.pop() {
                Some(Input::Raw(s)) => {
                    self.out.push_str(&s);
                    continue;
                }
                Some(Input::Open(frame)) => {
                    self.stack.push(frame);
                    continue;
                }
                Some(Input::Close(raw_end)) => match self.close_top(raw_end) {
                    Some(event) => return Ok(Some(event)),
                    None => continue,
                },
                Some(Input::Markup { source, mut tokenizer }) => match tokenizer.next_token() {
                    Some(token) => {
                        self.inputs.push(Input::Markup { source, tokenizer });
                        (token, source)
                    }
                    None => {
                        if let Some(event) = self.end_text_node(source) {
                            self.inputs.push(Input::Markup { source, tokenizer });
                            return Ok(Some(event));
                        }
                        let open = self.stack.iter().rev().take_while(|f| f.source == source).count();
                        self.staged.extend((0..open).map(|_| Input::Close(None)));
                        continue;
                    }
                },
                None => match self.tokenizer.next_token() {
                    Some(token) => (token, DOCUMENT),
                    None => {
                        if !self.tokenizer.is_drained() {
                            return Ok(None);
                        }
                        if let Some(event) = self.end_text_node(DOCUMENT) {
                            return Ok(Some(event));
                        }
                        if !self.stack.is_empty() {
                            let open = self.stack.len();
                            self.staged.extend((0..open).map(|_| Input::Close(None)));
                            continue;
                        }
                        if self.document.end && !self.end_handled {
                            self.pending = Some(Pending::End);
                            return Ok(Some(Event::End));
                        }
                        self.finished = true;
                        break;
                    }
                },
            };
            if !matches!(token, Token::Text(_)) && self.open_text.contains(&source) {
                self.unread(source, token);
                if let Some(event) = self.end_text_node(source) {
                    return Ok(Some(event));
                }
                continue;
            }
            if let Some(event) = self.on_token(token, source) {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    fn on_token(&mut self, token: Token, source: u64) -> Option<Event> {
        match token {
            Token::StartTag {
                name,
                attrs,
                self_closing,
                raw,
            } => self.on_start_tag(name, attrs, self_closing, raw, source),
            Token::EndTag { name, raw } => {
                self.on_end_tag(&name, raw, source);
                None
            }
            Token::Text(text) => {
                if self.suppressed_in(source) {
                    return None;
                }
                let routes = self.content_routes(|r| r.text);
                if routes.is_empty() && !self.document.text {
                    self.emit(&text);
                    return None;
                }
                if !self.open_text.contains(&source) {
                    self.open_text.push(source);
                }
                self.pending = Some(Pending::Text(text.clone()));
                Some(Event::Text {
                    routes,
                    document: self.document.text,
                    text,
                    last_in_text_node: false,
                })
            }
            Token::Comment { text, raw } => {
                if self.suppressed_in(source) {
                    return None;
                }
                let routes = self.content_routes(|r| r.comments);
                if routes.is_empty() && !self.document.comments {
                    self.emit(&raw);
                    return None;
                }
                self.pending = Some(Pending::Comment(raw));
                Some(Event::Comment {
                    routes,
                    document: self.document.comments,
                    text,
                })
            }
            Token::Doctype {
                name,
                public_id,
                system_id,
                raw,
            } => {
                if self.suppressed_in(source) {
                    return None;
                }
                if !self.document.doctype {
                    self.emit(&raw);
                    return None;
                }
                self.pending = Some(Pending::Doctype(raw));
                Some(Event::Doctype {
                    name,
                    public_id,
                    system_id,
                })
            }
        }
    }

    fn on_start_tag(
        &mut self,
        name: String,
        attrs: Vec<Attribute>,
        self_closing: bool,
        raw: String,
        source: u64,
    ) -> Option<Event> {
        let depth = self.stack.len();
        let info = ElementInfo {
            name: name.clone(),
            attrs: attrs
                .iter()
                .map(|a| (a.name.clone(), a.value.clone().unwrap_or_default()))
                .collect(),
        };
        self.tree.push(depth, info.clone());
        let void = self_closing || VOID_ELEMENTS.contains(&name.as_str());
        let namespace = match name.as_str() {
            "svg" => SVG_NS,
            "math" => MATHML_NS,
            _ => self.stack.last().map_or(HTML_NS, |f| f.namespace),
        };

        if self.suppressed_in(source) {
            if !void {
                let mut frame = Frame::plain(self.frame_id(), name, Vec::new(), namespace, source);
                frame.suppress_children = true;
                frame.suppress_end = true;
                self.stack.push(frame);
            }
            return None;
        }

        let matched: Vec<usize> = (0..self.routes.len())
            .filter(|&i| self.routes[i].0.matches(&self.tree, depth))
            .collect();
        let element_routes: Vec<usize> = matched.iter().copied().filter(|&i| self.routes[i].1.element).collect();
        let content_routes: Vec<usize> = matched
            .into_iter()
            .filter(|&i| self.routes[i].1.text || self.routes[i].1.comments)
            .collect();

        if element_routes.is_empty() {
            self.emit(&raw);
            if !void {
                let frame = Frame::plain(self.frame_id(), name, content_routes, namespace, source);
                self.stack.push(frame);
            }
            return None;
        }

        self.pending = Some(Pending::Element {
            name: name.clone(),
            attrs,
            self_closing,
            raw,
            routes: content_routes,
            namespace,
            source,
            void,
        });
        Some(Event::Element {
            routes: element_routes,
            tag_name: name,
            attrs: info.attrs,
            self_closing,
            can_have_content: !void,
            namespace_uri: namespace,
        })
    }

    /// Queue closes for the matching frame and any left open inside it.
    fn on_end_tag(&mut self, name: &str, raw: String, source: u64) {
        let Some(pos) = self.stack.iter().rposition(|f| f.source == source && f.name == name) else {
            if !self.suppressed_in(source) {
                self.emit(&raw);
            }
            return;
        };
        let unclosed = self.stack.len() - pos - 1;
        self.staged.extend((0..unclosed).map(|_| Input::Close(None)));
        self.staged.push(Input::Close(Some(raw)));
    }

    /// Close the innermost frame. Appended markup is matched while the
    /// frame is still open, so the close is queued again behind it.
    fn close_top(&mut self, raw_end: Option<String>) -> Option<Event> {
        let top = self.stack.last_mut()?;
        let append = if top.removed {
            Vec::new()
        } else {
            std::mem::take(&mut top.append)
        };
        self.inject(&append);
        if !self.staged.is_empty() {
            self.staged.push(Input::Close(raw_end));
            return None;
        }
        let frame = self.stack.pop()?;
        self.tree.close(self.stack.len());
        if self.suppressed_in(frame.source) {
            return None;
        }
        match raw_end {
            Some(raw) if frame.end_tag_handlers && !frame.removed => {
                let event = Event::EndTag {
                    frame: frame.id,
                    name: frame.out_name.clone(),
                };
                self.pending = Some(Pending::EndTag { frame, raw });
                Some(event)
            }
            raw_end => {
                self.finish_frame(frame, raw_end);
                None
            }
        }
    }

    /// Emit the end tag and trailing content of a popped frame.
    fn finish_frame(&mut self, frame: Frame, raw_end: Option<String>) {
        if let (false, Some(raw)) = (frame.suppress_end, raw_end) {
            if frame.out_name == frame.name {
                self.emit(&raw);
            } else {
                self.emit(&format!("</{}>", frame.out_name));
            }
        }
        self.inject(&frame.after);
    }

    /// Apply handler results for the pending event. For an element that
    /// opens a frame, returns the frame id later reported by its `EndTag`.
    pub fn apply(&mut self, m: Mutations) -> Result<Option<u64>, RewriterError> {
        let pending = self.pending.take().ok_or(RewriterError::NoPendingEvent)?;
        let mut opened = None;
        match pending {
            Pending::Element {
                name,
                attrs,
                self_closing,
                raw,
                routes,
                namespace,
                source,
                void,
            } => {
                let Mutations {
                    before,
                    after,
                    prepend,
                    append,
                    inner,
                    removed,
                    keep_content,
                    tag_name,
                    attrs: new_attrs,
                    end_tag_handlers,
                    ..
                } = m;
                self.inject(&before);
                let out_name = tag_name
                    .as_deref()
                    .map(str::to_ascii_lowercase)
                    .unwrap_or_else(|| name.clone());
                if !removed && !keep_content {
                    if tag_name.is_some() || new_attrs.is_some() {
                        let attrs = new_attrs.unwrap_or_else(|| {
                            attrs
                                .into_iter()
                                .map(|a| (a.name, a.value.unwrap_or_default()))
                                .collect()
                        });
                        self.emit(&serialize_start_tag(&out_name, &attrs, self_closing));
                    } else {
                        self.emit(&raw);
                    }
                }
                if void {
                    if !removed {
                        self.inject_inside(&prepend, inner);
                    }
                    self.inject(&after);
                } else {
                    let id = self.frame_id();
                    opened = Some(id);
                    self.open(Frame {
                        id,
                        name,
                        out_name,
                        routes,
                        namespace,
                        source,
                        removed,
                        suppress_children: removed || inner.is_some(),
                        suppress_end: removed || keep_content,
                        end_tag_handlers,
                        append,
                        after,
                    });
                    if !removed {
                        self.inject_inside(&prepend, inner);
                    }
                }
            }
            Pending::Text(text) => {
                self.inject(&m.before);
                if !m.removed {
                    match m.replace {
                        Some(content) => self.inject(&[content]),
                        None => self.emit(&text),
                    }
                }
                self.inject(&m.after);
            }
            Pending::Comment(raw) => {
                self.inject(&m.before);
                if !m.removed {
                    match (m.replace, &m.text) {
                        (Some(content), _) => self.inject(&[content]),
                        (None, Some(text)) => self.emit(&format!("<!--{text}-->")),
                        (None, None) => self.emit(&raw),
                    }
                }
                self.inject(&m.after);
            }
            Pending::Doctype(raw) => {
                if !m.removed {
                    self.emit(&raw);
                }
            }
            Pending::EndTag { mut frame, raw } => {
                if let Some(name) = &m.tag_name {
                    frame.out_name = name.to_ascii_lowercase();
                }
                self.inject(&m.before);
                if m.removed {
                    frame.suppress_end = true;
                }
                let mut after = m.after;
                after.append(&mut frame.after);
                frame.after = after;
                self.finish_frame(frame, Some(raw));
            }
            Pending::End => {
                self.inject(&m.append);
                self.end_handled = true;
            }
        }
        Ok(opened)
    }
}

fn serialize_start_tag(name: &str, attrs: &[(String, String)], self_closing: bool) -> String {
    let mut out = format!("<{name}");
    for (attr, value) in attrs {
        out.push(' ');
        out.push_str(attr);
        if !value.is_empty() {
            out.push_str(&format!("=\"{}\"", escape_attr(value)));
        }
    }
    out.push_str(if self_closing { " />" } else { ">" });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(selector: &str) -> RouteSpec {
        RouteSpec {
            selector: selector.into(),
            element: true,
            text: false,
            comments: false,
        }
    }

    fn run(
        chunks: &[&str],
        routes: Vec<RouteSpec>,
        document: DocumentHandlers,
        mut handle: impl FnMut(&Event) -> Mutations,
    ) -> String {
        let mut rw = Rewriter::new(routes, document).unwrap();
        let mut out = Vec::new();
        let mut drain = |rw: &mut Rewriter, out: &mut Vec<u8>| {
            while let Some(event) = rw.next_event().unwrap() {
                let m = handle(&event);
                rw.apply(m).unwrap();
            }
            out.extend(rw.take_output());
        };
        for chunk in chunks {
            rw.write(chunk.as_bytes()).unwrap();
            drain(&mut rw, &mut out);
        }
        rw.end();
        drain(&mut rw, &mut out);
        assert!(rw.is_finished());
        String::from_utf8(out).unwrap()
    }

    fn with_attr(event: &Event, name: &str, value: &str) -> Mutations {
        let Event::Element { attrs, .. } = event else { panic!("expected an element event") };
        let mut attrs = attrs.clone();
        attrs.retain(|(n, _)| n != name);
        attrs.push((name.into(), value.into()));
        Mutations {
            attrs: Some(attrs),
            ..Default::default()
        }
    }

    #[test]
    fn child_combinator_sets_attribute_on_direct_child_only() {
        let out = run(
            &["<div><p>a</p><span><p>b</p></span></div>"],
            vec![route("div > p")],
            DocumentHandlers::default(),
            |e| with_attr(e, "class", "m"),
        );
        assert_eq!(out, "<div><p class=\"m\">a</p><span><p>b</p></span></div>");
    }

    #[test]
    fn untouched_markup_is_byte_identical() {
        let html = "<!doctype html><html><body class=x><!-- c --><img src=a.png><p>t &amp; u</p></body></html>";
        let out = run(&[&html[..17], &html[17..40], &html[40..]], vec![route("span")], DocumentHandlers::default(), |_| {
            Mutations::default()
        });
        assert_eq!(out, html);
    }

    #[test]
    fn remove_drops_element_and_content() {
        let out = run(
            &["<ul><li class=ad>x<b>y</b></li><li>z</li></ul>"],
            vec![route("li.ad")],
            DocumentHandlers::default(),
            |_| Mutations {
                removed: true,
                after: vec![Content::html("<!--gone-->")],
                ..Default::default()
            },
        );
        assert_eq!(out, "<ul><!--gone--><li>z</li></ul>");
    }

    #[test]
    fn content_insertion_and_escaping() {
        let out = run(
            &["<p>old</p>"],
            vec![route("p")],
            DocumentHandlers::default(),
            |_| Mutations {
                before: vec![Content::text("<b>")],
                after: vec![Content::html("<hr>")],
                inner: Some(Content::text("1 < 2")),
                append: vec![Content::html("<i>!</i>")],
                ..Default::default()
            },
        );
        assert_eq!(out, "&lt;b&gt;<p>1 &lt; 2<i>!</i></p><hr>");
    }

    #[test]
    fn rename_and_keep_content() {
        let out = run(
            &["<b>bold</b><em>e</em>"],
            vec![route("b"), route("em")],
            DocumentHandlers::default(),
            |e| match e {
                Event::Element { tag_name, .. } if tag_name == "b" => Mutations {
                    tag_name: Some("STRONG".into()),
                    ..Default::default()
                },
                _ => Mutations {
                    keep_content: true,
                    ..Default::default()
                },
            },
        );
        assert_eq!(out, "<strong>bold</strong>e");
    }

    #[test]
    fn text_comment_and_document_handlers() {
        let routes = vec![RouteSpec {
            selector: "h1".into(),
            element: false,
            text: true,
            comments: false,
        }];
        let document = DocumentHandlers {
            comments: true,
            end: true,
            ..Default::default()
        };
        let out = run(&["<h1>hi</h1><p>x</p><!--c-->"], routes, document, |e| match e {
            Event::Text { routes, text, .. } => {
                assert_eq!(routes, &vec![0]);
                Mutations {
                    replace: Some(Content::text(text.to_uppercase())),
                    ..Default::default()
                }
            }
            Event::Comment { document, .. } => {
                assert!(*document);
                Mutations {
                    text: Some("d".into()),
                    ..Default::default()
                }
            }
            Event::End => Mutations {
                append: vec![Content::html("<footer></footer>")],
                ..Default::default()
            },
            other => panic!("unexpected event {other:?}"),
        });
        assert_eq!(out, "<h1>HI</h1><p>x</p><!--d--><footer></footer>");
    }

    #[test]
    fn end_tag_handlers_run_at_close() {
        let out = run(
            &["<div>a</div>"],
            vec![route("div")],
            DocumentHandlers::default(),
            |e| match e {
                Event::Element { .. } => Mutations {
                    end_tag_handlers: true,
                    ..Default::default()
                },
                Event::EndTag { name, .. } => {
                    assert_eq!(name, "div");
                    Mutations {
                        before: vec![Content::html("<span>!</span>")],
                        after: vec![Content::text("&")],
                        ..Default::default()
                    }
                }
                other => panic!("unexpected event {other:?}"),
            },
        );
        assert_eq!(out, "<div>a<span>!</span></div>&amp;");
    }

    #[test]
    fn void_elements_do_not_nest() {
        let out = run(
            &["<p><img src=x><br>t</p>"],
            vec![route("p > br")],
            DocumentHandlers::default(),
            |e| with_attr(e, "data-n", "1"),
        );
        assert_eq!(out, "<p><img src=x><br data-n=\"1\">t</p>");
    }

    #[test]
    fn waits_for_result_before_continuing() {
        let mut rw = Rewriter::new(vec![route("a")], DocumentHandlers::default()).unwrap();
        rw.write(b"<a>x</a><a>y</a>").unwrap();
        rw.end();
        assert!(rw.next_event().unwrap().is_some());
        assert!(matches!(rw.next_event(), Err(RewriterError::EventPending)));
        rw.apply(Mutations::default()).unwrap();
        assert!(matches!(rw.apply(Mutations::default()), Err(RewriterError::NoPendingEvent)));
        assert!(matches!(rw.write(b"more"), Err(RewriterError::Ended)));
    }

    #[test]
    fn end_tag_event_names_the_opened_frame() {
        let mut rw = Rewriter::new(vec![route("div")], DocumentHandlers::default()).unwrap();
        rw.write(b"<div></div><div></div>").unwrap();
        rw.end();
        assert!(matches!(rw.next_event().unwrap(), Some(Event::Element { .. })));
        let opened = rw
            .apply(Mutations {
                end_tag_handlers: true,
                ..Default::default()
            })
            .unwrap();
        assert!(opened.is_some());
        match rw.next_event().unwrap() {
            Some(Event::EndTag { frame, .. }) => assert_eq!(Some(frame), opened),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(rw.apply(Mutations::default()).unwrap(), None);
        assert!(matches!(rw.next_event().unwrap(), Some(Event::Element { .. })));
        let second = rw.apply(Mutations::default()).unwrap();
        assert_ne!(second, opened);
    }

    #[test]
    fn injected_markup_is_matched() {
        let out = run(
            &["<div></div>"],
            vec![route("div"), route("div > p")],
            DocumentHandlers::default(),
            |e| match e {
                Event::Element { tag_name, .. } if tag_name == "div" => Mutations {
                    append: vec![Content::html("<p>x</p>")],
                    ..Default::default()
                },
                other => with_attr(other, "class", "m"),
            },
        );
        assert_eq!(out, "<div><p class=\"m\">x</p></div>");
    }

    #[test]
    fn inner_markup_replaces_children_and_is_matched() {
        let out = run(
            &["<div><span>old</span></div>"],
            vec![route("div"), route("p")],
            DocumentHandlers::default(),
            |e| match e {
                Event::Element { tag_name, .. } if tag_name == "div" => Mutations {
                    inner: Some(Content::html("<p>new</p>")),
                    ..Default::default()
                },
                other => with_attr(other, "class", "m"),
            },
        );
        assert_eq!(out, "<div><p class=\"m\">new</p></div>");
    }

    #[test]
    fn before_markup_is_a_sibling() {
        let out = run(
            &["<section><div>a</div></section>"],
            vec![route("div"), route("section > p")],
            DocumentHandlers::default(),
            |e| match e {
                Event::Element { tag_name, .. } if tag_name == "div" => Mutations {
                    before: vec![Content::html("<p>b</p>")],
                    ..Default::default()
                },
                other => with_attr(other, "class", "m"),
            },
        );
        assert_eq!(out, "<section><p class=\"m\">b</p><div>a</div></section>");
    }

    #[test]
    fn self_injecting_handler_terminates() {
        let out = run(&["<p></p>"], vec![route("p")], DocumentHandlers::default(), |_| Mutations {
            append: vec![Content::html("<p></p>")],
            ..Default::default()
        });
        let opened = out.matches("<p>").count();
        assert_eq!(opened, out.matches("</p>").count());
        assert!(opened > MAX_INJECTION_DEPTH, "{opened}");
    }

    fn text_route(selector: &str) -> RouteSpec {
        RouteSpec {
            selector: selector.into(),
            element: false,
            text: true,
            comments: false,
        }
    }

    fn text_chunks(chunks: &[&str], selector: &str) -> (String, Vec<(String, bool)>) {
        let mut seen = Vec::new();
        let out = run(chunks, vec![text_route(selector)], DocumentHandlers::default(), |e| {
            if let Event::Text { text, last_in_text_node, .. } = e {
                seen.push((text.clone(), *last_in_text_node));
            }
            Mutations::default()
        });
        (out, seen)
    }

    #[test]
    fn split_text_node_marks_only_the_final_chunk() {
        let (out, seen) = text_chunks(&["<p>a < b</p><p>c</p>"], "p");
        assert_eq!(out, "<p>a < b</p><p>c</p>");
        let expected = [("a ", false), ("< b", false), ("", true), ("c", false), ("", true)];
        let expected: Vec<(String, bool)> = expected.iter().map(|(t, l)| (t.to_string(), *l)).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn script_text_across_writes_is_one_node() {
        let (out, seen) = text_chunks(&["<script>let a = 1;", "let b = 2;</script>"], "script");
        assert_eq!(out, "<script>let a = 1;let b = 2;</script>");
        let (last, chunks) = seen.split_last().unwrap();
        assert_eq!(last, &(String::new(), true));
        assert!(chunks.len() >= 2, "{seen:?}");
        assert!(chunks.iter().all(|(_, l)| !l));
        let text: String = chunks.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(text, "let a = 1;let b = 2;");
    }

    #[test]
    fn text_node_open_at_end_of_input_is_closed() {
        let (_, seen) = text_chunks(&["<p>tail"], "p");
        assert_eq!(seen, vec![("tail".to_string(), false), (String::new(), true)]);
    }

    #[test]
    fn keep_content_still_runs_end_tag_handlers() {
        let out = run(
            &["<div id=w><p>a</p></div>"],
            vec![route("div")],
            DocumentHandlers::default(),
            |e| match e {
                Event::Element { .. } => Mutations {
                    keep_content: true,
                    end_tag_handlers: true,
                    ..Default::default()
                },
                Event::EndTag { .. } => Mutations {
                    after: vec![Content::html("<!--/w-->")],
                    ..Default::default()
                },
                other => panic!("unexpected event {other:?}"),
            },
        );
        assert_eq!(out, "<p>a</p><!--/w-->");
    }

    #[test]
    fn invalid_selector_is_rejected() {
        assert!(matches!(
            Rewriter::new(vec![route("p:first-child")], DocumentHandlers::default()),
            Err(RewriterError::InvalidSelector { .. })
        ));
    }
}
