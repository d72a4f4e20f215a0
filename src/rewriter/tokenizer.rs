//! Incremental HTML tokenizer.
//!
//! Input arrives in arbitrary byte chunks; a token is only produced once it
//! is complete (or the input has ended). Text and markup are kept verbatim so
//! untouched tokens re-serialize byte for byte.

use std::collections::VecDeque;

/// Elements whose content is not markup.
const RAW_TEXT: [&str; 5] = ["script", "style", "textarea", "title", "xmp"];

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    /// Entity-decoded value; `None` for a bare attribute.
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    StartTag {
        name: String,
        attrs: Vec<Attribute>,
        self_closing: bool,
        raw: String,
    },
    EndTag {
        name: String,
        raw: String,
    },
    Text(String),
    Comment {
        text: String,
        raw: String,
    },
    Doctype {
        name: Option<String>,
        public_id: Option<String>,
        system_id: Option<String>,
        raw: String,
    },
}

#[derive(Default)]
pub struct Tokenizer {
    bytes: Vec<u8>,
    buf: String,
    pos: usize,
    ended: bool,
    /// Closing tag name while inside a raw text element.
    raw_text_end: Option<String>,
    queue: VecDeque<Token>,
}

impl Tokenizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A tokenizer over a complete piece of markup.
    pub fn complete(markup: &str) -> Self {
        Self {
            buf: markup.to_string(),
            ended: true,
            ..Self::default()
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
        let valid = match std::str::from_utf8(&self.bytes) {
            Ok(s) => s.len(),
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            // Invalid sequence in the middle: decode lossily.
            Err(_) => self.bytes.len(),
        };
        let decoded = String::from_utf8_lossy(&self.bytes[..valid]).into_owned();
        self.bytes.drain(..valid);
        self.compact();
        self.buf.push_str(&decoded);
    }

    pub fn end(&mut self) {
        if !self.bytes.is_empty() {
            let rest = String::from_utf8_lossy(&self.bytes).into_owned();
            self.bytes.clear();
            self.buf.push_str(&rest);
        }
        self.ended = true;
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// True once every buffered byte has been turned into tokens.
    pub fn is_drained(&self) -> bool {
        self.ended && self.pos >= self.buf.len() && self.queue.is_empty()
    }

    fn compact(&mut self) {
        if self.pos > 0 && self.pos >= self.buf.len() / 2 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }

    fn rest(&self) -> &str {
        &self.buf[self.pos..]
    }

    /// Push a token back to be returned by the next [`Tokenizer::next_token`].
    pub fn unread(&mut self, token: Token) {
        self.queue.push_front(token);
    }

    /// Next complete token, or `None` when more input is needed.
    pub fn next_token(&mut self) -> Option<Token> {
        if let Some(token) = self.queue.pop_front() {
            return Some(token);
        }
        if self.pos >= self.buf.len() {
            return None;
        }
        if let Some(end) = self.raw_text_end.clone() {
            return self.raw_text(&end);
        }
        let rest = self.rest();
        if !rest.starts_with('<') {
            let len = rest.find('<').unwrap_or(rest.len());
            if len == rest.len() && !self.ended {
                // Text may continue in the next chunk.
                return None;
            }
            return Some(Token::Text(self.advance(len)));
        }
        match self.markup() {
            Markup::Token(token) => Some(token),
            Markup::Incomplete if self.ended => {
                let len = self.rest().len();
                Some(Token::Text(self.advance(len)))
            }
            Markup::Incomplete => None,
            Markup::NotMarkup => {
                // A lone '<' is text; take it with whatever text follows.
                let rest = &self.rest()[1..];
                let len = 1 + rest.find('<').unwrap_or(rest.len());
                Some(Token::Text(self.advance(len)))
            }
        }
    }

    fn advance(&mut self, len: usize) -> String {
        let out = self.buf[self.pos..self.pos + len].to_string();
        self.pos += len;
        out
    }

    fn raw_text(&mut self, end: &str) -> Option<Token> {
        let rest = self.rest();
        let needle = format!("</{end}");
        let lower = rest.to_ascii_lowercase();
        let mut from = 0;
        loop {
            match lower[from..].find(&needle) {
                Some(i) => {
                    let at = from + i;
                    let after = lower.as_bytes().get(at + needle.len()).copied();
                    match after {
                        Some(b'>' | b'/' | b' ' | b'\t' | b'\n' | b'\r' | b'\x0c') => {
                            self.raw_text_end = None;
                            if at == 0 {
                                return self.next_token();
                            }
                            return Some(Token::Text(self.advance(at)));
                        }
                        None if !self.ended => {
                            // Could still become the closing tag.
                            return (at > 0).then(|| Token::Text(self.advance(at)));
                        }
                        _ => from = at + needle.len(),
                    }
                }
                None if self.ended => {
                    let len = rest.len();
                    self.raw_text_end = None;
                    return (len > 0).then(|| Token::Text(self.advance(len)));
                }
                None => {
                    // Keep a tail that might be the start of the closing tag.
                    let keep = needle.len().min(rest.len());
                    let mut cut = rest.len() - keep;
                    while !rest.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    return (cut > 0).then(|| Token::Text(self.advance(cut)));
                }
            }
        }
    }

    fn markup(&mut self) -> Markup {
        let rest = self.rest();
        let bytes = rest.as_bytes();
        if rest.len() < 2 {
            return if self.ended { Markup::NotMarkup } else { Markup::Incomplete };
        }
        if rest.starts_with("<!--") {
            return match rest[4..].find("-->") {
                Some(i) => {
                    let raw = self.advance(4 + i + 3);
                    let text = raw[4..raw.len() - 3].to_string();
                    Markup::Token(Token::Comment { text, raw })
                }
                None => Markup::Incomplete,
            };
        }
        if "<!--".starts_with(rest) && !self.ended {
            return Markup::Incomplete;
        }
        if bytes[1] == b'!' || bytes[1] == b'?' {
            let Some(i) = rest.find('>') else {
                return Markup::Incomplete;
            };
            let raw = self.advance(i + 1);
            let inner = &raw[2..raw.len() - 1];
            if inner.len() >= 7 && inner[..7].eq_ignore_ascii_case("doctype") {
                return Markup::Token(parse_doctype(&inner[7..], raw.clone()));
            }
            return Markup::Token(Token::Comment {
                text: inner.to_string(),
                raw,
            });
        }
        if bytes[1] == b'/' {
            if rest.len() < 3 {
                return if self.ended { Markup::NotMarkup } else { Markup::Incomplete };
            }
            if !bytes[2].is_ascii_alphabetic() {
                return Markup::NotMarkup;
            }
            let Some(i) = rest.find('>') else {
                return Markup::Incomplete;
            };
            let raw = self.advance(i + 1);
            let name: String = raw[2..raw.len() - 1]
                .chars()
                .take_while(|c| !c.is_ascii_whitespace() && *c != '/')
                .collect::<String>()
                .to_ascii_lowercase();
            return Markup::Token(Token::EndTag { name, raw });
        }
        if !bytes[1].is_ascii_alphabetic() {
            return Markup::NotMarkup;
        }
        let Some(end) = find_tag_end(rest) else {
            return Markup::Incomplete;
        };
        let raw = self.advance(end + 1);
        let (name, attrs, self_closing) = parse_start_tag(&raw[1..raw.len() - 1]);
        if RAW_TEXT.contains(&name.as_str()) && !self_closing {
            self.raw_text_end = Some(name.clone());
        }
        Markup::Token(Token::StartTag {
            name,
            attrs,
            self_closing,
            raw,
        })
    }
}

enum Markup {
    Token(Token),
    Incomplete,
    NotMarkup,
}

/// Index of the `>` closing a start tag, skipping quoted attribute values.
fn find_tag_end(s: &str) -> Option<usize> {
    let mut quote: Option<u8> = None;
    for (i, b) in s.bytes().enumerate().skip(1) {
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None => match b {
                b'"' | b'\'' => {
                    // Quotes only open a value right after '='.
                    if s.as_bytes()[..i].iter().rev().find(|c| !c.is_ascii_whitespace()) == Some(&b'=') {
                        quote = Some(b);
                    }
                }
                b'>' => return Some(i),
                _ => {}
            },
        }
    }
    None
}

fn parse_start_tag(inner: &str) -> (String, Vec<Attribute>, bool) {
    let name_len = inner
        .find(|c: char| c.is_ascii_whitespace() || c == '/')
        .unwrap_or(inner.len());
    let name = inner[..name_len].to_ascii_lowercase();
    let mut rest = &inner[name_len..];
    let mut attrs: Vec<Attribute> = Vec::new();
    let mut self_closing = false;

    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        if rest == "/" {
            self_closing = true;
            break;
        }
        if let Some(stripped) = rest.strip_prefix('/') {
            rest = stripped;
            continue;
        }
        let len = rest
            .find(|c: char| c.is_ascii_whitespace() || c == '=' || c == '/')
            .unwrap_or(rest.len())
            .max(1);
        let attr_name = rest[..len].to_ascii_lowercase();
        rest = rest[len..].trim_start();
        let value = if let Some(after_eq) = rest.strip_prefix('=') {
            let after_eq = after_eq.trim_start();
            let (value, remaining) = match after_eq.chars().next() {
                Some(q @ ('"' | '\'')) => {
                    let body = &after_eq[1..];
                    match body.find(q) {
                        Some(i) => (&body[..i], &body[i + 1..]),
                        None => (body, ""),
                    }
                }
                _ => {
                    let i = after_eq.find(|c: char| c.is_ascii_whitespace()).unwrap_or(after_eq.len());
                    (&after_eq[..i], &after_eq[i..])
                }
            };
            rest = remaining;
            Some(decode_entities(value))
        } else {
            None
        };
        if !attrs.iter().any(|a| a.name == attr_name) {
            attrs.push(Attribute { name: attr_name, value });
        }
    }
    (name, attrs, self_closing)
}

fn parse_doctype(inner: &str, raw: String) -> Token {
    let mut words = QuotedWords::new(inner.trim());
    let name = words.next().map(|w| w.to_ascii_lowercase());
    let mut public_id = None;
    let mut system_id = None;
    match words.next().map(|w| w.to_ascii_uppercase()) {
        Some(kw) if kw == "PUBLIC" => {
            public_id = words.next();
            system_id = words.next();
        }
        Some(kw) if kw == "SYSTEM" => system_id = words.next(),
        _ => {}
    }
    Token::Doctype {
        name,
        public_id,
        system_id,
        raw,
    }
}

/// Whitespace-separated words where quoted strings count as one word.
struct QuotedWords<'a> {
    rest: &'a str,
}

impl<'a> QuotedWords<'a> {
    fn new(s: &'a str) -> Self {
        Self { rest: s }
    }
}

impl Iterator for QuotedWords<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.rest = self.rest.trim_start();
        let first = self.rest.chars().next()?;
        if first == '"' || first == '\'' {
            let body = &self.rest[1..];
            let end = body.find(first).unwrap_or(body.len());
            let word = body[..end].to_string();
            self.rest = body.get(end + 1..).unwrap_or("");
            return Some(word);
        }
        let end = self.rest.find(|c: char| c.is_ascii_whitespace()).unwrap_or(self.rest.len());
        let word = self.rest[..end].to_string();
        self.rest = &self.rest[end..];
        Some(word)
    }
}

/// Decode the character references that appear in attribute values.
pub fn decode_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(i) = rest.find('&') {
        out.push_str(&rest[..i]);
        rest = &rest[i..];
        let Some(semi) = rest[1..].find(';').map(|j| j + 1) else {
            break;
        };
        let entity = &rest[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "nbsp" => Some('\u{a0}'),
            _ => entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &rest[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Escape text content.
pub fn escape_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Escape a double-quoted attribute value.
pub fn escape_attr(s: &str) -> String {
    s.replace('&', "&amp;").replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(chunks: &[&str]) -> Vec<Token> {
        let mut t = Tokenizer::new();
        let mut out = Vec::new();
        for chunk in chunks {
            t.feed(chunk.as_bytes());
            while let Some(tok) = t.next_token() {
                out.push(tok);
            }
        }
        t.end();
        while let Some(tok) = t.next_token() {
            out.push(tok);
        }
        out
    }

    fn raw(tokens: &[Token]) -> String {
        tokens
            .iter()
            .map(|t| match t {
                Token::StartTag { raw, .. }
                | Token::EndTag { raw, .. }
                | Token::Comment { raw, .. }
                | Token::Doctype { raw, .. } => raw.clone(),
                Token::Text(text) => text.clone(),
            })
            .collect()
    }

    #[test]
    fn splits_tags_across_chunks() {
        let input = ["<di", "v class=\"a", " b\">he", "llo</d", "iv>"];
        let toks = tokens(&input);
        assert_eq!(raw(&toks), input.concat());
        let Token::StartTag { name, attrs, .. } = &toks[0] else { panic!("expected a start tag") };
        assert_eq!(name, "div");
        assert_eq!(attrs[0].value.as_deref(), Some("a b"));
        assert_eq!(toks[1], Token::Text("hello".into()));
        assert!(matches!(&toks[2], Token::EndTag { name, .. } if name == "div"));
    }

    #[test]
    fn attributes_quoting_and_entities() {
        let toks = tokens(&["<a href='/x?a=1&amp;b=2' data-x=y hidden title=\"a > b\">"]);
        let Token::StartTag { attrs, .. } = &toks[0] else { panic!("expected a start tag") };
        assert_eq!(attrs.len(), 4);
        assert_eq!(attrs[0].value.as_deref(), Some("/x?a=1&b=2"));
        assert_eq!(attrs[1].value.as_deref(), Some("y"));
        assert_eq!(attrs[2], Attribute { name: "hidden".into(), value: None });
        assert_eq!(attrs[3].value.as_deref(), Some("a > b"));
    }

    #[test]
    fn comments_doctype_and_script() {
        let toks = tokens(&["<!DOCTYPE html><!-- c --><script>if (a<b) {}</script>x"]);
        assert!(matches!(&toks[0], Token::Doctype { name: Some(n), .. } if n == "html"));
        assert!(matches!(&toks[1], Token::Comment { text, .. } if text == " c "));
        assert!(matches!(&toks[2], Token::StartTag { name, .. } if name == "script"));
        assert_eq!(toks[3], Token::Text("if (a<b) {}".into()));
        assert!(matches!(&toks[4], Token::EndTag { name, .. } if name == "script"));
        assert_eq!(toks[5], Token::Text("x".into()));
    }

    #[test]
    fn stray_angle_bracket_is_text() {
        let toks = tokens(&["1 < 2 <3"]);
        assert_eq!(raw(&toks), "1 < 2 <3");
        assert!(toks.iter().all(|t| matches!(t, Token::Text(_))));
    }

    #[test]
    fn multibyte_split_across_chunks() {
        let bytes = "<p>é</p>".as_bytes();
        let mut t = Tokenizer::new();
        t.feed(&bytes[..4]);
        t.feed(&bytes[4..]);
        t.end();
        let mut out = Vec::new();
        while let Some(tok) = t.next_token() {
            out.push(tok);
        }
        assert_eq!(out[1], Token::Text("é".into()));
    }

    #[test]
    fn unread_token_comes_back_first() {
        let mut t = Tokenizer::complete("<b>x</b>");
        let first = t.next_token().unwrap();
        t.unread(first.clone());
        assert_eq!(t.next_token(), Some(first));
        assert_eq!(t.next_token(), Some(Token::Text("x".into())));
        assert!(matches!(t.next_token(), Some(Token::EndTag { .. })));
        assert!(t.next_token().is_none());
        assert!(t.is_drained());
    }

    #[test]
    fn escaping() {
        assert_eq!(escape_text("<b>&"), "&lt;b&gt;&amp;");
        assert_eq!(escape_attr("a\"&"), "a&quot;&amp;");
        assert_eq!(decode_entities("&#x41;&#66;&bogus;"), "AB&bogus;");
    }
}
