//! CSS selectors for element routes.
//!
//! Supported: type and universal selectors, `#id`, `.class`, attribute
//! selectors (`[a]`, `[a=v]`, `[a~=v]`, `[a^=v]`, `[a$=v]`, `[a*=v]`), the
//! descendant, `>`, `+` and `~` combinators, and comma-separated lists.

use super::RewriterError;

#[derive(Debug, Clone, PartialEq)]
pub struct ElementInfo {
    pub name: String,
    pub attrs: Vec<(String, String)>,
}

impl ElementInfo {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Combinator {
    Descendant,
    Child,
    Adjacent,
    Sibling,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum AttrOp {
    Exists,
    Equals,
    Includes,
    Prefix,
    Suffix,
    Substring,
}

#[derive(Debug, Clone, PartialEq)]
enum Simple {
    Id(String),
    Class(String),
    Attr { name: String, op: AttrOp, value: String },
}

#[derive(Debug, Clone, PartialEq, Default)]
struct Compound {
    tag: Option<String>,
    simples: Vec<Simple>,
}

impl Compound {
    fn matches(&self, el: &ElementInfo) -> bool {
        if let Some(tag) = &self.tag {
            if *tag != el.name {
                return false;
            }
        }
        self.simples.iter().all(|s| match s {
            Simple::Id(id) => el.attr("id") == Some(id.as_str()),
            Simple::Class(class) => el
                .attr("class")
                .is_some_and(|c| c.split_ascii_whitespace().any(|part| part == class)),
            Simple::Attr { name, op, value } => match (el.attr(name), op) {
                (None, _) => false,
                (Some(_), AttrOp::Exists) => true,
                (Some(v), AttrOp::Equals) => v == value,
                (Some(v), AttrOp::Includes) => v.split_ascii_whitespace().any(|w| w == value),
                (Some(v), AttrOp::Prefix) => !value.is_empty() && v.starts_with(value.as_str()),
                (Some(v), AttrOp::Suffix) => !value.is_empty() && v.ends_with(value.as_str()),
                (Some(v), AttrOp::Substring) => !value.is_empty() && v.contains(value.as_str()),
            },
        })
    }
}

/// One complex selector; `parts[i].1` joins `parts[i]` to `parts[i - 1]`.
#[derive(Debug, Clone, PartialEq)]
struct Complex {
    parts: Vec<(Compound, Combinator)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    alternatives: Vec<Complex>,
}

impl Selector {
    pub fn parse(input: &str) -> Result<Self, RewriterError> {
        let mut parser = Parser {
            src: input,
            chars: input.char_indices().peekable(),
        };
        let mut alternatives = vec![parser.complex()?];
        while parser.eat(',') {
            alternatives.push(parser.complex()?);
        }
        parser.skip_ws();
        if let Some(&(_, c)) = parser.chars.peek() {
            return Err(parser.error(format!("unexpected '{c}'")));
        }
        Ok(Self { alternatives })
    }

    /// Does the element most recently added at `depth` match?
    pub fn matches(&self, tree: &SiblingTree, depth: usize) -> bool {
        let Some(index) = tree.levels.get(depth).and_then(|l| l.len().checked_sub(1)) else {
            return false;
        };
        self.alternatives
            .iter()
            .any(|c| matches_at(tree, &c.parts, c.parts.len() - 1, depth, index))
    }
}

fn matches_at(tree: &SiblingTree, parts: &[(Compound, Combinator)], part: usize, depth: usize, index: usize) -> bool {
    if !parts[part].0.matches(&tree.levels[depth][index]) {
        return false;
    }
    if part == 0 {
        return true;
    }
    let ancestor = |d: usize| matches_at(tree, parts, part - 1, d, tree.levels[d].len() - 1);
    match parts[part].1 {
        Combinator::Child => depth > 0 && ancestor(depth - 1),
        Combinator::Descendant => (0..depth).rev().any(ancestor),
        Combinator::Adjacent => index > 0 && matches_at(tree, parts, part - 1, depth, index - 1),
        Combinator::Sibling => (0..index).rev().any(|i| matches_at(tree, parts, part - 1, depth, i)),
    }
}

/// Elements seen so far, grouped by nesting level.
///
/// `levels[d]` holds the children of the open element at depth `d - 1` (the
/// document for `d == 0`) in document order; every open element is the last
/// entry of its level.
#[derive(Debug, Default)]
pub struct SiblingTree {
    levels: Vec<Vec<ElementInfo>>,
}

impl SiblingTree {
    pub fn push(&mut self, depth: usize, info: ElementInfo) {
        self.levels.truncate(depth + 1);
        while self.levels.len() <= depth {
            self.levels.push(Vec::new());
        }
        self.levels[depth].push(info);
    }

    /// Forget the children of the element at `depth`.
    pub fn close(&mut self, depth: usize) {
        self.levels.truncate(depth + 1);
    }
}

struct Parser<'a> {
    src: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl Parser<'_> {
    fn error(&self, reason: String) -> RewriterError {
        RewriterError::InvalidSelector {
            selector: self.src.to_string(),
            reason,
        }
    }

    fn skip_ws(&mut self) -> bool {
        let mut skipped = false;
        while self.chars.peek().is_some_and(|(_, c)| c.is_whitespace()) {
            self.chars.next();
            skipped = true;
        }
        skipped
    }

    fn eat(&mut self, want: char) -> bool {
        self.skip_ws();
        if self.chars.peek().is_some_and(|(_, c)| *c == want) {
            self.chars.next();
            return true;
        }
        false
    }

    fn ident(&mut self) -> Result<String, RewriterError> {
        let mut out = String::new();
        while let Some(&(_, c)) = self.chars.peek() {
            if c.is_alphanumeric() || c == '-' || c == '_' || !c.is_ascii() {
                out.push(c);
                self.chars.next();
            } else if c == '\\' {
                self.chars.next();
                match self.chars.next() {
                    Some((_, escaped)) => out.push(escaped),
                    None => return Err(self.error("dangling escape".into())),
                }
            } else {
                break;
            }
        }
        if out.is_empty() {
            return Err(self.error("expected an identifier".into()));
        }
        Ok(out)
    }

    fn complex(&mut self) -> Result<Complex, RewriterError> {
        self.skip_ws();
        let mut parts = vec![(self.compound()?, Combinator::Descendant)];
        loop {
            let had_ws = self.skip_ws();
            let combinator = match self.chars.peek().map(|(_, c)| *c) {
                Some('>') => Combinator::Child,
                Some('+') => Combinator::Adjacent,
                Some('~') => Combinator::Sibling,
                Some(',') | None => break,
                Some(_) if had_ws => Combinator::Descendant,
                Some(c) => return Err(self.error(format!("unexpected '{c}'"))),
            };
            if combinator != Combinator::Descendant {
                self.chars.next();
                self.skip_ws();
            }
            parts.push((self.compound()?, combinator));
        }
        Ok(Complex { parts })
    }

    fn compound(&mut self) -> Result<Compound, RewriterError> {
        let mut compound = Compound::default();
        let mut any = false;
        match self.chars.peek().map(|(_, c)| *c) {
            Some('*') => {
                self.chars.next();
                any = true;
            }
            Some(c) if c.is_alphabetic() => {
                compound.tag = Some(self.ident()?.to_ascii_lowercase());
                any = true;
            }
            _ => {}
        }
        loop {
            match self.chars.peek().map(|(_, c)| *c) {
                Some('#') => {
                    self.chars.next();
                    compound.simples.push(Simple::Id(self.ident()?));
                }
                Some('.') => {
                    self.chars.next();
                    compound.simples.push(Simple::Class(self.ident()?));
                }
                Some('[') => {
                    self.chars.next();
                    compound.simples.push(self.attribute()?);
                }
                Some(':') => return Err(self.error("pseudo-classes are not supported".into())),
                _ => break,
            }
            any = true;
        }
        if !any {
            return Err(self.error("expected a selector".into()));
        }
        Ok(compound)
    }

    fn attribute(&mut self) -> Result<Simple, RewriterError> {
        self.skip_ws();
        let name = self.ident()?.to_ascii_lowercase();
        self.skip_ws();
        let op = match self.chars.next().map(|(_, c)| c) {
            Some(']') => {
                return Ok(Simple::Attr {
                    name,
                    op: AttrOp::Exists,
                    value: String::new(),
                })
            }
            Some('=') => AttrOp::Equals,
            Some(c @ ('~' | '^' | '$' | '*')) => {
                if !matches!(self.chars.next(), Some((_, '='))) {
                    return Err(self.error(format!("expected '=' after '{c}'")));
                }
                match c {
                    '~' => AttrOp::Includes,
                    '^' => AttrOp::Prefix,
                    '$' => AttrOp::Suffix,
                    _ => AttrOp::Substring,
                }
            }
            _ => return Err(self.error("malformed attribute selector".into())),
        };
        self.skip_ws();
        let value = match self.chars.peek().map(|(_, c)| *c) {
            Some(q @ ('"' | '\'')) => {
                self.chars.next();
                let mut value = String::new();
                loop {
                    match self.chars.next() {
                        Some((_, c)) if c == q => break,
                        Some((_, '\\')) => {
                            if let Some((_, c)) = self.chars.next() {
                                value.push(c);
                            }
                        }
                        Some((_, c)) => value.push(c),
                        None => return Err(self.error("unterminated string".into())),
                    }
                }
                value
            }
            _ => self.ident()?,
        };
        if !self.eat(']') {
            return Err(self.error("expected ']'".into()));
        }
        Ok(Simple::Attr { name, op, value })
    }
}
