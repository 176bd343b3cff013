//! Probe files describing channel groups.
//!
//! A probe file is a list of `name = value` assignments using Python
//! literal syntax:
//!
//! ```text
//! channel_groups = {
//!     0: {'channels': list(range(4)),
//!         'oe_channels': [8, 9, 10, 11],
//!         'geometry': {0: (0, 0), 1: (0, 20)}},
//! }
//! ```
//!
//! Values are parsed into [`ProbeValue`] by a small recursive-descent parser.
//! Nothing is evaluated beyond the `range(...)` and `list(...)` calls.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::error::{OpenEphysError, Result};

/// A literal value from a probe file.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    None,
    List(Vec<ProbeValue>),
    Tuple(Vec<ProbeValue>),
    Dict(Vec<(ProbeValue, ProbeValue)>),
}

impl ProbeValue {
    fn as_int(&self) -> Option<i64> {
        match self {
            ProbeValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    fn as_float(&self) -> Option<f64> {
        match self {
            ProbeValue::Int(v) => Some(*v as f64),
            ProbeValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    fn as_seq(&self) -> Option<&[ProbeValue]> {
        match self {
            ProbeValue::List(items) | ProbeValue::Tuple(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    /// Looks up a string key in a dict value.
    pub fn get(&self, key: &str) -> Option<&ProbeValue> {
        match self {
            ProbeValue::Dict(entries) => entries
                .iter()
                .find(|(k, _)| matches!(k, ProbeValue::Str(s) if s == key))
                .map(|(_, v)| v),
            _ => None,
        }
    }
}

/// One channel group of a probe.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProbeGroup {
    /// Sequential channel ids within the probe
    pub channels: Vec<u32>,
    /// Acquisition channel backing each entry of `channels`
    pub oe_channels: Vec<u32>,
    /// Site position per probe channel
    pub geometry: BTreeMap<u32, (f64, f64)>,
}

/// Typed content of a probe file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProbeLayout {
    pub groups: BTreeMap<u32, ProbeGroup>,
}

impl ProbeLayout {
    /// Parses probe-file text.
    pub fn parse(text: &str) -> Result<Self> {
        let assignments = parse_assignments(text)?;
        let Some((line, value)) = assignments.get("channel_groups") else {
            return Err(OpenEphysError::ProbeParse {
                line: text.lines().count().max(1),
                message: "no channel_groups assignment".to_string(),
            });
        };
        let err = |message: String| OpenEphysError::ProbeParse {
            line: *line,
            message,
        };

        let ProbeValue::Dict(entries) = value else {
            return Err(err("channel_groups is not a dict".to_string()));
        };

        let mut groups = BTreeMap::new();
        for (key, group) in entries {
            let id = key
                .as_int()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| err(format!("invalid channel group id {key:?}")))?;

            let channels = id_list(group.get("channels"))
                .ok_or_else(|| err(format!("group {id} has no valid channels list")))?;
            let oe_channels = id_list(group.get("oe_channels"))
                .ok_or_else(|| err(format!("group {id} has no valid oe_channels list")))?;
            if channels.len() != oe_channels.len() {
                return Err(err(format!(
                    "group {id} lists {} channels but {} oe_channels",
                    channels.len(),
                    oe_channels.len()
                )));
            }

            let mut geometry = BTreeMap::new();
            if let Some(ProbeValue::Dict(sites)) = group.get("geometry") {
                for (chan, pos) in sites {
                    let site = chan.as_int().and_then(|v| u32::try_from(v).ok());
                    let xy = pos
                        .as_seq()
                        .filter(|p| p.len() == 2)
                        .and_then(|p| Some((p[0].as_float()?, p[1].as_float()?)));
                    match (site, xy) {
                        (Some(site), Some(xy)) => {
                            geometry.insert(site, xy);
                        }
                        _ => return Err(err(format!("group {id} has a malformed geometry entry"))),
                    }
                }
            }

            groups.insert(
                id,
                ProbeGroup {
                    channels,
                    oe_channels,
                    geometry,
                },
            );
        }

        Ok(Self { groups })
    }

    /// Total number of channels over all groups
    pub fn channel_count(&self) -> usize {
        self.groups.values().map(|g| g.channels.len()).sum()
    }
}

/// Reads and parses a probe file.
pub fn read_probe_file<P: AsRef<Path>>(file_path: P) -> Result<ProbeLayout> {
    let text = fs::read_to_string(file_path.as_ref())?;
    let layout = ProbeLayout::parse(&text)?;
    info!(
        path = %file_path.as_ref().display(),
        groups = layout.groups.len(),
        channels = layout.channel_count(),
        "loaded probe file"
    );
    Ok(layout)
}

fn id_list(value: Option<&ProbeValue>) -> Option<Vec<u32>> {
    value?
        .as_seq()?
        .iter()
        .map(|v| v.as_int().and_then(|i| u32::try_from(i).ok()))
        .collect()
}

/// Parses all top-level assignments, keyed by lower-cased name.
pub fn parse_assignments(text: &str) -> Result<BTreeMap<String, (usize, ProbeValue)>> {
    let tokens = tokenize(text)?;
    let mut parser = Parser { tokens, pos: 0 };
    let mut out = BTreeMap::new();

    while let Some(tok) = parser.peek() {
        let line = tok.line;
        match &tok.kind {
            TokenKind::Semicolon => {
                parser.pos += 1;
            }
            TokenKind::Ident(name) => {
                let name = name.to_lowercase();
                parser.pos += 1;
                parser.expect(&TokenKind::Equals)?;
                let value = parser.expr()?;
                out.insert(name, (line, value));
            }
            other => {
                return Err(OpenEphysError::ProbeParse {
                    line,
                    message: format!("expected an assignment, found {other:?}"),
                })
            }
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Open(char),
    Close(char),
    Comma,
    Colon,
    Equals,
    Semicolon,
    Minus,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    line: usize,
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    let mut line = 1;

    while let Some(&c) = chars.peek() {
        let here = line;
        let err = move |message: String| OpenEphysError::ProbeParse {
            line: here,
            message,
        };
        let kind = match c {
            '\n' => {
                line += 1;
                chars.next();
                continue;
            }
            c if c.is_whitespace() || c == '\\' => {
                chars.next();
                continue;
            }
            '#' => {
                while chars.peek().is_some_and(|&c| c != '\n') {
                    chars.next();
                }
                continue;
            }
            '(' | '[' | '{' => {
                chars.next();
                TokenKind::Open(c)
            }
            ')' | ']' | '}' => {
                chars.next();
                TokenKind::Close(c)
            }
            ',' => {
                chars.next();
                TokenKind::Comma
            }
            ':' => {
                chars.next();
                TokenKind::Colon
            }
            '=' => {
                chars.next();
                TokenKind::Equals
            }
            ';' => {
                chars.next();
                TokenKind::Semicolon
            }
            '-' => {
                chars.next();
                TokenKind::Minus
            }
            '+' => {
                chars.next();
                continue;
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some('\\') => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some(other) => s.push(other),
                            None => return Err(err("unterminated string".to_string())),
                        },
                        Some('\n') | None => return Err(err("unterminated string".to_string())),
                        Some(ch) => s.push(ch),
                    }
                }
                TokenKind::Str(s)
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut s = String::new();
                while let Some(&d) = chars.peek() {
                    let exponent_sign = (d == '-' || d == '+') && s.ends_with(|e: char| e == 'e' || e == 'E');
                    if d.is_ascii_alphanumeric() || d == '.' || d == '_' || exponent_sign {
                        s.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let digits = s.replace('_', "");
                if let Ok(v) = digits.parse::<i64>() {
                    TokenKind::Int(v)
                } else if let Ok(v) = digits.parse::<f64>() {
                    TokenKind::Float(v)
                } else {
                    return Err(err(format!("invalid number {s:?}")));
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_alphanumeric() || d == '_' {
                        s.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                TokenKind::Ident(s)
            }
            other => return Err(err(format!("unexpected character {other:?}"))),
        };
        tokens.push(Token { kind, line });
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(1, |t| t.line)
    }

    fn error(&self, message: impl Into<String>) -> OpenEphysError {
        OpenEphysError::ProbeParse {
            line: self.line(),
            message: message.into(),
        }
    }

    fn next(&mut self) -> Result<Token> {
        let tok = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| self.error("unexpected end of file"))?;
        self.pos += 1;
        Ok(tok)
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<()> {
        let tok = self.next()?;
        if &tok.kind == kind {
            Ok(())
        } else {
            Err(OpenEphysError::ProbeParse {
                line: tok.line,
                message: format!("expected {kind:?}, found {:?}", tok.kind),
            })
        }
    }

    /// Consumes `close` if it is next.
    fn eat_close(&mut self, close: char) -> bool {
        if matches!(self.peek(), Some(Token { kind: TokenKind::Close(c), .. }) if *c == close) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// After an element: consumes a comma, or the closing bracket.
    /// Returns true once the sequence is closed.
    fn separator(&mut self, close: char) -> Result<bool> {
        if self.eat_close(close) {
            return Ok(true);
        }
        self.expect(&TokenKind::Comma)?;
        Ok(self.eat_close(close))
    }

    fn expr(&mut self) -> Result<ProbeValue> {
        let tok = self.next()?;
        match tok.kind {
            TokenKind::Int(v) => Ok(ProbeValue::Int(v)),
            TokenKind::Float(v) => Ok(ProbeValue::Float(v)),
            TokenKind::Str(s) => {
                // Adjacent literals concatenate
                let mut s = s;
                while let Some(Token { kind: TokenKind::Str(more), .. }) = self.peek() {
                    s.push_str(more);
                    self.pos += 1;
                }
                Ok(ProbeValue::Str(s))
            }
            TokenKind::Minus => match self.expr()? {
                ProbeValue::Int(v) => Ok(ProbeValue::Int(-v)),
                ProbeValue::Float(v) => Ok(ProbeValue::Float(-v)),
                other => Err(self.error(format!("cannot negate {other:?}"))),
            },
            TokenKind::Open('[') => Ok(ProbeValue::List(self.sequence(']')?)),
            TokenKind::Open('(') => {
                if self.eat_close(')') {
                    return Ok(ProbeValue::Tuple(Vec::new()));
                }
                let first = self.expr()?;
                if self.eat_close(')') {
                    // Parenthesised expression, not a tuple
                    return Ok(first);
                }
                self.expect(&TokenKind::Comma)?;
                let mut items = vec![first];
                if !self.eat_close(')') {
                    items.extend(self.sequence(')')?);
                }
                Ok(ProbeValue::Tuple(items))
            }
            TokenKind::Open('{') => self.dict(),
            TokenKind::Ident(name) => match name.as_str() {
                "True" => Ok(ProbeValue::Bool(true)),
                "False" => Ok(ProbeValue::Bool(false)),
                "None" => Ok(ProbeValue::None),
                "range" | "list" | "tuple" => self.call(&name),
                _ => Err(OpenEphysError::ProbeParse {
                    line: tok.line,
                    message: format!("unsupported name {name:?}"),
                }),
            },
            other => Err(OpenEphysError::ProbeParse {
                line: tok.line,
                message: format!("unexpected token {other:?}"),
            }),
        }
    }

    fn sequence(&mut self, close: char) -> Result<Vec<ProbeValue>> {
        let mut items = Vec::new();
        if self.eat_close(close) {
            return Ok(items);
        }
        loop {
            items.push(self.expr()?);
            if self.separator(close)? {
                return Ok(items);
            }
        }
    }

    fn dict(&mut self) -> Result<ProbeValue> {
        let mut entries = Vec::new();
        if self.eat_close('}') {
            return Ok(ProbeValue::Dict(entries));
        }
        loop {
            let key = self.expr()?;
            self.expect(&TokenKind::Colon)?;
            let value = self.expr()?;
            entries.push((key, value));
            if self.separator('}')? {
                return Ok(ProbeValue::Dict(entries));
            }
        }
    }

    fn call(&mut self, name: &str) -> Result<ProbeValue> {
        self.expect(&TokenKind::Open('('))?;
        let args = self.sequence(')')?;

        match name {
            "range" => {
                let ints: Option<Vec<i64>> = args.iter().map(ProbeValue::as_int).collect();
                let (start, stop, step) = match ints.as_deref() {
                    Some([stop]) => (0, *stop, 1),
                    Some([start, stop]) => (*start, *stop, 1),
                    Some([start, stop, step]) if *step != 0 => (*start, *stop, *step),
                    _ => return Err(self.error("range() takes one to three integers")),
                };
                let mut values = Vec::new();
                let mut v = start;
                while (step > 0 && v < stop) || (step < 0 && v > stop) {
                    values.push(ProbeValue::Int(v));
                    v += step;
                }
                Ok(ProbeValue::List(values))
            }
            _ => match args.as_slice() {
                [] if name == "list" => Ok(ProbeValue::List(Vec::new())),
                [] => Ok(ProbeValue::Tuple(Vec::new())),
                [arg] => {
                    let items = arg
                        .as_seq()
                        .ok_or_else(|| self.error(format!("{name}() needs a sequence")))?
                        .to_vec();
                    if name == "list" {
                        Ok(ProbeValue::List(items))
                    } else {
                        Ok(ProbeValue::Tuple(items))
                    }
                }
                _ => Err(self.error(format!("{name}() takes one argument"))),
            },
        }
    }
}
