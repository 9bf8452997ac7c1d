//! The path mini-language.
//!
//! Paths are dot-separated label chains. A backslash escapes a literal
//! dot inside a label. Besides plain labels a segment can be `#n`
//! (positional index), `#^` (step up to the parent) or `#attr=value`
//! (first node whose attribute matches; the name defaults to `id` when
//! omitted). Insertion positions are a
//! separate small grammar, see [`Position`].

use crate::error::{BagError, Result};

/// One classified path segment.
#[derive(Clone, Debug, PartialEq)]
pub enum Segment {
    Label(String),
    Index(usize),
    Parent,
    Attr { name: String, value: String },
}

impl Segment {
    pub fn parse(raw: &str) -> Result<Segment> {
        if let Some(rest) = raw.strip_prefix('#') {
            if rest == "^" {
                return Ok(Segment::Parent);
            }
            if let Some((name, value)) = rest.split_once('=') {
                // `#=value` defaults the attribute name to `id`
                let name = if name.is_empty() { "id" } else { name };
                return Ok(Segment::Attr {
                    name: name.to_string(),
                    value: value.to_string(),
                });
            }
            return rest
                .parse::<usize>()
                .map(Segment::Index)
                .map_err(|_| BagError::Path(format!("invalid index segment '{}'", raw)));
        }
        Ok(Segment::Label(raw.to_string()))
    }
}

/// Split a dotted path honoring `\.` escapes. Empty segments are kept
/// out of the result.
pub fn split_path(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'.') => {
                chars.next();
                current.push('.');
            }
            '.' => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

/// Escape the dots of a label so it survives a round trip through
/// [`split_path`].
pub fn escape_label(label: &str) -> String {
    label.replace('.', "\\.")
}

/// Join already-escaped segments back into a dotted path.
pub fn join_path<I, S>(segments: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for s in segments {
        if !out.is_empty() {
            out.push('.');
        }
        out.push_str(&escape_label(s.as_ref()));
    }
    out
}

/// Where a new node lands among its siblings.
///
/// `<` start, `>` end (the default), `#n` at index n, `<label` /
/// `>label` before / after the labeled sibling, `<#n` / `>#n` before /
/// after the indexed sibling.
#[derive(Clone, Debug, PartialEq)]
pub enum Position {
    Start,
    End,
    Index(usize),
    BeforeLabel(String),
    AfterLabel(String),
    BeforeIndex(usize),
    AfterIndex(usize),
}

impl Default for Position {
    fn default() -> Self {
        Position::End
    }
}

impl Position {
    pub fn parse(token: &str) -> Result<Position> {
        let bad = || BagError::Path(format!("invalid position token '{}'", token));
        match token {
            "" | ">" => Ok(Position::End),
            "<" => Ok(Position::Start),
            _ => {
                if let Some(rest) = token.strip_prefix('<') {
                    if let Some(idx) = rest.strip_prefix('#') {
                        idx.parse().map(Position::BeforeIndex).map_err(|_| bad())
                    } else {
                        Ok(Position::BeforeLabel(rest.to_string()))
                    }
                } else if let Some(rest) = token.strip_prefix('>') {
                    if let Some(idx) = rest.strip_prefix('#') {
                        idx.parse().map(Position::AfterIndex).map_err(|_| bad())
                    } else {
                        Ok(Position::AfterLabel(rest.to_string()))
                    }
                } else if let Some(idx) = token.strip_prefix('#') {
                    idx.parse().map(Position::Index).map_err(|_| bad())
                } else {
                    Err(bad())
                }
            }
        }
    }
}
