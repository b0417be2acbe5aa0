//! Core type definitions shared by the map, the command language and the
//! change log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Tag set attached to nodes and edges.
///
/// Names compare case-insensitively (stored lower-cased); values are kept
/// verbatim. Iteration order is by name. Serialized as a map of name to
/// optional value; the comma-separated text form is only used by the command
/// language.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, Option<String>>", into = "BTreeMap<String, Option<String>>")]
pub struct Tags(BTreeMap<String, Option<String>>);

/// One character of tag text, remembering whether it was backslash-escaped.
#[derive(Clone, Copy)]
struct TagChar {
    ch: char,
    escaped: bool,
}

fn tag_chars(text: &str) -> Vec<TagChar> {
    let mut out = Vec::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some(next) => out.push(TagChar { ch: next, escaped: true }),
                None => out.push(TagChar { ch, escaped: false }),
            }
        } else {
            out.push(TagChar { ch, escaped: false });
        }
    }
    out
}

// Unescaped surrounding whitespace is insignificant.
fn trimmed(chars: &[TagChar]) -> String {
    let is_blank = |c: &TagChar| !c.escaped && c.ch.is_whitespace();
    let start = chars.iter().position(|c| !is_blank(c)).unwrap_or(chars.len());
    let end = chars.iter().rposition(|c| !is_blank(c)).map_or(start, |i| i + 1);
    chars[start..end].iter().map(|c| c.ch).collect()
}

fn write_escaped(f: &mut fmt::Formatter<'_>, text: &str, specials: &[char]) -> fmt::Result {
    let last = text.chars().count().saturating_sub(1);
    for (i, ch) in text.chars().enumerate() {
        let edge_space = ch.is_whitespace() && (i == 0 || i == last);
        if ch == '\\' || specials.contains(&ch) || edge_space {
            f.write_str("\\")?;
        }
        write!(f, "{}", ch)?;
    }
    Ok(())
}

impl Tags {
    pub fn new() -> Self {
        Tags(BTreeMap::new())
    }

    /// Parse a tag string such as `t1=v1,active,t2=v2`.
    ///
    /// Empty segments are skipped; a trailing `=` with no value is a bare tag.
    /// A backslash escapes the next character, so `note=a\,b` keeps its comma.
    /// Reads back exactly what `Display` writes.
    pub fn parse(text: &str) -> Self {
        let mut tags = Tags::new();
        let chars = tag_chars(text);

        for segment in chars.split(|c| !c.escaped && c.ch == ',') {
            match segment.iter().position(|c| !c.escaped && c.ch == '=') {
                Some(split) => {
                    let value = trimmed(&segment[split + 1..]);
                    let value = if value.is_empty() { None } else { Some(value) };
                    tags.set(&trimmed(&segment[..split]), value);
                }
                None => {
                    let name = trimmed(segment);
                    if !name.is_empty() {
                        tags.set(&name, None);
                    }
                }
            }
        }

        tags
    }

    pub fn set(&mut self, name: &str, value: Option<String>) {
        let name = name.to_lowercase();
        if name.is_empty() {
            return;
        }
        self.0.insert(name, value);
    }

    /// Builder-style variant of [`Tags::set`].
    pub fn with(mut self, name: &str, value: Option<&str>) -> Self {
        self.set(name, value.map(str::to_string));
        self
    }

    /// `Some(None)` for a bare tag, `Some(Some(v))` for `name=v`.
    pub fn get(&self, name: &str) -> Option<Option<&str>> {
        self.0.get(&name.to_lowercase()).map(|v| v.as_deref())
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.get(name).flatten()
    }

    pub fn has(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_lowercase())
    }

    pub fn remove(&mut self, name: &str) -> Option<Option<String>> {
        self.0.remove(&name.to_lowercase())
    }

    /// Overlay `other` on top of `self`; names present in both take the value
    /// from `other`.
    pub fn merge(&mut self, other: &Tags) {
        for (name, value) in &other.0 {
            self.0.insert(name.clone(), value.clone());
        }
    }

    /// True when every tag of `filter` is present here. A bare filter tag only
    /// requires presence; a valued one requires an equal value.
    pub fn matches(&self, filter: &Tags) -> bool {
        filter.0.iter().all(|(name, expected)| match (self.0.get(name), expected) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(actual), Some(expected)) => actual.as_deref() == Some(expected.as_str()),
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Tags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            first = false;

            write_escaped(f, name, &[',', '='])?;
            if let Some(value) = value {
                f.write_str("=")?;
                write_escaped(f, value, &[','])?;
            }
        }
        Ok(())
    }
}

impl From<String> for Tags {
    fn from(text: String) -> Self {
        Tags::parse(&text)
    }
}

impl From<&str> for Tags {
    fn from(text: &str) -> Self {
        Tags::parse(text)
    }
}

impl From<BTreeMap<String, Option<String>>> for Tags {
    fn from(pairs: BTreeMap<String, Option<String>>) -> Self {
        pairs.into_iter().fold(Tags::new(), |mut tags, (name, value)| {
            tags.set(&name, value);
            tags
        })
    }
}

impl From<Tags> for BTreeMap<String, Option<String>> {
    fn from(tags: Tags) -> Self {
        tags.0
    }
}

/// Random 16-hex-digit identifier used for edge keys, transaction ids,
/// correlation ids and lease ids.
pub fn new_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Node keys, edge endpoints and edge types compare case-insensitively.
pub fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}
