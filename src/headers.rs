//! Order-preserving header storage.
//!
//! HTTP engines normalize header casing and iteration order; replaying or
//! diffing a captured request needs the fields exactly as they appeared on
//! the wire. [`OrderedHeaderMap`] keeps case-sensitive names in
//! first-insertion order alongside their values, and equality is
//! order-sensitive.

use std::collections::HashMap;
use std::fmt;

use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// The value of a header field: one line or several repeated lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// A single header line.
    One(String),
    /// Repeated header lines under the same name, in wire order.
    Many(Vec<String>),
}

impl FieldValue {
    /// Renders the value the way it would appear joined on one line.
    pub fn as_joined(&self) -> String {
        match self {
            FieldValue::One(v) => v.clone(),
            FieldValue::Many(vs) => vs.join(", "),
        }
    }

    /// Iterates the individual lines of the value.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        let slice: &[String] = match self {
            FieldValue::One(v) => std::slice::from_ref(v),
            FieldValue::Many(vs) => vs.as_slice(),
        };
        slice.iter().map(String::as_str)
    }

    fn push(&mut self, value: String) {
        match self {
            FieldValue::One(first) => {
                let first = std::mem::take(first);
                *self = FieldValue::Many(vec![first, value]);
            }
            FieldValue::Many(vs) => vs.push(value),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::One(v.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::One(v)
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(vs: Vec<String>) -> Self {
        FieldValue::Many(vs)
    }
}

/// A header map that remembers the order names were first inserted in.
///
/// Names are case-sensitive; `put` with an already-present name replaces the
/// value but keeps the original position, while `append` adds another line
/// under the same name.
#[derive(Debug, Clone, Default)]
pub struct OrderedHeaderMap {
    entries: HashMap<String, FieldValue>,
    order: Vec<String>,
}

impl OrderedHeaderMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        OrderedHeaderMap::default()
    }

    /// Inserts `value` under `key`, appending `key` to the order on first
    /// insertion only.
    pub fn put<V: Into<FieldValue>>(&mut self, key: &str, value: V) {
        if !self.entries.contains_key(key) {
            self.order.push(key.to_owned());
        }
        self.entries.insert(key.to_owned(), value.into());
    }

    /// Adds one more line under `key`, keeping its first-seen position.
    pub fn append(&mut self, key: &str, value: &str) {
        match self.entries.get_mut(key) {
            Some(existing) => existing.push(value.to_owned()),
            None => self.put(key, value),
        }
    }

    /// Looks up the value for `key`.
    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.entries.get(key)
    }

    /// Case-insensitive lookup, joined to one line. Convenience for
    /// protocol checks against captured traffic.
    pub fn get_ignore_case(&self, key: &str) -> Option<String> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_joined())
    }

    /// Removes `key` from both stores. The order list is swap-removed, the
    /// same way the capture buffer compacts.
    pub fn remove(&mut self, key: &str) -> Option<FieldValue> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            if let Some(pos) = self.order.iter().position(|k| k == key) {
                self.order.swap_remove(pos);
            }
        }
        removed
    }

    /// The names in first-insertion order.
    pub fn keys(&self) -> &[String] {
        &self.order
    }

    /// Number of distinct names.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no name is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Values in first-insertion order.
    pub fn values_in_order(&self) -> Vec<&FieldValue> {
        self.order
            .iter()
            .filter_map(|key| self.entries.get(key))
            .collect()
    }

    /// Iterates `(name, value)` pairs in first-insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.order
            .iter()
            .filter_map(|key| self.entries.get(key).map(|v| (key.as_str(), v)))
    }
}

// Order-sensitive on purpose: two requests whose headers arrived in a
// different order are different requests for replay purposes.
impl PartialEq for OrderedHeaderMap {
    fn eq(&self, other: &Self) -> bool {
        self.order == other.order && self.entries == other.entries
    }
}

impl Eq for OrderedHeaderMap {}

impl fmt::Display for OrderedHeaderMap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (key, value) in self.iter() {
            writeln!(f, "{} {}", key, value.as_joined())?;
        }
        Ok(())
    }
}

impl Serialize for OrderedHeaderMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("order", &self.order)?;
        map.serialize_entry("entries", &self.entries)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for OrderedHeaderMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            order: Vec<String>,
            entries: HashMap<String, FieldValue>,
        }

        let raw = Raw::deserialize(deserializer)?;
        Ok(OrderedHeaderMap {
            entries: raw.entries,
            order: raw.order,
        })
    }
}

/// Rebuilds the original-order header map from the raw bytes of a request or
/// response head. The first line is skipped; parsing stops at the blank line
/// separating head from body.
pub fn parse_raw_head(raw: &[u8]) -> OrderedHeaderMap {
    let mut map = OrderedHeaderMap::new();
    let mut lines = raw.split(|&b| b == b'\n');

    // Request line.
    lines.next();

    for line in lines {
        let line = match line.strip_suffix(b"\r") {
            Some(stripped) => stripped,
            None => line,
        };
        if line.is_empty() {
            break;
        }

        let text = String::from_utf8_lossy(line);
        let Some(colon) = text.find(':') else {
            continue;
        };

        let key = text[..colon].trim();
        let value = text[colon + 1..].trim();
        if key.is_empty() {
            continue;
        }
        map.append(key, value);
    }

    map
}

/// Parses a `Cookie` request header (or `Set-Cookie` lines) into name→value
/// pairs; on duplicate names the last one wins.
pub fn parse_cookie_pairs<'a, I>(lines: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut cookies = HashMap::new();
    for line in lines {
        for pair in line.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let Some(eq) = pair.find('=') else {
                continue;
            };
            let name = pair[..eq].trim();
            if name.is_empty() {
                continue;
            }
            cookies.insert(name.to_owned(), pair[eq + 1..].trim().to_owned());
            // A Set-Cookie line carries attributes after the first pair.
            break;
        }
    }
    cookies
}

/// Parses every `name=value` pair of a single `Cookie` request header line.
pub fn parse_cookie_header(line: &str) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for pair in line.split(';') {
        let pair = pair.trim();
        let Some(eq) = pair.find('=') else {
            continue;
        };
        let name = pair[..eq].trim();
        if name.is_empty() {
            continue;
        }
        cookies.insert(name.to_owned(), pair[eq + 1..].trim().to_owned());
    }
    cookies
}

/// Returns true for hop-by-hop headers that must not be forwarded.
pub(crate) fn is_hop_by_hop(name: &str) -> bool {
    name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("proxy-connection")
        || name.eq_ignore_ascii_case("upgrade")
        || name.eq_ignore_ascii_case("transfer-encoding")
}
