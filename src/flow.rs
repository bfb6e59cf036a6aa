//! Owned `Request`/`Response`/`Flow` abstractions the engine consumes.
//!
//! These stand in for the proxy framework's own flow objects (out of scope
//! per the engine's external-collaborator boundary): the host proxy (see
//! `proxy.rs`) builds a `Request` from whatever it received on the wire,
//! hands it to the engine, and applies whatever mutations the engine made
//! before continuing.

use bytes::Bytes;
use http::HeaderMap;
use serde_json::Value;

/// An insertion-order-preserving multi-map, used for query parameters.
///
/// HTTP query strings can repeat a key (`?a=1&a=2`); a plain `HashMap`
/// would silently drop one. This keeps every pair in arrival order while
/// still giving dict-like lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderedMultiMap {
    pairs: Vec<(String, String)>,
}

impl OrderedMultiMap {
    pub fn new() -> Self {
        Self { pairs: Vec::new() }
    }

    pub fn from_query_str(query: &str) -> Self {
        let mut map = Self::new();
        for pair in query.split('&').filter(|s| !s.is_empty()) {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next().unwrap_or_default();
            let value = parts.next().unwrap_or_default();
            map.pairs.push((
                percent_decode(key),
                percent_decode(value),
            ));
        }
        map
    }

    pub fn to_query_str(&self) -> String {
        self.pairs
            .iter()
            .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.pairs.iter().any(|(k, _)| k == key)
    }

    /// First value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `key`, in arrival order.
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.pairs
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((key.into(), value.into()));
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.pairs.retain(|(k, _)| k != &key);
        self.pairs.push((key, value.into()));
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, String)> {
        self.pairs.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// View as a JSON object, the representation `modify_content` and the
    /// match predicates operate on (first value wins per key, matching the
    /// source script's plain-dict `request.query`).
    pub fn to_json(&self) -> Value {
        let mut object = serde_json::Map::new();
        for (key, value) in &self.pairs {
            object
                .entry(key.clone())
                .or_insert_with(|| Value::String(value.clone()));
        }
        Value::Object(object)
    }

    pub fn from_json(value: &Value) -> Self {
        let mut map = Self::new();
        if let Value::Object(object) = value {
            for (key, value) in object {
                let value_str = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                map.insert(key.clone(), value_str);
            }
        }
        map
    }
}

fn percent_decode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut bytes = s.bytes();
    while let Some(b) = bytes.next() {
        match b {
            b'+' => out.push(' '),
            b'%' => {
                let hi = bytes.next();
                let lo = bytes.next();
                if let (Some(hi), Some(lo)) = (hi, lo) {
                    if let (Some(hi), Some(lo)) = (
                        (hi as char).to_digit(16),
                        (lo as char).to_digit(16),
                    ) {
                        out.push(((hi * 16 + lo) as u8) as char);
                        continue;
                    }
                }
                out.push('%');
            }
            other => out.push(other as char),
        }
    }
    out
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// A request the engine can inspect and rewrite.
#[derive(Debug, Clone)]
pub struct Request {
    pub scheme: String,
    pub host: String,
    pub method: String,
    /// The path without the query string.
    pub path: String,
    pub query: OrderedMultiMap,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Request {
    /// `path` joined with `?query` the way the source config matches a
    /// "full path including query" before falling back to the bare path.
    pub fn path_with_query(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query.to_query_str())
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn set_text(&mut self, text: String) {
        self.body = Bytes::from(text.into_bytes());
    }
}

/// A response the engine can inspect and rewrite, or synthesize from
/// scratch.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn set_text(&mut self, text: String) {
        self.body = Bytes::from(text.into_bytes());
    }

    pub fn is_error(&self) -> bool {
        self.status >= 400
    }
}

/// A single request/response exchange as seen by the engine.
#[derive(Debug, Clone)]
pub struct Flow {
    pub request: Request,
    pub response: Option<Response>,
    /// Set by the resolver when a rule's `terminate` key fires; the host's
    /// serve loop observes this after the callback returns.
    pub should_terminate: bool,
}

impl Flow {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            response: None,
            should_terminate: false,
        }
    }

    /// Headers of the request merged with those of the response (response
    /// wins on collision), as used by the `headers` predicate on the
    /// response path.
    pub fn merged_headers(&self) -> HeaderMap {
        let mut merged = self.request.headers.clone();
        if let Some(response) = &self.response {
            for (name, value) in &response.headers {
                merged.insert(name.clone(), value.clone());
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multimap_preserves_order_and_duplicates() {
        let map = OrderedMultiMap::from_query_str("a=1&b=2&a=3");
        assert_eq!(map.get("a"), Some("1"));
        assert_eq!(map.get_all("a"), vec!["1", "3"]);
        assert_eq!(map.get("b"), Some("2"));
    }

    #[test]
    fn multimap_roundtrips_through_query_str() {
        let map = OrderedMultiMap::from_query_str("name=foo%20bar&x=1");
        assert_eq!(map.get("name"), Some("foo bar"));
        let encoded = map.to_query_str();
        assert!(encoded.contains("name=foo+bar") || encoded.contains("name=foo%20bar"));
    }

    #[test]
    fn path_with_query_omits_question_mark_when_empty() {
        let request = Request {
            scheme: "http".into(),
            host: "h".into(),
            method: "GET".into(),
            path: "/a".into(),
            query: OrderedMultiMap::new(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        };
        assert_eq!(request.path_with_query(), "/a");
    }
}
