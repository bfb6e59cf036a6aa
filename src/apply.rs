//! Request/response applier (C6): applies `modify`/`replace`/`respond` to
//! a flow, and builds synthetic responses.
//!
//! Grounded on `original_source/moxy.py`'s `request`, `response`, and
//! `make_response` functions.

use crate::config::{LoadedConfig, RegexCache};
use crate::content::{content_as_str_value, encode_content, modify_content};
use crate::flow::{Flow, OrderedMultiMap, Response};
use crate::pattern::{content_matches, is_truthy};
use crate::save::SaveSink;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{Map, Value};
use tracing::debug;

/// Applies the request half of a resolved rule: the `headers` predicate
/// gate, `save`, `modify`, and `respond`.
pub fn apply_request(
    flow: &mut Flow,
    rule: &Value,
    loaded: &LoadedConfig,
    cache: &mut RegexCache,
    save: &dyn SaveSink,
) {
    if let Some(required_headers) = rule.get("headers") {
        if is_truthy(required_headers) {
            let headers_object = headers_to_json(&flow.request.headers);
            if !content_matches(None, required_headers, Some(&headers_object), cache) {
                return;
            }
        }
    }

    if let Some(save_target) = rule.get("save").or_else(|| loaded.default_value("save")) {
        if is_truthy(save_target) {
            save.save(save_target.clone(), flow, "request");
        }
    }

    if let Some(modify) = rule.get("modify") {
        apply_request_modify(flow, modify, cache);
    }

    if let Some(respond) = rule.get("respond") {
        if is_truthy(respond) {
            let charset = loaded.default_value("charset").and_then(|v| v.as_str()).map(str::to_string);
            let response = make_response(respond.clone(), 200, Value::String(String::new()), HeaderMap::new(), charset, cache);
            debug!(path = %flow.request.path, status = response.status, "mocking response");
            flow.response = Some(response);
        }
    }
}

fn apply_request_modify(flow: &mut Flow, modify: &Value, cache: &mut RegexCache) {
    let Value::Object(modify) = modify else {
        return;
    };

    if let Some(scheme) = modify.get("scheme").and_then(|v| v.as_str()) {
        flow.request.scheme = scheme.to_string();
    }
    if let Some(host) = modify.get("host").and_then(|v| v.as_str()) {
        flow.request.host = host.to_string();
    }
    if let Some(path) = modify.get("path").and_then(|v| v.as_str()) {
        flow.request.path = path.to_string();
    }
    if let Some(method) = modify.get("method").and_then(|v| v.as_str()) {
        flow.request.method = method.to_string();
    }

    if let Some(query_modifier) = modify.get("query") {
        match query_modifier {
            Value::String(_) | Value::Array(_) => {
                let query_object = flow.request.query.to_json();
                let modified = modify_content(query_modifier.clone(), query_object, cache);
                flow.request.query = OrderedMultiMap::from_json(&modified);
            }
            Value::Object(additions) => {
                for (key, value) in additions {
                    let value_str = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    flow.request.query.set(key.clone(), value_str);
                }
            }
            _ => {}
        }
    }

    if let Some(Value::Object(headers)) = modify.get("headers") {
        for (name, value) in headers {
            if let (Ok(name), Some(value_str)) = (
                HeaderName::from_bytes(name.as_bytes()),
                value.as_str().map(str::to_string).or_else(|| Some(value.to_string())),
            ) {
                if let Ok(value) = HeaderValue::from_str(&value_str) {
                    flow.request.headers.insert(name, value);
                }
            }
        }
    }

    if let Some(modifier) = modify.get("content") {
        let current = Value::String(flow.request.text());
        let modified = modify_content(modifier.clone(), current, cache);
        flow.request.set_text(content_as_str_value(&modified));
    }
}

/// Applies the response half of a resolved rule: the `headers` predicate
/// gate, `save`, `replace`, and `modify` (with the global `response["*"]`
/// modify list prepended).
pub fn apply_response(
    flow: &mut Flow,
    rule: &Value,
    loaded: &LoadedConfig,
    cache: &mut RegexCache,
    save: &dyn SaveSink,
) {
    if let Some(required_headers) = rule.get("headers") {
        if is_truthy(required_headers) {
            let merged = headers_to_json(&flow.merged_headers());
            if !content_matches(None, required_headers, Some(&merged), cache) {
                return;
            }
        }
    }

    if let Some(save_target) = rule.get("save").or_else(|| loaded.default_value("save")) {
        if is_truthy(save_target) {
            save.save(save_target.clone(), flow, "response");
        }
    }

    if let Some(replace) = rule.get("replace") {
        if is_truthy(replace) {
            let response_spec = match replace {
                Value::Object(map) if map.contains_key("response") => map["response"].clone(),
                other => other.clone(),
            };
            if is_truthy(&response_spec) {
                let current = flow.response.clone().unwrap_or(Response {
                    status: 200,
                    headers: HeaderMap::new(),
                    body: Bytes::new(),
                });
                let charset = loaded.default_value("charset").and_then(|v| v.as_str()).map(str::to_string);
                let replaced = make_response(
                    response_spec,
                    current.status,
                    Value::String(current.text()),
                    current.headers.clone(),
                    charset,
                    cache,
                );
                flow.response = Some(replaced);
            }
        }
    }

    let mut modify_list: Vec<Value> = match rule.get("modify") {
        Some(Value::Object(_)) | Some(Value::String(_)) => vec![rule["modify"].clone()],
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    };

    let global_modify = loaded
        .handlers("response")
        .and_then(|h| h.get("*"))
        .and_then(|g| g.get("modify"))
        .cloned();
    if let Some(global_modify) = global_modify {
        if is_truthy(&global_modify) {
            let mut global_list: Vec<Value> = match global_modify {
                Value::Object(_) | Value::String(_) => vec![global_modify],
                Value::Array(items) => items,
                _ => Vec::new(),
            };
            global_list.extend(modify_list);
            modify_list = global_list;
        }
    }

    if !modify_list.is_empty() {
        if let Some(response) = flow.response.as_mut() {
            let current = Value::String(response.text());
            let modified = modify_content(Value::Array(modify_list), current, cache);
            response.set_text(content_as_str_value(&modified));
        }
    }
}

fn headers_to_json(headers: &HeaderMap) -> Value {
    let mut map = Map::new();
    for (name, value) in headers {
        map.insert(
            name.as_str().to_string(),
            Value::String(value.to_str().unwrap_or_default().to_string()),
        );
    }
    Value::Object(map)
}

/// Builds a synthesized [`Response`] from a rule's `respond`/`replace`
/// value, defaulting status/content/headers to the given values unless
/// overridden. Mirrors `make_response`/`encode_content` in the source.
pub fn make_response(
    spec: Value,
    default_status: u16,
    default_content: Value,
    default_headers: HeaderMap,
    default_charset: Option<String>,
    cache: &mut RegexCache,
) -> Response {
    let spec = match spec {
        Value::String(s) => {
            let mut map = Map::new();
            map.insert("content".to_string(), Value::String(s));
            Value::Object(map)
        }
        other => other,
    };
    let spec_map = match &spec {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };

    let content_value = spec_map.get("content").cloned().unwrap_or(default_content);
    let encoded = encode_content(content_value, cache);

    let existing_content_type = default_headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let mut content_type = spec_map
        .get("type")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or(existing_content_type)
        .unwrap_or(encoded.content_type);

    let charset = spec_map
        .get("charset")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or(default_charset)
        .unwrap_or_else(|| "utf-8".to_string());
    if !charset.is_empty() && !content_type.contains(';') && !content_type.contains("image") {
        content_type = format!("{content_type}; charset={charset}");
    }

    let mut headers = default_headers;
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        headers.insert(http::header::CONTENT_TYPE, value);
    }
    if let Some(Value::Object(extra_headers)) = spec_map.get("headers") {
        for (name, value) in extra_headers {
            if let (Ok(name), Some(value_str)) = (
                HeaderName::from_bytes(name.as_bytes()),
                value.as_str().map(str::to_string).or_else(|| Some(value.to_string())),
            ) {
                if let Ok(value) = HeaderValue::from_str(&value_str) {
                    headers.insert(name, value);
                }
            }
        }
    }

    let status = spec_map
        .get("status")
        .and_then(|v| v.as_u64())
        .map(|n| n as u16)
        .unwrap_or(default_status);

    Response {
        status,
        headers,
        body: Bytes::from(encoded.bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegexCache;
    use serde_json::json;

    #[test]
    fn make_response_defaults_to_200_and_json_utf8() {
        let mut cache = RegexCache::new();
        let response = make_response(
            json!("pong"),
            200,
            Value::Null,
            HeaderMap::new(),
            None,
            &mut cache,
        );
        assert_eq!(response.status, 200);
        assert_eq!(response.text(), "pong");
        let content_type = response.headers.get(http::header::CONTENT_TYPE).unwrap();
        assert_eq!(content_type, "application/json; charset=utf-8");
    }

    #[test]
    fn make_response_honors_explicit_status_and_headers() {
        let mut cache = RegexCache::new();
        let response = make_response(
            json!({"status": 503, "headers": {"X-Mock": "1"}}),
            200,
            Value::Null,
            HeaderMap::new(),
            None,
            &mut cache,
        );
        assert_eq!(response.status, 503);
        assert_eq!(response.headers.get("X-Mock").unwrap(), "1");
    }
}
