//! Rule resolver (C4): selects the one applicable handler for a flow and
//! event, layers the global handler in, evaluates match predicates, and
//! hands the winning candidate to the state reducer (C5).
//!
//! Grounded on `original_source/moxy.py`'s `resolve_config`,
//! `request_matches_config`, and `response_matches_config`.

use crate::config::{LoadedConfig, RegexCache};
use crate::flow::{Flow, Request, Response};
use crate::pattern::{content_matches, host_matches, matches_value_or_list};
use crate::state::{resolve_config_state, RuntimeState};
use serde_json::{Map, Value};
use tracing::info;

/// Which half of the flow is being resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Request,
    Response,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Request => "request",
            EventKind::Response => "response",
        }
    }
}

/// The result of a successful resolution: the flat rule (state operators
/// already consumed) plus whether it asked the host to shut down.
pub struct Resolution {
    pub rule: Value,
    pub terminate: bool,
}

/// Returns the configuration for `event` given `flow`, or `None` if no
/// rule applies (the flow passes through unmodified) or the matched rule
/// explicitly opts out via `pass`.
pub fn resolve_config(
    flow: &Flow,
    event: EventKind,
    loaded: &LoadedConfig,
    runtime: &mut RuntimeState,
    cache: &mut RegexCache,
) -> Option<Resolution> {
    let path = &flow.request.path;
    let Some(handlers) = loaded.handlers(event.as_str()) else {
        return None;
    };

    let path_with_query = flow.request.path_with_query();
    let path_handler = handlers
        .get(&path_with_query)
        .or_else(|| handlers.get(path));

    let path_handler = match path_handler {
        Some(handler) => handler.clone(),
        None => {
            let table = match event {
                EventKind::Request => &loaded.re_request,
                EventKind::Response => &loaded.re_response,
            };
            match table.iter().find(|(re, _)| re.is_match(path)) {
                Some((_, handler)) => handler.clone(),
                None => return None,
            }
        }
    };

    let global = handlers.get("*").cloned().unwrap_or(Value::Object(Map::new()));

    let config = match path_handler {
        Value::Array(candidates) => {
            let mut matched = None;
            for candidate in candidates {
                let handler_config = if global.is_array() {
                    candidate
                } else {
                    layer(&global, &candidate)
                };
                if predicates_match(flow, event, &handler_config, loaded, runtime, cache) {
                    matched = Some(handler_config);
                    break;
                }
            }
            matched?
        }
        single => {
            let config = if let Value::Array(global_candidates) = &global {
                let mut matched = None;
                for candidate in global_candidates {
                    let handler_config = layer(candidate, &single);
                    if predicates_match(flow, event, &handler_config, loaded, runtime, cache) {
                        matched = Some(handler_config);
                        break;
                    }
                }
                matched
            } else {
                Some(layer(&global, &single))
            };
            let config = config?;
            if !predicates_match(flow, event, &config, loaded, runtime, cache) {
                return None;
            }
            config
        }
    };

    let config = resolve_config_state(path, config, runtime);

    if config.get("pass").map(crate::pattern::is_truthy).unwrap_or(false) {
        return None;
    }

    if let Some(msg) = config.get("log") {
        if crate::pattern::is_truthy(msg) {
            let label = match msg {
                Value::String(s) => s.clone(),
                _ => "Log".to_string(),
            };
            match event {
                EventKind::Request => {
                    info!(path = %flow.request.path, "{label}: {} {}", flow.request.method, flow.request.path)
                }
                EventKind::Response => {
                    info!(path = %flow.request.path, "{label}: {} {} -> {}", flow.request.method, flow.request.path, flow.response.as_ref().map(|r| r.status).unwrap_or(0))
                }
            }
        }
    }

    let terminate = config.get("terminate").map(crate::pattern::is_truthy).unwrap_or(false);

    Some(Resolution { rule: config, terminate })
}

/// Shallow merge: `entry` wins over `base` on key collision.
fn layer(base: &Value, entry: &Value) -> Value {
    let mut merged = match base {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    if let Value::Object(entry_map) = entry {
        for (key, value) in entry_map {
            merged.insert(key.clone(), value.clone());
        }
    }
    Value::Object(merged)
}

fn predicates_match(
    flow: &Flow,
    event: EventKind,
    config: &Value,
    loaded: &LoadedConfig,
    runtime: &RuntimeState,
    cache: &mut RegexCache,
) -> bool {
    if !request_matches_config(&flow.request, config, loaded, runtime, cache) {
        return false;
    }
    if event == EventKind::Response && !response_matches_config(flow.response.as_ref(), config, cache) {
        return false;
    }
    true
}

/// Evaluates the request-side predicates of spec.md §3/§4.1: `host`,
/// `scheme`, `method`, `path`, `query`, `request` (body content), and
/// `require` (stored-state membership).
pub fn request_matches_config(
    request: &Request,
    config: &Value,
    loaded: &LoadedConfig,
    runtime: &RuntimeState,
    cache: &mut RegexCache,
) -> bool {
    if !crate::pattern::is_truthy(config) {
        return false;
    }

    let host_allow = config.get("host").or_else(|| loaded.default_value("host"));
    if let Some(allow) = host_allow {
        if !host_matches(&request.host, allow, cache) {
            return false;
        }
    }

    let scheme_allow = config.get("scheme").or_else(|| loaded.default_value("scheme"));
    if let Some(scheme) = scheme_allow {
        if crate::pattern::is_truthy(scheme)
            && !matches_value_or_list(&Value::String(request.scheme.clone()), scheme, cache)
        {
            return false;
        }
    }

    if let Some(method) = config.get("method") {
        if crate::pattern::is_truthy(method)
            && !matches_value_or_list(&Value::String(request.method.clone()), method, cache)
        {
            return false;
        }
    }

    if let Some(path_allow) = config.get("path") {
        if crate::pattern::is_truthy(path_allow)
            && !matches_value_or_list(&Value::String(request.path.clone()), path_allow, cache)
        {
            return false;
        }
    }

    if let Some(Value::Object(required_query)) = config.get("query") {
        let query_object = request.query.to_json();
        for (key, expected) in required_query {
            let Some(actual) = query_object.get(key) else {
                return false;
            };
            if !matches_value_or_list(actual, expected, cache) {
                return false;
            }
        }
    }

    if let Some(required_content) = config.get("request") {
        if crate::pattern::is_truthy(required_content) {
            let text = request.text();
            if !content_matches(Some(text.as_str()), required_content, None, cache) {
                return false;
            }
        }
    }

    if let Some(required_state) = config.get("require") {
        match required_state {
            Value::Object(map) => {
                for (variable, required_value) in map {
                    let value = runtime.get_variable(variable);
                    if !matches_value_or_list(&value, required_value, cache) {
                        return false;
                    }
                }
            }
            other if crate::pattern::is_truthy(other) => {
                let variable = config
                    .get("variable")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| request.path.clone());
                let value = runtime.get_variable(&variable);
                if !matches_value_or_list(&value, other, cache) {
                    return false;
                }
            }
            _ => {}
        }
    }

    true
}

/// Evaluates the response-side predicates of spec.md §3/§4.1: `status`,
/// `error`, and `content`.
pub fn response_matches_config(response: Option<&Response>, config: &Value, cache: &mut RegexCache) -> bool {
    let Some(response) = response else {
        return false;
    };

    if let Some(status) = config.get("status") {
        if crate::pattern::is_truthy(status)
            && !matches_value_or_list(&Value::Number(response.status.into()), status, cache)
        {
            return false;
        }
    }

    if let Some(Value::Bool(required_error)) = config.get("error") {
        if *required_error != response.is_error() {
            return false;
        }
    }

    if let Some(required_content) = config.get("content") {
        if crate::pattern::is_truthy(required_content) {
            let text = response.text();
            if !content_matches(Some(text.as_str()), required_content, None, cache) {
                return false;
            }
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_file;
    use crate::flow::{OrderedMultiMap, Request as FlowRequest};
    use bytes::Bytes;
    use http::HeaderMap;
    use serde_json::json;
    use std::io::Write;

    fn make_request(path: &str) -> FlowRequest {
        FlowRequest {
            scheme: "http".into(),
            host: "h".into(),
            method: "GET".into(),
            path: path.into(),
            query: OrderedMultiMap::new(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    #[test]
    fn regex_path_order_determines_first_match() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"request": {{"~^/u/\\d+$": {{"respond": "numeric"}}, "~^/u/": {{"respond": "generic"}}}}}}"#
        )
        .unwrap();
        let (loaded, mut cache) = load_config_file(file.path()).unwrap();
        let mut runtime = RuntimeState::new();
        let flow = Flow::new(make_request("/u/42"));
        let resolution = resolve_config(&flow, EventKind::Request, &loaded, &mut runtime, &mut cache).unwrap();
        assert_eq!(resolution.rule, json!({"respond": "numeric"}));
    }

    #[test]
    fn no_handler_returns_none() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"request": {{"/ping": {{"respond": "pong"}}}}}}"#).unwrap();
        let (loaded, mut cache) = load_config_file(file.path()).unwrap();
        let mut runtime = RuntimeState::new();
        let flow = Flow::new(make_request("/missing"));
        assert!(resolve_config(&flow, EventKind::Request, &loaded, &mut runtime, &mut cache).is_none());
    }

    #[test]
    fn global_handler_layers_under_path_handler() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"request": {{"*": {{"method": "GET"}}, "/ping": {{"respond": "pong"}}}}}}"#
        )
        .unwrap();
        let (loaded, mut cache) = load_config_file(file.path()).unwrap();
        let mut runtime = RuntimeState::new();
        let flow = Flow::new(make_request("/ping"));
        let resolution = resolve_config(&flow, EventKind::Request, &loaded, &mut runtime, &mut cache).unwrap();
        assert_eq!(resolution.rule.get("respond"), Some(&json!("pong")));
    }

    #[test]
    fn pass_opts_out_of_mocking() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"request": {{"/a": {{"pass": true}}}}}}"#).unwrap();
        let (loaded, mut cache) = load_config_file(file.path()).unwrap();
        let mut runtime = RuntimeState::new();
        let flow = Flow::new(make_request("/a"));
        assert!(resolve_config(&flow, EventKind::Request, &loaded, &mut runtime, &mut cache).is_none());
    }
}
