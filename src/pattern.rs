//! Pattern primitives (C1): host/scheme/value/content matching with glob
//! (prefix/suffix), regex (`~`), and subset semantics.
//!
//! Grounded on `original_source/moxy.py`'s `host_matches`,
//! `matches_value_or_list`, `is_subset`, and `content_matches`, carried
//! over with the corrected (non-self-recursive) form of
//! `matches_value_or_list` noted in spec.md's design notes.

use crate::config::RegexCache;
use serde_json::Value;

/// Returns whether `host` matches `allow`.
///
/// - `nil` (JSON null / absent) always matches.
/// - A string prefixed with `.` matches any `host` ending with the suffix
///   after the dot.
/// - A string suffixed with `.` matches any `host` starting with the full
///   pattern (dot included).
/// - A string prefixed with `~` is a regex searched against `host`.
/// - Any other string must equal `host` exactly.
/// - An object means set membership keyed by `host`, truthy value required.
/// - An array matches if any element matches.
pub fn host_matches(host: &str, allow: &Value, cache: &mut RegexCache) -> bool {
    match allow {
        Value::Null => true,
        Value::String(pattern) => {
            if let Some(suffix) = pattern.strip_prefix('.') {
                host.ends_with(suffix)
            } else if pattern.ends_with('.') {
                host.starts_with(pattern.as_str())
            } else if let Some(re_src) = pattern.strip_prefix('~') {
                cache
                    .get(re_src)
                    .map(|re| re.is_match(host))
                    .unwrap_or(false)
            } else {
                host == pattern
            }
        }
        Value::Object(map) => map.get(host).map(is_truthy).unwrap_or(false),
        Value::Array(items) => items.iter().any(|item| host_matches(host, item, cache)),
        _ => false,
    }
}

/// Returns whether a JSON value is "truthy" in the sense the source script
/// uses for Python dict/list/bool/number truthiness.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn json_type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Returns whether `value` matches `allow`.
///
/// `allow` may be of the same JSON type as `value` (direct equality, with a
/// `~`-prefixed string escape hatch into regex search), an object (truthy
/// membership keyed by `value`'s string form), a string compared against
/// `value`'s string form, or an array (any element matches).
pub fn matches_value_or_list(value: &Value, allow: &Value, cache: &mut RegexCache) -> bool {
    if json_type_rank(value) == json_type_rank(allow) {
        if let Value::String(pattern) = allow {
            if let Some(re_src) = pattern.strip_prefix('~') {
                if value.as_str() == Some(pattern.as_str()) {
                    return true;
                }
                return cache
                    .get(re_src)
                    .map(|re| re.is_match(value.as_str().unwrap_or_default()))
                    .unwrap_or(false);
            }
        }
        return value == allow;
    }
    match allow {
        Value::Object(map) => {
            let key = value_as_lookup_key(value);
            map.get(&key).map(is_truthy).unwrap_or(false)
        }
        Value::String(pattern) => *pattern == value_as_str(value),
        Value::Array(items) => items
            .iter()
            .any(|item| matches_value_or_list(value, item, cache)),
        _ => false,
    }
}

fn value_as_lookup_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => value_as_str(other),
    }
}

fn value_as_str(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Structural recursive containment: `sub` matches when every part of it
/// is found inside `super_`.
///
/// - An object `sub` matches when every key is present in `super_` and the
///   values recurse.
/// - An array `sub` matches when every element finds some matching element
///   in `super_` (existential, non-positional).
/// - A string `sub` equal to `~` is a wildcard; `~`-prefixed is regex over
///   `super_`'s string form; otherwise string equality over that form.
/// - Scalars compare by equality. Mismatched shapes return `false`, never
///   raise.
pub fn is_subset(sub: &Value, super_: &Value, cache: &mut RegexCache) -> bool {
    match sub {
        Value::Object(sub_map) => {
            let super_map = match super_ {
                Value::Object(m) => m,
                _ => return false,
            };
            sub_map.iter().all(|(key, sub_value)| {
                super_map
                    .get(key)
                    .map(|super_value| is_subset(sub_value, super_value, cache))
                    .unwrap_or(false)
            })
        }
        Value::Array(sub_items) => {
            let super_items = match super_ {
                Value::Array(items) => items,
                _ => return false,
            };
            sub_items.iter().all(|sub_item| {
                super_items
                    .iter()
                    .any(|super_item| is_subset(sub_item, super_item, cache))
            })
        }
        Value::String(pattern) => {
            if pattern == "~" {
                true
            } else if let Some(re_src) = pattern.strip_prefix('~') {
                cache
                    .get_subset(re_src)
                    .map(|re| re.is_match(&value_as_str(super_)))
                    .unwrap_or(false)
            } else {
                value_as_str(super_) == *pattern
            }
        }
        other => other == super_,
    }
}

/// Returns whether `text` (and, lazily, its JSON-parsed form) satisfies
/// every element of `allow` (normalized to a list, AND semantics).
///
/// - A string element prefixed `~` is a regex search over `text`.
/// - A string element otherwise must be a substring of `text`.
/// - An object element is matched via [`is_subset`] against `text` parsed
///   as JSON (`object`, if already available, is reused instead of
///   re-parsing).
pub fn content_matches(
    text: Option<&str>,
    allow: &Value,
    object: Option<&Value>,
    cache: &mut RegexCache,
) -> bool {
    let owned;
    let items: &[Value] = match allow {
        Value::String(_) | Value::Object(_) => {
            owned = vec![allow.clone()];
            &owned
        }
        Value::Array(items) => items,
        _ => return true,
    };

    let mut text_cache: Option<String> = text.map(|s| s.to_string());
    let mut object_cache: Option<Value> = object.cloned();

    for allowed in items {
        match allowed {
            Value::String(pattern) => {
                if text_cache.is_none() {
                    text_cache = Some(
                        object_cache
                            .as_ref()
                            .map(|v| content_as_str(v))
                            .unwrap_or_default(),
                    );
                }
                let text = text_cache.as_deref().unwrap_or_default();
                if let Some(re_src) = pattern.strip_prefix('~') {
                    let matched = cache.get(re_src).map(|re| re.is_match(text)).unwrap_or(false);
                    if !matched {
                        return false;
                    }
                } else if !text.contains(pattern.as_str()) {
                    return false;
                }
            }
            Value::Object(_) => {
                if object_cache.is_none() {
                    object_cache = text_cache
                        .as_deref()
                        .map(|t| serde_json::from_str(t).unwrap_or(Value::Object(Default::default())));
                }
                let object = object_cache.as_ref().unwrap();
                if !is_subset(allowed, object, cache) {
                    return false;
                }
            }
            _ => {
                if !content_matches(text_cache.as_deref(), allowed, object_cache.as_ref(), cache) {
                    return false;
                }
            }
        }
    }
    true
}

fn content_as_str(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache() -> RegexCache {
        RegexCache::new()
    }

    #[test]
    fn host_matches_suffix_prefix_and_exact() {
        let mut cache = cache();
        assert!(host_matches("api.example.com", &json!(".example.com"), &mut cache));
        assert!(host_matches("api.example.com", &json!("api."), &mut cache));
        assert!(host_matches("api.example.com", &json!("api.example.com"), &mut cache));
        assert!(!host_matches("api.example.com", &json!("other.com"), &mut cache));
        assert!(host_matches("anything", &Value::Null, &mut cache));
    }

    #[test]
    fn host_matches_regex_and_list() {
        let mut cache = cache();
        assert!(host_matches("api-42.example.com", &json!("~^api-\\d+\\."), &mut cache));
        assert!(host_matches(
            "b.com",
            &json!(["a.com", "b.com"]),
            &mut cache
        ));
    }

    #[test]
    fn matches_value_or_list_numbers_and_regex() {
        let mut cache = cache();
        assert!(matches_value_or_list(&json!(200), &json!(200), &mut cache));
        assert!(!matches_value_or_list(&json!(200), &json!(404), &mut cache));
        assert!(matches_value_or_list(
            &json!("/users/42"),
            &json!("~^/users/\\d+$"),
            &mut cache
        ));
        assert!(matches_value_or_list(
            &json!("GET"),
            &json!(["GET", "POST"]),
            &mut cache
        ));
    }

    #[test]
    fn subset_law_object_and_list() {
        let mut cache = cache();
        let sub = json!({"a": 1, "b": {"c": "~"}});
        let sup = json!({"a": 1, "b": {"c": "anything"}, "extra": true});
        assert!(is_subset(&sub, &sup, &mut cache));

        let sub_list = json!(["x", "~^y"]);
        let sup_list = json!(["x", "y-thing", "z"]);
        assert!(is_subset(&sub_list, &sup_list, &mut cache));
    }

    #[test]
    fn subset_rejects_type_mismatch_without_panicking() {
        let mut cache = cache();
        assert!(!is_subset(&json!({"a": 1}), &json!([1, 2]), &mut cache));
        assert!(!is_subset(&json!([1]), &json!({"a": 1}), &mut cache));
    }

    #[test]
    fn content_matches_is_conjunctive() {
        let mut cache = cache();
        let allow = json!(["needle", {"ok": true}]);
        assert!(content_matches(
            Some("a needle in here"),
            &allow,
            Some(&json!({"ok": true})),
            &mut cache
        ));
        assert!(!content_matches(
            Some("no match here"),
            &allow,
            Some(&json!({"ok": true})),
            &mut cache
        ));
    }
}
