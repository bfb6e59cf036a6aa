//! Content transforms (C2): `mergeContent`, `deleteContent`,
//! `replaceInContent`, `modifyContent` over JSON trees, plus the filename
//! resolution pre-pass and response encoding.
//!
//! Grounded line-for-line on `original_source/moxy.py`'s
//! `resolve_value`/`merge_content`/`delete_content`/`replace_in_content`/
//! `modify_content`/`encode_content`/`make_response`. Transform failures
//! are swallowed per spec.md §7 kind 6 (runtime exception in a transform):
//! logged at debug, the element treated as a no-op.

use crate::config::RegexCache;
use crate::pattern::is_subset;
use serde_json::{Map, Value};
use std::path::Path;
use tracing::debug;

/// Resolves a "file reference" value: a string starting with `.` and
/// ending in `.json`/`.js` is loaded from disk and parsed as JSON. Any
/// failure (missing file, bad JSON) silently keeps the original string,
/// per spec.md §7 kind 2.
pub fn resolve_value(value: Value) -> Value {
    if let Value::String(s) = &value {
        let looks_like_file = s.starts_with('.') && (s.ends_with(".json") || s.ends_with(".js"));
        if looks_like_file {
            match std::fs::read_to_string(Path::new(s)) {
                Ok(text) => match serde_json::from_str(&text) {
                    Ok(parsed) => return parsed,
                    Err(err) => {
                        debug!(path = %s, error = %err, "referenced file did not contain valid JSON, keeping literal");
                    }
                },
                Err(err) => {
                    debug!(path = %s, error = %err, "referenced file missing, keeping literal");
                }
            }
        }
    }
    value
}

fn is_empty_ish(value: &Value) -> bool {
    !crate::pattern::is_truthy(value)
}

/// Recursively merges `merge` into `content`, per spec.md §4.2.
pub fn merge_content(merge: Value, content: Option<Value>, cache: &mut RegexCache) -> Value {
    let merge = resolve_value(merge);
    match merge {
        Value::Object(ref map) if map.len() == 1 && map.contains_key("replace_with") => {
            resolve_value(map["replace_with"].clone())
        }
        Value::Object(ref map) if map.len() == 1 && map.contains_key("replace_in") => {
            replace_in_content(map["replace_in"].clone(), content.unwrap_or(Value::Null), cache)
        }
        Value::Object(map) => {
            match content {
                Some(Value::Object(mut content_map)) => {
                    for (key, sub_merge) in map {
                        let existing = content_map.get(&key).cloned();
                        content_map.insert(key, merge_content(sub_merge, existing, cache));
                    }
                    Value::Object(content_map)
                }
                Some(Value::Array(items)) if map.contains_key("where") => {
                    Value::Array(merge_into_list(&map, items, cache))
                }
                _ => {
                    // content is neither an object nor (where-eligible) a
                    // list: build a brand-new object from `merge` alone.
                    let mut built = Map::new();
                    for (key, sub_merge) in map {
                        built.insert(key, merge_content(sub_merge, None, cache));
                    }
                    Value::Object(built)
                }
            }
        }
        Value::Array(elements) => {
            let elements: Vec<Value> = elements.into_iter().map(resolve_value).collect();
            let mut base: Vec<Value> = match content {
                Some(Value::Array(items)) => items,
                Some(other) => vec![other],
                None => Vec::new(),
            };
            for element in elements {
                base.push(merge_content(element, None, cache));
            }
            Value::Array(base)
        }
        other => other,
    }
}

fn merge_into_list(merge: &Map<String, Value>, mut content: Vec<Value>, cache: &mut RegexCache) -> Vec<Value> {
    let where_clause = merge.get("where").cloned().unwrap_or(Value::Null);
    let negated = merge.get("negated").map(crate::pattern::is_truthy).unwrap_or(false);
    let forall = merge.get("forall").map(crate::pattern::is_truthy).unwrap_or(true);
    let move_to = merge.get("move").and_then(|v| v.as_str()).map(str::to_string);
    let insert_at = merge.get("insert").and_then(|v| v.as_str()).map(str::to_string);

    let mut index = 0usize;
    let mut end_index = content.len();
    while index < end_index {
        let is_hit = is_subset(&where_clause, &content[index], cache) != negated;
        if !is_hit {
            index += 1;
            continue;
        }

        let mut new_element = Some(content[index].clone());
        if let Some(replace) = merge.get("replace") {
            new_element = Some(merge_content(replace.clone(), None, cache));
        } else if let Some(set_content) = merge.get("content") {
            new_element = Some(merge_content(set_content.clone(), None, cache));
        }
        if let Some(sub_merge) = merge.get("merge") {
            new_element = Some(merge_content(
                sub_merge.clone(),
                Some(new_element.unwrap_or(Value::Object(Map::new()))),
                cache,
            ));
        } else if merge.get("delete").map(crate::pattern::is_truthy).unwrap_or(false) {
            new_element = None;
        }

        match new_element {
            None => {
                content.remove(index);
                end_index -= 1;
            }
            Some(element) if move_to.is_some() => {
                content.remove(index);
                match move_to.as_deref() {
                    Some("head") | Some("first") => {
                        content.insert(0, element);
                        index += 1;
                    }
                    _ => {
                        content.push(element);
                        end_index -= 1;
                    }
                }
            }
            Some(element) if insert_at.is_some() => {
                if insert_at.as_deref() == Some("before") {
                    content.insert(index, element);
                } else {
                    content.insert(index + 1, element);
                }
                index += 1;
                end_index += 1;
            }
            Some(element) => {
                content[index] = element;
                index += 1;
            }
        }

        if !forall {
            break;
        }
    }
    content
}

/// Deletes `delete` from `content`, per spec.md §4.2.
pub fn delete_content(delete: Value, content: Value, cache: &mut RegexCache) -> Value {
    match (delete, content) {
        (Value::Object(delete_map), Value::Object(mut content_map)) => {
            for (key, rule) in delete_map {
                match rule {
                    Value::Object(rule_map) if !rule_map.is_empty() => {
                        if let Some(Value::Object(_)) = content_map.get(&key) {
                            let nested = content_map.remove(&key).unwrap();
                            content_map.insert(
                                key,
                                delete_content(Value::Object(rule_map), nested, cache),
                            );
                        }
                    }
                    Value::Object(_) => {
                        content_map.remove(&key);
                    }
                    Value::Array(rule_list) if !rule_list.is_empty() => {
                        if let Some(Value::Array(_)) = content_map.get(&key) {
                            let nested = content_map.remove(&key).unwrap();
                            content_map.insert(
                                key,
                                delete_content(Value::Array(rule_list), nested, cache),
                            );
                        }
                    }
                    Value::Array(_) => {
                        content_map.remove(&key);
                    }
                    scalar => {
                        let matches = is_empty_ish(&scalar) || content_map.get(&key) == Some(&scalar);
                        if matches {
                            content_map.remove(&key);
                        }
                    }
                }
            }
            Value::Object(content_map)
        }
        (Value::Array(patterns), Value::Array(items)) => {
            if patterns.is_empty() {
                Value::Array(Vec::new())
            } else {
                let filtered = items
                    .into_iter()
                    .filter(|item| !patterns.iter().any(|pattern| is_subset(pattern, item, cache)))
                    .collect();
                Value::Array(filtered)
            }
        }
        (_, _) => Value::Array(Vec::new()),
    }
}

/// Renders a JSON value back to text for writing into a request/response
/// body: strings pass through verbatim, everything else is serialized.
pub fn content_as_str_value(value: &Value) -> String {
    content_as_str(value)
}

fn content_as_str(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn content_as_object(value: &Value) -> Value {
    match value {
        Value::String(s) => serde_json::from_str(s).unwrap_or(Value::Object(Map::new())),
        Value::Null => Value::Object(Map::new()),
        other => other.clone(),
    }
}

/// Splits a sed-style string (`/pattern/replacement/` with any delimiter
/// character) into `(pattern, replacement)`.
fn split_sed_expr(expr: &str) -> Option<(String, String)> {
    let mut chars = expr.chars();
    let delimiter = chars.next()?;
    let rest: String = chars.collect();
    let fields: Vec<&str> = rest.splitn(3, delimiter).collect();
    if fields.len() == 2 {
        Some((fields[0].to_string(), fields[1].to_string()))
    } else {
        None
    }
}

/// Applies `replace` (dict update or regex substitution) to `content`.
pub fn replace_in_content(replace: Value, content: Value, cache: &mut RegexCache) -> Value {
    match replace {
        Value::Object(update) => {
            let mut object = match content_as_object(&content) {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            for (key, value) in update {
                object.insert(key, value);
            }
            Value::Object(object)
        }
        Value::String(expr) => {
            let Some((pattern, replacement)) = split_sed_expr(&expr) else {
                return Value::String(expr);
            };
            apply_regex_substitution(&pattern, &replacement, content, cache)
        }
        Value::Array(fields) if fields.len() == 2 => {
            let pattern = content_as_str(&fields[0]);
            let replacement = content_as_str(&fields[1]);
            apply_regex_substitution(&pattern, &replacement, content, cache)
        }
        other => other,
    }
}

fn apply_regex_substitution(
    pattern: &str,
    replacement: &str,
    content: Value,
    cache: &mut RegexCache,
) -> Value {
    let Some(re) = cache.get(pattern) else {
        return content;
    };
    let was_string = matches!(content, Value::String(_));
    let text = content_as_str(&content);
    // `$name`-less replacements in the source use Python's `\1` backreferences;
    // the `regex` crate's replacement syntax uses `$1`, so translate here.
    let translated = translate_backreferences(replacement);
    let replaced = re.replace_all(&text, translated.as_str()).into_owned();
    if was_string {
        Value::String(replaced)
    } else {
        serde_json::from_str(&replaced).unwrap_or(Value::String(replaced))
    }
}

fn translate_backreferences(replacement: &str) -> String {
    let mut out = String::with_capacity(replacement.len());
    let mut chars = replacement.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(d) = chars.peek() {
                if d.is_ascii_digit() {
                    out.push('$');
                    out.push(*d);
                    chars.next();
                    continue;
                }
            }
            out.push(c);
        } else if c == '$' {
            out.push_str("$$");
        } else {
            out.push(c);
        }
    }
    out
}

/// Applies every element of `modify` (normalized to a list) to `content`
/// in turn: `delete`, then `replace`, then `merge` within one mapping
/// element; a raw sed string or `[pattern, replacement]` pair is treated
/// as a text substitution.
pub fn modify_content(modify: Value, content: Value, cache: &mut RegexCache) -> Value {
    let elements: Vec<Value> = match modify {
        Value::Object(_) | Value::String(_) => vec![modify],
        Value::Array(items) => items,
        other => vec![other],
    };

    let mut content = content;
    for element in elements {
        content = match element {
            Value::Object(map) => {
                let mut content_value = content;
                if let Some(delete) = map.get("delete") {
                    if crate::pattern::is_truthy(delete) {
                        content_value = delete_content(delete.clone(), content_as_object(&content_value), cache);
                    }
                }
                if let Some(replace) = map.get("replace") {
                    if crate::pattern::is_truthy(replace) {
                        content_value = apply_replace_action(replace.clone(), content_value, cache);
                    }
                }
                if let Some(merge) = map.get("merge") {
                    if crate::pattern::is_truthy(merge) {
                        content_value = apply_merge_action(merge.clone(), content_value, cache);
                    }
                }
                content_value
            }
            Value::String(expr) => apply_text_substitution(&expr, content, cache),
            Value::Array(fields) if fields.len() == 2 => {
                let pattern = content_as_str(&fields[0]);
                let replacement = content_as_str(&fields[1]);
                apply_regex_substitution(&pattern, &replacement, content, cache)
            }
            _ => content,
        };
    }
    content
}

fn apply_text_substitution(expr: &str, content: Value, cache: &mut RegexCache) -> Value {
    match split_sed_expr(expr) {
        Some((pattern, replacement)) => apply_regex_substitution(&pattern, &replacement, content, cache),
        None => {
            debug!(expr = expr, "malformed sed-style modify expression, leaving content unchanged");
            content
        }
    }
}

fn apply_replace_action(replace: Value, content: Value, cache: &mut RegexCache) -> Value {
    if let Value::String(file_or_text) = &replace {
        if let Ok(bytes) = std::fs::read(file_or_text) {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            return match serde_json::from_str::<Value>(&text) {
                Ok(parsed) => parsed,
                Err(_) => Value::String(text),
            };
        }
        return Value::String(file_or_text.clone());
    }
    replace_in_content(replace, content, cache)
}

fn apply_merge_action(merge: Value, content: Value, cache: &mut RegexCache) -> Value {
    let merge = if let Value::String(path) = &merge {
        match std::fs::read_to_string(path).ok().and_then(|t| serde_json::from_str(&t).ok()) {
            Some(parsed) => parsed,
            None => merge,
        }
    } else {
        merge
    };
    merge_content(merge, Some(content_as_object(&content)), cache)
}

/// Guessed MIME type and bytes for a content value, per spec.md's
/// `encodeContent`.
pub struct EncodedContent {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Encodes `content` into bytes plus an inferred content type:
/// - a string naming an existing file is read from disk, type inferred
///   from its extension;
/// - any other string is treated as raw text (HTML if it starts with `<`,
///   else as JSON);
/// - an object/array is first run through [`merge_content`] (so nested
///   `replace_with`/`replace_in` directives work inside responses) and
///   serialized as JSON.
pub fn encode_content(content: Value, cache: &mut RegexCache) -> EncodedContent {
    if let Value::String(s) = &content {
        if let Ok(bytes) = std::fs::read(s) {
            let content_type = if s.ends_with(".html") {
                "text/html"
            } else if s.ends_with(".xml") {
                "text/xml"
            } else if s.ends_with(".txt") || s.ends_with(".md") {
                "text/plain"
            } else if s.ends_with(".js") {
                "application/javascript"
            } else {
                "application/json"
            };
            return EncodedContent {
                bytes,
                content_type: content_type.to_string(),
            };
        }
        let content_type = if s.starts_with('<') { "text/html" } else { "application/json" };
        return EncodedContent {
            bytes: s.clone().into_bytes(),
            content_type: content_type.to_string(),
        };
    }

    let processed = match &content {
        Value::Object(_) => merge_content(content.clone(), Some(Value::Object(Map::new())), cache),
        Value::Array(_) => merge_content(content.clone(), Some(Value::Array(Vec::new())), cache),
        _ => content.clone(),
    };
    EncodedContent {
        bytes: content_as_str(&processed).into_bytes(),
        content_type: "application/json".to_string(),
    }
}
