//! State reducer (C5): reduces `set`/`once`/`count`/`cycle`/`random`/
//! `state` operator keys to a flat rule, mutating the engine's runtime
//! state (hit counts, cycle indices, named variables) along the way.
//!
//! Grounded on `original_source/moxy.py`'s `resolve_config_state`,
//! `count_based_config`, and `state_based_config`. Since the candidate
//! rule is already an owned `serde_json::Value` by the time it reaches
//! here (built fresh per event by the resolver), there's no need for the
//! source's "copy on first mutation" bookkeeping — every mutation below is
//! already local to this call.

use rand::seq::SliceRandom;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::debug;

/// The three coupled state machines the reducer owns: hit counts (for
/// `count`/`once`), cycle indices (for `cycle`), and named variables (for
/// `set`/`state`/`require`).
#[derive(Debug, Default)]
pub struct RuntimeState {
    pub hit_count: HashMap<String, u64>,
    pub cycle_index: HashMap<String, u64>,
    pub mock_state: HashMap<String, Value>,
}

impl RuntimeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.hit_count.clear();
        self.cycle_index.clear();
        self.mock_state.clear();
    }

    pub fn get_variable(&self, name: &str) -> Value {
        self.mock_state.get(name).cloned().unwrap_or(Value::String(String::new()))
    }
}

fn as_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn merge_shallow(target: &mut Map<String, Value>, addition: Value) {
    if let Value::Object(map) = addition {
        for (key, value) in map {
            target.insert(key, value);
        }
    }
}

/// Reduces `count_config` for the current hit of `count_id` (default
/// `path`), incrementing `hit_count`. Layers, in order, the `*` bucket,
/// the `even`/`odd` bucket, then the exact count key (as both string and
/// number, since JSON object keys are always strings but the config may
/// have been authored with a numeric literal), falling back to `~` if no
/// exact key exists.
fn count_based_config(path: &str, count_config: &Value, state: &mut RuntimeState) -> Value {
    let mut result = Map::new();
    let Value::Object(count_map) = count_config else {
        return Value::Object(result);
    };

    let count_id = count_map
        .get("id")
        .and_then(|v| v.as_str())
        .unwrap_or(path)
        .to_string();
    let count = state.hit_count.entry(count_id.clone()).or_insert(0);
    *count += 1;
    let count = *count;

    if let Some(star) = count_map.get("*") {
        merge_shallow(&mut result, star.clone());
    }
    let parity_key = if count % 2 == 0 { "even" } else { "odd" };
    if let Some(parity) = count_map.get(parity_key) {
        merge_shallow(&mut result, parity.clone());
    }

    // JSON object keys are always strings, even when the config's author
    // wrote a bare numeric literal (`2` parses the same as `"2"` as a map
    // key once the source JSON is loaded) — so only the string form needs
    // a lookup here.
    let exact = count_map.get(&count.to_string());
    match exact {
        Some(specific) => merge_shallow(&mut result, specific.clone()),
        None => {
            if let Some(fallback) = count_map.get("~") {
                merge_shallow(&mut result, fallback.clone());
            }
        }
    }

    Value::Object(result)
}

/// Picks the branch of `state_config` keyed by the current value of
/// `variable`, always first layering `*`, falling back to `~` if the exact
/// value isn't a key.
fn state_based_config(variable: &str, state_config: &Value, state: &RuntimeState) -> Value {
    let mut result = Map::new();
    let Value::Object(state_map) = state_config else {
        return Value::Object(result);
    };
    if let Some(star) = state_map.get("*") {
        merge_shallow(&mut result, star.clone());
    }
    let value = state.get_variable(variable);
    let key = match &value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    match state_map.get(&key) {
        Some(branch) => merge_shallow(&mut result, branch.clone()),
        None => {
            if let Some(fallback) = state_map.get("~") {
                merge_shallow(&mut result, fallback.clone());
            }
        }
    }
    Value::Object(result)
}

/// Repeatedly consumes state-operator keys from `config`, in the order
/// `set`, `once`, `count`, `cycle`, `random`, `state`, until a pass finds
/// none left. Recursion lets compositions like `count` producing a
/// `random` resolve correctly (invariant 3: the value returned carries no
/// operator keys).
pub fn resolve_config_state(path: &str, config: Value, state: &mut RuntimeState) -> Value {
    let mut config = as_object(config);

    if let Some(set_config) = config.remove("set") {
        if crate::pattern::is_truthy(&set_config) {
            match set_config {
                Value::Object(vars) => {
                    for (variable, value) in vars {
                        state.mock_state.insert(variable, value);
                    }
                }
                scalar => {
                    let variable = config
                        .get("variable")
                        .and_then(|v| v.as_str())
                        .unwrap_or(path)
                        .to_string();
                    state.mock_state.insert(variable, scalar);
                }
            }
        }
        return resolve_config_state(path, Value::Object(config), state);
    }

    if let Some(once_config) = config.remove("once") {
        if crate::pattern::is_truthy(&once_config) {
            let mut wrapper = Map::new();
            wrapper.insert("1".to_string(), once_config);
            let reduced = count_based_config(path, &Value::Object(wrapper), state);
            merge_shallow(&mut config, reduced);
        }
        return resolve_config_state(path, Value::Object(config), state);
    }

    if let Some(count_config) = config.remove("count") {
        if crate::pattern::is_truthy(&count_config) {
            let reduced = count_based_config(path, &count_config, state);
            merge_shallow(&mut config, reduced);
        }
        return resolve_config_state(path, Value::Object(config), state);
    }

    if let Some(cycle_config) = config.remove("cycle") {
        if let Value::Array(cycle) = &cycle_config {
            if !cycle.is_empty() {
                let cycle_id = config
                    .get("cycle-id")
                    .and_then(|v| v.as_str())
                    .unwrap_or(path)
                    .to_string();
                let index = state.cycle_index.entry(cycle_id).or_insert(0);
                let chosen = cycle[(*index as usize) % cycle.len()].clone();
                *index += 1;
                merge_shallow(&mut config, chosen);
            }
        }
        return resolve_config_state(path, Value::Object(config), state);
    }

    if let Some(random_config) = config.remove("random") {
        if let Value::Array(choices) = &random_config {
            if !choices.is_empty() {
                let chosen = choices
                    .choose(&mut rand::thread_rng())
                    .cloned()
                    .unwrap_or(Value::Null);
                merge_shallow(&mut config, chosen);
            }
        }
        return resolve_config_state(path, Value::Object(config), state);
    }

    if let Some(state_operator) = config.remove("state") {
        if crate::pattern::is_truthy(&state_operator) {
            let variable = state_operator
                .get("variable")
                .and_then(|v| v.as_str())
                .or_else(|| config.get("variable").and_then(|v| v.as_str()))
                .unwrap_or(path)
                .to_string();
            let reduced = state_based_config(&variable, &state_operator, state);
            merge_shallow(&mut config, reduced);
        }
        return resolve_config_state(path, Value::Object(config), state);
    }

    debug!(path = path, "state reduction settled, no operator keys remain");
    Value::Object(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn count_increments_and_picks_exact_then_fallback() {
        let mut state = RuntimeState::new();
        let config = json!({
            "count": {"1": {"respond": "first"}, "~": {"respond": "other"}}
        });
        let first = resolve_config_state("/u/42", config.clone(), &mut state);
        assert_eq!(first, json!({"respond": "first"}));
        let second = resolve_config_state("/u/42", config.clone(), &mut state);
        assert_eq!(second, json!({"respond": "other"}));
        let third = resolve_config_state("/u/42", config, &mut state);
        assert_eq!(third, json!({"respond": "other"}));
        assert_eq!(state.hit_count.get("/u/42"), Some(&3));
    }

    #[test]
    fn once_shares_the_count_with_count() {
        let mut state = RuntimeState::new();
        let config = json!({"once": {"respond": {"status": 503}}});
        let first = resolve_config_state("/a", config.clone(), &mut state);
        assert_eq!(first, json!({"respond": {"status": 503}}));
        let second = resolve_config_state("/a", config, &mut state);
        assert_eq!(second, json!({}));
    }

    #[test]
    fn cycle_wraps_with_independent_ids() {
        let mut state = RuntimeState::new();
        let config = json!({
            "cycle": [{"respond": {"status": 200}}, {"respond": {"status": 500}}]
        });
        let results: Vec<Value> = (0..4)
            .map(|_| resolve_config_state("/r", config.clone(), &mut state))
            .collect();
        assert_eq!(
            results,
            vec![
                json!({"respond": {"status": 200}}),
                json!({"respond": {"status": 500}}),
                json!({"respond": {"status": 200}}),
                json!({"respond": {"status": 500}}),
            ]
        );
    }

    #[test]
    fn set_then_state_matches_stored_variable() {
        let mut state = RuntimeState::new();
        let set_config = json!({"set": {"mode": "x"}});
        resolve_config_state("/a", set_config, &mut state);
        assert_eq!(state.mock_state.get("mode"), Some(&json!("x")));

        let state_config = json!({
            "state": {"variable": "mode", "x": {"respond": "got-x"}, "~": {"respond": "fallback"}}
        });
        let resolved = resolve_config_state("/b", state_config, &mut state);
        assert_eq!(resolved, json!({"respond": "got-x"}));
    }

    #[test]
    fn no_operator_keys_is_returned_unchanged() {
        let mut state = RuntimeState::new();
        let config = json!({"respond": "pong"});
        let resolved = resolve_config_state("/ping", config.clone(), &mut state);
        assert_eq!(resolved, config);
    }
}
