//! Config loader & watcher (C3), plus the regex cache (part of C1/C5's
//! shared runtime state).
//!
//! Grounded on `mitigation-node/src/config.rs`'s `ConfigManager` for the
//! load/reload idiom, and on `original_source/moxy.py`'s
//! `load_config_file`/`extract_regex_paths`/`reload_config_if_updated` for
//! the exact semantics: JSON parsed with insertion order preserved
//! (`serde_json`'s `preserve_order` feature stands in for the source's
//! `OrderedDict` hack), regex path specifiers extracted in source order,
//! and a full atomic swap on reload with no partial updates.

use crate::error::{MockError, Result};
use regex::{Regex, RegexBuilder};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{error, warn};

/// Regular expressions interned by source string, so that repeated
/// evaluations of the same pattern across many events don't recompile it.
/// Flushed whenever the configuration is reloaded.
///
/// Two pools are kept because `is_subset` regexes run in multi-line/DOTALL
/// mode (to ease matching against templated, multi-line bodies) while
/// every other regex use (`host`, `~path`, value matching) does not; the
/// same source string can appear in both roles with different intended
/// semantics.
#[derive(Debug, Default)]
pub struct RegexCache {
    general: HashMap<String, Option<Arc<Regex>>>,
    subset: HashMap<String, Option<Arc<Regex>>>,
}

impl RegexCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Case-sensitive, free-spacing/extended mode (`(?x)`), matching the
    /// source's `re.compile(re_str, re.X)`.
    pub fn get(&mut self, source: &str) -> Option<Arc<Regex>> {
        Self::cached(&mut self.general, source, false)
    }

    /// As [`RegexCache::get`], plus multi-line and DOTALL, for `is_subset`
    /// regexes matched against (potentially multi-line) templated content.
    pub fn get_subset(&mut self, source: &str) -> Option<Arc<Regex>> {
        Self::cached(&mut self.subset, source, true)
    }

    fn cached(
        pool: &mut HashMap<String, Option<Arc<Regex>>>,
        source: &str,
        subset_mode: bool,
    ) -> Option<Arc<Regex>> {
        if let Some(existing) = pool.get(source) {
            return existing.clone();
        }
        let mut builder = RegexBuilder::new(source);
        builder.ignore_whitespace(true);
        if subset_mode {
            builder.multi_line(true).dot_matches_new_line(true);
        }
        let compiled = match builder.build() {
            Ok(re) => Some(Arc::new(re)),
            Err(err) => {
                error!(pattern = source, error = %err, "failed to compile regular expression");
                None
            }
        };
        pool.insert(source.to_string(), compiled.clone());
        compiled
    }

    pub fn clear(&mut self) {
        self.general.clear();
        self.subset.clear();
    }
}

/// A fully parsed and validated configuration, plus the derived regex
/// path tables extracted from it.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// The raw configuration tree, insertion order preserved.
    pub root: Value,
    /// Regex `request` specifiers, in source order (first match wins).
    pub re_request: Vec<(Arc<Regex>, Value)>,
    /// Regex `response` specifiers, in source order.
    pub re_response: Vec<(Arc<Regex>, Value)>,
    pub modified_at: SystemTime,
}

impl LoadedConfig {
    pub fn handlers(&self, event: &str) -> Option<&Value> {
        self.root.get(event)
    }

    /// A top-level default (`host`, `scheme`, `charset`, `save`), inherited
    /// by every rule unless a rule overrides it.
    pub fn default_value(&self, key: &str) -> Option<&Value> {
        self.root.get(key)
    }
}

/// Compiles every `~`-prefixed key of `handlers` into a regex path table,
/// preserving the iteration order of the source map (the tie-break order
/// at match time). A key that fails to compile is dropped (logged) rather
/// than aborting the whole load.
fn extract_regex_paths(handlers: Option<&Value>, cache: &mut RegexCache) -> Vec<(Arc<Regex>, Value)> {
    let mut table = Vec::new();
    let Some(Value::Object(map)) = handlers else {
        return table;
    };
    for (path, handler) in map {
        let Some(pattern) = path.strip_prefix('~') else {
            continue;
        };
        if let Some(re) = cache.get(pattern) {
            table.push((re, handler.clone()));
        } else {
            warn!(path = %path, "dropping unparsable regex path specifier");
        }
    }
    table
}

/// Reads and parses `path`, returning the derived [`LoadedConfig`] plus a
/// fresh [`RegexCache`] (the cache is flushed on every reload per spec).
pub fn load_config_file(path: &Path) -> Result<(LoadedConfig, RegexCache)> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| MockError::Config(format!("reading {}: {e}", path.display())))?;
    let root: Value = serde_json::from_str(&text)
        .map_err(|e| MockError::Config(format!("parsing {}: {e}", path.display())))?;
    let modified_at = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut cache = RegexCache::new();
    let re_request = extract_regex_paths(root.get("request"), &mut cache);
    let re_response = extract_regex_paths(root.get("response"), &mut cache);

    Ok((
        LoadedConfig {
            root,
            re_request,
            re_response,
            modified_at,
        },
        cache,
    ))
}

pub fn file_modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Resolves the configuration file path from the `--mock` CLI option,
/// defaulting to `mock.json` per the host proxy contract's `onLoad`.
pub fn default_mock_path() -> PathBuf {
    PathBuf::from("mock.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn regex_cache_memoizes_by_source() {
        let mut cache = RegexCache::new();
        let a = cache.get("^/foo$").unwrap();
        let b = cache.get("^/foo$").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn regex_cache_drops_invalid_pattern() {
        let mut cache = RegexCache::new();
        assert!(cache.get("(unterminated").is_none());
    }

    #[test]
    fn load_config_preserves_regex_path_order() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"request": {{"~^/b": {{"respond": "b"}}, "~^/a": {{"respond": "a"}}}}}}"#
        )
        .unwrap();
        let (config, _cache) = load_config_file(file.path()).unwrap();
        assert_eq!(config.re_request.len(), 2);
        // Source order: ~^/b first, then ~^/a.
        assert!(config.re_request[0].0.as_str().contains("/b"));
        assert!(config.re_request[1].0.as_str().contains("/a"));
    }

    #[test]
    fn load_config_rejects_bad_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(load_config_file(file.path()).is_err());
    }
}
