//! The mock engine: the single `RwLock`-guarded piece of shared state a
//! host proxy drives through four callbacks (`on_load`, `on_configure`,
//! `on_request`, `on_response`) plus `on_error`.
//!
//! Grounded on `mitigation-node/src/waf.rs`'s `WafEngine` (an
//! `Arc<RwLock<_>>`-wrapped engine exposing async check methods to the
//! proxy loop) for the shape, and on `original_source/moxy.py`'s
//! module-level `load`, `configure`, `request`, `response`, `done`
//! functions for the exact event semantics. The coarse single lock
//! mirrors the source's single-threaded event loop: every event sees a
//! config/state snapshot that is either fully the old one or fully the
//! new one (invariant 1), and counters/cycles/config reload never
//! interleave (invariant 4).

use crate::apply::{apply_request, apply_response};
use crate::config::{load_config_file, LoadedConfig, RegexCache};
use crate::error::{MockError, Result};
use crate::flow::Flow;
use crate::resolver::{resolve_config, EventKind};
use crate::save::{NoopSaveSink, SaveSink};
use crate::state::RuntimeState;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::RwLock;
use tracing::{info, warn};

struct EngineState {
    loaded: Option<Arc<LoadedConfig>>,
    runtime: RuntimeState,
    cache: RegexCache,
}

/// The scriptable mock/mutation engine. Clone is cheap (an `Arc` clone);
/// every method takes `&self` and internally acquires the one lock.
pub struct Engine {
    mock_path: PathBuf,
    save_sink: Box<dyn SaveSink>,
    state: RwLock<EngineState>,
}

impl Engine {
    /// Builds an engine pointed at `mock_path`, not yet loaded. Call
    /// [`Engine::on_load`] before serving traffic.
    pub fn new(mock_path: PathBuf) -> Self {
        Self::with_save_sink(mock_path, Box::new(NoopSaveSink))
    }

    pub fn with_save_sink(mock_path: PathBuf, save_sink: Box<dyn SaveSink>) -> Self {
        Self {
            mock_path,
            save_sink,
            state: RwLock::new(EngineState {
                loaded: None,
                runtime: RuntimeState::new(),
                cache: RegexCache::new(),
            }),
        }
    }

    /// Loads the configuration for the first time. Mirrors the source
    /// script's `load` hook.
    pub async fn on_load(&self) -> Result<()> {
        let (loaded, cache) = load_config_file(&self.mock_path)?;
        let mut state = self.state.write().await;
        info!(path = %self.mock_path.display(), "mock configuration loaded");
        state.loaded = Some(Arc::new(loaded));
        state.cache = cache;
        state.runtime.clear();
        Ok(())
    }

    /// Reloads the configuration only if the file's mtime has advanced
    /// since it was last loaded. Mirrors `reload_config_if_updated`:
    /// reload is atomic (the old `LoadedConfig`/`RegexCache` stay in
    /// effect for every in-flight event until the swap completes) and
    /// never partial.
    pub async fn on_configure(&self) -> Result<()> {
        let disk_mtime = crate::config::file_modified_at(&self.mock_path);
        let mut state = self.state.write().await;
        let needs_reload = match (&state.loaded, disk_mtime) {
            (None, _) => true,
            (Some(loaded), Some(disk_mtime)) => disk_mtime > loaded.modified_at,
            (Some(_), None) => false,
        };
        if !needs_reload {
            return Ok(());
        }
        match load_config_file(&self.mock_path) {
            Ok((loaded, cache)) => {
                info!(path = %self.mock_path.display(), "mock configuration reloaded");
                state.loaded = Some(Arc::new(loaded));
                state.cache = cache;
            }
            Err(err) => {
                warn!(error = %err, "configuration reload failed, keeping previous configuration");
            }
        }
        Ok(())
    }

    /// Runs the request half of a flow: resolves the rule, then applies
    /// it. Returns whether the rule asked the host to terminate.
    pub async fn on_request(&self, flow: &mut Flow) -> Result<bool> {
        self.on_configure().await?;
        let mut state = self.state.write().await;
        let Some(loaded) = state.loaded.as_ref() else {
            return Err(MockError::Config("engine used before on_load".into()));
        };
        let loaded = loaded.clone();
        let EngineState { runtime, cache, .. } = &mut *state;

        let Some(resolution) = resolve_config(flow, EventKind::Request, &loaded, runtime, cache) else {
            return Ok(false);
        };
        apply_request(flow, &resolution.rule, &loaded, cache, self.save_sink.as_ref());
        flow.should_terminate = resolution.terminate;
        Ok(resolution.terminate)
    }

    /// Runs the response half of a flow, once the upstream (or a request-
    /// side mock) has produced one.
    pub async fn on_response(&self, flow: &mut Flow) -> Result<bool> {
        let mut state = self.state.write().await;
        let Some(loaded) = state.loaded.as_ref() else {
            return Err(MockError::Config("engine used before on_load".into()));
        };
        let loaded = loaded.clone();
        let EngineState { runtime, cache, .. } = &mut *state;

        let Some(resolution) = resolve_config(flow, EventKind::Response, &loaded, runtime, cache) else {
            return Ok(flow.should_terminate);
        };
        apply_response(flow, &resolution.rule, &loaded, cache, self.save_sink.as_ref());
        if resolution.terminate {
            flow.should_terminate = true;
        }
        Ok(flow.should_terminate)
    }

    /// Records a transport/upstream failure. The engine never aborts a
    /// flow on its own error (spec's propagation rule): this only logs.
    pub async fn on_error(&self, context: &str, error: &MockError) {
        warn!(context, error = %error, "engine error, flow continues unmocked");
    }

    pub async fn last_loaded_at(&self) -> Option<SystemTime> {
        self.state.read().await.loaded.as_ref().map(|l| l.modified_at)
    }
}
