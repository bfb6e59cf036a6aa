//! The `save` extension point (resolves spec.md §9's open question: the
//! source script's `save` handler was a project-specific stub writing to a
//! local file, out of scope for a general-purpose engine).
//!
//! `SaveSink` lets a host proxy plug in its own persistence (a file, a
//! queue, a metrics counter) without the engine depending on any of it
//! directly, the same seam `mitigation-node` uses for its WAF's logging
//! backend.

use crate::flow::Flow;
use serde_json::Value;
use tracing::debug;

/// Receives the `save` target value and the flow it was attached to,
/// whenever a rule's `save` key fires on either side of the exchange.
pub trait SaveSink: Send + Sync {
    fn save(&self, target: Value, flow: &Flow, event: &str);
}

/// The default sink: logs at debug and discards. Good enough for the
/// engine's own tests and for hosts that don't care about `save`.
#[derive(Debug, Default)]
pub struct NoopSaveSink;

impl SaveSink for NoopSaveSink {
    fn save(&self, target: Value, flow: &Flow, event: &str) {
        debug!(
            path = %flow.request.path,
            event,
            target = %target,
            "save fired, discarded by the default sink"
        );
    }
}
