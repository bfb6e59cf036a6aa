//! A scriptable HTTP(S) mocking/mutation engine, embeddable in an
//! intercepting proxy.
//!
//! Modules mirror the pipeline a flow passes through: [`pattern`] and
//! [`content`] are the pure matching/transform primitives, [`config`]
//! loads and watches the JSON rule tree, [`state`] and [`resolver`]
//! together pick and flatten the one rule that applies to an event,
//! [`apply`] carries it out, and [`engine`] wires the whole thing behind
//! one lock for a host ([`proxy`]) to drive.

pub mod apply;
pub mod config;
pub mod content;
pub mod engine;
pub mod error;
pub mod flow;
pub mod pattern;
pub mod proxy;
pub mod resolver;
pub mod save;
pub mod state;

pub use engine::Engine;
pub use error::{MockError, Result};
pub use flow::{Flow, OrderedMultiMap, Request, Response};
pub use save::{NoopSaveSink, SaveSink};
