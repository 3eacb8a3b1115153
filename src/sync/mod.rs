//! Reconciliation engine.
//!
//! A run downloads the source into the staging area, dispatches every staged
//! record into per-scope work lists, reconciles each scope against the
//! correspondence store (create phase, then update phase) and finally sweeps
//! records that no source record confirmed.

pub mod aggregator;
pub mod context;
pub mod dispatch;
pub mod engine;
pub mod location;
pub mod orchestrator;
pub mod stats;
pub mod sweep;

pub use context::{CancelToken, ScopeContext};
pub use engine::SyncEngine;
pub use stats::{ErrorKey, RunStats, ScopeStats};
