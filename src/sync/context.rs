//! Per-scope run state and cooperative cancellation.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use super::stats::ScopeStats;
use crate::types::{ChangeSet, CorrespondenceId, ScopeId, TargetLocation};

/// Everything the engine accumulates about one scope during a run.
#[derive(Debug)]
pub struct ScopeContext {
    pub scope_id: ScopeId,
    /// Form schema handed to `map` and `post_map`.
    pub schema: Value,
    /// Snapshot of the target's locations, taken at first encounter.
    pub known_locations: Vec<TargetLocation>,
    pub changes: ChangeSet,
    pub stats: ScopeStats,
    /// Target ids whose update failed; protected from the sweep.
    pub ignored_deletes: HashSet<String>,
    /// Correspondence ids confirmed (created, updated or refreshed).
    pub confirmed: HashSet<CorrespondenceId>,
}

impl ScopeContext {
    pub fn new(
        scope_id: impl Into<ScopeId>,
        schema: Value,
        known_locations: Vec<TargetLocation>,
        stats: ScopeStats,
    ) -> Self {
        Self {
            scope_id: scope_id.into(),
            schema,
            known_locations,
            changes: ChangeSet::default(),
            stats,
            ignored_deletes: HashSet::new(),
            confirmed: HashSet::new(),
        }
    }
}

/// Cooperative abort signal: an explicit flag plus an optional deadline.
///
/// Checked between top-level iterations only; a mutation in flight always
/// completes.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    aborted: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same flag, with a deadline `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            aborted: Arc::clone(&self.aborted),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    /// Clear the flag so the engine can run again.
    pub fn reset(&self) {
        self.aborted.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}
