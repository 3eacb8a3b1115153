//! Run statistics and error classification.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{ErrorCategory, SourceDataKind, SyncError};
use crate::types::ScopeId;

/// Where in the flow an error was caught.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKey {
    EventMapErrors,
    LocationErrors,
    EventCreateErrors,
    EventUpdateErrors,
    EventCreateTimingsErrors,
    EventRemoveTimingsErrors,
    EventRecreateErrors,
    EventFalsyRemoveErrors,
    EventRemoveErrors,
}

/// Source ids that hit each kind of source data defect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceErrorLists {
    pub missing_timings: Vec<String>,
    pub missing_location: Vec<String>,
    pub validation_error: Vec<String>,
}

impl SourceErrorLists {
    /// Push `id` into the list of `kind`. Returns `false` when already listed.
    fn push(&mut self, kind: SourceDataKind, id: &str) -> bool {
        let list = match kind {
            SourceDataKind::MissingTimings => &mut self.missing_timings,
            SourceDataKind::MissingLocation => &mut self.missing_location,
            SourceDataKind::ValidationError => &mut self.validation_error,
        };
        if list.iter().any(|existing| existing == id) {
            return false;
        }
        list.push(id.to_string());
        true
    }

    pub fn is_empty(&self) -> bool {
        self.missing_timings.is_empty()
            && self.missing_location.is_empty()
            && self.validation_error.is_empty()
    }
}

/// Counters of one scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScopeStats {
    /// Source records dispatched into this scope.
    pub saved_events: u64,
    pub ignored_events: u64,
    pub created_events: u64,
    pub updated_events: u64,
    pub up_to_date_events: u64,
    pub removed_events: u64,
    pub recreated_events: u64,
    pub removed_falsy_events: u64,
    pub created_locations: u64,
    pub invalid_images: u64,

    pub merged_source_events: u64,
    /// Number of source records merged, per correspondence id.
    pub merged_by_id: BTreeMap<String, u32>,

    pub split_source_locations: u64,
    pub splitted_source_locations: u64,
    pub split_source_events: u64,
    pub splitted_source_events: u64,

    pub errors: BTreeMap<ErrorKey, u64>,
    pub source_errors: SourceErrorLists,
    pub remote_request_errors: u64,
    pub unclassified_errors: u64,
}

impl ScopeStats {
    /// Count an error caught at `key` for the source entity `id`.
    ///
    /// A source data error lists `id` under its kind and counts under `key`
    /// only the first time `id` is seen for that kind. A remote error counts
    /// only as a remote request error. Anything else counts under `key` and
    /// as unclassified.
    pub fn record_error(&mut self, key: ErrorKey, id: &str, error: &SyncError) {
        match error.category() {
            ErrorCategory::SourceData(kind) => {
                if self.source_errors.push(kind, id) {
                    *self.errors.entry(key).or_default() += 1;
                }
            }
            ErrorCategory::RemotePlatform => self.remote_request_errors += 1,
            ErrorCategory::Unclassified => {
                *self.errors.entry(key).or_default() += 1;
                self.unclassified_errors += 1;
            }
        }
    }

    pub fn error_count(&self, key: ErrorKey) -> u64 {
        self.errors.get(&key).copied().unwrap_or_default()
    }

    pub fn record_split(&mut self, chunks: usize) {
        if chunks > 1 {
            self.split_source_events += 1;
            self.splitted_source_events += chunks as u64;
        }
    }
}

/// Statistics of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct RunStats {
    /// Correlates log lines and error snapshots of one run.
    pub run_id: Uuid,
    pub start_sync_date: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Source records downloaded into the staging area.
    pub downloaded_records: u64,
    pub scopes: BTreeMap<ScopeId, ScopeStats>,
    /// Records that could not be assigned to a scope.
    pub dispatch_errors: u64,
    /// Scopes whose setup (schema, known locations) failed.
    pub scope_errors: u64,
    /// Source listing failure; the run stopped before dispatch.
    pub source_error: Option<String>,
    /// Failure preparing the run itself (working directory, store).
    pub fatal_error: Option<String>,
    /// Leftover staged records from an interrupted run were dispatched first.
    pub resumed: bool,
    pub swept: bool,
    pub cancelled: bool,
}

impl RunStats {
    pub fn new(start_sync_date: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::now_v7(),
            start_sync_date,
            finished_at: None,
            downloaded_records: 0,
            scopes: BTreeMap::new(),
            dispatch_errors: 0,
            scope_errors: 0,
            source_error: None,
            fatal_error: None,
            resumed: false,
            swept: false,
            cancelled: false,
        }
    }

    pub fn scope(&self, scope_id: &str) -> Option<&ScopeStats> {
        self.scopes.get(scope_id)
    }

    pub fn scope_mut(&mut self, scope_id: &str) -> &mut ScopeStats {
        self.scopes.entry(scope_id.to_string()).or_default()
    }

    /// Sum of a counter over every scope.
    pub fn total(&self, counter: impl Fn(&ScopeStats) -> u64) -> u64 {
        self.scopes.values().map(counter).sum()
    }
}
