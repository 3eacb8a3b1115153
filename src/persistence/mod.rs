//! Durable correspondence store.
//!
//! This module defines the trait the reconciliation engine uses to remember
//! what it has published, plus the DuckDB-backed implementation used by the
//! binary. Both stores are keyed by `(scope_id, correspondence_id)`.

mod duckdb_store;
pub mod migrations;

use chrono::{DateTime, Utc};

pub use duckdb_store::DuckDbStore;

use crate::error::StoreError;
use crate::types::{LocationRecord, SyncRecord};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Persistence operations required by the sync engine.
///
/// Implementations must be safe to share between concurrently running
/// scopes; each call is atomic on its own.
pub trait CorrespondenceStore: Send + Sync {
    // ========== Sync records ==========

    /// All chunk records of a correspondence id, ordered by `chunk_index`.
    fn find_sync_records(
        &self,
        scope_id: &str,
        correspondence_id: &str,
    ) -> StoreResult<Vec<SyncRecord>>;

    /// Whether at least one chunk record exists.
    fn has_sync_records(&self, scope_id: &str, correspondence_id: &str) -> StoreResult<bool>;

    fn insert_sync_record(&self, record: &SyncRecord) -> StoreResult<()>;

    /// Replace the record identified by `(scope_id, correspondence_id, chunk_index)`.
    fn update_sync_record(&self, record: &SyncRecord) -> StoreResult<()>;

    /// Refresh `synced_at` on every chunk of a correspondence id. Returns the
    /// number of records touched.
    fn touch_sync_records(
        &self,
        scope_id: &str,
        correspondence_id: &str,
        synced_at: DateTime<Utc>,
    ) -> StoreResult<usize>;

    fn remove_sync_record(
        &self,
        scope_id: &str,
        correspondence_id: &str,
        chunk_index: u32,
    ) -> StoreResult<()>;

    /// Records whose `synced_at` is strictly before `before`.
    fn stale_sync_records(&self, before: DateTime<Utc>) -> StoreResult<Vec<SyncRecord>>;

    fn count_sync_records(&self) -> StoreResult<usize>;

    // ========== Location records ==========

    fn find_location(
        &self,
        scope_id: &str,
        correspondence_id: &str,
    ) -> StoreResult<Option<LocationRecord>>;

    fn insert_location(&self, record: &LocationRecord) -> StoreResult<()>;

    // ========== Maintenance ==========

    fn migration_applied(&self, name: &str) -> StoreResult<bool>;

    fn record_migration(&self, name: &str, applied_at: DateTime<Utc>) -> StoreResult<()>;

    /// Records written before scopes were tracked (empty `scope_id`).
    fn unscoped_sync_records(&self) -> StoreResult<Vec<SyncRecord>>;

    /// Move an unscoped record into `scope_id`.
    fn assign_scope(
        &self,
        correspondence_id: &str,
        chunk_index: u32,
        scope_id: &str,
    ) -> StoreResult<()>;
}
