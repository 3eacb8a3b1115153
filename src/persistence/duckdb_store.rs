use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use duckdb::{params, Connection};
use tracing::debug;

use super::{CorrespondenceStore, StoreResult};
use crate::error::StoreError;
use crate::types::{LocationRecord, SyncRecord};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sync_records (
    scope_id TEXT NOT NULL,
    correspondence_id TEXT NOT NULL,
    chunk_index BIGINT NOT NULL,
    synced_at TEXT NOT NULL,
    target_id TEXT NOT NULL,
    target_data TEXT NOT NULL,
    PRIMARY KEY (scope_id, correspondence_id, chunk_index)
);

CREATE TABLE IF NOT EXISTS location_records (
    scope_id TEXT NOT NULL,
    correspondence_id TEXT NOT NULL,
    synced_at TEXT NOT NULL,
    target_data TEXT NOT NULL,
    PRIMARY KEY (scope_id, correspondence_id)
);

CREATE TABLE IF NOT EXISTS migrations (
    name TEXT PRIMARY KEY,
    applied_at TEXT NOT NULL
);
"#;

const SYNC_COLUMNS: &str =
    "scope_id, correspondence_id, chunk_index, synced_at, target_id, target_data";

/// DuckDB-backed [`CorrespondenceStore`].
///
/// The connection is shared behind a mutex; DuckDB connections are not
/// `Sync` and the engine only needs a single writer.
#[derive(Clone)]
pub struct DuckDbStore {
    conn: Arc<Mutex<Connection>>,
}

/// Row as stored, before timestamp and JSON decoding.
struct RawSyncRow {
    scope_id: String,
    correspondence_id: String,
    chunk_index: i64,
    synced_at: String,
    target_id: String,
    target_data: String,
}

impl RawSyncRow {
    fn from_row(row: &duckdb::Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            scope_id: row.get(0)?,
            correspondence_id: row.get(1)?,
            chunk_index: row.get(2)?,
            synced_at: row.get(3)?,
            target_id: row.get(4)?,
            target_data: row.get(5)?,
        })
    }

    fn decode(self) -> StoreResult<SyncRecord> {
        Ok(SyncRecord {
            scope_id: self.scope_id,
            correspondence_id: self.correspondence_id,
            chunk_index: u32::try_from(self.chunk_index).unwrap_or_default(),
            synced_at: decode_timestamp(&self.synced_at)?,
            target_id: self.target_id,
            target_data: serde_json::from_str(&self.target_data)?,
        })
    }
}

/// Fixed-width RFC 3339 so that text comparison matches time order.
fn encode_timestamp(instant: &DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_timestamp(raw: &str) -> StoreResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

impl DuckDbStore {
    /// Open (or create) a database file, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        debug!(path = %path.display(), "opening correspondence store");
        Self::bootstrap(Connection::open(path)?)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn query_sync_records(
        conn: &Connection,
        sql: &str,
        params: &[&dyn duckdb::ToSql],
    ) -> StoreResult<Vec<SyncRecord>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, RawSyncRow::from_row)?
            .collect::<duckdb::Result<Vec<_>>>()?;
        rows.into_iter().map(RawSyncRow::decode).collect()
    }
}

impl CorrespondenceStore for DuckDbStore {
    fn find_sync_records(
        &self,
        scope_id: &str,
        correspondence_id: &str,
    ) -> StoreResult<Vec<SyncRecord>> {
        let conn = self.conn()?;
        Self::query_sync_records(
            &conn,
            &format!(
                "SELECT {SYNC_COLUMNS} FROM sync_records \
                 WHERE scope_id = ? AND correspondence_id = ? \
                 ORDER BY chunk_index"
            ),
            params![scope_id, correspondence_id],
        )
    }

    fn has_sync_records(&self, scope_id: &str, correspondence_id: &str) -> StoreResult<bool> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sync_records WHERE scope_id = ? AND correspondence_id = ?",
            params![scope_id, correspondence_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn insert_sync_record(&self, record: &SyncRecord) -> StoreResult<()> {
        let target_data = serde_json::to_string(&record.target_data)?;
        let conn = self.conn()?;
        conn.execute(
            &format!("INSERT INTO sync_records ({SYNC_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?)"),
            params![
                record.scope_id,
                record.correspondence_id,
                i64::from(record.chunk_index),
                encode_timestamp(&record.synced_at),
                record.target_id,
                target_data,
            ],
        )?;
        Ok(())
    }

    fn update_sync_record(&self, record: &SyncRecord) -> StoreResult<()> {
        let target_data = serde_json::to_string(&record.target_data)?;
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sync_records SET synced_at = ?, target_id = ?, target_data = ? \
             WHERE scope_id = ? AND correspondence_id = ? AND chunk_index = ?",
            params![
                encode_timestamp(&record.synced_at),
                record.target_id,
                target_data,
                record.scope_id,
                record.correspondence_id,
                i64::from(record.chunk_index),
            ],
        )?;
        Ok(())
    }

    fn touch_sync_records(
        &self,
        scope_id: &str,
        correspondence_id: &str,
        synced_at: DateTime<Utc>,
    ) -> StoreResult<usize> {
        let conn = self.conn()?;
        let touched = conn.execute(
            "UPDATE sync_records SET synced_at = ? WHERE scope_id = ? AND correspondence_id = ?",
            params![encode_timestamp(&synced_at), scope_id, correspondence_id],
        )?;
        Ok(touched)
    }

    fn remove_sync_record(
        &self,
        scope_id: &str,
        correspondence_id: &str,
        chunk_index: u32,
    ) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM sync_records \
             WHERE scope_id = ? AND correspondence_id = ? AND chunk_index = ?",
            params![scope_id, correspondence_id, i64::from(chunk_index)],
        )?;
        Ok(())
    }

    fn stale_sync_records(&self, before: DateTime<Utc>) -> StoreResult<Vec<SyncRecord>> {
        let conn = self.conn()?;
        Self::query_sync_records(
            &conn,
            &format!(
                "SELECT {SYNC_COLUMNS} FROM sync_records WHERE synced_at < ? \
                 ORDER BY scope_id, correspondence_id, chunk_index"
            ),
            params![encode_timestamp(&before)],
        )
    }

    fn count_sync_records(&self) -> StoreResult<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sync_records", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn find_location(
        &self,
        scope_id: &str,
        correspondence_id: &str,
    ) -> StoreResult<Option<LocationRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT synced_at, target_data FROM location_records \
             WHERE scope_id = ? AND correspondence_id = ?",
        )?;
        let mut rows = stmt.query_map(params![scope_id, correspondence_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        match rows.next() {
            Some(row) => {
                let (synced_at, target_data) = row?;
                Ok(Some(LocationRecord {
                    scope_id: scope_id.to_string(),
                    correspondence_id: correspondence_id.to_string(),
                    synced_at: decode_timestamp(&synced_at)?,
                    target_data: serde_json::from_str(&target_data)?,
                }))
            }
            None => Ok(None),
        }
    }

    fn insert_location(&self, record: &LocationRecord) -> StoreResult<()> {
        let target_data = serde_json::to_string(&record.target_data)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO location_records (scope_id, correspondence_id, synced_at, target_data) \
             VALUES (?, ?, ?, ?) ON CONFLICT DO NOTHING",
            params![
                record.scope_id,
                record.correspondence_id,
                encode_timestamp(&record.synced_at),
                target_data,
            ],
        )?;
        Ok(())
    }

    fn migration_applied(&self, name: &str) -> StoreResult<bool> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM migrations WHERE name = ?",
            params![name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn record_migration(&self, name: &str, applied_at: DateTime<Utc>) -> StoreResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO migrations (name, applied_at) VALUES (?, ?)",
            params![name, encode_timestamp(&applied_at)],
        )?;
        Ok(())
    }

    fn unscoped_sync_records(&self) -> StoreResult<Vec<SyncRecord>> {
        let conn = self.conn()?;
        Self::query_sync_records(
            &conn,
            &format!(
                "SELECT {SYNC_COLUMNS} FROM sync_records WHERE scope_id = '' \
                 ORDER BY correspondence_id, chunk_index"
            ),
            params![],
        )
    }

    fn assign_scope(
        &self,
        correspondence_id: &str,
        chunk_index: u32,
        scope_id: &str,
    ) -> StoreResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            &format!(
                "INSERT INTO sync_records ({SYNC_COLUMNS}) \
                 SELECT ?, correspondence_id, chunk_index, synced_at, target_id, target_data \
                 FROM sync_records \
                 WHERE scope_id = '' AND correspondence_id = ? AND chunk_index = ?"
            ),
            params![scope_id, correspondence_id, i64::from(chunk_index)],
        )?;
        tx.execute(
            "DELETE FROM sync_records \
             WHERE scope_id = '' AND correspondence_id = ? AND chunk_index = ?",
            params![correspondence_id, i64::from(chunk_index)],
        )?;
        tx.commit()?;
        Ok(())
    }
}
