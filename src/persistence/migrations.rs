//! Named, run-once data migrations.

use chrono::Utc;
use tracing::{info, warn};

use super::{CorrespondenceStore, StoreResult};

type MigrationFn = fn(&dyn CorrespondenceStore) -> StoreResult<()>;

/// Migrations in application order.
const MIGRATIONS: &[(&str, MigrationFn)] = &[("backfill_scope_id", backfill_scope_id)];

/// Apply every migration not yet recorded. Returns the names applied.
pub fn run_pending(store: &dyn CorrespondenceStore) -> StoreResult<Vec<&'static str>> {
    let mut applied = Vec::new();
    for (name, migration) in MIGRATIONS {
        if store.migration_applied(name)? {
            continue;
        }
        info!(migration = name, "applying migration");
        migration(store)?;
        store.record_migration(name, Utc::now())?;
        applied.push(*name);
    }
    Ok(applied)
}

/// Records written before scopes were tracked carry the scope in the
/// published payload (`agendaUid`).
fn backfill_scope_id(store: &dyn CorrespondenceStore) -> StoreResult<()> {
    for record in store.unscoped_sync_records()? {
        let scope = record
            .target_data
            .extra
            .get("agendaUid")
            .and_then(|value| match value {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            });

        match scope {
            Some(scope) => {
                store.assign_scope(&record.correspondence_id, record.chunk_index, &scope)?;
            }
            None => warn!(
                correspondence_id = %record.correspondence_id,
                "cannot backfill scope: no agendaUid in stored payload"
            ),
        }
    }
    Ok(())
}
