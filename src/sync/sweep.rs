//! Mark-and-sweep deletion of records not confirmed during the run.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{error, info, warn};

use super::context::CancelToken;
use super::stats::{ErrorKey, RunStats};
use crate::error::Result;
use crate::persistence::CorrespondenceStore;
use crate::platform::MutationGateway;
use crate::staging::ErrorSink;
use crate::types::{CorrespondenceId, ScopeId, SyncRecord};

pub struct Sweeper<'a> {
    pub gateway: &'a MutationGateway,
    pub store: &'a dyn CorrespondenceStore,
    pub sink: &'a ErrorSink,
    pub cancel: &'a CancelToken,
    pub simulate: bool,
    /// Scopes whose setup failed this run.
    pub excluded_scopes: &'a HashSet<ScopeId>,
    /// Target ids whose update failed this run.
    pub ignored_deletes: &'a HashSet<String>,
    /// `(scope, correspondence id)` pairs confirmed by a simulated run, whose
    /// records were deliberately left untouched.
    pub confirmed: &'a HashSet<(ScopeId, CorrespondenceId)>,
}

impl Sweeper<'_> {
    /// Delete every record synced before `run_start` that this run did not
    /// confirm, on the target first and then locally.
    pub async fn sweep(&self, run_start: DateTime<Utc>, stats: &mut RunStats) -> Result<()> {
        let stale = self.store.stale_sync_records(run_start)?;
        info!(candidates = stale.len(), "sweeping stale records");

        for record in stale {
            if self.cancel.is_cancelled() {
                warn!("run cancelled, stopping sweep");
                stats.cancelled = true;
                break;
            }
            if !self.is_removable(&record) {
                continue;
            }

            match self.remove(&record).await {
                Ok(()) => stats.scope_mut(&record.scope_id).removed_events += 1,
                Err(err) => {
                    let err = err.context("Error on event remove");
                    error!(
                        scope = %record.scope_id,
                        correspondence_id = %record.correspondence_id,
                        target_id = %record.target_id,
                        error = %err,
                        "failed to remove stale event"
                    );
                    stats.scope_mut(&record.scope_id).record_error(
                        ErrorKey::EventRemoveErrors,
                        &record.correspondence_id,
                        &err,
                    );
                    let subject = json!({
                        "scopeId": record.scope_id,
                        "correspondenceId": record.correspondence_id,
                        "targetId": record.target_id,
                    });
                    self.sink
                        .record(&format!("{}.json", record.target_id), &err, Some(&subject))
                        .await;
                }
            }
        }
        Ok(())
    }

    fn is_removable(&self, record: &SyncRecord) -> bool {
        if self.excluded_scopes.contains(&record.scope_id)
            || self.ignored_deletes.contains(&record.target_id)
        {
            return false;
        }
        !(self.simulate
            && self
                .confirmed
                .contains(&(record.scope_id.clone(), record.correspondence_id.clone())))
    }

    async fn remove(&self, record: &SyncRecord) -> Result<()> {
        info!(
            scope = %record.scope_id,
            correspondence_id = %record.correspondence_id,
            target_id = %record.target_id,
            "removing stale event"
        );
        if self.simulate {
            return Ok(());
        }
        self.gateway
            .delete(&record.scope_id, &record.target_id)
            .await?;
        self.store.remove_sync_record(
            &record.scope_id,
            &record.correspondence_id,
            record.chunk_index,
        )?;
        Ok(())
    }
}
