//! Dispatch: route staged source records into per-scope work lists.
//!
//! For each record: resolve its scope (setting the scope up on first
//! encounter), map it, run the map-stage pipeline, resolve its locations and
//! hand one entity per location to the aggregator.

use std::collections::{BTreeMap, HashSet};

use serde_json::json;
use tracing::{debug, error, info, warn};

use super::aggregator::aggregate;
use super::context::ScopeContext;
use super::location::LocationResolver;
use super::stats::{ErrorKey, RunStats};
use crate::adapter::SourceAdapter;
use crate::config::RunOptions;
use crate::error::{Result, SourceDataError, SyncError};
use crate::persistence::CorrespondenceStore;
use crate::pipeline::stages::DefaultCountryCode;
use crate::pipeline::{CallSite, Pipeline, StageContext};
use crate::platform::{list_all_locations, TargetPlatform};
use crate::staging::ErrorSink;
use crate::types::{MappedEntity, ScopeId, SourceRecord};

/// Scopes encountered so far in a run.
#[derive(Debug, Default)]
pub struct DispatchState {
    pub contexts: BTreeMap<ScopeId, ScopeContext>,
    /// Scopes whose setup failed; their records are skipped.
    pub failed_scopes: HashSet<ScopeId>,
}

pub struct Dispatcher<'a> {
    pub adapter: &'a dyn SourceAdapter,
    pub platform: &'a dyn TargetPlatform,
    pub store: &'a dyn CorrespondenceStore,
    pub pipeline: &'a Pipeline,
    pub country_code: &'a DefaultCountryCode,
    pub sink: &'a ErrorSink,
    pub options: &'a RunOptions,
}

impl Dispatcher<'_> {
    /// Dispatch one record. `name` identifies it in logs and the error sink.
    /// Failures are recorded, never returned.
    pub async fn dispatch(
        &self,
        state: &mut DispatchState,
        stats: &mut RunStats,
        name: &str,
        record: &SourceRecord,
    ) {
        let scope_id = match self.adapter.scope_id(record) {
            Ok(scope_id) => scope_id,
            Err(err) => {
                let err = SyncError::from(err).context("Failed to resolve scope");
                error!(record = name, error = %err, "dispatch error");
                stats.dispatch_errors += 1;
                self.sink.record(name, &err, Some(record)).await;
                return;
            }
        };

        if state.failed_scopes.contains(&scope_id) {
            debug!(record = name, scope = %scope_id, "skipping record of failed scope");
            return;
        }

        if !state.contexts.contains_key(&scope_id) {
            match self.setup_scope(&scope_id, stats).await {
                Ok(ctx) => {
                    state.contexts.insert(scope_id.clone(), ctx);
                }
                Err(err) => {
                    error!(scope = %scope_id, error = %err, "scope setup failed");
                    stats.scope_errors += 1;
                    state.failed_scopes.insert(scope_id);
                    self.sink.record(name, &err, Some(record)).await;
                    return;
                }
            }
        }
        let Some(ctx) = state.contexts.get_mut(&scope_id) else {
            return;
        };

        ctx.stats.saved_events += 1;
        self.dispatch_in_scope(ctx, name, record).await;
    }

    /// Fetch the schema and the known locations of a scope.
    async fn setup_scope(&self, scope_id: &str, stats: &mut RunStats) -> Result<ScopeContext> {
        info!(scope = scope_id, "setting up scope");
        let schema = self
            .platform
            .fetch_schema(scope_id)
            .await
            .map_err(|err| SyncError::from(err).context("Failed to fetch scope schema"))?;
        let known = list_all_locations(self.platform, scope_id, self.options.page_size)
            .await
            .map_err(|err| SyncError::from(err).context("Failed to list scope locations"))?;
        debug!(scope = scope_id, locations = known.len(), "known locations loaded");

        let previous = stats.scopes.remove(scope_id).unwrap_or_default();
        Ok(ScopeContext::new(scope_id, schema, known, previous))
    }

    async fn dispatch_in_scope(&self, ctx: &mut ScopeContext, name: &str, record: &SourceRecord) {
        let entity_id = match self.adapter.entity_id(record) {
            Ok(id) => id,
            Err(err) => {
                let err = SyncError::from(err).context("Error in event map");
                self.fail(ctx, ErrorKey::EventMapErrors, name, name, err, record)
                    .await;
                return;
            }
        };

        let mut entity = match self.map(ctx, record).await {
            Ok(Some(entity)) => entity,
            Ok(None) => {
                debug!(scope = %ctx.scope_id, entity_id = %entity_id, "record ignored by map");
                ctx.stats.ignored_events += 1;
                return;
            }
            Err(err) => {
                let err = err.context("Error in event map");
                self.fail(ctx, ErrorKey::EventMapErrors, &entity_id, name, err, record)
                    .await;
                return;
            }
        };

        let locations = std::mem::take(&mut entity.locations);
        if locations.len() > 1 {
            ctx.stats.split_source_locations += 1;
            ctx.stats.splitted_source_locations += locations.len() as u64;
        }

        let resolver = LocationResolver {
            adapter: self.adapter,
            platform: self.platform,
            store: self.store,
            country_code: self.country_code,
            simulate: self.options.simulate,
        };

        for (position, location) in locations.iter().enumerate() {
            // Snapshots are named per location so failures of one record do
            // not overwrite each other.
            let location_key = self
                .adapter
                .location_id(location, record)
                .unwrap_or_else(|_| format!("location-{position}"));
            let snapshot_name = format!("{entity_id}.{location_key}.json");

            let (location_id, target) = match resolver.resolve(ctx, record, location).await {
                Ok(resolved) => resolved,
                Err(err) => {
                    let err = err.context("Error in location phase");
                    self.fail(ctx, ErrorKey::LocationErrors, &entity_id, &snapshot_name, err, record)
                        .await;
                    continue;
                }
            };

            let data = MappedEntity {
                location_uid: target.uid,
                ..entity.clone()
            };
            if let Err(err) = aggregate(ctx, self.store, &entity_id, &location_id, data, record) {
                let err = err.context("Error in location phase");
                self.fail(ctx, ErrorKey::LocationErrors, &entity_id, &snapshot_name, err, record)
                    .await;
            }
        }
    }

    /// `map` followed by the map-stage pipeline. Entities without locations
    /// are rejected here.
    async fn map(
        &self,
        ctx: &mut ScopeContext,
        record: &SourceRecord,
    ) -> Result<Option<MappedEntity>> {
        let Some(mut entity) = self
            .adapter
            .map(record, &ctx.schema, &ctx.known_locations)
            .await?
        else {
            return Ok(None);
        };

        let mut stage_ctx = StageContext::new(&ctx.scope_id, CallSite::Map);
        let result = self.pipeline.run(&mut entity, &mut stage_ctx).await;
        ctx.stats.invalid_images += u64::from(stage_ctx.invalid_images);
        result?;

        if entity.locations.is_empty() {
            return Err(SourceDataError::MissingLocation.into());
        }
        Ok(Some(entity))
    }

    async fn fail(
        &self,
        ctx: &mut ScopeContext,
        key: ErrorKey,
        id: &str,
        name: &str,
        err: SyncError,
        record: &SourceRecord,
    ) {
        warn!(scope = %ctx.scope_id, id, record = name, error = %err, "dispatch error");
        ctx.stats.record_error(key, id, &err);
        let subject = json!({ "scopeId": ctx.scope_id, "id": id, "record": record });
        self.sink.record(name, &err, Some(&subject)).await;
    }
}
