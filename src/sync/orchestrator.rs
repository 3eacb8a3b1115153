//! Chunked upsert: the create and update phases of one scope.
//!
//! Timings of a pending change are split into chunks of at most
//! `chunk_capacity`; chunk `i` is published as its own target entity and
//! tracked by the `i`-th stored record (records are listed by
//! `chunk_index`).

use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use super::context::{CancelToken, ScopeContext};
use super::stats::ErrorKey;
use crate::adapter::SourceAdapter;
use crate::config::RunOptions;
use crate::error::{Result, SyncError};
use crate::persistence::CorrespondenceStore;
use crate::pipeline::{CallSite, Pipeline, StageContext};
use crate::platform::{MutationGateway, Published};
use crate::staging::ErrorSink;
use crate::timings;
use crate::types::{MappedEntity, PendingChange, PostMapKind, SyncRecord, Timing};

pub struct Orchestrator<'a> {
    pub adapter: &'a dyn SourceAdapter,
    pub gateway: &'a MutationGateway,
    pub store: &'a dyn CorrespondenceStore,
    pub pipeline: &'a Pipeline,
    pub sink: &'a ErrorSink,
    pub options: &'a RunOptions,
    pub cancel: &'a CancelToken,
}

impl Orchestrator<'_> {
    /// Create phase, then update phase.
    pub async fn process_scope(&self, mut ctx: ScopeContext) -> ScopeContext {
        self.create_phase(&mut ctx).await;
        self.update_phase(&mut ctx).await;
        ctx
    }

    pub async fn create_phase(&self, ctx: &mut ScopeContext) {
        let items = std::mem::take(&mut ctx.changes.create);
        for (n, change) in items.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!(scope = %ctx.scope_id, "run cancelled, stopping create phase");
                break;
            }
            info!(
                scope = %ctx.scope_id,
                correspondence_id = %change.correspondence_id,
                "CREATE EVENT {}/{}",
                n + 1,
                items.len()
            );
            self.create_item(ctx, change).await;
        }
        ctx.changes.create = items;
    }

    pub async fn update_phase(&self, ctx: &mut ScopeContext) {
        let items = std::mem::take(&mut ctx.changes.update);
        for (n, change) in items.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!(scope = %ctx.scope_id, "run cancelled, stopping update phase");
                break;
            }
            info!(
                scope = %ctx.scope_id,
                correspondence_id = %change.correspondence_id,
                "UPDATE EVENT {}/{}",
                n + 1,
                items.len()
            );
            if let Err(err) = self.update_item(ctx, change).await {
                let name = format!("{}.json", change.correspondence_id);
                self.fail(ctx, ErrorKey::EventUpdateErrors, change, name, err.context("Error on event update"))
                    .await;
            }
        }
        ctx.changes.update = items;
    }

    async fn create_item(&self, ctx: &mut ScopeContext, change: &PendingChange) {
        let chunks = timings::chunk(&change.data.timings, self.options.chunk_capacity);
        ctx.stats.record_split(chunks.len());

        for (position, timings) in chunks.into_iter().enumerate() {
            let chunk_index = u32::try_from(position).unwrap_or(u32::MAX);
            if let Err(err) = self.create_chunk(ctx, change, chunk_index, timings).await {
                let name = format!("{}:{position}.json", change.correspondence_id);
                self.fail(ctx, ErrorKey::EventCreateErrors, change, name, err.context("Error on event create"))
                    .await;
            }
        }
    }

    async fn update_item(&self, ctx: &mut ScopeContext, change: &PendingChange) -> Result<()> {
        let records = self
            .store
            .find_sync_records(&ctx.scope_id, &change.correspondence_id)?;
        if records.is_empty() {
            self.create_item(ctx, change).await;
            return Ok(());
        }
        if self.options.simulate {
            ctx.confirmed.insert(change.correspondence_id.clone());
        }

        let chunks = timings::chunk(&change.data.timings, self.options.chunk_capacity);
        ctx.stats.record_split(chunks.len());

        let stored: Vec<Timing> = records
            .iter()
            .flat_map(|record| record.target_data.timings.iter().copied())
            .collect();
        let same_timings = timings::same_timings(&stored, &change.data.timings);

        if !self.options.force_update && !self.is_stale(change, &records) && same_timings {
            info!(
                scope = %ctx.scope_id,
                correspondence_id = %change.correspondence_id,
                "no need to update"
            );
            if !self.options.simulate {
                self.store
                    .touch_sync_records(&ctx.scope_id, &change.correspondence_id, Utc::now())?;
            }
            ctx.stats.up_to_date_events += 1;
            return Ok(());
        }

        let mut next_index = records
            .iter()
            .map(|record| record.chunk_index)
            .max()
            .map_or(0, |max| max + 1);

        for position in 0..chunks.len().max(records.len()) {
            let name = format!("{}:{position}.json", change.correspondence_id);
            match (chunks.get(position), records.get(position)) {
                (Some(timings), Some(record)) => {
                    self.update_chunk(ctx, change, record, timings.clone(), name)
                        .await;
                }
                (Some(timings), None) => {
                    let chunk_index = next_index;
                    next_index += 1;
                    if let Err(err) = self
                        .create_chunk(ctx, change, chunk_index, timings.clone())
                        .await
                    {
                        let err = err.context("Error on event update (one more for new timings)");
                        self.fail(ctx, ErrorKey::EventCreateTimingsErrors, change, name, err)
                            .await;
                    }
                }
                (None, Some(record)) => {
                    if let Err(err) = self.remove_chunk(ctx, record).await {
                        let err = err.context("Error on event update (one less for removed timings)");
                        self.fail(ctx, ErrorKey::EventRemoveTimingsErrors, change, name, err)
                            .await;
                    } else {
                        ctx.stats.removed_events += 1;
                    }
                }
                (None, None) => {}
            }
        }
        Ok(())
    }

    /// Whether the source changed after the oldest chunk was synced. Records
    /// without a source modification date always count as changed.
    fn is_stale(&self, change: &PendingChange, records: &[SyncRecord]) -> bool {
        let newest = change
            .raw_sources
            .iter()
            .map(|raw| self.adapter.updated_at(raw))
            .collect::<Option<Vec<_>>>()
            .and_then(|dates| dates.into_iter().max());
        let oldest = records.iter().map(|record| record.synced_at).min();

        match (newest, oldest) {
            (Some(newest), Some(oldest)) => {
                let threshold = Duration::try_seconds(self.options.staleness_tolerance_secs)
                    .and_then(|tolerance| oldest.checked_sub_signed(tolerance));
                threshold.map_or(true, |threshold| newest > threshold)
            }
            _ => true,
        }
    }

    /// Run `post_map` and the post-map stages. `None` means ignored.
    async fn finish_entity(
        &self,
        ctx: &mut ScopeContext,
        entity: MappedEntity,
        kind: PostMapKind,
    ) -> Result<Option<MappedEntity>> {
        let Some(mut entity) = self.adapter.post_map(entity, &ctx.schema, kind).await? else {
            return Ok(None);
        };
        let mut stage_ctx = StageContext::new(&ctx.scope_id, CallSite::PostMap(kind));
        let result = self.pipeline.run(&mut entity, &mut stage_ctx).await;
        ctx.stats.invalid_images += u64::from(stage_ctx.invalid_images);
        result?;
        Ok(Some(entity))
    }

    fn sync_record(
        &self,
        ctx: &ScopeContext,
        change: &PendingChange,
        chunk_index: u32,
        published: Published,
    ) -> SyncRecord {
        SyncRecord {
            scope_id: ctx.scope_id.clone(),
            correspondence_id: change.correspondence_id.clone(),
            chunk_index,
            synced_at: Utc::now(),
            target_id: published.event.uid.clone(),
            target_data: published.event,
        }
    }

    async fn create_chunk(
        &self,
        ctx: &mut ScopeContext,
        change: &PendingChange,
        chunk_index: u32,
        timings: Vec<Timing>,
    ) -> Result<()> {
        let entity = MappedEntity {
            timings,
            ..change.data.clone()
        };
        let Some(entity) = self.finish_entity(ctx, entity, PostMapKind::Create).await? else {
            ctx.stats.ignored_events += 1;
            return Ok(());
        };

        if !self.options.simulate {
            let published = self.gateway.create(&ctx.scope_id, entity).await?;
            if published.replaced_image {
                ctx.stats.invalid_images += 1;
            }
            let record = self.sync_record(ctx, change, chunk_index, published);
            self.store.insert_sync_record(&record)?;
        } else {
            ctx.confirmed.insert(change.correspondence_id.clone());
        }
        ctx.stats.created_events += 1;
        Ok(())
    }

    async fn update_chunk(
        &self,
        ctx: &mut ScopeContext,
        change: &PendingChange,
        record: &SyncRecord,
        timings: Vec<Timing>,
        name: String,
    ) {
        let entity = MappedEntity {
            timings,
            slug: record
                .target_data
                .slug
                .clone()
                .or_else(|| change.data.slug.clone()),
            ..change.data.clone()
        };

        let entity = match self.finish_entity(ctx, entity, PostMapKind::Update).await {
            Ok(Some(entity)) => entity,
            Ok(None) => {
                match self.remove_chunk(ctx, record).await {
                    Ok(()) => ctx.stats.removed_falsy_events += 1,
                    Err(err) => {
                        let err = err.context("Error on event remove (after post_map)");
                        self.fail(ctx, ErrorKey::EventFalsyRemoveErrors, change, name, err)
                            .await;
                    }
                }
                return;
            }
            Err(err) => {
                ctx.ignored_deletes.insert(record.target_id.clone());
                self.fail(ctx, ErrorKey::EventUpdateErrors, change, name, err.context("Error on event update"))
                    .await;
                return;
            }
        };

        if self.options.simulate {
            ctx.stats.updated_events += 1;
            return;
        }

        let result = match self
            .gateway
            .update(&ctx.scope_id, &record.target_id, entity.clone())
            .await
        {
            Ok(published) => {
                if published.replaced_image {
                    ctx.stats.invalid_images += 1;
                }
                let updated = SyncRecord {
                    synced_at: Utc::now(),
                    target_id: published.event.uid.clone(),
                    target_data: published.event,
                    ..record.clone()
                };
                self.store.update_sync_record(&updated).map_err(SyncError::from)
            }
            Err(err) if err.is_remote_not_found() => {
                match self.recreate_chunk(ctx, change, record, entity).await {
                    Ok(()) => ctx.stats.recreated_events += 1,
                    Err(err) => {
                        self.fail(ctx, ErrorKey::EventRecreateErrors, change, name, err.context("Error on event recreate"))
                            .await;
                    }
                }
                return;
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => ctx.stats.updated_events += 1,
            Err(err) => {
                ctx.ignored_deletes.insert(record.target_id.clone());
                self.fail(ctx, ErrorKey::EventUpdateErrors, change, name, err.context("Error on event update"))
                    .await;
            }
        }
    }

    /// The target lost the entity: drop the record and publish again under
    /// the same chunk index.
    async fn recreate_chunk(
        &self,
        ctx: &mut ScopeContext,
        change: &PendingChange,
        record: &SyncRecord,
        entity: MappedEntity,
    ) -> Result<()> {
        warn!(
            scope = %ctx.scope_id,
            correspondence_id = %change.correspondence_id,
            target_id = %record.target_id,
            "event not found on target, recreating"
        );
        self.store
            .remove_sync_record(&ctx.scope_id, &record.correspondence_id, record.chunk_index)?;
        let published = self.gateway.create(&ctx.scope_id, entity).await?;
        if published.replaced_image {
            ctx.stats.invalid_images += 1;
        }
        let record = self.sync_record(ctx, change, record.chunk_index, published);
        self.store.insert_sync_record(&record)?;
        Ok(())
    }

    async fn remove_chunk(&self, ctx: &mut ScopeContext, record: &SyncRecord) -> Result<()> {
        if self.options.simulate {
            return Ok(());
        }
        self.gateway.delete(&ctx.scope_id, &record.target_id).await?;
        self.store
            .remove_sync_record(&ctx.scope_id, &record.correspondence_id, record.chunk_index)?;
        Ok(())
    }

    async fn fail(
        &self,
        ctx: &mut ScopeContext,
        key: ErrorKey,
        change: &PendingChange,
        name: String,
        err: SyncError,
    ) {
        error!(
            scope = %ctx.scope_id,
            correspondence_id = %change.correspondence_id,
            error = %err,
            "synchronization error"
        );
        ctx.stats.record_error(key, &change.correspondence_id, &err);
        self.sink.record(&name, &err, Some(&subject(change))).await;
    }
}

fn subject(change: &PendingChange) -> Value {
    json!({
        "correspondenceId": change.correspondence_id,
        "entityId": change.entity_id,
        "locationId": change.location_id,
        "rawSources": change.raw_sources,
    })
}
