//! Change aggregation: route mapped entities into the create or update list
//! of their scope, merging entries that share a correspondence id.

use tracing::debug;

use super::context::ScopeContext;
use super::stats::ScopeStats;
use crate::error::Result;
use crate::persistence::CorrespondenceStore;
use crate::timings;
use crate::types::{correspondence_id, MappedEntity, PendingChange, SourceRecord};

/// Which work list an entity went to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Create,
    Update,
}

/// Route one (entity, location) pair. Entities with a stored sync record go
/// to `update`, others to `create`.
pub fn aggregate(
    ctx: &mut ScopeContext,
    store: &dyn CorrespondenceStore,
    entity_id: &str,
    location_id: &str,
    data: MappedEntity,
    raw: &SourceRecord,
) -> Result<Route> {
    let correspondence_id = correspondence_id(entity_id, location_id);
    let route = if store.has_sync_records(&ctx.scope_id, &correspondence_id)? {
        Route::Update
    } else {
        Route::Create
    };

    let change = PendingChange {
        correspondence_id,
        entity_id: entity_id.to_string(),
        location_id: location_id.to_string(),
        data,
        raw_sources: vec![raw.clone()],
        merge_count: 1,
    };

    let list = match route {
        Route::Create => &mut ctx.changes.create,
        Route::Update => &mut ctx.changes.update,
    };
    add_change(list, &mut ctx.stats, change);
    Ok(route)
}

/// Insert `change`, or merge it into the entry with the same correspondence
/// id. On merge the newest data wins except for timings, which are unioned.
pub fn add_change(list: &mut Vec<PendingChange>, stats: &mut ScopeStats, change: PendingChange) {
    let Some(existing) = list
        .iter_mut()
        .find(|item| item.correspondence_id == change.correspondence_id)
    else {
        list.push(change);
        return;
    };

    let timings = timings::union(&existing.data.timings, &change.data.timings);
    existing.data = MappedEntity {
        timings,
        ..change.data
    };
    existing.raw_sources.extend(change.raw_sources);
    existing.merge_count += change.merge_count;

    stats.merged_source_events += 1;
    stats
        .merged_by_id
        .insert(existing.correspondence_id.clone(), existing.merge_count);

    debug!(
        correspondence_id = %existing.correspondence_id,
        merged = existing.merge_count,
        "merged source record"
    );
}
