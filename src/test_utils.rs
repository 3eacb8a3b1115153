//! In-memory doubles of the source adapter and the target platform.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::adapter::{JsonLinesSource, SourceAdapter};
use crate::error::RemoteError;
use crate::platform::{RemoteResult, TargetPlatform};
use crate::types::{
    LocationRef, MappedEntity, PostMapKind, PublishedEvent, ScopeId, SourceRecord, TargetLocation,
};

#[derive(Default)]
struct PlatformState {
    calls: Vec<String>,
    next_uid: u64,
    events: BTreeMap<ScopeId, BTreeMap<String, PublishedEvent>>,
    locations: HashMap<ScopeId, Vec<TargetLocation>>,
    created_events: Vec<MappedEntity>,
    created_locations: Vec<Value>,
    create_failures: VecDeque<RemoteError>,
    update_failures: VecDeque<RemoteError>,
    delete_failures: VecDeque<RemoteError>,
    schema_failures: HashMap<ScopeId, RemoteError>,
}

impl PlatformState {
    fn uid(&mut self) -> String {
        self.next_uid += 1;
        self.next_uid.to_string()
    }
}

/// Target platform keeping events and locations in memory and recording
/// every call by method name.
#[derive(Default)]
pub struct MockPlatform {
    state: Mutex<PlatformState>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut PlatformState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    fn record(&self, call: &str) {
        self.with_state(|state| state.calls.push(call.to_string()));
    }

    pub fn calls(&self) -> Vec<String> {
        self.with_state(|state| state.calls.clone())
    }

    pub fn calls_named(&self, name: &str) -> usize {
        self.with_state(|state| state.calls.iter().filter(|call| *call == name).count())
    }

    pub fn add_location(&self, scope_id: &str, location: TargetLocation) {
        self.with_state(|state| {
            state
                .locations
                .entry(scope_id.to_string())
                .or_default()
                .push(location)
        });
    }

    pub fn fail_next_create(&self, err: RemoteError) {
        self.with_state(|state| state.create_failures.push_back(err));
    }

    pub fn fail_next_update(&self, err: RemoteError) {
        self.with_state(|state| state.update_failures.push_back(err));
    }

    pub fn fail_next_delete(&self, err: RemoteError) {
        self.with_state(|state| state.delete_failures.push_back(err));
    }

    /// Every schema fetch of `scope_id` fails with `err`.
    pub fn fail_schema(&self, scope_id: &str, err: RemoteError) {
        self.with_state(|state| {
            state.schema_failures.insert(scope_id.to_string(), err);
        });
    }

    /// Entities sent to `create_event`, including rejected attempts.
    pub fn created_events(&self) -> Vec<MappedEntity> {
        self.with_state(|state| state.created_events.clone())
    }

    /// Payloads sent to `create_location`.
    pub fn created_locations(&self) -> Vec<Value> {
        self.with_state(|state| state.created_locations.clone())
    }

    /// Live events of a scope.
    pub fn events(&self, scope_id: &str) -> Vec<PublishedEvent> {
        self.with_state(|state| {
            state
                .events
                .get(scope_id)
                .map(|events| events.values().cloned().collect())
                .unwrap_or_default()
        })
    }

    /// Delete an event behind the engine's back.
    pub fn remove_event(&self, scope_id: &str, target_id: &str) {
        self.with_state(|state| {
            if let Some(events) = state.events.get_mut(scope_id) {
                events.remove(target_id);
            }
        });
    }

    fn published(uid: String, entity: &MappedEntity) -> PublishedEvent {
        PublishedEvent {
            uid,
            slug: entity.slug.clone(),
            timings: entity.timings.clone(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl TargetPlatform for MockPlatform {
    async fn fetch_schema(&self, scope_id: &str) -> RemoteResult<Value> {
        self.record("fetch_schema");
        self.with_state(|state| match state.schema_failures.get(scope_id) {
            Some(err) => Err(err.clone()),
            None => Ok(serde_json::json!({ "fields": [] })),
        })
    }

    async fn list_locations(
        &self,
        scope_id: &str,
        offset: usize,
        limit: usize,
    ) -> RemoteResult<Vec<TargetLocation>> {
        self.record("list_locations");
        self.with_state(|state| {
            Ok(state
                .locations
                .get(scope_id)
                .map(|locations| locations.iter().skip(offset).take(limit).cloned().collect())
                .unwrap_or_default())
        })
    }

    async fn create_location(
        &self,
        scope_id: &str,
        location: &Value,
    ) -> RemoteResult<TargetLocation> {
        self.record("create_location");
        self.with_state(|state| {
            state.created_locations.push(location.clone());
            let created = TargetLocation {
                uid: Some(state.uid()),
                fields: location.as_object().cloned().unwrap_or_default(),
            };
            state
                .locations
                .entry(scope_id.to_string())
                .or_default()
                .push(created.clone());
            Ok(created)
        })
    }

    async fn create_event(
        &self,
        scope_id: &str,
        event: &MappedEntity,
    ) -> RemoteResult<PublishedEvent> {
        self.record("create_event");
        self.with_state(|state| {
            state.created_events.push(event.clone());
            if let Some(err) = state.create_failures.pop_front() {
                return Err(err);
            }
            let uid = state.uid();
            let published = Self::published(uid.clone(), event);
            state
                .events
                .entry(scope_id.to_string())
                .or_default()
                .insert(uid, published.clone());
            Ok(published)
        })
    }

    async fn update_event(
        &self,
        scope_id: &str,
        target_id: &str,
        event: &MappedEntity,
    ) -> RemoteResult<PublishedEvent> {
        self.record("update_event");
        self.with_state(|state| {
            if let Some(err) = state.update_failures.pop_front() {
                return Err(err);
            }
            let Some(stored) = state
                .events
                .get_mut(scope_id)
                .and_then(|events| events.get_mut(target_id))
            else {
                return Err(RemoteError::not_found("event not found"));
            };
            *stored = Self::published(target_id.to_string(), event);
            Ok(stored.clone())
        })
    }

    async fn delete_event(&self, scope_id: &str, target_id: &str) -> RemoteResult<()> {
        self.record("delete_event");
        self.with_state(|state| {
            if let Some(err) = state.delete_failures.pop_front() {
                return Err(err);
            }
            state
                .events
                .get_mut(scope_id)
                .and_then(|events| events.remove(target_id))
                .map(|_| ())
                .ok_or_else(|| RemoteError::not_found("event not found"))
        })
    }
}

#[derive(Default)]
struct SourceState {
    records: Vec<SourceRecord>,
    fail_listing: bool,
    ignored: HashSet<String>,
    dropped_on_update: HashSet<String>,
}

/// Source serving in-memory records with the JSON-lines record conventions.
pub struct MockSource {
    conventions: JsonLinesSource,
    state: Mutex<SourceState>,
}

impl Default for MockSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSource {
    pub fn new() -> Self {
        Self {
            conventions: JsonLinesSource::new("in-memory"),
            state: Mutex::new(SourceState::default()),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut SourceState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    pub fn set_records(&self, records: Vec<SourceRecord>) {
        self.with_state(|state| state.records = records);
    }

    pub fn fail_listing(&self, fail: bool) {
        self.with_state(|state| state.fail_listing = fail);
    }

    /// `map` ignores records with this id.
    pub fn ignore(&self, id: &str) {
        self.with_state(|state| {
            state.ignored.insert(id.to_string());
        });
    }

    /// `post_map` drops update payloads carrying this slug.
    pub fn drop_on_update(&self, slug: &str) {
        self.with_state(|state| {
            state.dropped_on_update.insert(slug.to_string());
        });
    }
}

#[async_trait]
impl SourceAdapter for MockSource {
    async fn list(&self, offset: usize, limit: usize) -> Result<Vec<SourceRecord>> {
        self.with_state(|state| {
            if state.fail_listing {
                return Err(anyhow!("source unavailable"));
            }
            Ok(state.records.iter().skip(offset).take(limit).cloned().collect())
        })
    }

    fn scope_id(&self, record: &SourceRecord) -> Result<ScopeId> {
        self.conventions.scope_id(record)
    }

    fn entity_id(&self, record: &SourceRecord) -> Result<String> {
        self.conventions.entity_id(record)
    }

    fn updated_at(&self, record: &SourceRecord) -> Option<DateTime<Utc>> {
        self.conventions.updated_at(record)
    }

    fn location_id(&self, location: &LocationRef, record: &SourceRecord) -> Result<String> {
        self.conventions.location_id(location, record)
    }

    fn find_location(
        &self,
        known: &[TargetLocation],
        location: &LocationRef,
    ) -> Option<TargetLocation> {
        self.conventions.find_location(known, location)
    }

    async fn map_location(&self, raw: Value, location: &LocationRef) -> Result<Value> {
        self.conventions.map_location(raw, location).await
    }

    async fn map(
        &self,
        record: &SourceRecord,
        schema: &Value,
        known_locations: &[TargetLocation],
    ) -> Result<Option<MappedEntity>> {
        let id = self.conventions.entity_id(record)?;
        if self.with_state(|state| state.ignored.contains(&id)) {
            return Ok(None);
        }
        self.conventions.map(record, schema, known_locations).await
    }

    async fn post_map(
        &self,
        entity: MappedEntity,
        _schema: &Value,
        kind: PostMapKind,
    ) -> Result<Option<MappedEntity>> {
        let dropped = kind == PostMapKind::Update
            && entity.slug.as_ref().is_some_and(|slug| {
                self.with_state(|state| state.dropped_on_update.contains(slug))
            });
        Ok((!dropped).then_some(entity))
    }
}
