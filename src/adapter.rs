//! Source adapter capability trait and the bundled JSON-lines adapter.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::types::{LocationRef, MappedEntity, PostMapKind, ScopeId, SourceRecord, TargetLocation};

/// Everything the engine needs to know about a source.
///
/// Errors are reported through `anyhow`; raise a
/// [`SourceDataError`](crate::error::SourceDataError) (possibly with added
/// context) to have a failure counted as a source data defect.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// One page of source records. An empty page ends the listing.
    async fn list(&self, offset: usize, limit: usize) -> Result<Vec<SourceRecord>>;

    /// Scope the record is published into.
    fn scope_id(&self, record: &SourceRecord) -> Result<ScopeId>;

    fn entity_id(&self, record: &SourceRecord) -> Result<String>;

    /// Last modification of the record at the source. Records without one
    /// are always treated as modified.
    fn updated_at(&self, record: &SourceRecord) -> Option<DateTime<Utc>>;

    fn location_id(&self, location: &LocationRef, record: &SourceRecord) -> Result<String>;

    /// Match a location reference against the target's known locations.
    fn find_location(
        &self,
        _known: &[TargetLocation],
        _location: &LocationRef,
    ) -> Option<TargetLocation> {
        None
    }

    /// Raw location detail, fed through the location-detail stages.
    async fn fetch_location(&self, _location_id: &str, location: &LocationRef) -> Result<Value> {
        Ok(location.clone())
    }

    /// Target-shaped location payload built from the fetched detail.
    async fn map_location(&self, raw: Value, location: &LocationRef) -> Result<Value>;

    /// `Ok(None)` ignores the record.
    async fn map(
        &self,
        record: &SourceRecord,
        schema: &Value,
        known_locations: &[TargetLocation],
    ) -> Result<Option<MappedEntity>>;

    /// Last transformation before a create or update call. `Ok(None)` ignores
    /// the chunk (and removes its published counterpart on update).
    async fn post_map(
        &self,
        entity: MappedEntity,
        _schema: &Value,
        _kind: PostMapKind,
    ) -> Result<Option<MappedEntity>> {
        Ok(Some(entity))
    }
}

/// Reads records from a JSON-lines file.
///
/// Each line is an object with `id`, `scope`, optional `updatedAt`,
/// `timings` and `locations`; every other key is passed to the target as is.
/// Locations are objects with an `id` and arbitrary place fields.
pub struct JsonLinesSource {
    path: PathBuf,
}

const RESERVED_KEYS: [&str; 5] = ["id", "scope", "updatedAt", "timings", "locations"];

impl JsonLinesSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn string_field(value: &Value, key: &str) -> Option<String> {
        match value.get(key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

#[async_trait]
impl SourceAdapter for JsonLinesSource {
    async fn list(&self, offset: usize, limit: usize) -> Result<Vec<SourceRecord>> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read source file {}", self.path.display()))?;

        contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .skip(offset)
            .take(limit)
            .map(|(number, line)| {
                serde_json::from_str(line)
                    .with_context(|| format!("Invalid JSON on line {}", number + 1))
            })
            .collect()
    }

    fn scope_id(&self, record: &SourceRecord) -> Result<ScopeId> {
        Self::string_field(record, "scope").ok_or_else(|| anyhow!("record has no scope"))
    }

    fn entity_id(&self, record: &SourceRecord) -> Result<String> {
        Self::string_field(record, "id").ok_or_else(|| anyhow!("record has no id"))
    }

    fn updated_at(&self, record: &SourceRecord) -> Option<DateTime<Utc>> {
        record
            .get("updatedAt")
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    fn location_id(&self, location: &LocationRef, _record: &SourceRecord) -> Result<String> {
        Self::string_field(location, "id").ok_or_else(|| anyhow!("location has no id"))
    }

    fn find_location(&self, known: &[TargetLocation], location: &LocationRef) -> Option<TargetLocation> {
        let id = Self::string_field(location, "id")?;
        known
            .iter()
            .find(|candidate| {
                candidate.fields.get("extId").and_then(Value::as_str) == Some(id.as_str())
            })
            .cloned()
    }

    async fn map_location(&self, raw: Value, _location: &LocationRef) -> Result<Value> {
        let Value::Object(mut fields) = raw else {
            return Err(anyhow!("location detail is not an object"));
        };
        if let Some(id) = fields.remove("id") {
            fields.insert("extId".to_string(), id);
        }
        Ok(Value::Object(fields))
    }

    async fn map(
        &self,
        record: &SourceRecord,
        _schema: &Value,
        _known_locations: &[TargetLocation],
    ) -> Result<Option<MappedEntity>> {
        let Some(object) = record.as_object() else {
            return Ok(None);
        };

        let timings = match object.get("timings") {
            Some(timings) => serde_json::from_value(timings.clone())
                .context("Failed to parse timings")?,
            None => Vec::new(),
        };
        let locations = match object.get("locations") {
            Some(Value::Array(locations)) => locations.clone(),
            _ => Vec::new(),
        };

        let mut fields: Map<String, Value> = object
            .iter()
            .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        let mut entity = MappedEntity {
            timings,
            locations,
            ..Default::default()
        };
        if let Some(slug) = fields.remove("slug").and_then(|v| v.as_str().map(String::from)) {
            entity.slug = Some(slug);
        }
        if let Some(image) = fields.remove("image") {
            entity.image = serde_json::from_value(image).ok();
        }
        entity.fields = fields;

        Ok(Some(entity))
    }
}
