//! Data model shared by the reconciliation engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::timings::serde_instant;

/// Opaque record produced by the source adapter.
pub type SourceRecord = Value;

/// Adapter-defined location reference carried by a mapped entity.
pub type LocationRef = Value;

/// Scope (tenant / agenda) identifier owning target entities.
pub type ScopeId = String;

/// Stable key joining one source entity + location to target entities.
pub type CorrespondenceId = String;

/// Build the correspondence id of an entity at a location.
pub fn correspondence_id(entity_id: &str, location_id: &str) -> CorrespondenceId {
    format!("{entity_id}.{location_id}")
}

/// A time interval. Bounds stay optional until the timing filter has run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timing {
    #[serde(default, with = "serde_instant")]
    pub begin: Option<DateTime<Utc>>,
    #[serde(default, with = "serde_instant")]
    pub end: Option<DateTime<Utc>>,
}

impl Timing {
    pub fn new(begin: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            begin: Some(begin),
            end: Some(end),
        }
    }

    /// Both bounds present and `begin < end`.
    pub fn is_valid(&self) -> bool {
        matches!((self.begin, self.end), (Some(begin), Some(end)) if begin < end)
    }
}

/// Image reference of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub url: String,
}

/// Canonical, target-shaped representation of one or more source records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappedEntity {
    #[serde(default)]
    pub timings: Vec<Timing>,

    /// Location references, only present between `map` and dispatch.
    #[serde(default, skip_serializing)]
    pub locations: Vec<LocationRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_uid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Image>,

    /// Arbitrary target fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Location as known by the target platform.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetLocation {
    #[serde(default, deserialize_with = "lenient_id")]
    pub uid: Option<String>,

    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Event as returned by the target after a create or update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishedEvent {
    #[serde(deserialize_with = "required_id")]
    pub uid: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,

    #[serde(default)]
    pub timings: Vec<Timing>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Which call site a `post_map` invocation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostMapKind {
    Create,
    Update,
}

/// Run-scoped accumulation of merged source data for one correspondence id.
#[derive(Debug, Clone)]
pub struct PendingChange {
    pub correspondence_id: CorrespondenceId,
    pub entity_id: String,
    pub location_id: String,
    pub data: MappedEntity,
    pub raw_sources: Vec<SourceRecord>,
    /// Number of source records merged into this change.
    pub merge_count: u32,
}

/// Work lists of one scope.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub create: Vec<PendingChange>,
    pub update: Vec<PendingChange>,
}

/// Durable record of one published chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRecord {
    pub scope_id: ScopeId,
    pub correspondence_id: CorrespondenceId,
    pub chunk_index: u32,
    pub synced_at: DateTime<Utc>,
    pub target_id: String,
    pub target_data: PublishedEvent,
}

/// Durable record of a resolved location. Never updated once written.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationRecord {
    pub scope_id: ScopeId,
    pub correspondence_id: CorrespondenceId,
    pub synced_at: DateTime<Utc>,
    pub target_data: TargetLocation,
}

fn id_from_value(value: Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn lenient_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(id_from_value(Value::deserialize(deserializer)?))
}

fn required_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    id_from_value(Value::deserialize(deserializer)?)
        .ok_or_else(|| serde::de::Error::custom("expected a string or numeric uid"))
}
