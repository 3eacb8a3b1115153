//! Location resolution: find or create, never update.

use chrono::Utc;
use tracing::{debug, info};

use super::context::ScopeContext;
use crate::adapter::SourceAdapter;
use crate::error::{Result, SyncError};
use crate::persistence::CorrespondenceStore;
use crate::pipeline::stages::DefaultCountryCode;
use crate::platform::TargetPlatform;
use crate::types::{LocationRecord, LocationRef, SourceRecord, TargetLocation};

pub struct LocationResolver<'a> {
    pub adapter: &'a dyn SourceAdapter,
    pub platform: &'a dyn TargetPlatform,
    pub store: &'a dyn CorrespondenceStore,
    pub country_code: &'a DefaultCountryCode,
    pub simulate: bool,
}

impl LocationResolver<'_> {
    /// Resolve a location reference to its target location.
    ///
    /// A persisted record wins; otherwise a match among the scope's known
    /// locations is adopted; otherwise the detail is fetched from the source,
    /// mapped and created on the target. Returns the location id with the
    /// resolved location.
    pub async fn resolve(
        &self,
        ctx: &mut ScopeContext,
        record: &SourceRecord,
        location: &LocationRef,
    ) -> Result<(String, TargetLocation)> {
        let location_id = self.adapter.location_id(location, record)?;

        if let Some(stored) = self.store.find_location(&ctx.scope_id, &location_id)? {
            return Ok((location_id, stored.target_data));
        }

        if let Some(found) = self.adapter.find_location(&ctx.known_locations, location) {
            debug!(scope = %ctx.scope_id, location_id = %location_id, "adopting known location");
            if !self.simulate {
                self.persist(&ctx.scope_id, &location_id, &found)?;
            }
            return Ok((location_id, found));
        }

        let mut raw = self
            .adapter
            .fetch_location(&location_id, location)
            .await
            .map_err(|e| SyncError::from(e).context("Failed to fetch location"))?;
        self.country_code.apply(&mut raw);
        let mapped = self.adapter.map_location(raw, location).await?;

        let created = if self.simulate {
            serde_json::from_value(mapped).unwrap_or_default()
        } else {
            let created = self.platform.create_location(&ctx.scope_id, &mapped).await?;
            self.persist(&ctx.scope_id, &location_id, &created)?;
            ctx.known_locations.push(created.clone());
            created
        };

        info!(
            scope = %ctx.scope_id,
            location_id = %location_id,
            uid = ?created.uid,
            "location not found, created"
        );
        ctx.stats.created_locations += 1;
        Ok((location_id, created))
    }

    fn persist(&self, scope_id: &str, location_id: &str, location: &TargetLocation) -> Result<()> {
        self.store.insert_location(&LocationRecord {
            scope_id: scope_id.to_string(),
            correspondence_id: location_id.to_string(),
            synced_at: Utc::now(),
            target_data: location.clone(),
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::DuckDbStore;
    use crate::sync::stats::ScopeStats;
    use crate::test_utils::{MockPlatform, MockSource};
    use serde_json::json;

    fn context(known: Vec<TargetLocation>) -> ScopeContext {
        ScopeContext::new("a", json!({}), known, ScopeStats::default())
    }

    fn resolver<'a>(
        source: &'a MockSource,
        platform: &'a MockPlatform,
        store: &'a DuckDbStore,
        country: &'a DefaultCountryCode,
        simulate: bool,
    ) -> LocationResolver<'a> {
        LocationResolver {
            adapter: source,
            platform,
            store,
            country_code: country,
            simulate,
        }
    }

    #[tokio::test]
    async fn test_creates_then_reuses_persisted_location() {
        let source = MockSource::new();
        let platform = MockPlatform::new();
        let store = DuckDbStore::open_in_memory().unwrap();
        let country = DefaultCountryCode::new(Some("FR".to_string()));
        let resolver = resolver(&source, &platform, &store, &country, false);
        let mut ctx = context(Vec::new());
        let location = json!({"id": "l1", "name": "Salle"});

        let (id, created) = resolver.resolve(&mut ctx, &json!({}), &location).await.unwrap();
        assert_eq!(id, "l1");
        assert!(created.uid.is_some());
        assert_eq!(platform.created_locations()[0]["countryCode"], "FR");

        let (_, again) = resolver.resolve(&mut ctx, &json!({}), &location).await.unwrap();
        assert_eq!(again.uid, created.uid);
        assert_eq!(platform.calls_named("create_location"), 1);
        assert_eq!(ctx.stats.created_locations, 1);
    }

    #[tokio::test]
    async fn test_adopts_known_location() {
        let source = MockSource::new();
        let platform = MockPlatform::new();
        let store = DuckDbStore::open_in_memory().unwrap();
        let country = DefaultCountryCode::new(None);
        let resolver = resolver(&source, &platform, &store, &country, false);
        let known = TargetLocation {
            uid: Some("77".to_string()),
            fields: json!({"extId": "l1"}).as_object().unwrap().clone(),
        };
        let mut ctx = context(vec![known]);

        let (_, found) = resolver
            .resolve(&mut ctx, &json!({}), &json!({"id": "l1"}))
            .await
            .unwrap();
        assert_eq!(found.uid.as_deref(), Some("77"));
        assert_eq!(platform.calls_named("create_location"), 0);
        assert!(store.find_location("a", "l1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_simulate_neither_creates_nor_persists() {
        let source = MockSource::new();
        let platform = MockPlatform::new();
        let store = DuckDbStore::open_in_memory().unwrap();
        let country = DefaultCountryCode::new(None);
        let resolver = resolver(&source, &platform, &store, &country, true);
        let mut ctx = context(Vec::new());

        resolver
            .resolve(&mut ctx, &json!({}), &json!({"id": "l1"}))
            .await
            .unwrap();
        assert_eq!(platform.calls_named("create_location"), 0);
        assert!(store.find_location("a", "l1").unwrap().is_none());
    }
}
