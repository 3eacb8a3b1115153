//! Built-in pipeline stages.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use serde_json::Value;
use tracing::warn;

use super::image::ImageProbe;
use super::{CallSite, MapStage, StageContext};
use crate::error::{Result, SourceDataError};
use crate::types::{Image, MappedEntity};

/// Give zero-length timings a configured duration.
#[derive(Debug, Clone, Copy)]
pub struct ExpandFlatTimings {
    duration: Option<Duration>,
}

impl ExpandFlatTimings {
    pub fn new(duration: Option<Duration>) -> Self {
        Self { duration }
    }
}

#[async_trait]
impl MapStage for ExpandFlatTimings {
    fn name(&self) -> &'static str {
        "expand_flat_timings"
    }

    async fn apply(&self, entity: &mut MappedEntity, _ctx: &mut StageContext<'_>) -> Result<()> {
        let Some(duration) = self.duration else {
            return Ok(());
        };
        for timing in &mut entity.timings {
            if let (Some(begin), Some(end)) = (timing.begin, timing.end) {
                if begin == end {
                    timing.end = end.checked_add_signed(duration).or(timing.end);
                }
            }
        }
        Ok(())
    }
}

/// Drop intervals with a missing bound or `end <= begin`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterTimings;

#[async_trait]
impl MapStage for FilterTimings {
    fn name(&self) -> &'static str {
        "filter_timings"
    }

    fn runs_after(&self) -> &'static [&'static str] {
        &["expand_flat_timings"]
    }

    async fn apply(&self, entity: &mut MappedEntity, _ctx: &mut StageContext<'_>) -> Result<()> {
        entity.timings.retain(|timing| timing.is_valid());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MissingTimingsGuard;

#[async_trait]
impl MapStage for MissingTimingsGuard {
    fn name(&self) -> &'static str {
        "missing_timings_guard"
    }

    fn runs_after(&self) -> &'static [&'static str] {
        &["expand_flat_timings", "filter_timings"]
    }

    async fn apply(&self, entity: &mut MappedEntity, _ctx: &mut StageContext<'_>) -> Result<()> {
        if entity.timings.is_empty() {
            return Err(SourceDataError::MissingTimings.into());
        }
        Ok(())
    }
}

/// Replace an unreachable image with the fallback (or drop it) instead of
/// letting the platform reject the entity. Post-map only.
pub struct InvalidImageFallback {
    probe: Arc<dyn ImageProbe>,
    enabled: bool,
    default_image_url: Option<String>,
}

impl InvalidImageFallback {
    pub fn new(probe: Arc<dyn ImageProbe>, enabled: bool, default_image_url: Option<String>) -> Self {
        Self {
            probe,
            enabled,
            default_image_url,
        }
    }
}

#[async_trait]
impl MapStage for InvalidImageFallback {
    fn name(&self) -> &'static str {
        "invalid_image_fallback"
    }

    fn applies_to(&self, call_site: CallSite) -> bool {
        matches!(call_site, CallSite::PostMap(_))
    }

    async fn apply(&self, entity: &mut MappedEntity, ctx: &mut StageContext<'_>) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let Some(image) = &entity.image else {
            return Ok(());
        };
        if self.probe.is_reachable(&image.url).await {
            return Ok(());
        }

        warn!(scope = ctx.scope_id, url = %image.url, "image unreachable, using fallback");
        entity.image = self
            .default_image_url
            .as_ref()
            .map(|url| Image { url: url.clone() });
        ctx.invalid_images += 1;
        Ok(())
    }
}

/// Location-detail stage: set `countryCode` on a fetched location lacking one.
#[derive(Debug, Clone)]
pub struct DefaultCountryCode {
    code: Option<String>,
}

impl DefaultCountryCode {
    pub fn new(code: Option<String>) -> Self {
        Self { code }
    }

    pub fn apply(&self, location: &mut Value) {
        let (Some(code), Value::Object(fields)) = (&self.code, location) else {
            return;
        };
        let missing = match fields.get("countryCode") {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(_) => false,
        };
        if missing {
            fields.insert("countryCode".to_string(), Value::String(code.clone()));
        }
    }
}
