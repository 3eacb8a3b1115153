use std::sync::Arc;

use rand::Rng;
use serde_json::Value;
use tracing::{debug, warn};

use super::TargetPlatform;
use crate::error::{RemoteError, RemoteErrorKind, Result, SourceDataError, SyncError};
use crate::types::{Image, MappedEntity, PublishedEvent};

/// Upper bound (inclusive) of the random suffix appended to a duplicate slug.
const SLUG_SUFFIX_MAX: u32 = 1_000_000;

/// Result of a successful create or update.
#[derive(Debug, Clone)]
pub struct Published {
    pub event: PublishedEvent,
    /// The image was rejected and replaced by the fallback before publishing.
    pub replaced_image: bool,
}

/// Create / update / delete with the fixed retry and fallback policy.
#[derive(Clone)]
pub struct MutationGateway {
    platform: Arc<dyn TargetPlatform>,
    no_bail_on_invalid_image: bool,
    default_image_url: Option<String>,
}

impl MutationGateway {
    pub fn new(platform: Arc<dyn TargetPlatform>) -> Self {
        Self {
            platform,
            no_bail_on_invalid_image: false,
            default_image_url: None,
        }
    }

    pub fn with_image_fallback(mut self, enabled: bool, default_image_url: Option<String>) -> Self {
        self.no_bail_on_invalid_image = enabled;
        self.default_image_url = default_image_url;
        self
    }

    pub fn platform(&self) -> &dyn TargetPlatform {
        self.platform.as_ref()
    }

    fn fallback_image(&self) -> Option<Image> {
        self.default_image_url
            .as_ref()
            .map(|url| Image { url: url.clone() })
    }

    fn should_replace_image(&self, err: &RemoteError) -> bool {
        self.no_bail_on_invalid_image && err.kind == RemoteErrorKind::InvalidImage
    }

    /// Create an event.
    ///
    /// A duplicate slug is retried once with a random suffix; a rejected
    /// image is replaced and retried once when the fallback is enabled. A
    /// "data is invalid" rejection becomes a source data error; anything
    /// else is returned as a remote error.
    pub async fn create(&self, scope_id: &str, mut entity: MappedEntity) -> Result<Published> {
        let mut replaced_image = false;

        let mut attempt = self.platform.create_event(scope_id, &entity).await;

        if let Err(err) = &attempt {
            if err.kind == RemoteErrorKind::DuplicateSlug {
                let suffix = rand::thread_rng().gen_range(0..=SLUG_SUFFIX_MAX);
                let slug = format!("{}_{suffix}", entity.slug.as_deref().unwrap_or_default());
                debug!(scope = scope_id, slug = %slug, "duplicate slug, retrying");
                entity.slug = Some(slug);
                attempt = self.platform.create_event(scope_id, &entity).await;
            }
        }

        if let Err(err) = &attempt {
            if self.should_replace_image(err) {
                warn!(scope = scope_id, "image rejected, retrying with fallback");
                entity.image = self.fallback_image();
                replaced_image = true;
                attempt = self.platform.create_event(scope_id, &entity).await;
            }
        }

        match attempt {
            Ok(event) => Ok(Published {
                event,
                replaced_image,
            }),
            Err(err) if err.kind == RemoteErrorKind::InvalidData => Err(invalid_data(err)),
            Err(err) => Err(err.into()),
        }
    }

    /// Update a published event.
    ///
    /// Not-found is returned as a remote error so the caller can recreate;
    /// any other 400 is a source data error.
    pub async fn update(
        &self,
        scope_id: &str,
        target_id: &str,
        mut entity: MappedEntity,
    ) -> Result<Published> {
        let mut replaced_image = false;

        let mut attempt = self.platform.update_event(scope_id, target_id, &entity).await;

        if let Err(err) = &attempt {
            if self.should_replace_image(err) {
                warn!(scope = scope_id, target_id, "image rejected, retrying with fallback");
                entity.image = self.fallback_image();
                replaced_image = true;
                attempt = self.platform.update_event(scope_id, target_id, &entity).await;
            }
        }

        match attempt {
            Ok(event) => Ok(Published {
                event,
                replaced_image,
            }),
            Err(err) if !err.is_not_found() && err.status == Some(400) => Err(invalid_data(err)),
            Err(err) if err.kind == RemoteErrorKind::InvalidData => Err(invalid_data(err)),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete a published event. Returns `false` when it was already gone.
    pub async fn delete(&self, scope_id: &str, target_id: &str) -> Result<bool> {
        match self.platform.delete_event(scope_id, target_id).await {
            Ok(()) => Ok(true),
            Err(err) if err.is_not_found() => {
                debug!(scope = scope_id, target_id, "event already removed");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn invalid_data(err: RemoteError) -> SyncError {
    let errors = err
        .body
        .as_ref()
        .and_then(|body| body.get("errors"))
        .cloned()
        .unwrap_or(Value::Null);
    SyncError::from(SourceDataError::InvalidData { errors }).context(err.to_string())
}
