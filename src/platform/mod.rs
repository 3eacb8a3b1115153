//! Remote events platform.
//!
//! [`TargetPlatform`] is the raw capability surface; [`MutationGateway`]
//! layers the retry and classification policy on top of it.

mod gateway;
#[cfg(feature = "http")]
pub mod http;

use async_trait::async_trait;
use serde_json::Value;

pub use gateway::{MutationGateway, Published};
#[cfg(feature = "http")]
pub use http::HttpPlatform;

use crate::error::RemoteError;
use crate::types::{MappedEntity, PublishedEvent, TargetLocation};

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

#[async_trait]
pub trait TargetPlatform: Send + Sync {
    /// Form schema of a scope, handed to `map` and `post_map`.
    async fn fetch_schema(&self, scope_id: &str) -> RemoteResult<Value>;

    /// One page of the scope's known locations.
    async fn list_locations(
        &self,
        scope_id: &str,
        offset: usize,
        limit: usize,
    ) -> RemoteResult<Vec<TargetLocation>>;

    async fn create_location(&self, scope_id: &str, location: &Value)
        -> RemoteResult<TargetLocation>;

    async fn create_event(&self, scope_id: &str, event: &MappedEntity)
        -> RemoteResult<PublishedEvent>;

    async fn update_event(
        &self,
        scope_id: &str,
        target_id: &str,
        event: &MappedEntity,
    ) -> RemoteResult<PublishedEvent>;

    async fn delete_event(&self, scope_id: &str, target_id: &str) -> RemoteResult<()>;
}

/// Every known location of a scope, fetched page by page until an empty page.
pub async fn list_all_locations(
    platform: &dyn TargetPlatform,
    scope_id: &str,
    page_size: usize,
) -> RemoteResult<Vec<TargetLocation>> {
    let page_size = page_size.max(1);
    let mut locations = Vec::new();
    loop {
        let page = platform
            .list_locations(scope_id, locations.len(), page_size)
            .await?;
        if page.is_empty() {
            break;
        }
        locations.extend(page);
    }
    Ok(locations)
}
