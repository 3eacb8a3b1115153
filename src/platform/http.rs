//! REST implementation of [`TargetPlatform`].

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::{RemoteResult, TargetPlatform};
use crate::config::PlatformConfig;
use crate::error::{RemoteError, RemoteErrorKind};
use crate::types::{MappedEntity, PublishedEvent, TargetLocation};

/// Events platform reached over HTTP with a bearer token.
#[derive(Debug, Clone)]
pub struct HttpPlatform {
    client: reqwest::Client,
    base_url: String,
    access_token: Option<String>,
}

impl HttpPlatform {
    pub fn new(config: &PlatformConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            access_token: config.resolve_access_token(),
        })
    }

    /// `path` is appended as is; ids are percent-encoded as path segments.
    fn scope_url(&self, scope_id: &str, path: &str) -> String {
        format!(
            "{}/agendas/{}/{}",
            self.base_url,
            urlencoding::encode(scope_id),
            path
        )
    }

    fn event_url(&self, scope_id: &str, target_id: &str) -> String {
        self.scope_url(scope_id, &format!("events/{}", urlencoding::encode(target_id)))
    }

    fn request(&self, method: Method, url: String) -> RequestBuilder {
        let request = self.client.request(method, url);
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn execute(&self, request: RequestBuilder) -> RemoteResult<Value> {
        let response = request
            .send()
            .await
            .map_err(|e| RemoteError::new(RemoteErrorKind::Transport, e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| RemoteError::new(RemoteErrorKind::Transport, e.to_string()))?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        if status.is_success() {
            return Ok(body);
        }

        let kind = classify(status.as_u16(), &body);
        let message = body
            .get("message")
            .or_else(|| body.get("error"))
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| status.to_string());
        debug!(status = status.as_u16(), ?kind, "platform request failed");

        Err(RemoteError::new(kind, message)
            .with_status(status.as_u16())
            .with_body(body))
    }
}

/// Decode `body[key]`, or the whole body when the key is absent.
fn unwrap_payload<T: DeserializeOwned>(body: Value, key: &str) -> RemoteResult<T> {
    let payload = match body {
        Value::Object(mut map) if map.contains_key(key) => map.remove(key).unwrap_or_default(),
        other => other,
    };
    serde_json::from_value(payload).map_err(|e| {
        RemoteError::new(RemoteErrorKind::Other, format!("unexpected response: {e}"))
    })
}

/// Map an error response onto a [`RemoteErrorKind`].
pub fn classify(status: u16, body: &Value) -> RemoteErrorKind {
    let errors = body.get("errors").and_then(Value::as_array);
    let field_of = |error: &Value| error.get("field").and_then(Value::as_str).map(String::from);

    if let Some(first) = errors.and_then(|errors| errors.first()) {
        if field_of(first).as_deref() == Some("slug")
            && first.get("code").and_then(Value::as_str) == Some("duplicate")
        {
            return RemoteErrorKind::DuplicateSlug;
        }
    }
    if let Some([only]) = errors.map(Vec::as_slice) {
        if field_of(only).as_deref() == Some("image") {
            return RemoteErrorKind::InvalidImage;
        }
    }
    if status == 404 || body.get("error").and_then(Value::as_str) == Some("event not found") {
        return RemoteErrorKind::NotFound;
    }
    if status == 400 && body.get("message").and_then(Value::as_str) == Some("data is invalid") {
        return RemoteErrorKind::InvalidData;
    }

    match status {
        401 | 403 => RemoteErrorKind::Unauthorized,
        429 => RemoteErrorKind::RateLimited,
        500..=599 => RemoteErrorKind::Server,
        _ => RemoteErrorKind::Other,
    }
}

#[async_trait]
impl TargetPlatform for HttpPlatform {
    async fn fetch_schema(&self, scope_id: &str) -> RemoteResult<Value> {
        let body = self
            .execute(self.request(Method::GET, self.scope_url(scope_id, "settings")))
            .await?;
        Ok(body
            .pointer("/schema/fields")
            .cloned()
            .unwrap_or(body))
    }

    async fn list_locations(
        &self,
        scope_id: &str,
        offset: usize,
        limit: usize,
    ) -> RemoteResult<Vec<TargetLocation>> {
        let request = self
            .request(Method::GET, self.scope_url(scope_id, "locations"))
            .query(&[
                ("from", offset.to_string()),
                ("size", limit.to_string()),
                ("detailed", "1".to_string()),
            ]);
        let body = self.execute(request).await?;
        unwrap_payload(body, "locations")
    }

    async fn create_location(
        &self,
        scope_id: &str,
        location: &Value,
    ) -> RemoteResult<TargetLocation> {
        let request = self
            .request(Method::POST, self.scope_url(scope_id, "locations"))
            .json(location);
        unwrap_payload(self.execute(request).await?, "location")
    }

    async fn create_event(
        &self,
        scope_id: &str,
        event: &MappedEntity,
    ) -> RemoteResult<PublishedEvent> {
        let request = self
            .request(Method::POST, self.scope_url(scope_id, "events"))
            .json(event);
        unwrap_payload(self.execute(request).await?, "event")
    }

    async fn update_event(
        &self,
        scope_id: &str,
        target_id: &str,
        event: &MappedEntity,
    ) -> RemoteResult<PublishedEvent> {
        let request = self
            .request(Method::PATCH, self.event_url(scope_id, target_id))
            .json(event);
        unwrap_payload(self.execute(request).await?, "event")
    }

    async fn delete_event(&self, scope_id: &str, target_id: &str) -> RemoteResult<()> {
        self.execute(self.request(Method::DELETE, self.event_url(scope_id, target_id)))
            .await?;
        Ok(())
    }
}
