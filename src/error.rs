//! Error types and failure classification.
//!
//! Every failure raised while synchronizing falls into one of three
//! categories (see [`ErrorCategory`]): a defect of the source data, an error
//! returned by the remote platform, or anything else (I/O, programming
//! errors). Categories drive statistics and error reports, never control
//! flow; control flow decisions look at [`RemoteErrorKind`] directly.

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

/// Kind of source data defect, used to bucket offending ids in statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceDataKind {
    MissingTimings,
    MissingLocation,
    ValidationError,
}

/// The source record is structurally unusable.
#[derive(Debug, Clone, Error)]
pub enum SourceDataError {
    #[error("Missing timings")]
    MissingTimings,

    #[error("Missing location")]
    MissingLocation,

    /// The target rejected the entity for reasons attributable to its data.
    #[error("Invalid data")]
    InvalidData { errors: Value },
}

impl SourceDataError {
    pub fn kind(&self) -> SourceDataKind {
        match self {
            Self::MissingTimings => SourceDataKind::MissingTimings,
            Self::MissingLocation => SourceDataKind::MissingLocation,
            Self::InvalidData { .. } => SourceDataKind::ValidationError,
        }
    }
}

/// What the remote platform complained about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    NotFound,
    DuplicateSlug,
    InvalidImage,
    InvalidData,
    Unauthorized,
    RateLimited,
    Server,
    Transport,
    Other,
}

/// Error returned by a [`TargetPlatform`](crate::platform::TargetPlatform) call.
#[derive(Debug, Clone, Error, Serialize)]
#[error("remote platform error ({kind:?}): {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub status: Option<u16>,
    pub message: String,
    pub body: Option<Value>,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
            body: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::NotFound, message).with_status(404)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == RemoteErrorKind::NotFound
    }
}

/// Errors raised by the correspondence store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid stored timestamp: {0}")]
    Timestamp(#[from] chrono::ParseError),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store connection lock poisoned")]
    Poisoned,
}

/// Failure category used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "category", content = "kind")]
pub enum ErrorCategory {
    SourceData(SourceDataKind),
    RemotePlatform,
    Unclassified,
}

/// Error type flowing through the reconciliation engine.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("source data error: {0}")]
    Source(#[from] SourceDataError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("staging error: {0}")]
    Staging(#[from] std::io::Error),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<SyncError>,
    },

    #[error(transparent)]
    Other(anyhow::Error),
}

impl From<anyhow::Error> for SyncError {
    /// Adapters report through `anyhow`; recover typed causes so that a
    /// `SourceDataError` or `RemoteError` raised inside an adapter is still
    /// classified correctly.
    fn from(err: anyhow::Error) -> Self {
        let err = match err.downcast::<SourceDataError>() {
            Ok(source) => return Self::Source(source),
            Err(err) => err,
        };
        match err.downcast::<RemoteError>() {
            Ok(remote) => Self::Remote(remote),
            Err(err) => Self::Other(err),
        }
    }
}

impl SyncError {
    /// Wrap this error with a context message, keeping the typed cause.
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, skipping context layers.
    pub fn root(&self) -> &SyncError {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self.root() {
            Self::Source(source) => ErrorCategory::SourceData(source.kind()),
            Self::Remote(_) => ErrorCategory::RemotePlatform,
            _ => ErrorCategory::Unclassified,
        }
    }

    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self.root() {
            Self::Remote(remote) => Some(remote),
            _ => None,
        }
    }

    pub fn is_remote_not_found(&self) -> bool {
        self.as_remote().is_some_and(RemoteError::is_not_found)
    }

    /// Flattened, cycle-free JSON view of the error for the error sink.
    pub fn snapshot(&self) -> Value {
        let mut chain = Vec::new();
        let mut current = self;
        while let Self::Context { context, source } = current {
            chain.push(Value::String(context.clone()));
            current = source;
        }
        chain.push(Value::String(current.to_string()));

        let mut snapshot = json!({
            "message": self.to_string(),
            "category": self.category(),
            "chain": chain,
        });
        match current {
            Self::Remote(remote) => {
                snapshot["remote"] = serde_json::to_value(remote).unwrap_or(Value::Null);
            }
            Self::Source(SourceDataError::InvalidData { errors }) => {
                snapshot["errors"] = errors.clone();
            }
            _ => {}
        }
        snapshot
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_sees_through_context() {
        let err = SyncError::from(SourceDataError::MissingTimings)
            .context("Error in event map")
            .context("Dispatch failed");

        assert_eq!(
            err.category(),
            ErrorCategory::SourceData(SourceDataKind::MissingTimings)
        );
        assert!(err.to_string().starts_with("Dispatch failed"));
    }

    #[test]
    fn test_anyhow_downcasts_typed_causes() {
        let err: SyncError = anyhow::Error::new(SourceDataError::MissingLocation).into();
        assert_eq!(
            err.category(),
            ErrorCategory::SourceData(SourceDataKind::MissingLocation)
        );

        let err: SyncError = anyhow::Error::new(RemoteError::not_found("gone")).into();
        assert!(err.is_remote_not_found());

        let err: SyncError = anyhow::anyhow!("boom").into();
        assert_eq!(err.category(), ErrorCategory::Unclassified);
    }

    #[test]
    fn test_snapshot_is_flat() {
        let err = SyncError::from(
            RemoteError::new(RemoteErrorKind::Server, "bad gateway")
                .with_status(502)
                .with_body(json!({"error": "upstream"})),
        )
        .context("Error on event update");

        let snapshot = err.snapshot();
        assert_eq!(snapshot["category"]["category"], "remote_platform");
        assert_eq!(snapshot["chain"].as_array().unwrap().len(), 2);
        assert_eq!(snapshot["remote"]["status"], 502);
    }
}
