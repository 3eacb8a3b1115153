pub mod adapter;
pub mod config;
pub mod error;
pub mod persistence;
pub mod pipeline;
pub mod platform;
pub mod staging;
pub mod sync;
pub mod timings;
pub mod types;

#[cfg(test)]
pub mod test_utils;

pub use adapter::{JsonLinesSource, SourceAdapter};
pub use config::{RunOptions, SyncConfig};
pub use error::{Result, SyncError};
pub use platform::TargetPlatform;
pub use sync::{RunStats, SyncEngine};
