//! On-disk staging area between download and dispatch, and the error sink.
//!
//! Layout under the working directory:
//!
//! ```text
//! data/record.{n}.json       staged source records, dispatched in numeric order
//! errors/{run_start}:{name}  flattened error snapshots
//! ```
//!
//! Snapshots written while resuming an interrupted run are named
//! `{run_start}:resume:{name}`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::types::SourceRecord;

const STAGED_FILE_PATTERN: &str = r"^record\.(\d+)\.json$";

/// A staged record file and its position in download order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub index: u64,
    pub path: PathBuf,
}

impl StagedFile {
    /// File name used in logs and error sink names.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("record.{}.json", self.index))
    }
}

/// Durable FIFO of downloaded source records.
#[derive(Debug, Clone)]
pub struct StagingQueue {
    dir: PathBuf,
    pattern: Regex,
}

impl StagingQueue {
    /// Open the queue rooted at `<working_dir>/data`, creating it if needed.
    pub async fn open(working_dir: &Path) -> std::io::Result<Self> {
        let dir = working_dir.join("data");
        tokio::fs::create_dir_all(&dir).await?;
        let pattern = Regex::new(STAGED_FILE_PATTERN)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))?;
        Ok(Self { dir, pattern })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn stage(&self, index: u64, record: &SourceRecord) -> std::io::Result<StagedFile> {
        let path = self.dir.join(format!("record.{index}.json"));
        let contents = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(&path, contents).await?;
        Ok(StagedFile { index, path })
    }

    /// Staged files in numeric order. Files not matching the naming scheme
    /// are ignored.
    pub async fn pending(&self) -> std::io::Result<Vec<StagedFile>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(captures) = self.pattern.captures(&name) else {
                continue;
            };
            if let Ok(index) = captures[1].parse::<u64>() {
                files.push(StagedFile {
                    index,
                    path: entry.path(),
                });
            }
        }
        files.sort_by_key(|file| file.index);
        Ok(files)
    }

    pub async fn has_pending(&self) -> std::io::Result<bool> {
        Ok(!self.pending().await?.is_empty())
    }

    /// Index following the highest staged file, so new records never
    /// overwrite files still waiting for dispatch.
    pub async fn next_index(&self) -> std::io::Result<u64> {
        Ok(self
            .pending()
            .await?
            .last()
            .map_or(0, |file| file.index.saturating_add(1)))
    }

    pub async fn read(&self, file: &StagedFile) -> std::io::Result<SourceRecord> {
        let contents = tokio::fs::read(&file.path).await?;
        Ok(serde_json::from_slice(&contents)?)
    }

    /// Remove a dispatched file. A missing file is not an error.
    pub async fn remove(&self, file: &StagedFile) -> std::io::Result<()> {
        match tokio::fs::remove_file(&file.path).await {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }
}

/// Writes one JSON snapshot per caught error.
#[derive(Debug, Clone)]
pub struct ErrorSink {
    dir: PathBuf,
    prefix: String,
}

impl ErrorSink {
    pub async fn open(working_dir: &Path, run_start: DateTime<Utc>) -> std::io::Result<Self> {
        let dir = working_dir.join("errors");
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            prefix: run_start.to_rfc3339_opts(SecondsFormat::Millis, true),
        })
    }

    /// Sink writing into the same directory under `{prefix}:{label}`.
    pub fn labelled(&self, label: &str) -> Self {
        Self {
            dir: self.dir.clone(),
            prefix: format!("{}:{label}", self.prefix),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the snapshot for `name`. Names that are not plain file names
    /// are replaced by their blake3 digest.
    pub fn path_for(&self, name: &str) -> PathBuf {
        let safe = name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ':'))
            && !name.is_empty()
            && name.len() <= 128;
        let name = if safe {
            name.to_string()
        } else {
            blake3::hash(name.as_bytes()).to_hex().to_string()
        };
        self.dir.join(format!("{}:{}", self.prefix, name))
    }

    /// Persist an error snapshot. Failing to write is logged, never raised.
    pub async fn record(&self, name: &str, error: &SyncError, subject: Option<&Value>) {
        let mut snapshot = json!({ "error": error.snapshot() });
        if let Some(subject) = subject {
            snapshot["subject"] = subject.clone();
        }

        let path = self.path_for(name);
        let written = match serde_json::to_vec_pretty(&snapshot) {
            Ok(contents) => tokio::fs::write(&path, contents).await,
            Err(err) => Err(err.into()),
        };
        match written {
            Ok(()) => debug!(path = %path.display(), "error snapshot written"),
            Err(err) => warn!(path = %path.display(), error = %err, "failed to write error snapshot"),
        }
    }
}
