//! # Filesystem Dead-Letter Sink
//!
//! Writes each [`DeadLetterRecord`] as a pretty-printed JSON file under a base
//! directory, partitioned by day. Files are written to a temporary path and
//! renamed into place so readers never see a partial record.

use crate::dead_letter::{DeadLetterError, DeadLetterRecord, DeadLetterSink};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Filesystem-based dead-letter sink
///
/// # Examples
///
/// ```no_run
/// use account_keeper_core::adapters::FilesystemDeadLetterSink;
/// use std::path::PathBuf;
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let sink = FilesystemDeadLetterSink::new(PathBuf::from("./data")).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct FilesystemDeadLetterSink {
    base_path: PathBuf,
}

impl FilesystemDeadLetterSink {
    /// Create a sink rooted at `base_path`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the directory cannot be created.
    pub async fn new(base_path: PathBuf) -> Result<Self, DeadLetterError> {
        fs::create_dir_all(&base_path)
            .await
            .map_err(|e| storage_error("Failed to create base directory", e))?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Full path a record is written to
    pub fn record_path(&self, record: &DeadLetterRecord) -> PathBuf {
        self.base_path.join(record.to_relative_path())
    }
}

fn storage_error(context: &str, e: std::io::Error) -> DeadLetterError {
    DeadLetterError::Storage {
        message: format!("{}: {}", context, e),
    }
}

#[async_trait]
impl DeadLetterSink for FilesystemDeadLetterSink {
    async fn record(&self, record: DeadLetterRecord) -> Result<(), DeadLetterError> {
        let path = self.record_path(&record);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| storage_error("Failed to create directory structure", e))?;
        }

        let json = serde_json::to_string_pretty(&record)?;

        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| storage_error("Failed to create temp file", e))?;
        file.write_all(json.as_bytes())
            .await
            .map_err(|e| storage_error("Failed to write record", e))?;
        file.flush()
            .await
            .map_err(|e| storage_error("Failed to flush file", e))?;

        fs::rename(&temp_path, &path)
            .await
            .map_err(|e| storage_error("Failed to rename temp file", e))?;

        debug!(path = %path.display(), "Dead-letter record written");
        Ok(())
    }
}

#[cfg(test)]
#[path = "filesystem_dead_letter_tests.rs"]
mod tests;
