//! Durable sink
//!
//! Append-only log of processed messages, one JSON `DeliveryRecord` per line.
//! The parent directory is created on first use. Every append is flushed
//! and synced to disk before it returns, so a message is only acknowledged
//! once its record is durable.
//!
//! The log has a single writer (the worker) and no internal locking.

use std::path::{Path, PathBuf};

use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::broker::DeliveryRecord;
use crate::utils::RelayResult;

#[derive(Debug, Clone)]
pub struct LogSink {
    path: PathBuf,
    dir_ready: bool,
}

impl LogSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            dir_ready: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn ensure_dir(&mut self) -> RelayResult<()> {
        if self.dir_ready {
            return Ok(());
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        self.dir_ready = true;
        Ok(())
    }

    /// Appends one record as a single newline-terminated line.
    pub async fn append(&mut self, record: &DeliveryRecord) -> RelayResult<()> {
        self.ensure_dir().await?;

        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        file.sync_data().await?;

        debug!(path = %self.path.display(), bytes = line.len(), "Appended delivery record");
        Ok(())
    }

    /// Reads every record back in append order. A missing log is empty.
    /// Lines that do not parse are skipped.
    pub async fn records(&self) -> RelayResult<Vec<DeliveryRecord>> {
        let data = match fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        Ok(data
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}
