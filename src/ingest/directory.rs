//! Batch source over local directories.
//!
//! Batches are `*.csv` files in an inbox directory. Once staged they are
//! moved into a processed or bad directory under the same file name.

use super::{BatchRef, BatchSource, Disposition};
use crate::config::workflow::SourceConfig;
use crate::error::{Error, Result};
use crate::model::RawRow;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

#[derive(Debug, Clone)]
pub struct DirectorySource {
    inbox: PathBuf,
    processed: PathBuf,
    bad: PathBuf,
}

impl DirectorySource {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            inbox: config.inbox.clone(),
            processed: config.processed.clone(),
            bad: config.bad.clone(),
        }
    }

    fn path_of(&self, batch: &BatchRef) -> PathBuf {
        self.inbox.join(&batch.id)
    }
}

#[async_trait]
impl BatchSource for DirectorySource {
    async fn list_batches(&self) -> Result<Vec<BatchRef>> {
        let mut dir = tokio::fs::read_dir(&self.inbox).await.map_err(|e| {
            Error::Source(format!("cannot list {}: {e}", self.inbox.display()))
        })?;

        let mut batches = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.to_lowercase().ends_with(".csv") {
                batches.push(BatchRef::new(name));
            }
        }

        batches.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(batches)
    }

    async fn fetch_rows(&self, batch: &BatchRef) -> Result<Vec<RawRow>> {
        let path = self.path_of(batch);
        let bytes = tokio::fs::read(&path).await?;
        parse_csv(&bytes).map_err(|e| Error::Source(format!("{}: {e}", path.display())))
    }

    async fn route(&self, batch: &BatchRef, disposition: Disposition) -> Result<()> {
        let target_dir = match disposition {
            Disposition::Processed => &self.processed,
            Disposition::Bad => &self.bad,
        };
        move_into(&self.path_of(batch), target_dir).await?;
        info!(batch = %batch.id, to = %target_dir.display(), "batch routed");
        Ok(())
    }
}

/// Parse CSV bytes with a header row. A leading UTF-8 BOM is dropped.
pub fn parse_csv(bytes: &[u8]) -> std::result::Result<Vec<RawRow>, csv::Error> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes);

    let headers = reader.headers()?.clone();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row: RawRow = headers
            .iter()
            .zip(record.iter())
            .map(|(h, v)| (h.to_string(), v.to_string()))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

async fn move_into(from: &Path, dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let name = from
        .file_name()
        .ok_or_else(|| Error::Source(format!("not a file: {}", from.display())))?;
    tokio::fs::rename(from, dir.join(name)).await.map_err(|e| {
        Error::Source(format!("cannot move {} to {}: {e}", from.display(), dir.display()))
    })
}
