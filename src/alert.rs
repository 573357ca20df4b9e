//! Quarantine reports and where they are delivered.

use crate::error::{Error, Result};
use crate::model::{QuarantineEntry, QueueName};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

const REPORT_HEADER: [&str; 3] = ["Source Batch", "Entry Id", "Reason for Failure"];

/// One quarantined record in a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRow {
    pub origin: String,
    pub id: String,
    pub reason: String,
}

/// Quarantine entries collected for a single delivery.
#[derive(Debug, Clone)]
pub struct QuarantineReport {
    /// Unique per report, even for reports generated in the same instant.
    pub id: Uuid,
    pub workflow: String,
    pub queue: QueueName,
    pub generated_at: DateTime<Utc>,
    pub rows: Vec<ReportRow>,
}

impl QuarantineReport {
    pub fn new(
        workflow: &str,
        queue: &QueueName,
        generated_at: DateTime<Utc>,
        entries: &[QuarantineEntry],
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow: workflow.to_string(),
            queue: queue.clone(),
            generated_at,
            rows: entries
                .iter()
                .map(|e| ReportRow {
                    origin: e.origin.clone().unwrap_or_default(),
                    id: e.id.to_string(),
                    reason: e.reason.clone(),
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// File name for this report, e.g. `acme-2026-10-19T08-30-00.000Z-1f0c9a2e.csv`.
    pub fn file_name(&self) -> String {
        let id = self.id.simple().to_string();
        format!(
            "{}-{}-{}.csv",
            self.workflow,
            self.generated_at.format("%Y-%m-%dT%H-%M-%S%.3fZ"),
            &id[..8]
        )
    }

    /// Render as CSV with CRLF line endings and every field quoted.
    pub fn to_csv(&self) -> Result<String> {
        let mut writer = csv::WriterBuilder::new()
            .quote_style(csv::QuoteStyle::Always)
            .terminator(csv::Terminator::CRLF)
            .from_writer(Vec::new());

        let write = |w: &mut csv::Writer<Vec<u8>>| -> std::result::Result<(), csv::Error> {
            w.write_record(REPORT_HEADER)?;
            for row in &self.rows {
                w.write_record([&row.origin, &row.id, &row.reason])?;
            }
            Ok(())
        };
        write(&mut writer).map_err(|e| Error::Other(format!("render report: {e}")))?;

        let bytes = writer
            .into_inner()
            .map_err(|e| Error::Other(format!("render report: {e}")))?;
        String::from_utf8(bytes).map_err(|e| Error::Other(format!("render report: {e}")))
    }
}

/// Destination for quarantine reports.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, report: &QuarantineReport) -> Result<()>;
}

/// Writes each report as a new CSV file into a directory. Existing files
/// are never overwritten.
#[derive(Debug, Clone)]
pub struct FileAlertSink {
    dir: PathBuf,
}

impl FileAlertSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl AlertSink for FileAlertSink {
    async fn deliver(&self, report: &QuarantineReport) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(report.file_name());
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        file.write_all(report.to_csv()?.as_bytes()).await?;
        file.flush().await?;
        info!(
            workflow = %report.workflow,
            rows = report.len(),
            path = %path.display(),
            "quarantine report written"
        );
        Ok(())
    }
}

/// Logs every report row. Used when no report directory is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn deliver(&self, report: &QuarantineReport) -> Result<()> {
        for row in &report.rows {
            warn!(
                workflow = %report.workflow,
                origin = %row.origin,
                id = %row.id,
                reason = %row.reason,
                "quarantined record"
            );
        }
        Ok(())
    }
}
