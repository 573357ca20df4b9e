//! Record processors.
//!
//! A processor takes one claimed entry and either accepts it or rejects it
//! with a reason. Rejections are final: the pipeline quarantines the entry
//! and never retries it.

use crate::cache::TtlCache;
use crate::clock::Clock;
use crate::config::workflow::ProcessorConfig;
use crate::model::{EntryId, QueueEntry};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Why a record could not be processed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct Rejection {
    pub reason: String,
}

impl Rejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl From<crate::error::Error> for Rejection {
    fn from(e: crate::error::Error) -> Self {
        Self::new(e.to_string())
    }
}

#[async_trait]
pub trait RecordProcessor: Send + Sync {
    async fn process(&self, entry: &QueueEntry) -> Result<(), Rejection>;
}

/// Runs an executable once per record.
///
/// The payload is written as JSON to the hook's stdin, and `IMPORTQ_QUEUE`
/// and `IMPORTQ_ENTRY_ID` are set in its environment. Exit status 0 accepts
/// the record; otherwise the last line the hook wrote to stderr becomes the
/// rejection reason. The child is killed if the call is dropped.
#[derive(Clone)]
pub struct HookProcessor {
    command: PathBuf,
    args: Vec<String>,
    /// Encoded payloads the hook accepted, per queue and entry id.
    accepted: Option<Arc<TtlCache<EntryId, Vec<u8>>>>,
}

impl HookProcessor {
    pub fn new(config: &ProcessorConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            accepted: None,
        }
    }

    /// Accept without running the hook when the same entry arrives with the
    /// payload the hook accepted less than `ttl` ago.
    pub fn with_accepted_cache(mut self, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        self.accepted = Some(Arc::new(TtlCache::new(ttl, clock)));
        self
    }

    fn already_accepted(&self, entry: &QueueEntry, payload: &[u8]) -> bool {
        self.accepted.as_ref().is_some_and(|cache| {
            cache
                .get(entry.queue_name.as_str(), &entry.id)
                .is_some_and(|seen| seen == payload)
        })
    }

    async fn run(&self, entry: &QueueEntry, payload: Vec<u8>) -> Result<(), Rejection> {
        let command = &self.command;
        debug!(
            queue = %entry.queue_name,
            id = %entry.id,
            command = %command.display(),
            "running hook"
        );

        let mut child = Command::new(command)
            .args(&self.args)
            .env("IMPORTQ_QUEUE", entry.queue_name.as_str())
            .env("IMPORTQ_ENTRY_ID", entry.id.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Rejection::new(format!("cannot start {}: {e}", command.display())))?;

        // Feed stdin while stderr drains, so neither pipe can fill and block.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A hook may exit without reading its input; its status decides.
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!("hook did not read payload: {e}");
                }
            }
        };
        let ((), output) = tokio::join!(feed, child.wait_with_output());
        let output = output.map_err(|e| Rejection::new(format!("hook did not finish: {e}")))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = stderr
            .lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| {
                format!("hook exited with status {}", output.status.code().unwrap_or(-1))
            });
        Err(Rejection::new(reason))
    }
}

#[async_trait]
impl RecordProcessor for HookProcessor {
    async fn process(&self, entry: &QueueEntry) -> Result<(), Rejection> {
        let payload = serde_json::to_vec(&entry.payload)
            .map_err(|e| Rejection::new(format!("cannot encode payload: {e}")))?;

        if self.already_accepted(entry, &payload) {
            debug!(queue = %entry.queue_name, id = %entry.id, "payload unchanged since accepted, hook skipped");
            return Ok(());
        }

        let result = self.run(entry, payload.clone()).await;

        if let Some(cache) = &self.accepted {
            match &result {
                Ok(()) => cache.insert(entry.queue_name.as_str(), entry.id.clone(), payload),
                Err(_) => cache.invalidate(entry.queue_name.as_str(), &entry.id),
            }
        }
        result
    }
}
