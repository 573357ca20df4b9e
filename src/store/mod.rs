//! Durable queue store.
//!
//! [`QueueStore`] gives the exact queue semantics (upsert, claim, quarantine)
//! on top of any [`Backend`] that offers conditional single-entry
//! transitions and a paged range query with a continuation key. Contention
//! is a normal outcome ([`Write::ConditionFailed`], or `None` from a claim),
//! not an error. Backend failures propagate untouched; the store never
//! retries.

pub mod memory;

pub use memory::MemoryBackend;

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::model::{EntryId, QuarantineEntry, QueueEntry, QueueName};
use crate::telemetry::metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use std::sync::Arc;
use tracing::{debug, warn};

/// Default number of rows a backend reads per page.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Outcome of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Write {
    Applied,
    ConditionFailed,
}

/// One page of a range query.
#[derive(Debug, Clone)]
pub struct Page<T> {
    /// Items in this page that matched the filter.
    pub items: Vec<T>,
    /// Rows examined to produce this page, matched or not.
    pub scanned: usize,
    /// Continuation key. `None` when the partition is exhausted.
    pub last_key: Option<EntryId>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            scanned: 0,
            last_key: None,
        }
    }
}

/// A key-value store with conditional writes and paged range queries.
///
/// Every state change of a single entry is one conditional operation on the
/// backend, so two processes sharing a backend never undo each other's work.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Write `payload` as an unclaimed entry, unless the stored entry is
    /// claimed.
    async fn upsert(
        &self,
        queue: &QueueName,
        id: &EntryId,
        payload: &serde_json::Value,
    ) -> Result<Write>;

    /// Mark an unclaimed entry claimed at `at`, leaving its payload as
    /// stored. Returns the claimed entry, or `None` if it is absent or
    /// already claimed.
    async fn claim(
        &self,
        queue: &QueueName,
        id: &EntryId,
        at: DateTime<Utc>,
    ) -> Result<Option<QueueEntry>>;

    /// Return an entry to the unclaimed state if it is still held by the
    /// claim made at `claimed_at`. Anything else is left alone.
    async fn release(
        &self,
        queue: &QueueName,
        id: &EntryId,
        claimed_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Remove a live entry. Absent entries are not an error.
    async fn delete(&self, queue: &QueueName, id: &EntryId) -> Result<()>;

    /// Read one page of entries with `claimed == claimed`, in key order,
    /// starting after `start_after`.
    async fn query(
        &self,
        queue: &QueueName,
        claimed: bool,
        start_after: Option<&EntryId>,
        page_size: usize,
    ) -> Result<Page<QueueEntry>>;

    /// Atomically remove the live entry and store it in quarantine with
    /// `reason`, replacing any quarantine entry with the same id. `None`
    /// when there is no live entry.
    async fn move_to_quarantine(
        &self,
        queue: &QueueName,
        id: &EntryId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<QuarantineEntry>>;

    /// Atomically turn a quarantine entry back into unclaimed work. Returns
    /// `false`, changing nothing, if there is no such quarantine entry or
    /// the live entry is claimed.
    async fn move_from_quarantine(&self, queue: &QueueName, id: &EntryId) -> Result<bool>;

    async fn delete_quarantined(&self, queue: &QueueName, id: &EntryId) -> Result<()>;

    async fn query_quarantined(
        &self,
        queue: &QueueName,
        start_after: Option<&EntryId>,
        page_size: usize,
    ) -> Result<Page<QuarantineEntry>>;
}

/// What an upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// Entry written (new or replaced) as unclaimed.
    Written,
    /// A worker holds the entry; it was left alone.
    SkippedClaimed,
}

/// Queue operations scoped by queue name.
#[derive(Clone)]
pub struct QueueStore {
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
    page_size: usize,
}

impl QueueStore {
    pub fn new(backend: Arc<dyn Backend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            clock,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// A store over a fresh in-process backend (for testing and dry runs).
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()), Arc::new(SystemClock))
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Write or replace an unclaimed entry. Never resets a claimed one.
    pub async fn upsert(
        &self,
        queue: &QueueName,
        id: &EntryId,
        payload: serde_json::Value,
    ) -> Result<Upsert> {
        let result = match self.backend.upsert(queue, id, &payload).await? {
            Write::Applied => Upsert::Written,
            Write::ConditionFailed => {
                warn!(queue = %queue, id = %id, "entry is claimed, upsert skipped");
                Upsert::SkippedClaimed
            }
        };
        record_op(queue, "upsert");
        Ok(result)
    }

    /// Up to `limit` unclaimed entries.
    pub async fn list_unclaimed(&self, queue: &QueueName, limit: usize) -> Result<Vec<QueueEntry>> {
        self.scan(queue, false, limit).await
    }

    /// Up to `limit` claimed entries.
    pub async fn list_claimed(&self, queue: &QueueName, limit: usize) -> Result<Vec<QueueEntry>> {
        self.scan(queue, true, limit).await
    }

    /// Claim up to `limit` unclaimed entries. Each claim is a conditional
    /// flag flip; entries lost to a concurrent claimer are skipped. Returns
    /// only the entries this call now owns, with their payload as stored at
    /// claim time. On a backend error the claims already made are released
    /// where the backend allows it.
    pub async fn claim_batch(&self, queue: &QueueName, limit: usize) -> Result<Vec<QueueEntry>> {
        let candidates = self.list_unclaimed(queue, limit).await?;
        let mut claimed = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            let won = match self.backend.claim(queue, &candidate.id, self.clock.now()).await {
                Ok(won) => won,
                Err(e) => {
                    if let Err(release_error) = self.release(queue, &claimed).await {
                        warn!(queue = %queue, count = claimed.len(), error = %release_error, "could not release partial claim");
                    }
                    return Err(e);
                }
            };
            match won {
                Some(entry) => claimed.push(entry),
                None => {
                    debug!(queue = %queue, id = %candidate.id, "lost claim race, skipping");
                    metrics::claim_contention()
                        .add(1, &[KeyValue::new("queue", queue.to_string())]);
                }
            }
        }

        record_op(queue, "claim");
        Ok(claimed)
    }

    /// Give claimed entries back to the queue unprocessed.
    ///
    /// Only the claim recorded on each entry is undone, so releasing again
    /// after another worker has claimed the entry changes nothing.
    pub async fn release(&self, queue: &QueueName, entries: &[QueueEntry]) -> Result<()> {
        for entry in entries {
            if let Some(claimed_at) = entry.claimed_at {
                self.backend.release(queue, &entry.id, claimed_at).await?;
            }
        }
        record_op(queue, "release");
        Ok(())
    }

    /// Remove a live entry. Idempotent.
    pub async fn delete(&self, queue: &QueueName, id: &EntryId) -> Result<()> {
        self.backend.delete(queue, id).await?;
        record_op(queue, "delete");
        Ok(())
    }

    /// Move a live entry into quarantine with `reason`.
    ///
    /// Returns `false` when there was no live entry to move, which is treated
    /// as already resolved.
    pub async fn quarantine(&self, queue: &QueueName, id: &EntryId, reason: &str) -> Result<bool> {
        let moved = self
            .backend
            .move_to_quarantine(queue, id, reason, self.clock.now())
            .await?;
        if moved.is_none() {
            debug!(queue = %queue, id = %id, "no live entry to quarantine");
        }
        record_op(queue, "quarantine");
        Ok(moved.is_some())
    }

    /// Up to `limit` quarantine entries.
    pub async fn list_quarantined(
        &self,
        queue: &QueueName,
        limit: usize,
    ) -> Result<Vec<QuarantineEntry>> {
        let backend = &self.backend;
        let page_size = self.page_size;
        collect_pages(limit, move |after| async move {
            backend
                .query_quarantined(queue, after.as_ref(), page_size)
                .await
        })
        .await
    }

    /// Remove quarantine entries by id. Absent ids are ignored.
    pub async fn delete_quarantined(&self, queue: &QueueName, ids: &[EntryId]) -> Result<()> {
        for id in ids {
            self.backend.delete_quarantined(queue, id).await?;
        }
        record_op(queue, "delete_quarantined");
        Ok(())
    }

    /// Put a quarantined record back on the queue as fresh, unclaimed work.
    ///
    /// Returns `false` if no such quarantine entry exists. If the live entry
    /// is currently claimed the quarantine entry is kept.
    pub async fn requeue_quarantined(&self, queue: &QueueName, id: &EntryId) -> Result<bool> {
        let moved = self.backend.move_from_quarantine(queue, id).await?;
        if moved {
            record_op(queue, "requeue");
        }
        Ok(moved)
    }

    async fn scan(&self, queue: &QueueName, claimed: bool, limit: usize) -> Result<Vec<QueueEntry>> {
        let backend = &self.backend;
        let page_size = self.page_size;
        collect_pages(limit, move |after| async move {
            backend.query(queue, claimed, after.as_ref(), page_size).await
        })
        .await
    }
}

/// Merge pages until `limit` items are found or the partition is exhausted.
///
/// A page may hold fewer items than it scanned, or none, and still carry a
/// continuation key.
async fn collect_pages<T, F, Fut>(limit: usize, mut fetch: F) -> Result<Vec<T>>
where
    F: FnMut(Option<EntryId>) -> Fut,
    Fut: Future<Output = Result<Page<T>>>,
{
    let mut found = Vec::new();
    let mut start_after = None;

    while found.len() < limit {
        let page = fetch(start_after.take()).await?;
        found.extend(page.items);
        if page.scanned == 0 || page.last_key.is_none() {
            break;
        }
        start_after = page.last_key;
    }

    found.truncate(limit);
    Ok(found)
}

fn record_op(queue: &QueueName, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}
