//! In-process backend.
//!
//! Keeps both namespaces in ordered maps behind one lock, so every
//! transition, including moves between namespaces, is atomic. Range queries read `page_size`
//! rows of the partition and then filter, so a page can come back with
//! fewer matches than rows scanned (or none at all) while still carrying a
//! continuation key.

use super::{Backend, Page, Write};
use crate::error::{Error, Result};
use crate::model::{EntryId, QuarantineEntry, QueueEntry, QueueName};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

type Key = (QueueName, EntryId);

#[derive(Default)]
struct Tables {
    live: BTreeMap<Key, QueueEntry>,
    quarantine: BTreeMap<Key, QuarantineEntry>,
}

#[derive(Default)]
pub struct MemoryBackend {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail as if the store were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Backend("memory backend marked unavailable".into()));
        }
        self.tables
            .lock()
            .map_err(|_| Error::Backend("memory backend lock poisoned".into()))
    }
}

/// Scan up to `page_size` rows of `queue` after `start_after`, keeping those
/// that pass `keep`.
fn page_of<V: Clone>(
    map: &BTreeMap<Key, V>,
    queue: &QueueName,
    start_after: Option<&EntryId>,
    page_size: usize,
    keep: impl Fn(&V) -> bool,
) -> Page<V> {
    let lower = match start_after {
        Some(id) => Bound::Excluded((queue.clone(), id.clone())),
        None => Bound::Included((queue.clone(), EntryId::new(""))),
    };

    let mut page = Page::empty();
    let mut last = None;
    for ((q, id), value) in map.range((lower, Bound::Unbounded)) {
        if q != queue || page.scanned == page_size {
            break;
        }
        page.scanned += 1;
        last = Some(id.clone());
        if keep(value) {
            page.items.push(value.clone());
        }
    }

    if page.scanned == page_size {
        page.last_key = last;
    }
    page
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn upsert(
        &self,
        queue: &QueueName,
        id: &EntryId,
        payload: &serde_json::Value,
    ) -> Result<Write> {
        let mut tables = self.tables()?;
        let key = (queue.clone(), id.clone());
        if tables.live.get(&key).is_some_and(|e| e.claimed) {
            return Ok(Write::ConditionFailed);
        }
        tables.live.insert(
            key,
            QueueEntry::unclaimed(queue.clone(), id.clone(), payload.clone()),
        );
        Ok(Write::Applied)
    }

    async fn claim(
        &self,
        queue: &QueueName,
        id: &EntryId,
        at: DateTime<Utc>,
    ) -> Result<Option<QueueEntry>> {
        let mut tables = self.tables()?;
        match tables.live.get_mut(&(queue.clone(), id.clone())) {
            Some(entry) if !entry.claimed => {
                entry.claimed = true;
                entry.claimed_at = Some(at);
                Ok(Some(entry.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn release(
        &self,
        queue: &QueueName,
        id: &EntryId,
        claimed_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tables = self.tables()?;
        let held = tables
            .live
            .get_mut(&(queue.clone(), id.clone()))
            .filter(|e| e.claimed && e.claimed_at == Some(claimed_at));
        if let Some(entry) = held {
            entry.claimed = false;
            entry.claimed_at = None;
        }
        Ok(())
    }

    async fn delete(&self, queue: &QueueName, id: &EntryId) -> Result<()> {
        let mut tables = self.tables()?;
        tables.live.remove(&(queue.clone(), id.clone()));
        Ok(())
    }

    async fn query(
        &self,
        queue: &QueueName,
        claimed: bool,
        start_after: Option<&EntryId>,
        page_size: usize,
    ) -> Result<Page<QueueEntry>> {
        let tables = self.tables()?;
        Ok(page_of(&tables.live, queue, start_after, page_size, |e| {
            e.claimed == claimed
        }))
    }

    async fn move_to_quarantine(
        &self,
        queue: &QueueName,
        id: &EntryId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<QuarantineEntry>> {
        let mut tables = self.tables()?;
        let key = (queue.clone(), id.clone());
        let Some(entry) = tables.live.remove(&key) else {
            return Ok(None);
        };
        let quarantined = QuarantineEntry::from_entry(entry, reason, at);
        tables.quarantine.insert(key, quarantined.clone());
        Ok(Some(quarantined))
    }

    async fn move_from_quarantine(&self, queue: &QueueName, id: &EntryId) -> Result<bool> {
        let mut tables = self.tables()?;
        let key = (queue.clone(), id.clone());
        if !tables.quarantine.contains_key(&key)
            || tables.live.get(&key).is_some_and(|e| e.claimed)
        {
            return Ok(false);
        }
        let Some(entry) = tables.quarantine.remove(&key) else {
            return Ok(false);
        };
        tables.live.insert(
            key,
            QueueEntry::unclaimed(entry.queue_name, entry.id, entry.payload),
        );
        Ok(true)
    }

    async fn delete_quarantined(&self, queue: &QueueName, id: &EntryId) -> Result<()> {
        let mut tables = self.tables()?;
        tables.quarantine.remove(&(queue.clone(), id.clone()));
        Ok(())
    }

    async fn query_quarantined(
        &self,
        queue: &QueueName,
        start_after: Option<&EntryId>,
        page_size: usize,
    ) -> Result<Page<QuarantineEntry>> {
        let tables = self.tables()?;
        Ok(page_of(&tables.quarantine, queue, start_after, page_size, |_| true))
    }
}
