//! Queue store semantics over the in-process backend.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use importq::clock::ManualClock;
use importq::error::{Error, Result};
use importq::model::{EntryId, QuarantineEntry, QueueEntry, QueueName};
use importq::store::{Backend, MemoryBackend, Page, QueueStore, Upsert, Write};
use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Wraps the in-process backend to interleave another writer's work.
#[derive(Default)]
struct Interleaved {
    inner: MemoryBackend,
    /// Upserted by a competing writer right after the next unclaimed scan.
    after_scan: Mutex<Option<(EntryId, serde_json::Value)>>,
    /// Plain deletes fail, as if the store dropped the connection.
    fail_delete: bool,
}

#[async_trait]
impl Backend for Interleaved {
    async fn upsert(&self, queue: &QueueName, id: &EntryId, payload: &serde_json::Value) -> Result<Write> {
        self.inner.upsert(queue, id, payload).await
    }

    async fn claim(&self, queue: &QueueName, id: &EntryId, at: DateTime<Utc>) -> Result<Option<QueueEntry>> {
        self.inner.claim(queue, id, at).await
    }

    async fn release(&self, queue: &QueueName, id: &EntryId, claimed_at: DateTime<Utc>) -> Result<()> {
        self.inner.release(queue, id, claimed_at).await
    }

    async fn delete(&self, queue: &QueueName, id: &EntryId) -> Result<()> {
        if self.fail_delete {
            return Err(Error::Backend("connection reset".into()));
        }
        self.inner.delete(queue, id).await
    }

    async fn query(
        &self,
        queue: &QueueName,
        claimed: bool,
        start_after: Option<&EntryId>,
        page_size: usize,
    ) -> Result<Page<QueueEntry>> {
        let page = self.inner.query(queue, claimed, start_after, page_size).await?;
        let pending = self.after_scan.lock().unwrap().take();
        if let Some((id, payload)) = pending.filter(|_| !claimed) {
            self.inner.upsert(queue, &id, &payload).await?;
        }
        Ok(page)
    }

    async fn move_to_quarantine(
        &self,
        queue: &QueueName,
        id: &EntryId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<QuarantineEntry>> {
        self.inner.move_to_quarantine(queue, id, reason, at).await
    }

    async fn move_from_quarantine(&self, queue: &QueueName, id: &EntryId) -> Result<bool> {
        self.inner.move_from_quarantine(queue, id).await
    }

    async fn delete_quarantined(&self, queue: &QueueName, id: &EntryId) -> Result<()> {
        self.inner.delete_quarantined(queue, id).await
    }

    async fn query_quarantined(
        &self,
        queue: &QueueName,
        start_after: Option<&EntryId>,
        page_size: usize,
    ) -> Result<Page<QuarantineEntry>> {
        self.inner.query_quarantined(queue, start_after, page_size).await
    }
}

fn store_with(backend: Arc<MemoryBackend>) -> QueueStore {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()));
    QueueStore::new(backend, clock)
}

fn queue() -> QueueName {
    QueueName::for_tenant("plac:ins", 42)
}

#[tokio::test]
async fn upsert_then_list_unclaimed() {
    let store = QueueStore::in_memory();
    let q = queue();

    store.upsert(&q, &"a".into(), json!({"n": 1})).await.unwrap();
    store.upsert(&q, &"b".into(), json!({"n": 2})).await.unwrap();

    let entries = store.list_unclaimed(&q, 10).await.unwrap();
    let ids: Vec<_> = entries.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, ["a", "b"]);
    assert!(entries.iter().all(|e| !e.claimed && e.claimed_at.is_none()));
}

#[tokio::test]
async fn upsert_replaces_unclaimed_payload() {
    let store = QueueStore::in_memory();
    let q = queue();
    let id = EntryId::new("a");

    store.upsert(&q, &id, json!({"v": "old"})).await.unwrap();
    store.upsert(&q, &id, json!({"v": "new"})).await.unwrap();

    let entries = store.list_unclaimed(&q, 10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].payload, json!({"v": "new"}));
}

#[tokio::test]
async fn upsert_leaves_claimed_entry_alone() {
    let store = QueueStore::in_memory();
    let q = queue();
    let id = EntryId::new("a");

    store.upsert(&q, &id, json!({"v": "old"})).await.unwrap();
    let claimed = store.claim_batch(&q, 10).await.unwrap();
    assert_eq!(claimed.len(), 1);

    let result = store.upsert(&q, &id, json!({"v": "new"})).await.unwrap();
    assert_eq!(result, Upsert::SkippedClaimed);

    let still_claimed = store.list_claimed(&q, 10).await.unwrap();
    assert_eq!(still_claimed.len(), 1);
    assert_eq!(still_claimed[0].payload, json!({"v": "old"}));
    assert!(store.list_unclaimed(&q, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn each_entry_listed_once_across_pages() {
    let store = QueueStore::in_memory().with_page_size(2);
    let q = queue();

    for i in 0..7 {
        store
            .upsert(&q, &EntryId::new(format!("e{i}")), json!({}))
            .await
            .unwrap();
    }
    // Claimed entries sit between unclaimed ones and produce sparse pages.
    store.claim_batch(&q, 3).await.unwrap();

    let unclaimed = store.list_unclaimed(&q, 100).await.unwrap();
    let ids: HashSet<_> = unclaimed.iter().map(|e| e.id.clone()).collect();
    assert_eq!(unclaimed.len(), 4);
    assert_eq!(ids.len(), 4);

    let claimed = store.list_claimed(&q, 100).await.unwrap();
    assert_eq!(claimed.len(), 3);
}

#[tokio::test]
async fn list_respects_limit() {
    let store = QueueStore::in_memory().with_page_size(3);
    let q = queue();
    for i in 0..10 {
        store
            .upsert(&q, &EntryId::new(format!("e{i:02}")), json!({}))
            .await
            .unwrap();
    }
    assert_eq!(store.list_unclaimed(&q, 4).await.unwrap().len(), 4);
}

#[tokio::test]
async fn queues_are_isolated() {
    let store = QueueStore::in_memory();
    let a = QueueName::for_tenant("plac:ins", 1);
    let b = QueueName::for_tenant("plac:ins", 2);

    store.upsert(&a, &"x".into(), json!({})).await.unwrap();

    assert!(store.list_unclaimed(&b, 10).await.unwrap().is_empty());
    assert!(store.claim_batch(&b, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_claims_are_exclusive() {
    let store = QueueStore::in_memory().with_page_size(5);
    let q = queue();
    for i in 0..50 {
        store
            .upsert(&q, &EntryId::new(format!("e{i:02}")), json!({}))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let q = q.clone();
        handles.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            loop {
                let batch = store.claim_batch(&q, 4).await.unwrap();
                if batch.is_empty() && store.list_unclaimed(&q, 1).await.unwrap().is_empty() {
                    break;
                }
                mine.extend(batch.into_iter().map(|e| e.id));
            }
            mine
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let unique: HashSet<_> = all.iter().cloned().collect();
    assert_eq!(all.len(), 50);
    assert_eq!(unique.len(), 50);
}

#[tokio::test]
async fn claim_stamps_clock_time() {
    let backend = Arc::new(MemoryBackend::new());
    let store = store_with(backend);
    let q = queue();
    store.upsert(&q, &"a".into(), json!({})).await.unwrap();

    let claimed = store.claim_batch(&q, 1).await.unwrap();
    assert_eq!(
        claimed[0].claimed_at,
        Some(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap())
    );
}

#[tokio::test]
async fn quarantine_moves_entry_and_keeps_origin() {
    let store = QueueStore::in_memory();
    let q = queue();
    let id = EntryId::new("a");

    store
        .upsert(&q, &id, json!({"source_batch": "day1.csv", "key": "a"}))
        .await
        .unwrap();
    store.claim_batch(&q, 1).await.unwrap();

    assert!(store.quarantine(&q, &id, "no match").await.unwrap());

    assert!(store.list_claimed(&q, 10).await.unwrap().is_empty());
    let quarantined = store.list_quarantined(&q, 10).await.unwrap();
    assert_eq!(quarantined.len(), 1);
    assert_eq!(quarantined[0].reason, "no match");
    assert_eq!(quarantined[0].origin.as_deref(), Some("day1.csv"));
}

#[tokio::test]
async fn repeated_quarantine_does_not_duplicate() {
    let store = QueueStore::in_memory();
    let q = queue();
    let id = EntryId::new("a");

    store.upsert(&q, &id, json!({})).await.unwrap();
    assert!(store.quarantine(&q, &id, "first").await.unwrap());
    assert!(!store.quarantine(&q, &id, "second").await.unwrap());

    store.upsert(&q, &id, json!({})).await.unwrap();
    assert!(store.quarantine(&q, &id, "third").await.unwrap());

    let quarantined = store.list_quarantined(&q, 10).await.unwrap();
    assert_eq!(quarantined.len(), 1);
    assert_eq!(quarantined[0].reason, "third");
}

#[tokio::test]
async fn delete_quarantined_ignores_unknown_ids() {
    let store = QueueStore::in_memory();
    let q = queue();
    store.upsert(&q, &"a".into(), json!({})).await.unwrap();
    store.quarantine(&q, &"a".into(), "bad").await.unwrap();

    store
        .delete_quarantined(&q, &[EntryId::new("a"), EntryId::new("missing")])
        .await
        .unwrap();
    assert!(store.list_quarantined(&q, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn requeue_restores_unclaimed_entry() {
    let store = QueueStore::in_memory();
    let q = queue();
    let id = EntryId::new("a");

    store.upsert(&q, &id, json!({"k": 1})).await.unwrap();
    store.quarantine(&q, &id, "bad").await.unwrap();

    assert!(store.requeue_quarantined(&q, &id).await.unwrap());
    assert!(store.list_quarantined(&q, 10).await.unwrap().is_empty());

    let entries = store.list_unclaimed(&q, 10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].payload, json!({"k": 1}));

    assert!(!store.requeue_quarantined(&q, &"missing".into()).await.unwrap());
}

#[tokio::test]
async fn unavailable_backend_errors_propagate() {
    let backend = Arc::new(MemoryBackend::new());
    let store = store_with(Arc::clone(&backend));
    let q = queue();

    backend.set_unavailable(true);
    assert!(store.upsert(&q, &"a".into(), json!({})).await.is_err());
    assert!(store.claim_batch(&q, 1).await.is_err());
    assert!(store.list_quarantined(&q, 1).await.is_err());

    backend.set_unavailable(false);
    assert!(store.upsert(&q, &"a".into(), json!({})).await.is_ok());
}

#[tokio::test]
async fn claim_keeps_payload_written_after_scan() {
    let q = queue();
    let id = EntryId::new("a");
    let backend = Arc::new(Interleaved::default());
    let store = QueueStore::new(backend.clone(), Arc::new(ManualClock::new(Utc::now())));

    store.upsert(&q, &id, json!({"v": 1})).await.unwrap();
    *backend.after_scan.lock().unwrap() = Some((id.clone(), json!({"v": 2})));

    let claimed = store.claim_batch(&q, 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].payload, json!({"v": 2}));

    let stored = store.list_claimed(&q, 10).await.unwrap();
    assert_eq!(stored[0].payload, json!({"v": 2}));
}

#[tokio::test]
async fn release_returns_claimed_entries_to_queue() {
    let store = QueueStore::in_memory();
    let q = queue();
    store.upsert(&q, &"a".into(), json!({"k": 1})).await.unwrap();
    store.upsert(&q, &"b".into(), json!({"k": 2})).await.unwrap();
    let claimed = store.claim_batch(&q, 10).await.unwrap();

    store.release(&q, &claimed[..1]).await.unwrap();

    let unclaimed = store.list_unclaimed(&q, 10).await.unwrap();
    assert_eq!(unclaimed.len(), 1);
    assert_eq!(unclaimed[0].id.as_str(), "a");
    assert_eq!(unclaimed[0].claimed_at, None);
    assert_eq!(unclaimed[0].payload, json!({"k": 1}));
    assert_eq!(store.list_claimed(&q, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn quarantine_does_not_depend_on_plain_delete() {
    let q = queue();
    let id = EntryId::new("a");
    let backend = Arc::new(Interleaved {
        fail_delete: true,
        ..Default::default()
    });
    let store = QueueStore::new(backend, Arc::new(ManualClock::new(Utc::now())));

    store.upsert(&q, &id, json!({})).await.unwrap();
    store.claim_batch(&q, 1).await.unwrap();

    assert!(store.quarantine(&q, &id, "no match").await.unwrap());
    assert!(store.list_claimed(&q, 10).await.unwrap().is_empty());
    assert_eq!(store.list_quarantined(&q, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn failed_quarantine_leaves_entry_live() {
    let backend = Arc::new(MemoryBackend::new());
    let store = store_with(Arc::clone(&backend));
    let q = queue();
    let id = EntryId::new("a");

    store.upsert(&q, &id, json!({})).await.unwrap();
    store.claim_batch(&q, 1).await.unwrap();

    backend.set_unavailable(true);
    assert!(store.quarantine(&q, &id, "no match").await.is_err());
    backend.set_unavailable(false);

    assert_eq!(store.list_claimed(&q, 10).await.unwrap().len(), 1);
    assert!(store.list_quarantined(&q, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn requeue_keeps_quarantine_entry_while_live_entry_is_claimed() {
    let store = QueueStore::in_memory();
    let q = queue();
    let id = EntryId::new("a");

    store.upsert(&q, &id, json!({"v": "bad"})).await.unwrap();
    store.quarantine(&q, &id, "bad").await.unwrap();
    store.upsert(&q, &id, json!({"v": "fresh"})).await.unwrap();
    store.claim_batch(&q, 1).await.unwrap();

    assert!(!store.requeue_quarantined(&q, &id).await.unwrap());
    assert_eq!(store.list_quarantined(&q, 10).await.unwrap().len(), 1);
    let claimed = store.list_claimed(&q, 10).await.unwrap();
    assert_eq!(claimed[0].payload, json!({"v": "fresh"}));
}

#[tokio::test]
async fn stale_release_leaves_newer_claim_alone() {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()));
    let store = QueueStore::new(Arc::new(MemoryBackend::new()), clock.clone());
    let q = queue();
    store.upsert(&q, &"a".into(), json!({})).await.unwrap();

    let first = store.claim_batch(&q, 1).await.unwrap();
    store.release(&q, &first).await.unwrap();
    clock.advance(chrono::Duration::seconds(5));
    let second = store.claim_batch(&q, 1).await.unwrap();

    store.release(&q, &first).await.unwrap();
    let claimed = store.list_claimed(&q, 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].claimed_at, second[0].claimed_at);
}
