//! Queue backend over Postgres.
//!
//! Single-entry transitions are single statements guarded on `claimed`, so
//! the row lock taken by Postgres decides claim races. Moves between the live
//! and quarantine tables run in one transaction. Paging is keyset paging on
//! `id` within a queue.

use super::Db;
use crate::error::Result;
use crate::model::{EntryId, QuarantineEntry, QueueEntry, QueueName};
use crate::store::{Backend, Page, Write};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

const UPSERT_UNCLAIMED: &str = "INSERT INTO queue_entries (queue_name, id, claimed, claimed_at, payload, updated_at)
     VALUES ($1, $2, false, NULL, $3, now())
     ON CONFLICT (queue_name, id) DO UPDATE
     SET payload = EXCLUDED.payload, updated_at = now()
     WHERE queue_entries.claimed = false";

const INSERT_QUARANTINED: &str = "INSERT INTO quarantine_entries (queue_name, id, payload, reason, origin, quarantined_at)
     VALUES ($1, $2, $3, $4, $5, $6)
     ON CONFLICT (queue_name, id) DO UPDATE
     SET payload = EXCLUDED.payload, reason = EXCLUDED.reason,
         origin = EXCLUDED.origin, quarantined_at = EXCLUDED.quarantined_at";

#[async_trait]
impl Backend for Db {
    async fn upsert(
        &self,
        queue: &QueueName,
        id: &EntryId,
        payload: &serde_json::Value,
    ) -> Result<Write> {
        let rows_affected = sqlx::query(UPSERT_UNCLAIMED)
            .bind(queue.as_str())
            .bind(id.as_str())
            .bind(payload)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(if rows_affected == 0 {
            Write::ConditionFailed
        } else {
            Write::Applied
        })
    }

    async fn claim(
        &self,
        queue: &QueueName,
        id: &EntryId,
        at: DateTime<Utc>,
    ) -> Result<Option<QueueEntry>> {
        let row: Option<QueueEntryRow> = sqlx::query_as(
            "UPDATE queue_entries
             SET claimed = true, claimed_at = $3, updated_at = now()
             WHERE queue_name = $1 AND id = $2 AND claimed = false
             RETURNING queue_name, id, claimed, claimed_at, payload",
        )
        .bind(queue.as_str())
        .bind(id.as_str())
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(QueueEntry::from))
    }

    async fn release(
        &self,
        queue: &QueueName,
        id: &EntryId,
        claimed_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE queue_entries
             SET claimed = false, claimed_at = NULL, updated_at = now()
             WHERE queue_name = $1 AND id = $2 AND claimed = true AND claimed_at = $3",
        )
        .bind(queue.as_str())
        .bind(id.as_str())
        .bind(claimed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, queue: &QueueName, id: &EntryId) -> Result<()> {
        sqlx::query("DELETE FROM queue_entries WHERE queue_name = $1 AND id = $2")
            .bind(queue.as_str())
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn query(
        &self,
        queue: &QueueName,
        claimed: bool,
        start_after: Option<&EntryId>,
        page_size: usize,
    ) -> Result<Page<QueueEntry>> {
        let rows: Vec<QueueEntryRow> = sqlx::query_as(
            "SELECT queue_name, id, claimed, claimed_at, payload
             FROM queue_entries
             WHERE queue_name = $1 AND claimed = $2
             AND ($3::text IS NULL OR id > $3)
             ORDER BY id
             LIMIT $4",
        )
        .bind(queue.as_str())
        .bind(claimed)
        .bind(start_after.map(EntryId::as_str))
        .bind(page_size as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(into_page(rows, page_size, |row| &row.id))
    }

    async fn move_to_quarantine(
        &self,
        queue: &QueueName,
        id: &EntryId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<QuarantineEntry>> {
        let mut tx = self.pool.begin().await?;

        let row: Option<QueueEntryRow> = sqlx::query_as(
            "DELETE FROM queue_entries WHERE queue_name = $1 AND id = $2
             RETURNING queue_name, id, claimed, claimed_at, payload",
        )
        .bind(queue.as_str())
        .bind(id.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        let entry = QuarantineEntry::from_entry(QueueEntry::from(row), reason, at);
        sqlx::query(INSERT_QUARANTINED)
            .bind(entry.queue_name.as_str())
            .bind(entry.id.as_str())
            .bind(&entry.payload)
            .bind(&entry.reason)
            .bind(entry.origin.as_deref())
            .bind(entry.quarantined_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(entry))
    }

    async fn move_from_quarantine(&self, queue: &QueueName, id: &EntryId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let row: Option<QuarantineEntryRow> = sqlx::query_as(
            "SELECT queue_name, id, payload, reason, origin, quarantined_at
             FROM quarantine_entries WHERE queue_name = $1 AND id = $2
             FOR UPDATE",
        )
        .bind(queue.as_str())
        .bind(id.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(false);
        };

        let written = sqlx::query(UPSERT_UNCLAIMED)
            .bind(queue.as_str())
            .bind(id.as_str())
            .bind(&row.payload)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if written == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM quarantine_entries WHERE queue_name = $1 AND id = $2")
            .bind(queue.as_str())
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn delete_quarantined(&self, queue: &QueueName, id: &EntryId) -> Result<()> {
        sqlx::query("DELETE FROM quarantine_entries WHERE queue_name = $1 AND id = $2")
            .bind(queue.as_str())
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn query_quarantined(
        &self,
        queue: &QueueName,
        start_after: Option<&EntryId>,
        page_size: usize,
    ) -> Result<Page<QuarantineEntry>> {
        let rows: Vec<QuarantineEntryRow> = sqlx::query_as(
            "SELECT queue_name, id, payload, reason, origin, quarantined_at
             FROM quarantine_entries
             WHERE queue_name = $1
             AND ($2::text IS NULL OR id > $2)
             ORDER BY id
             LIMIT $3",
        )
        .bind(queue.as_str())
        .bind(start_after.map(EntryId::as_str))
        .bind(page_size as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(into_page(rows, page_size, |row| &row.id))
    }
}

/// Build a page from a full result set. A short page means the partition is
/// exhausted.
fn into_page<R, T>(rows: Vec<R>, page_size: usize, key: impl Fn(&R) -> &String) -> Page<T>
where
    T: From<R>,
{
    let scanned = rows.len();
    let last_key = if scanned == page_size {
        rows.last().map(|row| EntryId::new(key(row).clone()))
    } else {
        None
    };
    Page {
        items: rows.into_iter().map(T::from).collect(),
        scanned,
        last_key,
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct QueueEntryRow {
    queue_name: String,
    id: String,
    claimed: bool,
    claimed_at: Option<DateTime<Utc>>,
    payload: serde_json::Value,
}

impl From<QueueEntryRow> for QueueEntry {
    fn from(row: QueueEntryRow) -> Self {
        Self {
            queue_name: QueueName(row.queue_name),
            id: EntryId(row.id),
            claimed: row.claimed,
            claimed_at: row.claimed_at,
            payload: row.payload,
        }
    }
}

#[derive(sqlx::FromRow)]
struct QuarantineEntryRow {
    queue_name: String,
    id: String,
    payload: serde_json::Value,
    reason: String,
    origin: Option<String>,
    quarantined_at: DateTime<Utc>,
}

impl From<QuarantineEntryRow> for QuarantineEntry {
    fn from(row: QuarantineEntryRow) -> Self {
        Self {
            queue_name: QueueName(row.queue_name),
            id: EntryId(row.id),
            payload: row.payload,
            reason: row.reason,
            origin: row.origin,
            quarantined_at: row.quarantined_at,
        }
    }
}
