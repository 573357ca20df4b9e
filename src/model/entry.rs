//! Queue and quarantine entry types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Payload field that carries the originating batch of a staged record.
pub const ORIGIN_FIELD: &str = "source_batch";

/// Logical partition of the queue. One per workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueName(pub String);

impl QueueName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Derive the queue name for a tenant, e.g. `plac:ins:42`.
    pub fn for_tenant(prefix: &str, legal_entity_id: impl std::fmt::Display) -> Self {
        Self(format!("{prefix}:{legal_entity_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Natural key of a business record within its queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub String);

impl EntryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntryId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One unit of work in a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub queue_name: QueueName,
    pub id: EntryId,
    /// True once a worker owns the entry.
    pub claimed: bool,
    /// Set only while claimed.
    pub claimed_at: Option<DateTime<Utc>>,
    /// The record to process. Replaced wholesale on upsert.
    pub payload: serde_json::Value,
}

impl QueueEntry {
    /// A fresh, unclaimed entry.
    pub fn unclaimed(queue_name: QueueName, id: EntryId, payload: serde_json::Value) -> Self {
        Self {
            queue_name,
            id,
            claimed: false,
            claimed_at: None,
            payload,
        }
    }

    /// This entry as claimed at `at`.
    pub fn claimed_at(&self, at: DateTime<Utc>) -> Self {
        Self {
            claimed: true,
            claimed_at: Some(at),
            ..self.clone()
        }
    }

    /// Provenance recorded by the aggregator, if any.
    pub fn origin(&self) -> Option<String> {
        self.payload
            .get(ORIGIN_FIELD)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}

/// A queue entry that failed permanently, pending operator review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineEntry {
    pub queue_name: QueueName,
    pub id: EntryId,
    pub payload: serde_json::Value,
    pub reason: String,
    pub origin: Option<String>,
    pub quarantined_at: DateTime<Utc>,
}

impl QuarantineEntry {
    pub fn from_entry(entry: QueueEntry, reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        let origin = entry.origin();
        Self {
            queue_name: entry.queue_name,
            id: entry.id,
            payload: entry.payload,
            reason: reason.into(),
            origin,
            quarantined_at: at,
        }
    }
}
