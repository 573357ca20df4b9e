//! Raw input rows and aggregated records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One row from an input batch: column name to raw string value.
pub type RawRow = BTreeMap<String, String>;

/// Flat field map of an aggregated record or child.
pub type Fields = BTreeMap<String, String>;

/// A business entity merged from one or more raw rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Entity key shared by every row that contributed to this record.
    pub key: String,
    /// Top-level fields from primary rows.
    pub fields: Fields,
    /// Named sub-collections, each keyed by the child row's secondary key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, BTreeMap<String, Fields>>,
    /// Batch this record was read from.
    pub source_batch: String,
}

impl Record {
    pub fn new(key: impl Into<String>, source_batch: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            source_batch: source_batch.into(),
            ..Default::default()
        }
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Children under `collection`, if any were seen.
    pub fn collection(&self, collection: &str) -> Option<&BTreeMap<String, Fields>> {
        self.children.get(collection)
    }

    pub fn to_payload(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }

    pub fn from_payload(payload: &serde_json::Value) -> serde_json::Result<Self> {
        Self::deserialize(payload)
    }
}

/// Result of aggregating one batch.
#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    pub records: BTreeMap<String, Record>,
    /// Rows dropped for an unknown kind or a missing entity key.
    pub skipped: usize,
}
