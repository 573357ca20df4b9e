//! Row aggregation.
//!
//! Merges the flat rows of a batch into one [`Record`] per entity key.
//! Primary rows fill the record's top-level fields; child rows land in a
//! named sub-collection keyed by a secondary column. In both cases a
//! non-empty value overwrites and an empty one never does, so the last
//! non-empty value for a field wins. Values are trimmed first.

use crate::model::record::Fields;
use crate::model::{Aggregation, RawRow, Record};
use serde::Deserialize;
use tracing::{debug, warn};

/// How to read a batch's rows.
#[derive(Debug, Clone, Deserialize)]
pub struct RowLayout {
    /// Column holding the row kind discriminator.
    pub row_kind_column: String,
    /// Column holding the entity key.
    pub entity_key_column: String,
    /// Kind value of rows that carry the entity's own fields.
    pub primary_kind: String,
    #[serde(default)]
    pub children: Vec<ChildLayout>,
}

/// A row kind that attaches to its entity as a keyed sub-record.
#[derive(Debug, Clone, Deserialize)]
pub struct ChildLayout {
    pub kind: String,
    /// Name of the sub-collection on the record, e.g. `rate_lines`.
    pub collection: String,
    /// Column whose value keys the child within its collection.
    pub key_column: String,
}

impl RowLayout {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.children.iter().any(|c| c.kind == self.primary_kind) {
            return Err(format!(
                "row kind {:?} is both primary and child",
                self.primary_kind
            ));
        }
        for (i, child) in self.children.iter().enumerate() {
            if self.children[..i].iter().any(|c| c.kind == child.kind) {
                return Err(format!("row kind {:?} declared twice", child.kind));
            }
        }
        Ok(())
    }
}

enum RowKind<'a> {
    Primary,
    Child(&'a ChildLayout),
}

#[derive(Debug, Clone)]
pub struct Aggregator {
    layout: RowLayout,
}

impl Aggregator {
    pub fn new(layout: RowLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &RowLayout {
        &self.layout
    }

    /// Aggregate `rows` from batch `batch_id`.
    pub fn aggregate<I>(&self, batch_id: &str, rows: I) -> Aggregation
    where
        I: IntoIterator<Item = RawRow>,
    {
        let mut out = Aggregation::default();

        for (line, row) in rows.into_iter().enumerate() {
            let kind = value_of(&row, &self.layout.row_kind_column);
            let Some(kind) = self.kind_of(kind) else {
                debug!(batch = batch_id, line, kind, "skipping row of unknown kind");
                out.skipped += 1;
                continue;
            };

            let key = value_of(&row, &self.layout.entity_key_column);
            if key.is_empty() {
                warn!(batch = batch_id, line, "skipping row without entity key");
                out.skipped += 1;
                continue;
            }

            let record = out
                .records
                .entry(key.to_string())
                .or_insert_with(|| Record::new(key, batch_id));

            match kind {
                RowKind::Primary => merge_fields(&mut record.fields, &row),
                RowKind::Child(child) => {
                    let child_key = value_of(&row, &child.key_column).to_string();
                    let fields = record
                        .children
                        .entry(child.collection.clone())
                        .or_default()
                        .entry(child_key)
                        .or_default();
                    merge_fields(fields, &row);
                }
            }
        }

        out
    }

    fn kind_of(&self, kind: &str) -> Option<RowKind<'_>> {
        if kind == self.layout.primary_kind {
            return Some(RowKind::Primary);
        }
        self.layout
            .children
            .iter()
            .find(|c| c.kind == kind)
            .map(RowKind::Child)
    }
}

/// Trimmed value of `column`, empty if missing.
fn value_of<'a>(row: &'a RawRow, column: &str) -> &'a str {
    row.get(column).map(|v| v.trim()).unwrap_or("")
}

fn merge_fields(into: &mut Fields, row: &RawRow) {
    for (column, value) in row {
        let value = value.trim();
        if !value.is_empty() {
            into.insert(column.clone(), value.to_string());
        }
    }
}
