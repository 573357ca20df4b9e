//! Core data model.
//!
//! A queue entry is one staged record waiting to be processed. Entries that
//! fail permanently move into quarantine with a reason. Records are the
//! aggregated business entities carried in an entry's payload.

pub mod entry;
pub mod record;

pub use entry::{EntryId, QuarantineEntry, QueueEntry, QueueName};
pub use record::{Aggregation, RawRow, Record};
