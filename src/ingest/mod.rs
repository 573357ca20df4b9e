//! Input batches: discovery, row reading, routing, and aggregation.

pub mod aggregate;
pub mod directory;

pub use aggregate::{Aggregator, ChildLayout, RowLayout};
pub use directory::DirectorySource;

use crate::error::Result;
use crate::model::RawRow;
use async_trait::async_trait;

/// A discovered input batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRef {
    /// Identifier recorded as provenance on every staged record.
    pub id: String,
}

impl BatchRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Where a batch goes once staging is done with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Every record was staged.
    Processed,
    /// The batch could not be read or a record could not be staged.
    Bad,
}

impl Disposition {
    pub fn as_str(self) -> &'static str {
        match self {
            Disposition::Processed => "processed",
            Disposition::Bad => "bad",
        }
    }
}

/// Supplier of raw input batches.
#[async_trait]
pub trait BatchSource: Send + Sync {
    /// Batches waiting to be staged, oldest first.
    async fn list_batches(&self) -> Result<Vec<BatchRef>>;

    /// Read and parse the rows of `batch`. An error means the batch is
    /// unusable and will be routed to [`Disposition::Bad`].
    async fn fetch_rows(&self, batch: &BatchRef) -> Result<Vec<RawRow>>;

    /// Move `batch` out of the way so it is not listed again.
    async fn route(&self, batch: &BatchRef, disposition: Disposition) -> Result<()>;
}
