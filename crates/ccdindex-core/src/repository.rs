//! Storage unit-of-work used by the batch importer and event reconciler.
//!
//! Every batch obtains its own [`Repository`] from a [`RepositoryFactory`].
//! Writes made through a repository stay invisible to other batches until
//! [`Repository::commit`] succeeds; dropping a repository without committing
//! discards them.

use async_trait::async_trait;

use crate::error::ImportError;
use crate::types::{
    CandidateEvent, CandidateRejection, ReadHeight, RowKind, StoredEvent, StoredRejection,
};

/// A scoped storage session over a single transaction.
#[async_trait]
pub trait Repository: Send {
    /// Highest height with a read marker, or `None` if nothing was imported yet.
    async fn latest_read_height(&mut self) -> Result<Option<u64>, ImportError>;

    /// Highest height the staging source has data for.
    async fn final_height(&mut self) -> Result<u64, ImportError>;

    /// Heights in `[from, to]` that already carry a read marker, ascending.
    async fn read_heights_in_range(&mut self, from: u64, to: u64)
        -> Result<Vec<u64>, ImportError>;

    /// Candidate transaction events with a height in `[from, to]`.
    async fn candidate_events(
        &mut self,
        from: u64,
        to: u64,
    ) -> Result<Vec<CandidateEvent>, ImportError>;

    /// Candidate rejected transactions with a height in `[from, to]`.
    async fn candidate_rejections(
        &mut self,
        from: u64,
        to: u64,
    ) -> Result<Vec<CandidateRejection>, ImportError>;

    /// Next unused ordinal for `kind` rows of the given transaction.
    ///
    /// Returns `0` when the transaction has no stored rows of that kind.
    async fn next_index(
        &mut self,
        kind: RowKind,
        block_height: u64,
        transaction_index: u32,
    ) -> Result<u32, ImportError>;

    async fn add_event(&mut self, event: StoredEvent) -> Result<(), ImportError>;

    async fn add_rejection(&mut self, rejection: StoredRejection) -> Result<(), ImportError>;

    async fn add_read_height(&mut self, marker: ReadHeight) -> Result<(), ImportError>;

    /// Make every write of this session visible atomically.
    async fn commit(self: Box<Self>) -> Result<(), ImportError>;
}

/// Opens independent repositories, one per unit of work.
#[async_trait]
pub trait RepositoryFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn Repository>, ImportError>;
}
