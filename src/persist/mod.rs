//! Durable storage for queued mutations.

/// SQLite implementation of [`QueueSink`].
pub mod sqlite;

use crate::{mutation::MutationRecord, types::MutationId};

/// Failures raised by a [`QueueSink`].
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    /// SQLite driver error.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Envelope encode/decode error.
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
    /// Anything else, e.g. an unsupported format version.
    #[error("{0}")]
    Message(String),
}

/// Result alias for persistence calls.
pub type PersistResult<T> = Result<T, PersistError>;

/// Write-through store for the mutation queue.
///
/// Every call must be durable when it returns.
pub trait QueueSink: Send {
    /// Inserts or replaces `record`, keyed by its id.
    fn upsert(&mut self, record: &MutationRecord) -> PersistResult<()>;
    /// Deletes the record with `id`; unknown ids are not an error.
    fn remove(&mut self, id: &MutationId) -> PersistResult<()>;
    /// Loads every stored record ordered by enqueue sequence.
    fn load_all(&self) -> PersistResult<Vec<MutationRecord>>;
    /// Pushes buffered state to stable storage.
    fn flush(&mut self) -> PersistResult<()> {
        Ok(())
    }
}
