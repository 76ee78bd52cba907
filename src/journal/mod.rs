//! Durable ingest journal
//!
//! Records are appended under the buffer's current batch number and stay in
//! the journal until a commit cycle has handed them to the sink. Storage is
//! behind [`JournalStore`] so the engine can be swapped:
//!
//! - [`SqliteStore`]: rusqlite, WAL, survives crashes (production)
//! - [`MemoryStore`]: volatile, for tests and embedding
//!
//! Deletes only ever remove records strictly below a watermark; rows are
//! never edited in place.

pub mod buffer;
pub mod memory_store;
pub mod sqlite_store;

pub use buffer::IngestBuffer;
pub use memory_store::MemoryStore;
pub use sqlite_store::SqliteStore;

use crate::model::{Clock, EntityChange, Manifest};

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Corrupt journal row: {0}")]
    Corrupt(String),
    #[error("Journal lock poisoned by a panicked writer")]
    Poisoned,
}

/// A record as handed to the buffer, before it has a batch number
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    /// Destination table family the record is grouped under at commit
    pub source: String,
    pub change: EntityChange,
    pub clock: Clock,
    pub manifest: Manifest,
    pub cursor: String,
}

impl NewRecord {
    fn encode(self, batch_number: u64) -> Result<BufferedRecord, JournalError> {
        Ok(BufferedRecord {
            batch_number,
            source: self.source,
            payload: serde_json::to_string(&self.change)?,
            clock: self.clock,
            manifest: self.manifest,
            cursor: self.cursor,
        })
    }
}

/// A record as stored in the journal
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedRecord {
    pub batch_number: u64,
    pub source: String,
    /// Serialized [`EntityChange`]
    pub payload: String,
    pub clock: Clock,
    pub manifest: Manifest,
    pub cursor: String,
}

impl BufferedRecord {
    pub fn decode_change(&self) -> Result<EntityChange, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

/// Latest committed position of one module on one chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorCheckpoint {
    pub chain: String,
    pub module_hash: String,
    pub block_number: u64,
    pub cursor: String,
}

/// Storage engine behind [`IngestBuffer`]
///
/// Implementations need not be thread-safe; the buffer serialises access.
pub trait JournalStore: Send {
    /// Append records atomically: all of them or none
    fn append(&mut self, records: &[BufferedRecord]) -> Result<(), JournalError>;

    /// Highest batch number on disk, `None` when empty
    fn max_batch_number(&self) -> Result<Option<u64>, JournalError>;

    /// Every record with `batch_number <= boundary`, in append order
    fn select_through(&self, boundary: u64) -> Result<Vec<BufferedRecord>, JournalError>;

    /// Remove every record with `batch_number < watermark`
    fn delete_below(&mut self, watermark: u64) -> Result<usize, JournalError>;

    fn count(&self) -> Result<u64, JournalError>;

    /// Record committed cursors; a checkpoint never moves a cursor backwards
    fn save_cursors(&mut self, checkpoints: &[CursorCheckpoint]) -> Result<(), JournalError>;

    /// Commit point of a flushed cycle: delete below `watermark` and save
    /// `checkpoints` together. On error neither change is applied.
    fn commit_through(
        &mut self,
        watermark: u64,
        checkpoints: &[CursorCheckpoint],
    ) -> Result<usize, JournalError>;

    fn latest_cursor(&self, chain: &str, module_hash: &str)
        -> Result<Option<String>, JournalError>;

    /// Get store type for logging
    fn store_type(&self) -> &'static str;
}
