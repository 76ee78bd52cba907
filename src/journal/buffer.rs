use crate::journal::{BufferedRecord, CursorCheckpoint, JournalError, JournalStore, NewRecord};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// The ingest buffer: a journal store plus the current batch number
///
/// One mutex owns both, so reading the counter and writing a record happen
/// together, and the committer's fence (read counter, advance it, select)
/// can never interleave with an append. The lock is only held for local
/// storage calls, never across an await.
pub struct IngestBuffer {
    state: Mutex<BufferState>,
}

struct BufferState {
    store: Box<dyn JournalStore>,
    /// Batch number assigned to the next append
    batch_number: u64,
}

impl IngestBuffer {
    /// Open the buffer over `store`, resuming numbering after whatever is on disk
    pub fn open(store: Box<dyn JournalStore>) -> Result<Self, JournalError> {
        let on_disk = store.max_batch_number()?;
        let pending = store.count()?;
        let batch_number = on_disk.unwrap_or(0) + 1;

        log::info!(
            "📒 Ingest buffer ready ({} store): {} pending records, next batch {}",
            store.store_type(),
            pending,
            batch_number
        );

        Ok(Self {
            state: Mutex::new(BufferState {
                store,
                batch_number,
            }),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, BufferState>, JournalError> {
        self.state.lock().map_err(|_| JournalError::Poisoned)
    }

    /// Append one record durably; returns the batch number it was given
    pub fn append(&self, record: NewRecord) -> Result<u64, JournalError> {
        self.append_batch(vec![record])
    }

    /// Append several records atomically under one batch number
    pub fn append_batch(&self, records: Vec<NewRecord>) -> Result<u64, JournalError> {
        let mut state = self.lock()?;
        let batch_number = state.batch_number;

        if records.is_empty() {
            return Ok(batch_number);
        }

        let encoded = records
            .into_iter()
            .map(|record| record.encode(batch_number))
            .collect::<Result<Vec<_>, _>>()?;
        state.store.append(&encoded)?;

        log::debug!("Buffered {} records in batch {}", encoded.len(), batch_number);
        Ok(batch_number)
    }

    /// Batch number the next append will receive
    pub fn current_batch_number(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .batch_number
    }

    pub fn pending_count(&self) -> Result<u64, JournalError> {
        self.lock()?.store.count()
    }

    pub fn latest_cursor(
        &self,
        chain: &str,
        module_hash: &str,
    ) -> Result<Option<String>, JournalError> {
        self.lock()?.store.latest_cursor(chain, module_hash)
    }

    /// Fence the current batch and select everything at or below it
    ///
    /// Appends from this point on are numbered `boundary + 1` or higher. The
    /// counter stays advanced even if the select fails.
    pub(crate) fn fence(&self) -> Result<(u64, Vec<BufferedRecord>), JournalError> {
        let mut state = self.lock()?;
        let boundary = state.batch_number;
        state.batch_number += 1;

        let records = state.store.select_through(boundary)?;
        Ok((boundary, records))
    }

    /// Drop everything at or below a flushed boundary and checkpoint cursors,
    /// as one store operation
    pub(crate) fn release(
        &self,
        boundary: u64,
        checkpoints: &[CursorCheckpoint],
    ) -> Result<usize, JournalError> {
        self.lock()?.store.commit_through(boundary + 1, checkpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::fixtures::{buffered, record};
    use crate::journal::MemoryStore;

    #[test]
    fn test_numbering_starts_at_one() {
        let buffer = IngestBuffer::open(Box::new(MemoryStore::new())).unwrap();
        assert_eq!(buffer.current_batch_number(), 1);
        assert_eq!(buffer.append(record("transfers", "a", 1)).unwrap(), 1);
        assert_eq!(buffer.pending_count().unwrap(), 1);
    }

    #[test]
    fn test_numbering_resumes_after_disk_max() {
        let mut store = MemoryStore::new();
        store
            .append(&[buffered(4, "transfers", "a", 1), buffered(9, "transfers", "b", 2)])
            .unwrap();

        let buffer = IngestBuffer::open(Box::new(store)).unwrap();
        assert_eq!(buffer.current_batch_number(), 10);
        assert_eq!(buffer.append(record("transfers", "c", 3)).unwrap(), 10);
    }

    #[test]
    fn test_fence_moves_new_appends_above_boundary() {
        let buffer = IngestBuffer::open(Box::new(MemoryStore::new())).unwrap();
        buffer.append(record("transfers", "a", 1)).unwrap();
        buffer.append(record("transfers", "b", 2)).unwrap();

        let (boundary, selected) = buffer.fence().unwrap();
        assert_eq!(boundary, 1);
        assert_eq!(selected.len(), 2);

        assert_eq!(buffer.append(record("transfers", "c", 3)).unwrap(), 2);

        // Only the fenced records go
        assert_eq!(buffer.release(boundary, &[]).unwrap(), 2);
        assert_eq!(buffer.pending_count().unwrap(), 1);
    }

    #[test]
    fn test_empty_batch_append_is_noop() {
        let buffer = IngestBuffer::open(Box::new(MemoryStore::new())).unwrap();
        assert_eq!(buffer.append_batch(Vec::new()).unwrap(), 1);
        assert_eq!(buffer.pending_count().unwrap(), 0);
    }
}
