use crate::journal::{BufferedRecord, CursorCheckpoint, JournalError, JournalStore};
use std::collections::HashMap;

/// Volatile journal; everything is lost with the process
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Vec<BufferedRecord>,
    cursors: HashMap<(String, String), (u64, String)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JournalStore for MemoryStore {
    fn append(&mut self, records: &[BufferedRecord]) -> Result<(), JournalError> {
        self.records.extend_from_slice(records);
        Ok(())
    }

    fn max_batch_number(&self) -> Result<Option<u64>, JournalError> {
        Ok(self.records.iter().map(|r| r.batch_number).max())
    }

    fn select_through(&self, boundary: u64) -> Result<Vec<BufferedRecord>, JournalError> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.batch_number <= boundary)
            .cloned()
            .collect())
    }

    fn delete_below(&mut self, watermark: u64) -> Result<usize, JournalError> {
        let before = self.records.len();
        self.records.retain(|r| r.batch_number >= watermark);
        Ok(before - self.records.len())
    }

    fn count(&self) -> Result<u64, JournalError> {
        Ok(self.records.len() as u64)
    }

    fn save_cursors(&mut self, checkpoints: &[CursorCheckpoint]) -> Result<(), JournalError> {
        for checkpoint in checkpoints {
            let key = (checkpoint.chain.clone(), checkpoint.module_hash.clone());
            let entry = self
                .cursors
                .entry(key)
                .or_insert_with(|| (checkpoint.block_number, checkpoint.cursor.clone()));
            if checkpoint.block_number >= entry.0 {
                *entry = (checkpoint.block_number, checkpoint.cursor.clone());
            }
        }
        Ok(())
    }

    fn commit_through(
        &mut self,
        watermark: u64,
        checkpoints: &[CursorCheckpoint],
    ) -> Result<usize, JournalError> {
        self.save_cursors(checkpoints)?;
        self.delete_below(watermark)
    }

    fn latest_cursor(
        &self,
        chain: &str,
        module_hash: &str,
    ) -> Result<Option<String>, JournalError> {
        Ok(self
            .cursors
            .get(&(chain.to_string(), module_hash.to_string()))
            .map(|(_, cursor)| cursor.clone()))
    }

    fn store_type(&self) -> &'static str {
        "memory"
    }
}
