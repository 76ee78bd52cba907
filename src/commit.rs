//! Batch committer: fence, drain, flush, delete
//!
//! ## Cycle
//!
//! ```text
//! Idle ──commit()──▶ Committing
//!   1. fence: boundary = current batch, appends move to boundary + 1
//!   2. select batch_number <= boundary, group by source, flatten
//!   3. on_flush(groups)
//!   4. ok  → delete batch_number <= boundary, checkpoint cursors
//!      err → keep everything, return the error
//! Committing ──done──▶ Idle
//! ```
//!
//! The boundary is never rolled back. After a failed cycle the next one fences
//! a higher boundary and picks the same records up again together with
//! anything appended since. Delivery is therefore at-least-once: a group that
//! reached the sink before another group failed is sent again on retry.
//!
//! A `commit()` arriving while a cycle is in flight returns
//! [`CommitOutcome::Skipped`] instead of queueing.

use crate::flatten::{flatten, Row, Scalar};
use crate::journal::{BufferedRecord, CursorCheckpoint, IngestBuffer, JournalError};
use crate::sink::SinkError;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Rows of one commit cycle, grouped by destination table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushBatch {
    pub boundary: u64,
    pub groups: BTreeMap<String, Vec<Row>>,
}

impl FlushBatch {
    pub fn row_count(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Another cycle was already running
    Skipped,
    /// Fenced, nothing pending
    Empty { boundary: u64 },
    Committed {
        boundary: u64,
        records: usize,
        tables: usize,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),
    #[error("Record in batch {batch_number} has an undecodable payload: {source}")]
    Decode {
        batch_number: u64,
        #[source]
        source: serde_json::Error,
    },
    #[error("Flush failed: {0}")]
    Flush(#[from] SinkError),
}

pub struct BatchCommitter {
    buffer: Arc<IngestBuffer>,
    committing: AtomicBool,
}

impl BatchCommitter {
    pub fn new(buffer: Arc<IngestBuffer>) -> Self {
        Self {
            buffer,
            committing: AtomicBool::new(false),
        }
    }

    pub fn buffer(&self) -> &Arc<IngestBuffer> {
        &self.buffer
    }

    pub fn is_committing(&self) -> bool {
        self.committing.load(Ordering::Acquire)
    }

    /// Run one commit cycle, handing the fenced rows to `on_flush`
    ///
    /// Records are deleted only after `on_flush` returns `Ok`. On error every
    /// selected record stays in the journal and the error is returned.
    pub async fn commit<F, Fut>(&self, on_flush: F) -> Result<CommitOutcome, CommitError>
    where
        F: FnOnce(FlushBatch) -> Fut,
        Fut: Future<Output = Result<(), SinkError>>,
    {
        let Some(_guard) = CommitGuard::acquire(&self.committing) else {
            log::debug!("Commit already in flight, trigger coalesced");
            return Ok(CommitOutcome::Skipped);
        };

        let (boundary, records) = self.buffer.fence()?;
        if records.is_empty() {
            log::debug!("Nothing to commit at boundary {}", boundary);
            return Ok(CommitOutcome::Empty { boundary });
        }

        let record_count = records.len();
        let (batch, checkpoints) = build_flush_batch(boundary, &records)?;
        drop(records);
        let tables = batch.groups.len();

        log::debug!(
            "Flushing {} records across {} tables (boundary {})",
            record_count,
            tables,
            boundary
        );

        if let Err(e) = on_flush(batch).await {
            log::warn!(
                "⚠️  Flush of boundary {} failed, {} records retained for the next cycle: {}",
                boundary,
                record_count,
                e
            );
            return Err(CommitError::Flush(e));
        }

        let deleted = self.buffer.release(boundary, &checkpoints)?;
        if deleted != record_count {
            log::warn!(
                "⚠️  Selected {} records but deleted {} at boundary {}",
                record_count,
                deleted,
                boundary
            );
        }

        Ok(CommitOutcome::Committed {
            boundary,
            records: record_count,
            tables,
        })
    }
}

/// Holds the Committing state; releases it on drop, including when the
/// cycle's future is cancelled mid-flush
struct CommitGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> CommitGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for CommitGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Flatten fenced records into per-table rows and collect the newest cursor
/// of every (chain, module hash)
fn build_flush_batch(
    boundary: u64,
    records: &[BufferedRecord],
) -> Result<(FlushBatch, Vec<CursorCheckpoint>), CommitError> {
    let mut groups: BTreeMap<String, Vec<Row>> = BTreeMap::new();
    let mut latest: HashMap<(&str, &str), (u64, &str)> = HashMap::new();

    for record in records {
        let change = record.decode_change().map_err(|source| CommitError::Decode {
            batch_number: record.batch_number,
            source,
        })?;

        let mut row = flatten(&change.fields);
        row.insert("block_id".to_string(), Scalar::from(record.clock.block_id.as_str()));
        row.insert(
            "block_number".to_string(),
            Scalar::UInt(record.clock.block_number),
        );
        row.insert("chain".to_string(), Scalar::from(record.manifest.chain.as_str()));
        row.insert(
            "module_hash".to_string(),
            Scalar::from(record.manifest.module_hash.as_str()),
        );
        row.insert(
            "timestamp".to_string(),
            Scalar::Int(record.clock.timestamp.timestamp()),
        );
        row.insert(
            "operation".to_string(),
            Scalar::from(change.operation.as_str()),
        );
        row.insert("id".to_string(), Scalar::Text(change.id));

        groups.entry(record.source.clone()).or_default().push(row);

        let key = (
            record.manifest.chain.as_str(),
            record.manifest.module_hash.as_str(),
        );
        let candidate = (record.clock.block_number, record.cursor.as_str());
        latest
            .entry(key)
            .and_modify(|current| {
                if candidate.0 >= current.0 {
                    *current = candidate;
                }
            })
            .or_insert(candidate);
    }

    let checkpoints = latest
        .into_iter()
        .map(|((chain, module_hash), (block_number, cursor))| CursorCheckpoint {
            chain: chain.to_string(),
            module_hash: module_hash.to_string(),
            block_number,
            cursor: cursor.to_string(),
        })
        .collect();

    Ok((FlushBatch { boundary, groups }, checkpoints))
}
