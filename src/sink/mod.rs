//! External sink contract and the standard flush routine
//!
//! A sink accepts rows for one table per call and either applies all of them
//! or fails cleanly. [`flush_to_sink`] is the `on_flush` callback the commit
//! loop passes to [`BatchCommitter::commit`](crate::commit::BatchCommitter::commit).

pub mod clickhouse;

pub use clickhouse::ClickhouseSink;

use crate::commit::FlushBatch;
use crate::flatten::Row;
use async_trait::async_trait;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Table {0} is not provisioned in the sink")]
    UnknownTable(String),
    #[error("Sink rejected insert into {table} (status {status}): {message}")]
    Rejected {
        table: String,
        status: u16,
        message: String,
    },
    #[error("Insert into {table} timed out after {elapsed:?}")]
    Timeout { table: String, elapsed: Duration },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("{} of {total} table groups failed: {}", .failed.len(), .failed.join(", "))]
    GroupsFailed { failed: Vec<String>, total: usize },
}

#[async_trait]
pub trait Sink: Send + Sync {
    /// Insert rows into one table, all or nothing
    async fn insert(&self, table: &str, rows: &[Row]) -> Result<(), SinkError>;

    /// Get sink type for logging
    fn sink_type(&self) -> &'static str;
}

/// Hand every table group of a batch to the sink
///
/// Each insert is bounded by `timeout`. A failing group (rejected, timed out,
/// unknown table) is logged and the remaining groups still run; if any group
/// failed the whole flush fails so the committer keeps every record.
pub async fn flush_to_sink(
    sink: &dyn Sink,
    batch: FlushBatch,
    timeout: Duration,
) -> Result<(), SinkError> {
    let total = batch.groups.len();
    let mut failed = Vec::new();

    for (table, rows) in &batch.groups {
        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, sink.insert(table, rows)).await {
            Ok(result) => result,
            Err(_) => Err(SinkError::Timeout {
                table: table.clone(),
                elapsed: started.elapsed(),
            }),
        };

        match result {
            Ok(()) => {
                log::debug!(
                    "✅ Inserted {} rows into {} ({}ms)",
                    rows.len(),
                    table,
                    started.elapsed().as_millis()
                );
            }
            Err(SinkError::UnknownTable(_)) => {
                log::error!(
                    "❌ Table {} is not provisioned, {} rows stay buffered",
                    table,
                    rows.len()
                );
                failed.push(table.clone());
            }
            Err(e) => {
                log::error!("❌ Failed to insert {} rows into {}: {}", rows.len(), table, e);
                failed.push(table.clone());
            }
        }
    }

    if failed.is_empty() {
        Ok(())
    } else {
        Err(SinkError::GroupsFailed { failed, total })
    }
}
