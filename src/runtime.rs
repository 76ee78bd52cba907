//! Periodic commit loop
//!
//! Drives [`BatchCommitter`] from a tokio interval and runs one last cycle on
//! shutdown so a clean stop leaves nothing buffered that the sink accepts.

use crate::commit::{BatchCommitter, CommitError, CommitOutcome};
use crate::sink::{flush_to_sink, Sink};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// One commit cycle against `sink`, with the outcome logged
pub async fn run_cycle(
    committer: &BatchCommitter,
    sink: &dyn Sink,
    timeout: Duration,
) -> Result<CommitOutcome, CommitError> {
    let started = Instant::now();
    let result = committer
        .commit(|batch| flush_to_sink(sink, batch, timeout))
        .await;

    match &result {
        Ok(CommitOutcome::Committed {
            boundary,
            records,
            tables,
        }) => {
            log::info!(
                "✅ Committed {} records to {} ({} tables, boundary {}, {}ms)",
                records,
                sink.sink_type(),
                tables,
                boundary,
                started.elapsed().as_millis()
            );
        }
        Ok(CommitOutcome::Empty { boundary }) => {
            log::debug!("Commit cycle at boundary {} found nothing", boundary);
        }
        Ok(CommitOutcome::Skipped) => {
            log::debug!("Commit cycle skipped, previous cycle still running");
        }
        Err(e) => {
            log::error!("❌ Commit cycle failed: {}", e);
        }
    }

    result
}

/// Commit every `every` until `shutdown` flips to `true` or its sender drops
///
/// Failed cycles are logged and left for the next tick to retry. Ticks missed
/// during a slow cycle are not replayed back to back.
pub async fn run_commit_loop(
    committer: Arc<BatchCommitter>,
    sink: Arc<dyn Sink>,
    every: Duration,
    timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    log::info!("🚀 Starting commit loop");
    log::info!("   ├─ Sink: {}", sink.sink_type());
    log::info!("   ├─ Interval: {}ms", every.as_millis());
    log::info!("   └─ Insert timeout: {}ms", timeout.as_millis());

    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let _ = run_cycle(&committer, sink.as_ref(), timeout).await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    log::info!("🛑 Shutdown requested, running final commit");
    match run_cycle(&committer, sink.as_ref(), timeout).await {
        Ok(_) => {}
        Err(_) => {
            let pending = committer.buffer().pending_count().unwrap_or(0);
            log::warn!(
                "⚠️  Final commit failed, {} records stay in the journal for the next start",
                pending
            );
        }
    }
}
