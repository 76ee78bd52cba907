//! Journal Flush - operator tool for the ingest journal
//!
//! Opens the on-disk journal and either reports what is buffered or drains it
//! into ClickHouse, retrying failed cycles with exponential backoff.
//!
//! Usage:
//!   cargo run --release --bin journal_flush            # drain to ClickHouse
//!   cargo run --release --bin journal_flush -- --status
//!   cargo run --release --bin journal_flush -- --max-retries 10
//!
//! Environment variables: see `SinkConfig::from_env`.

use chainsink::backoff::ExponentialBackoff;
use chainsink::commit::{BatchCommitter, CommitOutcome};
use chainsink::config::SinkConfig;
use chainsink::journal::{IngestBuffer, SqliteStore};
use chainsink::runtime::run_cycle;
use chainsink::sink::ClickhouseSink;
use dotenv::dotenv;
use log::{error, info};
use std::env;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_MAX_RETRIES: u32 = 5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().collect();
    let status_only = args.iter().any(|a| a == "--status");
    let max_retries = match args.windows(2).find(|w| w[0] == "--max-retries") {
        Some(w) => w[1]
            .parse::<u32>()
            .map_err(|_| format!("Invalid --max-retries value: {}", w[1]))?,
        None => DEFAULT_MAX_RETRIES,
    };

    let config = SinkConfig::from_env()?;

    info!("🚀 Journal Flush");
    info!("   ├─ Journal: {}", config.journal_path);
    info!("   └─ Durability: {}", config.durability);

    let store = SqliteStore::open(&config.journal_path, config.durability)?;
    let buffer = Arc::new(IngestBuffer::open(Box::new(store))?);

    let pending = buffer.pending_count()?;
    if status_only {
        println!("journal:        {}", config.journal_path);
        println!("pending:        {}", pending);
        println!("next batch:     {}", buffer.current_batch_number());
        return Ok(());
    }

    if pending == 0 {
        info!("✅ Journal is empty, nothing to flush");
        return Ok(());
    }

    let sink = ClickhouseSink::new(&config.clickhouse)?;
    info!(
        "📤 Draining {} records to {} (database {})",
        pending, config.clickhouse.url, config.clickhouse.database
    );

    let committer = BatchCommitter::new(buffer.clone());
    let mut backoff =
        ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60), max_retries);

    loop {
        match run_cycle(&committer, &sink, config.sink_timeout()).await {
            Ok(CommitOutcome::Committed { .. }) => backoff.reset(),
            Ok(CommitOutcome::Empty { .. }) | Ok(CommitOutcome::Skipped) => break,
            Err(_) => {
                if backoff.sleep().await.is_err() {
                    let remaining = buffer.pending_count()?;
                    error!(
                        "❌ Giving up after {} retries, {} records stay in the journal",
                        max_retries, remaining
                    );
                    return Err(format!("{} records could not be flushed", remaining).into());
                }
            }
        }
    }

    info!("✅ Journal drained");
    Ok(())
}
