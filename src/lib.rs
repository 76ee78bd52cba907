//! chainsink: durable webhook ingestion with fenced batch commits
//!
//! Block state changes arrive on a signed webhook, are appended to a local
//! journal under a monotonically increasing batch number, and are periodically
//! fenced, grouped by destination table, flattened, and handed to a sink.
//! Records leave the journal only after the sink accepted them.

pub mod backoff;
pub mod commit;
pub mod config;
pub mod flatten;
pub mod journal;
pub mod model;
pub mod runtime;
pub mod signature;
pub mod sink;
pub mod sqlite_pragma;
pub mod webhook;

pub use commit::{BatchCommitter, CommitError, CommitOutcome, FlushBatch};
pub use config::SinkConfig;
pub use journal::{IngestBuffer, JournalError};
pub use signature::SignatureCache;
pub use sink::{flush_to_sink, Sink, SinkError};
pub use webhook::{IngestError, WebhookAck, WebhookHandler};
