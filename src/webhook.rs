//! Request-path handling for the inbound webhook and cursor lookup
//!
//! Transport agnostic: the HTTP layer passes the signature header and raw
//! body in and maps the result to a status with [`IngestError::status_code`].
//! Authentication and shape errors are resolved here and never touch the
//! journal.

use crate::journal::{IngestBuffer, JournalError, NewRecord};
use crate::model::{Clock, EntityChange, Manifest, TableChange};
use crate::signature::SignatureCache;
use serde::Deserialize;
use std::sync::Arc;

/// Header carrying the signed token
pub const SIGNATURE_HEADER: &str = "x-signature-ed25519";

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Authentication failed: {0}")]
    AuthFailure(&'static str),
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
    #[error("No committed cursor for chain {chain} and module hash {module_hash}")]
    UnknownCursor { chain: String, module_hash: String },
    #[error("Buffer write failed: {0}")]
    BufferWriteFailure(#[source] JournalError),
    #[error("Journal unavailable: {0}")]
    Journal(#[source] JournalError),
}

impl IngestError {
    /// HTTP status the transport should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            IngestError::AuthFailure(_) => 401,
            IngestError::MalformedPayload(_) | IngestError::UnknownCursor { .. } => 400,
            IngestError::BufferWriteFailure(_) | IngestError::Journal(_) => 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(default)]
    pub trace_id: String,
}

/// `data` of a block payload; exactly one of the two lists is expected
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockData {
    #[serde(default)]
    pub entity_changes: Option<Vec<EntityChange>>,
    #[serde(default)]
    pub table_changes: Option<Vec<TableChange>>,
}

impl BlockData {
    fn into_entity_changes(self) -> Result<Vec<EntityChange>, IngestError> {
        match (self.entity_changes, self.table_changes) {
            (Some(entity_changes), None) => Ok(entity_changes),
            (None, Some(table_changes)) => {
                Ok(table_changes.into_iter().map(EntityChange::from).collect())
            }
            (Some(_), Some(_)) => Err(IngestError::MalformedPayload(
                "data carries both entityChanges and tableChanges".to_string(),
            )),
            (None, None) => Err(IngestError::MalformedPayload(
                "data carries neither entityChanges nor tableChanges".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockPayload {
    pub cursor: String,
    #[serde(default)]
    pub session: Option<Session>,
    pub clock: Clock,
    pub manifest: Manifest,
    pub data: BlockData,
}

#[derive(Debug, Clone)]
pub enum WebhookMessage {
    /// Liveness probe, `{"message": "PING"}`
    Ping,
    Block(Box<BlockPayload>),
}

impl WebhookMessage {
    pub fn parse(body: &str) -> Result<Self, IngestError> {
        let value: serde_json::Value = serde_json::from_str(body)
            .map_err(|e| IngestError::MalformedPayload(format!("body is not JSON: {}", e)))?;

        if value.get("message").and_then(|m| m.as_str()) == Some("PING") {
            return Ok(WebhookMessage::Ping);
        }

        serde_json::from_value(value)
            .map(|payload| WebhookMessage::Block(Box::new(payload)))
            .map_err(|e| IngestError::MalformedPayload(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookAck {
    Pong,
    Buffered { batch_number: u64, records: usize },
}

/// Request context shared by every inbound request
pub struct WebhookHandler {
    signatures: Arc<SignatureCache>,
    buffer: Arc<IngestBuffer>,
}

impl WebhookHandler {
    pub fn new(signatures: Arc<SignatureCache>, buffer: Arc<IngestBuffer>) -> Self {
        Self { signatures, buffer }
    }

    /// Handle one `POST /`
    ///
    /// The signature is checked before the body is even parsed. Every change
    /// of a block is appended in one atomic batch, in payload order.
    pub fn handle(&self, signature: Option<&str>, body: &str) -> Result<WebhookAck, IngestError> {
        let token = signature
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(IngestError::AuthFailure("missing signature"))?;

        if !self.signatures.verify(token) {
            return Err(IngestError::AuthFailure("invalid or expired signature"));
        }

        match WebhookMessage::parse(body)? {
            WebhookMessage::Ping => {
                log::debug!("Webhook PING received");
                Ok(WebhookAck::Pong)
            }
            WebhookMessage::Block(payload) => self.buffer_block(*payload),
        }
    }

    fn buffer_block(&self, payload: BlockPayload) -> Result<WebhookAck, IngestError> {
        let BlockPayload {
            cursor,
            session,
            clock,
            manifest,
            data,
        } = payload;

        let changes = data.into_entity_changes()?;
        if let Some(change) = changes.iter().find(|c| c.entity.trim().is_empty()) {
            return Err(IngestError::MalformedPayload(format!(
                "change {} has no destination table",
                change.id
            )));
        }

        let records: Vec<NewRecord> = changes
            .into_iter()
            .map(|change| NewRecord {
                source: change.entity.clone(),
                change,
                clock: clock.clone(),
                manifest: manifest.clone(),
                cursor: cursor.clone(),
            })
            .collect();
        let count = records.len();

        let batch_number = self.buffer.append_batch(records).map_err(|e| {
            log::error!(
                "❌ Failed to buffer block {} ({} changes): {}",
                clock.block_number,
                count,
                e
            );
            IngestError::BufferWriteFailure(e)
        })?;

        log::debug!(
            "📥 Block {} on {} buffered: {} changes in batch {} (trace {})",
            clock.block_number,
            manifest.chain,
            count,
            batch_number,
            session.map(|s| s.trace_id).unwrap_or_default()
        );

        Ok(WebhookAck::Buffered {
            batch_number,
            records: count,
        })
    }

    /// Handle `GET /cursor?chain=..&module_hash=..`
    pub fn latest_cursor(
        &self,
        chain: Option<&str>,
        module_hash: Option<&str>,
    ) -> Result<String, IngestError> {
        let (chain, module_hash) = match (chain, module_hash) {
            (Some(chain), Some(module_hash)) => (chain, module_hash),
            _ => {
                return Err(IngestError::MalformedPayload(
                    "chain and module_hash are required".to_string(),
                ))
            }
        };

        self.buffer
            .latest_cursor(chain, module_hash)
            .map_err(IngestError::Journal)?
            .ok_or_else(|| IngestError::UnknownCursor {
                chain: chain.to_string(),
                module_hash: module_hash.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::MemoryStore;
    use crate::signature::{issue_token, key_id};
    use ed25519_dalek::SigningKey;
    use serde_json::json;
    use std::collections::HashMap;

    const SEED: [u8; 32] = [3u8; 32];
    const NOW: i64 = 1_700_000_000;

    fn handler() -> (WebhookHandler, Arc<IngestBuffer>) {
        let key = SigningKey::from_bytes(&SEED).verifying_key();
        let signatures = SignatureCache::new_with_clock(
            HashMap::from([(key_id(&key), key)]),
            Box::new(|| NOW),
        );
        let buffer = Arc::new(IngestBuffer::open(Box::new(MemoryStore::new())).unwrap());
        (
            WebhookHandler::new(Arc::new(signatures), buffer.clone()),
            buffer,
        )
    }

    fn token() -> String {
        issue_token(&SigningKey::from_bytes(&SEED), NOW + 60).unwrap()
    }

    fn block_body(data: serde_json::Value) -> String {
        json!({
            "cursor": "cursor-abc",
            "session": {"traceId": "trace-1", "resolvedStartBlock": 1},
            "clock": {"number": 100, "id": "ab".repeat(32), "timestamp": "2024-01-01T00:00:00Z"},
            "manifest": {
                "chain": "wax",
                "moduleHash": "0".repeat(40),
                "moduleName": "map_transfers",
                "type": "sf.substreams.sink.entity.v1.EntityChanges",
                "finalBlockOnly": false
            },
            "data": data
        })
        .to_string()
    }

    #[test]
    fn test_entity_changes_buffered() {
        let (handler, buffer) = handler();
        let body = block_body(json!({"entityChanges": [
            {"entity": "transfers", "id": "t1", "operation": "OPERATION_CREATE",
             "fields": [{"name": "amount", "newValue": {"bigint": "5"}}]},
            {"entity": "accounts", "id": "a1", "operation": "OPERATION_UPDATE", "fields": []}
        ]}));

        let ack = handler.handle(Some(&token()), &body).unwrap();

        assert_eq!(
            ack,
            WebhookAck::Buffered {
                batch_number: 1,
                records: 2
            }
        );
        assert_eq!(buffer.pending_count().unwrap(), 2);
    }

    #[test]
    fn test_table_changes_buffered() {
        let (handler, buffer) = handler();
        let body = block_body(json!({"tableChanges": [
            {"table": "accounts", "pk": "a1", "operation": "OPERATION_CREATE",
             "fields": [{"name": "balance", "newValue": "10"}]}
        ]}));

        handler.handle(Some(&token()), &body).unwrap();
        assert_eq!(buffer.pending_count().unwrap(), 1);
    }

    #[test]
    fn test_ping_not_buffered() {
        let (handler, buffer) = handler();

        let ack = handler
            .handle(Some(&token()), r#"{"message": "PING"}"#)
            .unwrap();

        assert_eq!(ack, WebhookAck::Pong);
        assert_eq!(buffer.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_auth_failures_rejected_before_parsing() {
        let (handler, buffer) = handler();

        let err = handler.handle(None, "not even json").unwrap_err();
        assert_eq!(err.status_code(), 401);

        let err = handler.handle(Some("  "), "not even json").unwrap_err();
        assert_eq!(err.status_code(), 401);

        let expired = issue_token(&SigningKey::from_bytes(&SEED), NOW - 1).unwrap();
        let err = handler
            .handle(Some(&expired), &block_body(json!({"entityChanges": []})))
            .unwrap_err();
        assert!(matches!(err, IngestError::AuthFailure(_)));

        assert_eq!(buffer.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_malformed_payloads_rejected() {
        let (handler, buffer) = handler();
        let token = token();

        let cases = vec![
            "{".to_string(),
            json!({"cursor": "c"}).to_string(),
            block_body(json!({})),
            block_body(json!({"entityChanges": [], "tableChanges": []})),
            block_body(json!({"entityChanges": [{"entity": "", "id": "x"}]})),
            block_body(json!({"entityChanges": [
                {"entity": "t", "id": "x", "fields": [{"name": "a", "newValue": {"float": 1.0}}]}
            ]})),
        ];

        for body in cases {
            let err = handler.handle(Some(&token), &body).unwrap_err();
            assert_eq!(err.status_code(), 400, "body {} should be rejected", body);
        }
        assert_eq!(buffer.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_cursor_lookup() {
        let (handler, _buffer) = handler();

        let err = handler.latest_cursor(Some("wax"), None).unwrap_err();
        assert_eq!(err.status_code(), 400);

        let err = handler.latest_cursor(Some("wax"), Some("abc")).unwrap_err();
        assert!(matches!(err, IngestError::UnknownCursor { .. }));
        assert_eq!(err.status_code(), 400);
    }
}
