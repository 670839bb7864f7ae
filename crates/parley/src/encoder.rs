//! Chunk encoding.
//!
//! Turns a [`ChunkPayload`] plus its addressing metadata into a [`LogEntry`]
//! and serializes batches for the store. Encoding is pure: the same payload
//! and metadata always produce the same bytes, which is what lets a producer
//! retry an append safely.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::debug;
use parley_protocol::{ChunkPayload, ChunkRecord, EntryHeaders, LogEntry, Role};

use crate::error::{ParleyError, ParleyResult};

/// Everything about a chunk except its content.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkMeta {
    pub message_id: String,
    pub actor_id: String,
    pub role: Role,
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub txid: Option<String>,
}

impl ChunkMeta {
    /// Metadata for a single-shot chunk, which always sits at seq 0.
    pub fn single(
        message_id: impl Into<String>,
        actor_id: impl Into<String>,
        role: Role,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            actor_id: actor_id.into(),
            role,
            seq: 0,
            created_at,
            txid: None,
        }
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    pub fn with_txid(mut self, txid: Option<String>) -> Self {
        self.txid = txid;
        self
    }
}

/// Generate a fresh message id.
pub fn new_message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}

/// Build a log entry for `payload`.
pub fn encode(payload: &ChunkPayload, meta: &ChunkMeta) -> ParleyResult<LogEntry> {
    if meta.message_id.trim().is_empty() {
        return Err(ParleyError::validation("message id must not be empty"));
    }
    if meta.actor_id.trim().is_empty() {
        return Err(ParleyError::validation("actor id must not be empty"));
    }
    if !matches!(payload, ChunkPayload::Stream { .. }) && meta.seq != 0 {
        return Err(ParleyError::validation(format!(
            "{} chunks occupy seq 0 of their own message, got seq {}",
            payload.kind(),
            meta.seq
        )));
    }

    let headers = meta.txid.as_ref().map(|txid| EntryHeaders {
        txid: Some(txid.clone()),
        ..EntryHeaders::default()
    });

    Ok(LogEntry {
        key: LogEntry::key_for(&meta.message_id, meta.seq),
        value: ChunkRecord {
            message_id: meta.message_id.clone(),
            actor_id: meta.actor_id.clone(),
            role: meta.role,
            chunk: serde_json::to_string(payload)?,
            seq: meta.seq,
            created_at: meta.created_at,
        },
        headers,
    })
}

/// Serialize a single entry as an append body.
pub fn to_bytes(entry: &LogEntry) -> ParleyResult<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(entry)?))
}

/// Decode a catch-up batch (a JSON array of entries). An empty body is an
/// empty batch. Elements that are not entries are skipped.
pub fn decode_batch(body: &[u8]) -> ParleyResult<Vec<LogEntry>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let values: Vec<serde_json::Value> = serde_json::from_slice(body)?;
    Ok(values
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<LogEntry>(value) {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!("Skipping malformed batch element: {}", e);
                None
            }
        })
        .collect())
}

/// Check a raw append body: one entry or a non-empty array of entries.
pub fn validate_append_body(body: &[u8]) -> ParleyResult<()> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| ParleyError::validation(format!("append body is not JSON: {}", e)))?;
    let elements = match value {
        serde_json::Value::Array(items) if items.is_empty() => {
            return Err(ParleyError::validation("append batch must not be empty"));
        }
        serde_json::Value::Array(items) => items,
        single => vec![single],
    };
    for element in elements {
        serde_json::from_value::<LogEntry>(element)
            .map_err(|e| ParleyError::validation(format!("invalid log entry: {}", e)))?;
    }
    Ok(())
}
