//! Log entries and chunk records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chunk::{ChunkPayload, Role};

/// One immutable entry in a session log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// `<messageId>:<seq>`.
    pub key: String,
    pub value: ChunkRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<EntryHeaders>,
}

impl LogEntry {
    /// Build the deterministic key for a chunk.
    pub fn key_for(message_id: &str, seq: u64) -> String {
        format!("{}:{}", message_id, seq)
    }

    /// Split a key back into message id and seq. Message ids may contain
    /// colons, so the split happens at the last one.
    pub fn parse_key(key: &str) -> Option<(&str, u64)> {
        let (message_id, seq) = key.rsplit_once(':')?;
        if message_id.is_empty() {
            return None;
        }
        Some((message_id, seq.parse().ok()?))
    }

    /// Decode the chunk payload carried by this entry.
    pub fn payload(&self) -> Result<ChunkPayload, serde_json::Error> {
        self.value.payload()
    }
}

/// The value half of a log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    pub message_id: String,
    pub actor_id: String,
    pub role: Role,
    /// JSON encoding of a [`ChunkPayload`].
    pub chunk: String,
    pub seq: u64,
    pub created_at: DateTime<Utc>,
}

impl ChunkRecord {
    pub fn payload(&self) -> Result<ChunkPayload, serde_json::Error> {
        serde_json::from_str(&self.chunk)
    }
}

/// Optional per-entry headers recorded alongside the value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EntryHeaders {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer_epoch: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer_seq: Option<u64>,
}

impl EntryHeaders {
    pub fn is_empty(&self) -> bool {
        *self == EntryHeaders::default()
    }
}
