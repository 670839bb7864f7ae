//! Log store interface.
//!
//! The store is an HTTP-shaped append-only log keyed by session id. Every
//! call returns the store's raw status and headers so that the producer and
//! the consumer proxy can interpret them; only transport failures are
//! reported as errors.

mod http;
mod memory;

pub use http::HttpLogStore;
pub use memory::{DEFAULT_MAX_BATCH_ENTRIES, MemoryLogStore};

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::{ParleyError, ParleyResult};

/// Body of a store response.
pub enum StoreBody {
    /// A complete body (catch-up batch, error payload, or empty).
    Bytes(Bytes),
    /// A live SSE body that stays open while the stream is tailed.
    Stream(BoxStream<'static, ParleyResult<Bytes>>),
}

impl std::fmt::Debug for StoreBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreBody::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            StoreBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Raw response from the store.
#[derive(Debug)]
pub struct StoreResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: StoreBody,
}

impl StoreResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Collect the body into bytes. Live bodies are drained until they end,
    /// so only call this on non-live responses.
    pub async fn into_bytes(self) -> ParleyResult<Bytes> {
        match self.body {
            StoreBody::Bytes(bytes) => Ok(bytes),
            StoreBody::Stream(mut stream) => {
                use futures::StreamExt;
                let mut buf = Vec::new();
                while let Some(chunk) = stream.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(Bytes::from(buf))
            }
        }
    }
}

/// Options for a stream read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Position to read from; `None` or `-1` means the beginning.
    pub offset: Option<String>,
    /// Opaque cursor echoed back to the store.
    pub cursor: Option<String>,
    /// Tail the stream over SSE instead of returning one batch.
    pub live: bool,
}

impl ReadOptions {
    pub fn from_offset(offset: impl Into<String>) -> Self {
        Self {
            offset: Some(offset.into()),
            ..Self::default()
        }
    }

    pub fn live_from(offset: Option<String>) -> Self {
        Self {
            offset,
            cursor: None,
            live: true,
        }
    }
}

/// The durable append-only log all session traffic goes through.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Create a stream. A stream that already exists answers 409.
    async fn create(&self, session_id: &str, content_type: &str) -> ParleyResult<StoreResponse>;

    /// Append a body, with producer and close headers passed through as-is.
    async fn append(
        &self,
        session_id: &str,
        body: Bytes,
        headers: HeaderMap,
    ) -> ParleyResult<StoreResponse>;

    /// Read from an offset, either one catch-up batch or a live SSE tail.
    async fn read(&self, session_id: &str, options: &ReadOptions) -> ParleyResult<StoreResponse>;

    /// Stream metadata only.
    async fn head(&self, session_id: &str) -> ParleyResult<StoreResponse>;

    /// Delete a stream and everything in it.
    async fn delete(&self, session_id: &str) -> ParleyResult<StoreResponse>;
}

/// Pull a human-readable message out of an error body.
pub fn error_details(status: StatusCode, body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        for field in ["error", "message"] {
            if let Some(text) = value.get(field).and_then(|v| v.as_str()) {
                return text.to_string();
            }
        }
    }

    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        return status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_string();
    }

    const MAX_DETAILS: usize = 512;
    if text.len() > MAX_DETAILS {
        let mut end = MAX_DETAILS;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    } else {
        text.to_string()
    }
}

/// Validate a session id before it is used as a store path segment.
pub fn validate_session_id(session_id: &str) -> ParleyResult<()> {
    if session_id.trim().is_empty() {
        return Err(ParleyError::validation("session id must not be empty"));
    }
    if session_id.len() > 256 {
        return Err(ParleyError::validation("session id is too long"));
    }
    if session_id.chars().any(|c| c.is_control() || c == '/') {
        return Err(ParleyError::validation(
            "session id must not contain '/' or control characters",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_details_prefers_json_fields() {
        let body = br#"{"error":"stream is closed"}"#;
        assert_eq!(
            error_details(StatusCode::CONFLICT, body),
            "stream is closed"
        );
        let body = br#"{"message":"nope"}"#;
        assert_eq!(error_details(StatusCode::BAD_REQUEST, body), "nope");
    }

    #[test]
    fn test_error_details_falls_back_to_text_and_reason() {
        assert_eq!(
            error_details(StatusCode::BAD_GATEWAY, b"upstream went away\n"),
            "upstream went away"
        );
        assert_eq!(error_details(StatusCode::BAD_GATEWAY, b""), "Bad Gateway");

        let long = "x".repeat(2000);
        let details = error_details(StatusCode::INTERNAL_SERVER_ERROR, long.as_bytes());
        assert!(details.len() < 600);
        assert!(details.ends_with("..."));
    }

    #[test]
    fn test_validate_session_id() {
        assert!(validate_session_id("S1").is_ok());
        assert!(validate_session_id("ses_abc-123").is_ok());
        assert!(validate_session_id("").is_err());
        assert!(validate_session_id("a/b").is_err());
        assert!(validate_session_id("a\nb").is_err());
    }
}
