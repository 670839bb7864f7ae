//! Producer client.
//!
//! Writes entries to the log store. Appends that carry producer metadata are
//! idempotent at the store, so they can be retried after ambiguous failures.
//! [`ProducerSession`] tracks one producer identity's sequence numbers and
//! resynchronizes when the store reports a different expected seq.

use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use bytes::Bytes;
use log::{debug, warn};
use parley_protocol::LogEntry;
use parley_protocol::headers::{
    CONTENT_TYPE_JSON, PRODUCER_EPOCH, PRODUCER_EXPECTED_SEQ, PRODUCER_ID,
    PRODUCER_RECEIVED_SEQ, PRODUCER_SEQ, RELAYED_APPEND_HEADERS, STREAM_CLOSED,
    STREAM_NEXT_OFFSET,
};
use std::sync::Arc;
use std::time::Duration;

use crate::encoder;
use crate::error::{ParleyError, ParleyResult};
use crate::store::{LogStore, StoreResponse, error_details, validate_session_id};

/// Default number of attempts for a retryable append.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Producer identity attached to an append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerMeta {
    pub producer_id: String,
    pub epoch: u64,
    pub seq: u64,
}

/// What the store did with an append.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    /// A new entry was written.
    pub accepted: bool,
    /// The store recognized a retry of an already-accepted seq.
    pub duplicate: bool,
    pub next_offset: Option<String>,
    pub received_seq: Option<u64>,
    pub expected_seq: Option<u64>,
}

/// A raw store response relayed to a remote producer.
#[derive(Debug)]
pub struct RelayedAppend {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Appends entries to session streams.
#[derive(Clone)]
pub struct ProducerClient {
    store: Arc<dyn LogStore>,
    max_attempts: u32,
}

impl ProducerClient {
    pub fn new(store: Arc<dyn LogStore>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Create the session stream if it does not exist yet.
    pub async fn ensure_stream(&self, session_id: &str) -> ParleyResult<()> {
        validate_session_id(session_id)?;
        let resp = self.store.create(session_id, CONTENT_TYPE_JSON).await?;
        match resp.status {
            s if s.is_success() => {
                debug!("Stream {} created", session_id);
                Ok(())
            }
            StatusCode::CONFLICT => Ok(()),
            status => {
                let body = resp.into_bytes().await.unwrap_or_default();
                Err(ParleyError::Upstream {
                    status: status.as_u16(),
                    details: error_details(status, &body),
                })
            }
        }
    }

    /// Append one entry. With `producer`, the entry is stamped with the
    /// producer identity and the store deduplicates retries.
    pub async fn append(
        &self,
        session_id: &str,
        entry: &LogEntry,
        producer: Option<&ProducerMeta>,
    ) -> ParleyResult<AppendOutcome> {
        self.send(session_id, entry, producer, false).await
    }

    /// Append `final_entry` and mark the stream closed in the same request.
    pub async fn close_stream(
        &self,
        session_id: &str,
        final_entry: &LogEntry,
        producer: Option<&ProducerMeta>,
    ) -> ParleyResult<AppendOutcome> {
        self.send(session_id, final_entry, producer, true).await
    }

    /// Delete the session stream. A missing stream is reported as
    /// [`ParleyError::StreamNotFound`].
    pub async fn delete_stream(&self, session_id: &str) -> ParleyResult<()> {
        validate_session_id(session_id)?;
        let resp = self.store.delete(session_id).await?;
        match resp.status {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(ParleyError::StreamNotFound(session_id.to_string())),
            status => {
                let body = resp.into_bytes().await.unwrap_or_default();
                Err(ParleyError::Upstream {
                    status: status.as_u16(),
                    details: error_details(status, &body),
                })
            }
        }
    }

    /// Forward a pre-encoded body from a remote producer. The producer's
    /// own headers pass through and the store's verdict is relayed back
    /// unchanged, so the remote producer handles its own retries.
    pub async fn forward(
        &self,
        session_id: &str,
        body: Bytes,
        request_headers: &HeaderMap,
    ) -> ParleyResult<RelayedAppend> {
        validate_session_id(session_id)?;
        let mut headers = HeaderMap::new();
        for name in [PRODUCER_ID, PRODUCER_EPOCH, PRODUCER_SEQ, STREAM_CLOSED] {
            if let Some(value) = request_headers.get(name) {
                headers.insert(HeaderName::from_static(name), value.clone());
            }
        }
        headers.insert("content-type", HeaderValue::from_static(CONTENT_TYPE_JSON));

        let resp = self.store.append(session_id, body, headers).await?;
        if resp.status == StatusCode::NOT_FOUND {
            return Err(ParleyError::StreamNotFound(session_id.to_string()));
        }

        let mut relayed = HeaderMap::new();
        for name in RELAYED_APPEND_HEADERS {
            if let Some(value) = resp.headers.get(*name) {
                relayed.insert(HeaderName::from_static(name), value.clone());
            }
        }
        let status = resp.status;
        let body = resp.into_bytes().await?;
        Ok(RelayedAppend {
            status,
            headers: relayed,
            body,
        })
    }

    async fn send(
        &self,
        session_id: &str,
        entry: &LogEntry,
        producer: Option<&ProducerMeta>,
        close: bool,
    ) -> ParleyResult<AppendOutcome> {
        validate_session_id(session_id)?;
        let body = match producer {
            Some(meta) => encoder::to_bytes(&stamp(entry, meta))?,
            None => encoder::to_bytes(entry)?,
        };

        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static(CONTENT_TYPE_JSON));
        if let Some(meta) = producer {
            headers.insert(PRODUCER_ID, header_value(&meta.producer_id)?);
            headers.insert(PRODUCER_EPOCH, HeaderValue::from(meta.epoch));
            headers.insert(PRODUCER_SEQ, HeaderValue::from(meta.seq));
        }
        if close {
            headers.insert(STREAM_CLOSED, HeaderValue::from_static("true"));
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self
                .store
                .append(session_id, body.clone(), headers.clone())
                .await;

            let retryable = match &result {
                Ok(resp) => resp.status.is_server_error() && producer.is_some(),
                Err(ParleyError::Unavailable(_)) => true,
                Err(ParleyError::Transport(_)) => producer.is_some(),
                Err(_) => false,
            };

            if retryable && attempt < self.max_attempts {
                let delay = Duration::from_millis(100 * u64::from(attempt.min(20)));
                warn!(
                    "Append to {} failed (attempt {}/{}), retrying in {:?}",
                    session_id, attempt, self.max_attempts, delay
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            return interpret(session_id, result?, producer).await;
        }
    }
}

/// Copy the producer identity into the entry's own headers so readers can
/// see who wrote it.
fn stamp(entry: &LogEntry, meta: &ProducerMeta) -> LogEntry {
    let mut entry = entry.clone();
    let headers = entry.headers.get_or_insert_with(Default::default);
    headers.producer_id = Some(meta.producer_id.clone());
    headers.producer_epoch = Some(meta.epoch);
    headers.producer_seq = Some(meta.seq);
    entry
}

fn header_value(value: &str) -> ParleyResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| ParleyError::validation(format!("invalid header value: {}", value)))
}

fn header_u64(resp: &StoreResponse, name: &str) -> Option<u64> {
    resp.header(name).and_then(|v| v.parse().ok())
}

async fn interpret(
    session_id: &str,
    resp: StoreResponse,
    producer: Option<&ProducerMeta>,
) -> ParleyResult<AppendOutcome> {
    let status = resp.status;

    if status.is_success() {
        let duplicate = status == StatusCode::NO_CONTENT && producer.is_some();
        let received_seq =
            header_u64(&resp, PRODUCER_RECEIVED_SEQ).or_else(|| producer.map(|p| p.seq));
        let expected_seq = header_u64(&resp, PRODUCER_EXPECTED_SEQ)
            .or_else(|| received_seq.map(|seq| seq + 1));

        if let (Some(meta), Some(received)) = (producer, received_seq)
            && received != meta.seq
        {
            return Err(ParleyError::SequenceMismatch {
                expected: expected_seq.unwrap_or(received + 1),
                received,
            });
        }

        return Ok(AppendOutcome {
            accepted: !duplicate,
            duplicate,
            next_offset: resp.header(STREAM_NEXT_OFFSET).map(str::to_string),
            received_seq,
            expected_seq,
        });
    }

    let closed = resp.header(STREAM_CLOSED) == Some("true");
    let expected = header_u64(&resp, PRODUCER_EXPECTED_SEQ);
    let received = header_u64(&resp, PRODUCER_RECEIVED_SEQ)
        .or_else(|| producer.map(|p| p.seq))
        .unwrap_or_default();
    let epoch = header_u64(&resp, PRODUCER_EPOCH);
    let body = resp.into_bytes().await.unwrap_or_default();

    Err(match status {
        StatusCode::NOT_FOUND => ParleyError::StreamNotFound(session_id.to_string()),
        StatusCode::CONFLICT if closed => ParleyError::StreamClosed(session_id.to_string()),
        StatusCode::CONFLICT if expected.is_some() => ParleyError::SequenceMismatch {
            expected: expected.unwrap_or_default(),
            received,
        },
        StatusCode::FORBIDDEN => ParleyError::ProducerFenced {
            current_epoch: epoch.unwrap_or_default(),
        },
        _ => ParleyError::Upstream {
            status: status.as_u16(),
            details: error_details(status, &body),
        },
    })
}

// ============================================================================
// Producer session
// ============================================================================

/// One producer identity writing to one session stream.
///
/// On a sequence mismatch the session adopts the store's expected seq and
/// retries the append once. Entries the store never saw are not replayed;
/// the caller's next append simply continues from the store's position.
pub struct ProducerSession {
    client: ProducerClient,
    session_id: String,
    producer_id: String,
    epoch: u64,
    next_seq: u64,
}

impl ProducerSession {
    pub fn new(
        client: ProducerClient,
        session_id: impl Into<String>,
        producer_id: impl Into<String>,
        epoch: u64,
    ) -> Self {
        Self {
            client,
            session_id: session_id.into(),
            producer_id: producer_id.into(),
            epoch,
            next_seq: 0,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn meta(&self) -> ProducerMeta {
        ProducerMeta {
            producer_id: self.producer_id.clone(),
            epoch: self.epoch,
            seq: self.next_seq,
        }
    }

    pub async fn append(&mut self, entry: &LogEntry) -> ParleyResult<AppendOutcome> {
        self.write(entry, false).await
    }

    /// Append `final_entry` and close the stream.
    pub async fn close(&mut self, final_entry: &LogEntry) -> ParleyResult<AppendOutcome> {
        self.write(final_entry, true).await
    }

    async fn write(&mut self, entry: &LogEntry, close: bool) -> ParleyResult<AppendOutcome> {
        match self.attempt(entry, close).await {
            Err(ParleyError::SequenceMismatch { expected, received }) => {
                warn!(
                    "Producer {} epoch {} on {}: store expected seq {}, sent {}; resyncing",
                    self.producer_id, self.epoch, self.session_id, expected, received
                );
                self.next_seq = expected;
                self.attempt(entry, close).await
            }
            other => other,
        }
    }

    async fn attempt(&mut self, entry: &LogEntry, close: bool) -> ParleyResult<AppendOutcome> {
        let meta = self.meta();
        let outcome = self
            .client
            .send(&self.session_id, entry, Some(&meta), close)
            .await?;
        self.next_seq = meta.seq + 1;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{ChunkMeta, encode};
    use crate::store::{MemoryLogStore, ReadOptions, StoreBody};
    use async_trait::async_trait;
    use chrono::Utc;
    use parley_protocol::{ChunkPayload, Message, Role, StreamChunk};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn user_entry(id: &str, text: &str) -> LogEntry {
        encode(
            &ChunkPayload::WholeMessage {
                message: Message::user(text),
            },
            &ChunkMeta::single(id, "alice", Role::User, Utc::now()),
        )
        .unwrap()
    }

    fn delta_entry(seq: u64, text: &str) -> LogEntry {
        encode(
            &ChunkPayload::Stream {
                chunk: StreamChunk::TextDelta {
                    delta: text.to_string(),
                },
            },
            &ChunkMeta::single("msg_run", "agent", Role::Assistant, Utc::now()).with_seq(seq),
        )
        .unwrap()
    }

    async fn entry_count(store: &MemoryLogStore, session: &str) -> usize {
        let resp = store.read(session, &ReadOptions::default()).await.unwrap();
        let body = resp.into_bytes().await.unwrap();
        encoder::decode_batch(&body).unwrap().len()
    }

    /// Store wrapper that drops the response of the first matching append
    /// after forwarding it, like a connection reset after the write landed.
    struct LossyStore {
        inner: MemoryLogStore,
        drop_responses: AtomicU32,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl LogStore for LossyStore {
        async fn create(&self, session_id: &str, ct: &str) -> ParleyResult<StoreResponse> {
            self.inner.create(session_id, ct).await
        }

        async fn append(
            &self,
            session_id: &str,
            body: Bytes,
            headers: HeaderMap,
        ) -> ParleyResult<StoreResponse> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let resp = self.inner.append(session_id, body, headers).await?;
            if self.drop_responses.load(Ordering::SeqCst) > 0 {
                self.drop_responses.fetch_sub(1, Ordering::SeqCst);
                return Err(ParleyError::Transport("connection reset".to_string()));
            }
            Ok(resp)
        }

        async fn read(&self, session_id: &str, o: &ReadOptions) -> ParleyResult<StoreResponse> {
            self.inner.read(session_id, o).await
        }

        async fn head(&self, session_id: &str) -> ParleyResult<StoreResponse> {
            self.inner.head(session_id).await
        }

        async fn delete(&self, session_id: &str) -> ParleyResult<StoreResponse> {
            self.inner.delete(session_id).await
        }
    }

    #[tokio::test]
    async fn test_ensure_stream_is_idempotent() {
        let store = Arc::new(MemoryLogStore::default());
        let client = ProducerClient::new(store, 3);
        client.ensure_stream("S1").await.unwrap();
        client.ensure_stream("S1").await.unwrap();
    }

    #[tokio::test]
    async fn test_append_missing_stream() {
        let client = ProducerClient::new(Arc::new(MemoryLogStore::default()), 3);
        let err = client
            .append("nope", &user_entry("msg_1", "hi"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ParleyError::StreamNotFound(_)));
    }

    #[tokio::test]
    async fn test_retry_after_lost_response_is_deduplicated() {
        let memory = MemoryLogStore::default();
        let lossy = Arc::new(LossyStore {
            inner: memory.clone(),
            drop_responses: AtomicU32::new(1),
            attempts: AtomicU32::new(0),
        });
        let client = ProducerClient::new(lossy.clone(), 3);
        client.ensure_stream("S1").await.unwrap();

        let mut session = ProducerSession::new(client, "S1", "parley-test", 1);
        session.append(&delta_entry(0, "a")).await.unwrap();
        session.append(&delta_entry(1, "b")).await.unwrap();
        session.append(&delta_entry(2, "c")).await.unwrap();

        lossy.drop_responses.store(1, Ordering::SeqCst);
        let outcome = session.append(&delta_entry(3, "d")).await.unwrap();

        assert!(outcome.duplicate);
        assert_eq!(outcome.received_seq, Some(3));
        assert_eq!(entry_count(&memory, "S1").await, 4);
        assert_eq!(session.meta().seq, 4);
    }

    #[tokio::test]
    async fn test_bare_append_is_not_replayed_after_transport_error() {
        let memory = MemoryLogStore::default();
        let lossy = Arc::new(LossyStore {
            inner: memory.clone(),
            drop_responses: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
        });
        let client = ProducerClient::new(lossy.clone(), 5);
        client.ensure_stream("S1").await.unwrap();

        lossy.drop_responses.store(1, Ordering::SeqCst);
        let err = client
            .append("S1", &user_entry("msg_1", "hi"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ParleyError::Transport(_)));
        assert_eq!(lossy.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(entry_count(&memory, "S1").await, 1);
    }

    #[tokio::test]
    async fn test_session_resyncs_to_expected_seq() {
        let memory = Arc::new(MemoryLogStore::default());
        let client = ProducerClient::new(memory.clone(), 3);
        client.ensure_stream("S1").await.unwrap();

        // Another writer with the same identity already advanced the store.
        let mut other = ProducerSession::new(client.clone(), "S1", "parley-test", 1);
        other.append(&delta_entry(0, "a")).await.unwrap();
        other.append(&delta_entry(1, "b")).await.unwrap();

        let mut session = ProducerSession::new(client, "S1", "parley-test", 1);
        session.next_seq = 5;
        let outcome = session.append(&delta_entry(2, "c")).await.unwrap();
        assert!(outcome.accepted);
        assert_eq!(outcome.received_seq, Some(2));
        assert_eq!(session.meta().seq, 3);
    }

    #[tokio::test]
    async fn test_stale_epoch_is_fenced() {
        let memory = Arc::new(MemoryLogStore::default());
        let client = ProducerClient::new(memory, 3);
        client.ensure_stream("S1").await.unwrap();

        let mut newer = ProducerSession::new(client.clone(), "S1", "parley-test", 2);
        newer.append(&delta_entry(0, "new")).await.unwrap();

        let mut older = ProducerSession::new(client, "S1", "parley-test", 1);
        let err = older.append(&delta_entry(0, "old")).await.unwrap_err();
        assert!(matches!(
            err,
            ParleyError::ProducerFenced { current_epoch: 2 }
        ));
    }

    #[tokio::test]
    async fn test_close_stream_then_append_fails() {
        let memory = Arc::new(MemoryLogStore::default());
        let client = ProducerClient::new(memory.clone(), 3);
        client.ensure_stream("S1").await.unwrap();
        client
            .close_stream("S1", &user_entry("msg_1", "bye"), None)
            .await
            .unwrap();

        let err = client
            .append("S1", &user_entry("msg_2", "again"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ParleyError::StreamClosed(_)));

        let resp = memory.read("S1", &ReadOptions::default()).await.unwrap();
        assert_eq!(resp.header(STREAM_CLOSED), Some("true"));
        assert!(matches!(resp.body, StoreBody::Bytes(_)));
    }

    #[tokio::test]
    async fn test_forward_relays_store_verdict() {
        let memory = Arc::new(MemoryLogStore::default());
        let client = ProducerClient::new(memory, 3);
        client.ensure_stream("S1").await.unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(PRODUCER_ID, HeaderValue::from_static("remote"));
        headers.insert(PRODUCER_EPOCH, HeaderValue::from_static("0"));
        headers.insert(PRODUCER_SEQ, HeaderValue::from_static("0"));
        headers.insert("x-unrelated", HeaderValue::from_static("1"));
        let body = encoder::to_bytes(&user_entry("msg_1", "hi")).unwrap();

        let first = client.forward("S1", body.clone(), &headers).await.unwrap();
        assert_eq!(first.status, StatusCode::OK);
        assert!(first.headers.contains_key(STREAM_NEXT_OFFSET));

        let retry = client.forward("S1", body, &headers).await.unwrap();
        assert_eq!(retry.status, StatusCode::NO_CONTENT);
        assert_eq!(retry.headers.get(PRODUCER_RECEIVED_SEQ).unwrap(), "0");
    }
}
