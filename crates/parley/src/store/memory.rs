//! In-process log store.
//!
//! Implements the same HTTP-shaped contract as the remote store: offsets,
//! idempotent producers, closing, catch-up batches and SSE tails. Used for
//! single-node deployments and tests.

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use bytes::Bytes;
use dashmap::DashMap;
use log::{debug, info};
use parley_protocol::headers::{
    CONTENT_TYPE_EVENT_STREAM, CONTENT_TYPE_JSON, OFFSET_START, PRODUCER_EPOCH,
    PRODUCER_EXPECTED_SEQ, PRODUCER_ID, PRODUCER_RECEIVED_SEQ, PRODUCER_SEQ, STREAM_CLOSED,
    STREAM_CURSOR, STREAM_NEXT_OFFSET, STREAM_UP_TO_DATE,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

use super::{LogStore, ReadOptions, StoreBody, StoreResponse};
use crate::error::ParleyResult;

/// Default cap on entries returned by one catch-up read.
pub const DEFAULT_MAX_BATCH_ENTRIES: usize = 1000;

#[derive(Debug, Clone, Copy)]
struct ProducerState {
    epoch: u64,
    last_seq: u64,
}

#[derive(Debug)]
struct StreamState {
    content_type: String,
    entries: Vec<Bytes>,
    closed: bool,
    deleted: bool,
    producers: HashMap<String, ProducerState>,
}

#[derive(Debug)]
struct MemoryStream {
    state: Mutex<StreamState>,
    changed: Notify,
}

/// Log store held entirely in memory.
#[derive(Debug, Clone)]
pub struct MemoryLogStore {
    streams: Arc<DashMap<String, Arc<MemoryStream>>>,
    max_batch_entries: usize,
}

impl Default for MemoryLogStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BATCH_ENTRIES)
    }
}

impl MemoryLogStore {
    pub fn new(max_batch_entries: usize) -> Self {
        Self {
            streams: Arc::new(DashMap::new()),
            max_batch_entries: max_batch_entries.max(1),
        }
    }

    fn stream(&self, session_id: &str) -> Option<Arc<MemoryStream>> {
        self.streams.get(session_id).map(|s| s.value().clone())
    }
}

// ============================================================================
// Offsets and responses
// ============================================================================

fn format_offset(index: usize) -> String {
    format!("{:016}", index)
}

/// Resolve a requested offset to an entry index, clamped to the tail.
fn resolve_offset(offset: Option<&str>, tail: usize) -> Result<usize, String> {
    match offset {
        None | Some(OFFSET_START) | Some("") => Ok(0),
        Some("now") => Ok(tail),
        Some(raw) => raw
            .parse::<usize>()
            .map(|index| index.min(tail))
            .map_err(|_| format!("invalid offset: {}", raw)),
    }
}

fn header_value(value: impl ToString) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).unwrap_or_else(|_| HeaderValue::from_static(""))
}

fn respond(status: StatusCode, headers: HeaderMap, body: Bytes) -> StoreResponse {
    StoreResponse {
        status,
        headers,
        body: StoreBody::Bytes(body),
    }
}

fn error_response(status: StatusCode, message: &str, mut headers: HeaderMap) -> StoreResponse {
    let body = serde_json::json!({ "error": message }).to_string();
    headers.insert("content-type", HeaderValue::from_static(CONTENT_TYPE_JSON));
    respond(status, headers, Bytes::from(body))
}

fn join_entries(entries: &[Bytes]) -> Vec<u8> {
    let mut body = Vec::with_capacity(entries.iter().map(|e| e.len() + 1).sum::<usize>() + 2);
    body.push(b'[');
    for (i, entry) in entries.iter().enumerate() {
        if i > 0 {
            body.push(b',');
        }
        body.extend_from_slice(entry);
    }
    body.push(b']');
    body
}

fn control_frame(next: usize, up_to_date: bool, closed: bool) -> String {
    let control = serde_json::json!({
        "streamNextOffset": format_offset(next),
        "streamCursor": format_offset(next),
        "upToDate": up_to_date,
        "streamClosed": closed,
    });
    format!("event: control\ndata: {}\n\n", control)
}

fn data_frame(entries: &[Bytes]) -> String {
    format!(
        "event: data\ndata: {}\n\n",
        String::from_utf8_lossy(&join_entries(entries))
    )
}

/// Split an append body into compact entries. A JSON array appends each
/// element.
fn split_body(body: &[u8]) -> Result<Vec<Bytes>, String> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| format!("body is not valid JSON: {}", e))?;
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| {
                serde_json::to_vec(item)
                    .map(Bytes::from)
                    .map_err(|e| e.to_string())
            })
            .collect(),
        single => serde_json::to_vec(&single)
            .map(|bytes| vec![Bytes::from(bytes)])
            .map_err(|e| e.to_string()),
    }
}

struct ProducerHeaders {
    id: String,
    epoch: u64,
    seq: u64,
}

fn parse_producer_headers(headers: &HeaderMap) -> Result<Option<ProducerHeaders>, String> {
    let get = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    match (get(PRODUCER_ID), get(PRODUCER_EPOCH), get(PRODUCER_SEQ)) {
        (None, None, None) => Ok(None),
        (Some(id), Some(epoch), Some(seq)) => {
            if id.is_empty() {
                return Err("producer-id must not be empty".to_string());
            }
            let epoch = epoch
                .parse()
                .map_err(|_| format!("invalid producer-epoch: {}", epoch))?;
            let seq = seq
                .parse()
                .map_err(|_| format!("invalid producer-seq: {}", seq))?;
            Ok(Some(ProducerHeaders {
                id: id.to_string(),
                epoch,
                seq,
            }))
        }
        _ => Err("producer-id, producer-epoch and producer-seq must be sent together".to_string()),
    }
}

// ============================================================================
// LogStore implementation
// ============================================================================

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn create(&self, session_id: &str, content_type: &str) -> ParleyResult<StoreResponse> {
        let mut created = false;
        self.streams.entry(session_id.to_string()).or_insert_with(|| {
            created = true;
            Arc::new(MemoryStream {
                state: Mutex::new(StreamState {
                    content_type: content_type.to_string(),
                    entries: Vec::new(),
                    closed: false,
                    deleted: false,
                    producers: HashMap::new(),
                }),
                changed: Notify::new(),
            })
        });

        if !created {
            return Ok(error_response(
                StatusCode::CONFLICT,
                "stream already exists",
                HeaderMap::new(),
            ));
        }

        info!("Created stream {}", session_id);
        let mut headers = HeaderMap::new();
        headers.insert(STREAM_NEXT_OFFSET, header_value(format_offset(0)));
        Ok(respond(StatusCode::CREATED, headers, Bytes::new()))
    }

    async fn append(
        &self,
        session_id: &str,
        body: Bytes,
        headers: HeaderMap,
    ) -> ParleyResult<StoreResponse> {
        let Some(stream) = self.stream(session_id) else {
            return Ok(error_response(
                StatusCode::NOT_FOUND,
                "stream not found",
                HeaderMap::new(),
            ));
        };

        let producer = match parse_producer_headers(&headers) {
            Ok(producer) => producer,
            Err(msg) => return Ok(error_response(StatusCode::BAD_REQUEST, &msg, HeaderMap::new())),
        };
        let close = headers
            .get(STREAM_CLOSED)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));

        let mut state = stream.state.lock().await;
        if state.deleted {
            return Ok(error_response(
                StatusCode::NOT_FOUND,
                "stream not found",
                HeaderMap::new(),
            ));
        }

        let mut out = HeaderMap::new();
        if let Some(p) = &producer {
            out.insert(PRODUCER_EPOCH, header_value(p.epoch));
            out.insert(PRODUCER_SEQ, header_value(p.seq));
            out.insert(PRODUCER_RECEIVED_SEQ, header_value(p.seq));

            match state.producers.get(&p.id).copied() {
                Some(known) if p.epoch < known.epoch => {
                    out.insert(PRODUCER_EPOCH, header_value(known.epoch));
                    return Ok(error_response(
                        StatusCode::FORBIDDEN,
                        "stale producer epoch",
                        out,
                    ));
                }
                Some(known) if p.epoch == known.epoch => {
                    let expected = known.last_seq + 1;
                    out.insert(PRODUCER_EXPECTED_SEQ, header_value(expected));
                    if p.seq <= known.last_seq {
                        debug!(
                            "Duplicate append on {} from {} (epoch {}, seq {})",
                            session_id, p.id, p.epoch, p.seq
                        );
                        out.insert(STREAM_NEXT_OFFSET, header_value(format_offset(state.entries.len())));
                        return Ok(respond(StatusCode::NO_CONTENT, out, Bytes::new()));
                    }
                    if p.seq > expected {
                        return Ok(error_response(
                            StatusCode::CONFLICT,
                            "producer sequence gap",
                            out,
                        ));
                    }
                }
                _ => {
                    if p.seq != 0 {
                        out.insert(PRODUCER_EXPECTED_SEQ, header_value(0));
                        return Ok(error_response(
                            StatusCode::BAD_REQUEST,
                            "a new producer epoch must start at seq 0",
                            out,
                        ));
                    }
                }
            }
        }

        if state.closed {
            out.insert(STREAM_CLOSED, HeaderValue::from_static("true"));
            return Ok(error_response(StatusCode::CONFLICT, "stream is closed", out));
        }

        let entries = if body.iter().all(u8::is_ascii_whitespace) {
            if !close {
                return Ok(error_response(
                    StatusCode::BAD_REQUEST,
                    "empty append body",
                    out,
                ));
            }
            Vec::new()
        } else if state.content_type.starts_with(CONTENT_TYPE_JSON) {
            match split_body(&body) {
                Ok(entries) => entries,
                Err(msg) => return Ok(error_response(StatusCode::BAD_REQUEST, &msg, out)),
            }
        } else {
            vec![body]
        };

        state.entries.extend(entries);
        if close {
            state.closed = true;
            out.insert(STREAM_CLOSED, HeaderValue::from_static("true"));
        }
        if let Some(p) = producer {
            out.insert(PRODUCER_EXPECTED_SEQ, header_value(p.seq + 1));
            state.producers.insert(
                p.id,
                ProducerState {
                    epoch: p.epoch,
                    last_seq: p.seq,
                },
            );
        }
        out.insert(STREAM_NEXT_OFFSET, header_value(format_offset(state.entries.len())));
        drop(state);

        stream.changed.notify_waiters();
        Ok(respond(StatusCode::OK, out, Bytes::new()))
    }

    async fn read(&self, session_id: &str, options: &ReadOptions) -> ParleyResult<StoreResponse> {
        let Some(stream) = self.stream(session_id) else {
            return Ok(error_response(
                StatusCode::NOT_FOUND,
                "stream not found",
                HeaderMap::new(),
            ));
        };

        let state = stream.state.lock().await;
        if state.deleted {
            return Ok(error_response(
                StatusCode::NOT_FOUND,
                "stream not found",
                HeaderMap::new(),
            ));
        }
        let tail = state.entries.len();
        let start = match resolve_offset(options.offset.as_deref(), tail) {
            Ok(start) => start,
            Err(msg) => return Ok(error_response(StatusCode::BAD_REQUEST, &msg, HeaderMap::new())),
        };

        if options.live {
            drop(state);
            return Ok(live_response(stream, start, self.max_batch_entries));
        }

        let end = tail.min(start + self.max_batch_entries);
        let body = join_entries(&state.entries[start..end]);
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static(CONTENT_TYPE_JSON));
        headers.insert("cache-control", HeaderValue::from_static("no-store"));
        headers.insert(
            "etag",
            header_value(format!("\"{}:{}:{}\"", session_id, start, end)),
        );
        headers.insert("content-length", header_value(body.len()));
        headers.insert(STREAM_NEXT_OFFSET, header_value(format_offset(end)));
        headers.insert(STREAM_CURSOR, header_value(format_offset(end)));
        if end == tail {
            headers.insert(STREAM_UP_TO_DATE, HeaderValue::from_static("true"));
            if state.closed {
                headers.insert(STREAM_CLOSED, HeaderValue::from_static("true"));
            }
        }

        Ok(respond(StatusCode::OK, headers, Bytes::from(body)))
    }

    async fn head(&self, session_id: &str) -> ParleyResult<StoreResponse> {
        let Some(stream) = self.stream(session_id) else {
            return Ok(respond(StatusCode::NOT_FOUND, HeaderMap::new(), Bytes::new()));
        };
        let state = stream.state.lock().await;
        if state.deleted {
            return Ok(respond(StatusCode::NOT_FOUND, HeaderMap::new(), Bytes::new()));
        }

        let mut headers = HeaderMap::new();
        headers.insert("content-type", header_value(&state.content_type));
        headers.insert(
            STREAM_NEXT_OFFSET,
            header_value(format_offset(state.entries.len())),
        );
        if state.closed {
            headers.insert(STREAM_CLOSED, HeaderValue::from_static("true"));
        }
        Ok(respond(StatusCode::OK, headers, Bytes::new()))
    }

    async fn delete(&self, session_id: &str) -> ParleyResult<StoreResponse> {
        let Some((_, stream)) = self.streams.remove(session_id) else {
            return Ok(error_response(
                StatusCode::NOT_FOUND,
                "stream not found",
                HeaderMap::new(),
            ));
        };

        stream.state.lock().await.deleted = true;
        stream.changed.notify_waiters();
        info!("Deleted stream {}", session_id);
        Ok(respond(StatusCode::NO_CONTENT, HeaderMap::new(), Bytes::new()))
    }
}

// ============================================================================
// Live tail
// ============================================================================

struct LiveCursor {
    stream: Arc<MemoryStream>,
    offset: usize,
    max_batch: usize,
    finished: bool,
}

fn live_response(stream: Arc<MemoryStream>, start: usize, max_batch: usize) -> StoreResponse {
    let mut headers = HeaderMap::new();
    headers.insert(
        "content-type",
        HeaderValue::from_static(CONTENT_TYPE_EVENT_STREAM),
    );
    headers.insert("cache-control", HeaderValue::from_static("no-cache"));
    headers.insert(STREAM_NEXT_OFFSET, header_value(format_offset(start)));

    let cursor = LiveCursor {
        stream,
        offset: start,
        max_batch,
        finished: false,
    };

    let body = futures::stream::unfold(cursor, |mut cursor| async move {
        if cursor.finished {
            return None;
        }
        let stream = cursor.stream.clone();
        loop {
            // Register interest before checking state so an append between
            // the check and the wait is not missed.
            let notified = stream.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = stream.state.lock().await;
                if state.deleted {
                    return None;
                }
                let tail = state.entries.len();
                if cursor.offset < tail {
                    let end = tail.min(cursor.offset + cursor.max_batch);
                    let mut frame = data_frame(&state.entries[cursor.offset..end]);
                    let up_to_date = end == tail;
                    let closed = up_to_date && state.closed;
                    frame.push_str(&control_frame(end, up_to_date, closed));
                    cursor.offset = end;
                    cursor.finished = closed;
                    return Some((Ok(Bytes::from(frame)), cursor));
                }
                if state.closed {
                    cursor.finished = true;
                    return Some((Ok(Bytes::from(control_frame(tail, true, true))), cursor));
                }
            }

            notified.await;
        }
    });

    StoreResponse {
        status: StatusCode::OK,
        headers,
        body: StoreBody::Stream(Box::pin(body)),
    }
}
