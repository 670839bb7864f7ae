//! Consumer proxy.
//!
//! Relays store reads to clients: catch-up batches in one round trip, or a
//! live SSE tail. Only stream-protocol headers cross the boundary.

use axum::http::{HeaderMap, HeaderName, StatusCode};
use bytes::Bytes;
use futures::stream::BoxStream;
use log::debug;
use parley_protocol::LogEntry;
use parley_protocol::headers::{
    OFFSET_START, RELAYED_READ_HEADERS, STREAM_CLOSED, STREAM_CURSOR, STREAM_NEXT_OFFSET,
    STREAM_UP_TO_DATE, STRIPPED_BODY_HEADERS,
};
use std::sync::Arc;

use crate::encoder;
use crate::error::{ParleyError, ParleyResult};
use crate::store::{LogStore, ReadOptions, StoreBody, error_details, validate_session_id};

/// Upper bound on catch-up pages fetched when rebuilding a session.
const MAX_HISTORY_PAGES: usize = 10_000;

/// Body of a relayed read.
pub enum ReadBody {
    Batch(Bytes),
    Live(BoxStream<'static, ParleyResult<Bytes>>),
}

/// A read response ready to be sent to a consumer.
pub struct ReadResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ReadBody,
}

impl ReadResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn next_offset(&self) -> Option<&str> {
        self.header(STREAM_NEXT_OFFSET)
    }

    pub fn is_up_to_date(&self) -> bool {
        self.header(STREAM_UP_TO_DATE) == Some("true")
    }

    pub fn is_closed(&self) -> bool {
        self.header(STREAM_CLOSED) == Some("true")
    }
}

/// A decoded catch-up batch.
#[derive(Debug, Clone, Default)]
pub struct CatchUpBatch {
    pub entries: Vec<LogEntry>,
    pub next_offset: Option<String>,
    pub cursor: Option<String>,
    pub up_to_date: bool,
    pub closed: bool,
}

/// Keep only the stream-protocol headers of a store read.
pub fn relay_read_headers(source: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for name in RELAYED_READ_HEADERS {
        if let Some(value) = source.get(*name) {
            headers.insert(HeaderName::from_static(name), value.clone());
        }
    }
    strip_body_headers(&mut headers);
    headers
}

/// Remove transport-framing headers that no longer describe a relayed body.
pub fn strip_body_headers(headers: &mut HeaderMap) {
    for name in STRIPPED_BODY_HEADERS {
        headers.remove(*name);
    }
}

/// Reads session streams on behalf of consumers.
#[derive(Clone)]
pub struct ConsumerProxy {
    store: Arc<dyn LogStore>,
}

impl ConsumerProxy {
    pub fn new(store: Arc<dyn LogStore>) -> Self {
        Self { store }
    }

    /// Read from the store and filter the response for relaying.
    pub async fn read(&self, session_id: &str, options: &ReadOptions) -> ParleyResult<ReadResponse> {
        validate_session_id(session_id)?;
        let resp = self.store.read(session_id, options).await?;
        let status = resp.status;

        if status == StatusCode::NOT_FOUND {
            return Err(ParleyError::StreamNotFound(session_id.to_string()));
        }
        if !status.is_success() {
            let details = match resp.body {
                StoreBody::Bytes(body) => error_details(status, &body),
                StoreBody::Stream(_) => error_details(status, b""),
            };
            return Err(ParleyError::Upstream {
                status: status.as_u16(),
                details,
            });
        }

        let headers = relay_read_headers(&resp.headers);
        let body = match resp.body {
            StoreBody::Bytes(bytes) => ReadBody::Batch(bytes),
            StoreBody::Stream(stream) => ReadBody::Live(stream),
        };

        if options.live {
            debug!(
                "Live read on {} from offset {}",
                session_id,
                options.offset.as_deref().unwrap_or(OFFSET_START)
            );
        }

        Ok(ReadResponse {
            status,
            headers,
            body,
        })
    }

    /// Stream metadata (next offset, closed flag) without a body.
    pub async fn head(&self, session_id: &str) -> ParleyResult<HeaderMap> {
        validate_session_id(session_id)?;
        let resp = self.store.head(session_id).await?;
        match resp.status {
            s if s.is_success() => Ok(relay_read_headers(&resp.headers)),
            StatusCode::NOT_FOUND => Err(ParleyError::StreamNotFound(session_id.to_string())),
            status => Err(ParleyError::Upstream {
                status: status.as_u16(),
                details: error_details(status, b""),
            }),
        }
    }

    /// One decoded catch-up batch starting at `offset`.
    pub async fn catch_up(&self, session_id: &str, offset: Option<&str>) -> ParleyResult<CatchUpBatch> {
        let options = ReadOptions {
            offset: offset.map(str::to_string),
            ..ReadOptions::default()
        };
        let resp = self.read(session_id, &options).await?;
        let next_offset = resp.next_offset().map(str::to_string);
        let cursor = resp.header(STREAM_CURSOR).map(str::to_string);
        let up_to_date = resp.is_up_to_date();
        let closed = resp.is_closed();

        let entries = match resp.body {
            ReadBody::Batch(body) => encoder::decode_batch(&body)?,
            ReadBody::Live(_) => {
                return Err(ParleyError::internal("store answered a catch-up read with a live body"));
            }
        };

        Ok(CatchUpBatch {
            entries,
            next_offset,
            cursor,
            up_to_date,
            closed,
        })
    }

    /// Every entry in the session, paging through catch-up reads.
    pub async fn read_entries(&self, session_id: &str) -> ParleyResult<Vec<LogEntry>> {
        let mut entries = Vec::new();
        let mut offset: Option<String> = None;

        for _ in 0..MAX_HISTORY_PAGES {
            let batch = self.catch_up(session_id, offset.as_deref()).await?;
            entries.extend(batch.entries);

            if batch.up_to_date {
                return Ok(entries);
            }
            match batch.next_offset {
                Some(next) if offset.as_deref() != Some(next.as_str()) => offset = Some(next),
                _ => return Ok(entries),
            }
        }

        Err(ParleyError::internal(format!(
            "session {} exceeded {} history pages",
            session_id, MAX_HISTORY_PAGES
        )))
    }
}
