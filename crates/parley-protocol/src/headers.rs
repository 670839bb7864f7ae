//! HTTP header names used by the log store protocol.
//!
//! Header names are lowercase; HTTP treats them case-insensitively.

pub const STREAM_NEXT_OFFSET: &str = "stream-next-offset";
pub const STREAM_CURSOR: &str = "stream-cursor";
pub const STREAM_UP_TO_DATE: &str = "stream-up-to-date";
pub const STREAM_CLOSED: &str = "stream-closed";

pub const PRODUCER_ID: &str = "producer-id";
pub const PRODUCER_EPOCH: &str = "producer-epoch";
pub const PRODUCER_SEQ: &str = "producer-seq";
pub const PRODUCER_RECEIVED_SEQ: &str = "producer-received-seq";
pub const PRODUCER_EXPECTED_SEQ: &str = "producer-expected-seq";

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_EVENT_STREAM: &str = "text/event-stream";

/// Headers relayed from a store read to the consumer. Everything else is dropped.
pub const RELAYED_READ_HEADERS: &[&str] = &[
    STREAM_NEXT_OFFSET,
    STREAM_CURSOR,
    STREAM_UP_TO_DATE,
    STREAM_CLOSED,
    "content-type",
    "cache-control",
    "etag",
];

/// Transport-framing headers that must never be relayed with a raw body;
/// the layer that re-serializes the response recomputes them.
pub const STRIPPED_BODY_HEADERS: &[&str] =
    &["content-encoding", "content-length", "transfer-encoding"];

/// Headers relayed from a store append back to the producer.
pub const RELAYED_APPEND_HEADERS: &[&str] = &[
    STREAM_NEXT_OFFSET,
    STREAM_CLOSED,
    PRODUCER_EPOCH,
    PRODUCER_SEQ,
    PRODUCER_RECEIVED_SEQ,
    PRODUCER_EXPECTED_SEQ,
    "content-type",
];

/// Offset meaning "from the beginning of the stream".
pub const OFFSET_START: &str = "-1";
