//! Error taxonomy for log store, producer, proxy and run coordination.

use thiserror::Error;

/// Errors surfaced by the session log and the run coordinator.
#[derive(Debug, Error)]
pub enum ParleyError {
    /// Malformed input rejected before anything was written.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The session stream does not exist in the log store.
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    /// The log store answered with a status we do not map to a specific kind.
    #[error("log store returned {status}: {details}")]
    Upstream { status: u16, details: String },

    /// The store's idempotency state diverged from the producer's.
    #[error("producer sequence mismatch: store expected {expected}, received {received}")]
    SequenceMismatch { expected: u64, received: u64 },

    /// The stream was closed; no further appends are accepted.
    #[error("stream closed: {0}")]
    StreamClosed(String),

    /// A newer producer epoch has taken over this stream.
    #[error("producer fenced: store is at epoch {current_epoch}")]
    ProducerFenced { current_epoch: u64 },

    /// No active run exists for the session.
    #[error("no active run for session {0}")]
    RunNotFound(String),

    /// The run exists but is not waiting for this decision.
    #[error("no pending approval: {0}")]
    ApprovalNotPending(String),

    /// The model provider or a tool failed during a run.
    #[error("generation failed: {0}")]
    Generation(String),

    /// The run was cancelled by its caller or superseded.
    #[error("aborted by caller")]
    AbortedByCaller,

    /// The request never reached the log store.
    #[error("log store unavailable: {0}")]
    Unavailable(String),

    /// The request may have reached the log store but the response was lost.
    #[error("log store transport error: {0}")]
    Transport(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ParleyError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Map a transport failure from the HTTP client. Connection failures are
    /// known not to have reached the store.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_connect() {
            Self::Unavailable(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ParleyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization: {}", err))
    }
}

pub type ParleyResult<T> = Result<T, ParleyError>;
