//! Wire types for the Parley session event log.
//!
//! Every session owns one append-only log. Each entry in that log is a
//! [`LogEntry`]: a deterministic key (`<messageId>:<seq>`), a [`ChunkRecord`]
//! value, and optional producer headers.
//!
//! ```text
//! Client ──[POST messages/approvals/control]──┐
//!                                              ├──> Encoder ──> Producer ──> log store
//! Agent run (coordinator) ─────────────────────┘
//!
//! Client <──[GET stream: catch-up | live SSE]── Consumer proxy <── log store
//! ```
//!
//! The chunk itself is a JSON-encoded [`ChunkPayload`], tagged by `type`.
//! Streamed agent output travels as [`ChunkPayload::Stream`] carrying a
//! [`StreamChunk`]; every agent run ends with exactly one terminal stream chunk.

pub mod chunk;
pub mod entry;
pub mod headers;

pub use chunk::{
    ChunkPayload, ControlAction, Message, PermissionMode, Role, SessionConfig, StreamChunk,
};
pub use entry::{ChunkRecord, EntryHeaders, LogEntry};
