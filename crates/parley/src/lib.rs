//! Parley: a per-session append-only event log for collaborative agent chat.
//!
//! Producers (user requests, agent runs, tool-result callbacks, approvals)
//! append ordered entries to one log per session. Consumers read it back in
//! catch-up batches or tail it live over SSE. The coordinator keeps at most
//! one agent run per session and writes every run's output through an
//! idempotent producer.

pub mod api;
pub mod auth;
pub mod config;
pub mod coordinator;
pub mod encoder;
pub mod error;
pub mod metadata;
pub mod producer;
pub mod provider;
pub mod proxy;
pub mod store;
pub mod tools;

pub use error::{ParleyError, ParleyResult};
