//! Session metadata: owner, title and last activity.
//!
//! The conversation itself lives in the log store. Metadata is a side
//! record kept by the API layer; failures to update it never fail a write
//! to the log.

mod db;
mod memory;

pub use db::{Database, SqliteMetadataStore};
pub use memory::MemoryMetadataStore;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use sqlx::FromRow;

/// Metadata of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub id: String,
    /// User who first wrote to the session.
    pub owner_id: String,
    pub title: Option<String>,
    /// RFC 3339 timestamps.
    pub created_at: String,
    pub last_active_at: String,
}

#[async_trait]
pub trait SessionMetadataStore: Send + Sync {
    /// Record activity on a session, creating its record on first use.
    async fn touch(&self, session_id: &str, actor_id: &str) -> Result<()>;

    async fn get(&self, session_id: &str) -> Result<Option<SessionMetadata>>;

    async fn set_title(&self, session_id: &str, title: &str) -> Result<()>;

    /// Remove the session's record. Returns whether one existed.
    async fn delete(&self, session_id: &str) -> Result<bool>;
}
