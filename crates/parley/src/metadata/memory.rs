//! In-memory session metadata.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use super::{SessionMetadata, SessionMetadataStore};

#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    sessions: DashMap<String, SessionMetadata>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionMetadataStore for MemoryMetadataStore {
    async fn touch(&self, session_id: &str, actor_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.sessions
            .entry(session_id.to_string())
            .and_modify(|meta| meta.last_active_at = now.clone())
            .or_insert_with(|| SessionMetadata {
                id: session_id.to_string(),
                owner_id: actor_id.to_string(),
                title: None,
                created_at: now.clone(),
                last_active_at: now.clone(),
            });
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<SessionMetadata>> {
        Ok(self.sessions.get(session_id).map(|m| m.value().clone()))
    }

    async fn set_title(&self, session_id: &str, title: &str) -> Result<()> {
        if let Some(mut meta) = self.sessions.get_mut(session_id) {
            meta.title = Some(title.to_string());
        }
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<bool> {
        Ok(self.sessions.remove(session_id).is_some())
    }
}
