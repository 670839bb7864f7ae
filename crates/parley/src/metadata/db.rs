//! SQLite-backed session metadata.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::{SessionMetadata, SessionMetadataStore};

/// Database connection pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database at `path` and run migrations.
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory: {}", parent.display()))?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", path.display());
        let options = SqliteConnectOptions::from_str(&database_url)
            .context("parsing database URL")?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("connecting to database")?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Create an in-memory database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("parsing in-memory database URL")?;

        // A single connection keeps every query on the same in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("connecting to in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running database migrations")?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// [`SessionMetadataStore`] over the `sessions` table.
#[derive(Debug, Clone)]
pub struct SqliteMetadataStore {
    db: Database,
}

impl SqliteMetadataStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionMetadataStore for SqliteMetadataStore {
    async fn touch(&self, session_id: &str, actor_id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO sessions (id, owner_id, title, created_at, last_active_at)
            VALUES (?, ?, NULL, ?, ?)
            ON CONFLICT(id) DO UPDATE SET last_active_at = excluded.last_active_at
            "#,
        )
        .bind(session_id)
        .bind(actor_id)
        .bind(&now)
        .bind(&now)
        .execute(self.db.pool())
        .await
        .context("touching session")?;
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<SessionMetadata>> {
        sqlx::query_as::<_, SessionMetadata>(
            "SELECT id, owner_id, title, created_at, last_active_at FROM sessions WHERE id = ?",
        )
        .bind(session_id)
        .fetch_optional(self.db.pool())
        .await
        .context("fetching session")
    }

    async fn set_title(&self, session_id: &str, title: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET title = ? WHERE id = ?")
            .bind(title)
            .bind(session_id)
            .execute(self.db.pool())
            .await
            .context("updating session title")?;
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(session_id)
            .execute(self.db.pool())
            .await
            .context("deleting session")?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteMetadataStore {
        SqliteMetadataStore::new(Database::in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_touch_creates_then_updates() {
        let store = store().await;
        store.touch("s1", "alice").await.unwrap();
        let first = store.get("s1").await.unwrap().unwrap();
        assert_eq!(first.owner_id, "alice");
        assert_eq!(first.title, None);

        store.touch("s1", "bob").await.unwrap();
        let second = store.get("s1").await.unwrap().unwrap();
        assert_eq!(second.owner_id, "alice");
        assert_eq!(second.created_at, first.created_at);
        assert!(second.last_active_at >= first.last_active_at);
    }

    #[tokio::test]
    async fn test_title_and_delete() {
        let store = store().await;
        store.touch("s1", "alice").await.unwrap();
        store.set_title("s1", "Fix the build").await.unwrap();
        assert_eq!(
            store.get("s1").await.unwrap().unwrap().title.as_deref(),
            Some("Fix the build")
        );

        assert!(store.delete("s1").await.unwrap());
        assert!(!store.delete("s1").await.unwrap());
        assert!(store.get("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_database_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("parley.db");
        let store = SqliteMetadataStore::new(Database::new(&path).await.unwrap());
        store.touch("s1", "alice").await.unwrap();
        assert!(path.exists());
    }
}
