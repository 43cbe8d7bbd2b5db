//! SQLite storage layer for chat message persistence.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{sqlite::SqlitePool, Row};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::models::{Message, MessageKind};

/// Persistence used by the hub and the HTTP layer.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a message.
    async fn save(&self, message: &Message) -> Result<()>;

    /// The newest `limit` messages, oldest first.
    async fn recent(&self, limit: usize) -> Result<Vec<Message>>;

    /// Total number of stored messages.
    async fn count_all(&self) -> Result<i64>;

    /// Delete messages created before `now - age`. Returns rows removed.
    async fn purge_older_than(&self, age: chrono::Duration) -> Result<u64>;

    /// Messages created within `[start, end]`, oldest first.
    async fn between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Message>>;
}

/// Storage manager for chat messages.
#[derive(Clone)]
pub struct Storage {
    pool: Arc<SqlitePool>,
}

impl Storage {
    /// Create a new storage instance.
    pub async fn new(db_path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePool::connect(&db_url).await?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Initialize the database schema.
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                user_id TEXT,
                username TEXT NOT NULL,
                content TEXT NOT NULL,
                type TEXT NOT NULL DEFAULT 'text',
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&*self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_created_at ON messages(created_at)")
            .execute(&*self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_type ON messages(type)")
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    fn rows_to_messages(&self, rows: &[sqlx::sqlite::SqliteRow]) -> Vec<Message> {
        rows.iter()
            .filter_map(|row| match self.row_to_message(row) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!("Skipping unreadable message row: {}", e);
                    None
                }
            })
            .collect()
    }

    fn row_to_message(&self, row: &sqlx::sqlite::SqliteRow) -> Result<Message> {
        let kind: String = row.try_get("type")?;
        let created_at: String = row.try_get("created_at")?;

        Ok(Message {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            username: row.try_get("username")?,
            content: row.try_get("content")?,
            kind: kind.parse::<MessageKind>()?,
            created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        })
    }
}

/// Fixed-width UTC timestamps so that string order matches time order.
fn timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

#[async_trait]
impl MessageStore for Storage {
    async fn save(&self, message: &Message) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, user_id, username, content, type, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(&message.user_id)
        .bind(&message.username)
        .bind(&message.content)
        .bind(message.kind.to_string())
        .bind(timestamp(&message.created_at))
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, username, content, type, created_at
            FROM messages
            ORDER BY created_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await?;

        let mut messages = self.rows_to_messages(&rows);
        messages.reverse();
        Ok(messages)
    }

    async fn count_all(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM messages")
            .fetch_one(&*self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("total")?)
    }

    async fn purge_older_than(&self, age: chrono::Duration) -> Result<u64> {
        let cutoff = Utc::now() - age;
        let result = sqlx::query("DELETE FROM messages WHERE created_at < ?")
            .bind(timestamp(&cutoff))
            .execute(&*self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, username, content, type, created_at
            FROM messages
            WHERE created_at BETWEEN ? AND ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(timestamp(&start))
        .bind(timestamp(&end))
        .fetch_all(&*self.pool)
        .await?;

        Ok(self.rows_to_messages(&rows))
    }
}

/// Periodically delete messages older than `max_age`.
pub fn spawn_purge_task(
    store: Arc<dyn MessageStore>,
    max_age: chrono::Duration,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            match store.purge_older_than(max_age).await {
                Ok(0) => {}
                Ok(removed) => info!("Retention purge removed {} message(s)", removed),
                Err(e) => error!("Retention purge failed: {}", e),
            }
        }
    })
}
