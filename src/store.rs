use crate::{
    chat::{ChatMessage, MessageId},
    entity::RoomId,
};
use anyhow::{Context, Result};
use sqlx::{sqlite::SqliteConnectOptions, ConnectOptions, Row, SqlitePool};
use std::{path::Path, str::FromStr};

/// Local persisted client state: the key/value table that stands in for
/// browser storage, plus a per-room message cache.
#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Create a new Store instance.
    /// This will automatically create the database file if it doesn't exist.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        // Ensure the parent directory exists
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Ok(Self { pool })
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS client_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create client_state table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER NOT NULL,
                room_id INTEGER NOT NULL,
                sender_id INTEGER NOT NULL,
                sender_name TEXT NOT NULL,
                sender_image TEXT,
                text TEXT NOT NULL,
                sent_at_time DATETIME NOT NULL,
                PRIMARY KEY (room_id, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create messages table")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_room_time ON messages(room_id, sent_at_time DESC)",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create messages index")?;

        Ok(())
    }

    pub async fn get_value(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM client_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to read client state {key}"))?;

        Ok(match row {
            Some(row) => Some(row.try_get("value")?),
            None => None,
        })
    }

    pub async fn set_value(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO client_state (key, value)
            VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to write client state {key}"))?;

        Ok(())
    }

    pub async fn remove_value(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM client_state WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to remove client state {key}"))?;
        Ok(())
    }

    /// Cache a chat message. Re-saving the same id is a no-op.
    pub async fn save_message(&self, room_id: RoomId, msg: &ChatMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO messages
                (id, room_id, sender_id, sender_name, sender_image, text, sent_at_time)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(msg.id)
        .bind(room_id)
        .bind(msg.sender_id)
        .bind(&msg.sender_name)
        .bind(&msg.sender_image)
        .bind(&msg.text)
        .bind(msg.sent_at_time)
        .execute(&self.pool)
        .await
        .context("Failed to save message")?;

        Ok(())
    }

    /// Retrieve the cached tail of a room.
    /// Returns messages ordered oldest to newest.
    pub async fn cached_history(&self, room_id: RoomId, limit: i64) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, sender_id, sender_name, sender_image, text, sent_at_time
            FROM messages
            WHERE room_id = ?
            ORDER BY sent_at_time DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(room_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch cached history")?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            messages.push(ChatMessage {
                id: row.try_get::<MessageId, _>("id")?,
                sender_id: row.try_get("sender_id")?,
                sender_name: row.try_get("sender_name")?,
                sender_image: row.try_get("sender_image")?,
                text: row.try_get("text")?,
                sent_at_time: row.try_get("sent_at_time")?,
            });
        }

        // Return in chronological order (oldest -> newest)
        messages.reverse();

        Ok(messages)
    }
}
