//! Collected-message storage (SQLite).

use crate::ScopeId;
use crate::error::Result;
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use sqlx::Row as _;
use sqlx::SqlitePool;
use std::collections::BTreeMap;

/// A collected chat message, as fed into analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRecord {
    /// Platform message id, unique within a chat.
    pub message_id: i64,
    pub chat_id: ScopeId,
    pub author_id: i64,
    pub author_name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Emoji -> count. Ordered so serialization is deterministic.
    pub reactions: BTreeMap<String, i64>,
    pub reply_to_message_id: Option<i64>,
}

/// Message store for ingestion and windowed retrieval.
pub struct MessageStore {
    pool: SqlitePool,
}

impl MessageStore {
    /// Create a new message store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the messages table.
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id INTEGER NOT NULL,
                chat_id INTEGER NOT NULL,
                author_id INTEGER NOT NULL,
                author_name TEXT NOT NULL,
                text TEXT NOT NULL,
                timestamp TIMESTAMP NOT NULL,
                reactions TEXT,
                reply_to_message_id INTEGER,
                UNIQUE(message_id, chat_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create messages table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp)")
            .execute(&self.pool)
            .await
            .context("failed to create messages timestamp index")?;

        Ok(())
    }

    /// Insert a collected message. Re-delivery of the same (chat, message) pair
    /// overwrites the stored text.
    pub async fn insert(&self, record: &ChatRecord) -> Result<()> {
        let reactions =
            serde_json::to_string(&record.reactions).context("failed to encode reactions")?;

        sqlx::query(
            r#"
            INSERT INTO messages (message_id, chat_id, author_id, author_name, text, timestamp, reactions, reply_to_message_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(message_id, chat_id) DO UPDATE SET
                text = excluded.text,
                reactions = excluded.reactions
            "#,
        )
        .bind(record.message_id)
        .bind(record.chat_id)
        .bind(record.author_id)
        .bind(&record.author_name)
        .bind(&record.text)
        .bind(record.timestamp)
        .bind(reactions)
        .bind(record.reply_to_message_id)
        .execute(&self.pool)
        .await
        .context("failed to insert message")?;

        Ok(())
    }

    /// Replace the reaction counts on a stored message. Missing messages are
    /// ignored (reactions can arrive for messages collected before a restart).
    pub async fn update_reactions(
        &self,
        chat_id: ScopeId,
        message_id: i64,
        reactions: &BTreeMap<String, i64>,
    ) -> Result<()> {
        let encoded = serde_json::to_string(reactions).context("failed to encode reactions")?;

        sqlx::query("UPDATE messages SET reactions = ? WHERE chat_id = ? AND message_id = ?")
            .bind(encoded)
            .bind(chat_id)
            .bind(message_id)
            .execute(&self.pool)
            .await
            .context("failed to update reactions")?;

        Ok(())
    }

    /// Current reaction counts on a stored message. Unknown messages read as
    /// no reactions.
    pub async fn reactions_for(
        &self,
        chat_id: ScopeId,
        message_id: i64,
    ) -> Result<BTreeMap<String, i64>> {
        let row = sqlx::query("SELECT reactions FROM messages WHERE chat_id = ? AND message_id = ?")
            .bind(chat_id)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to read reactions")?;

        Ok(row
            .and_then(|r| r.try_get::<Option<String>, _>("reactions").ok().flatten())
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default())
    }

    /// Fetch all messages in a chat since `since`, oldest first.
    pub async fn fetch_since(
        &self,
        chat_id: ScopeId,
        since: DateTime<Utc>,
    ) -> Result<Vec<ChatRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT message_id, chat_id, author_id, author_name, text, timestamp, reactions, reply_to_message_id
            FROM messages
            WHERE chat_id = ? AND timestamp >= ?
            ORDER BY timestamp ASC, message_id ASC
            "#,
        )
        .bind(chat_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch messages")?;

        let records = rows
            .into_iter()
            .map(|row| {
                let reactions: Option<String> = row.try_get("reactions").ok();
                ChatRecord {
                    message_id: row.try_get("message_id").unwrap_or_default(),
                    chat_id: row.try_get("chat_id").unwrap_or_default(),
                    author_id: row.try_get("author_id").unwrap_or_default(),
                    author_name: row.try_get("author_name").unwrap_or_default(),
                    text: row.try_get("text").unwrap_or_default(),
                    timestamp: row
                        .try_get::<DateTime<Utc>, _>("timestamp")
                        .unwrap_or_else(|_| Utc::now()),
                    reactions: reactions
                        .and_then(|raw| serde_json::from_str(&raw).ok())
                        .unwrap_or_default(),
                    reply_to_message_id: row.try_get("reply_to_message_id").ok(),
                }
            })
            .collect();

        Ok(records)
    }

    /// Delete messages older than `cutoff`. Returns the number removed.
    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("failed to delete old messages")?;

        Ok(result.rows_affected())
    }

    /// Delete every stored message. Returns the number removed.
    pub async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM messages")
            .execute(&self.pool)
            .await
            .context("failed to clear messages")?;

        Ok(result.rows_affected())
    }

    /// Total stored message count.
    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM messages")
            .fetch_one(&self.pool)
            .await
            .context("failed to count messages")?;

        Ok(row.try_get("count").unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_store() -> MessageStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite should connect");

        let store = MessageStore::new(pool);
        store.initialize().await.expect("schema should initialize");
        store
    }

    fn record(chat_id: i64, message_id: i64, text: &str, timestamp: DateTime<Utc>) -> ChatRecord {
        ChatRecord {
            message_id,
            chat_id,
            author_id: 7,
            author_name: "alice".into(),
            text: text.into(),
            timestamp,
            reactions: BTreeMap::new(),
            reply_to_message_id: None,
        }
    }

    #[tokio::test]
    async fn fetch_since_scopes_by_chat_and_window() {
        let store = setup_store().await;
        let now = Utc::now();

        store.insert(&record(1, 10, "in window", now)).await.unwrap();
        store
            .insert(&record(1, 9, "too old", now - Duration::hours(48)))
            .await
            .unwrap();
        store.insert(&record(2, 10, "other chat", now)).await.unwrap();

        let fetched = store
            .fetch_since(1, now - Duration::hours(24))
            .await
            .expect("fetch should succeed");

        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].text, "in window");
    }

    #[tokio::test]
    async fn reinserted_message_updates_text_not_duplicates() {
        let store = setup_store().await;
        let now = Utc::now();

        store.insert(&record(1, 10, "original", now)).await.unwrap();
        store.insert(&record(1, 10, "edited", now)).await.unwrap();

        let fetched = store.fetch_since(1, now - Duration::hours(1)).await.unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].text, "edited");
    }

    #[tokio::test]
    async fn reactions_round_trip_and_update() {
        let store = setup_store().await;
        let now = Utc::now();

        store.insert(&record(1, 10, "hello", now)).await.unwrap();

        let mut reactions = BTreeMap::new();
        reactions.insert("👍".to_string(), 3);
        store.update_reactions(1, 10, &reactions).await.unwrap();

        let fetched = store.fetch_since(1, now - Duration::hours(1)).await.unwrap();
        assert_eq!(fetched[0].reactions.get("👍"), Some(&3));

        let read_back = store.reactions_for(1, 10).await.unwrap();
        assert_eq!(read_back.get("👍"), Some(&3));
        assert!(store.reactions_for(1, 999).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_older_than_reports_count() {
        let store = setup_store().await;
        let now = Utc::now();

        store
            .insert(&record(1, 1, "stale", now - Duration::hours(200)))
            .await
            .unwrap();
        store.insert(&record(1, 2, "fresh", now)).await.unwrap();

        let removed = store
            .delete_older_than(now - Duration::hours(168))
            .await
            .expect("delete should succeed");

        assert_eq!(removed, 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn clear_empties_the_store() {
        let store = setup_store().await;
        let now = Utc::now();

        store.insert(&record(1, 1, "a", now)).await.unwrap();
        store.insert(&record(2, 2, "b", now)).await.unwrap();

        assert_eq!(store.clear().await.unwrap(), 2);
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
