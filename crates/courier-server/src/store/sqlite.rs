//! SQLite-backed [`Store`] implementation.
//!
//! The schema mirrors the relay's data model: `users`, `conversations`, and
//! `messages`, with timestamps persisted as RFC 3339 text. SQLite's
//! single-writer semantics give the per-row read-after-write consistency the
//! `Store` contract asks for.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use courier_core::model::{
    Conversation, ConversationId, Message, MessageId, MessageStatus, Presence, User, UserId,
};

use super::{NewMessage, NewUser, Store, StoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL,
    email TEXT NOT NULL UNIQUE,
    google_id TEXT,
    image_url TEXT,
    status TEXT NOT NULL DEFAULT 'offline',
    last_active TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS conversations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_a INTEGER NOT NULL,
    user_b INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id INTEGER NOT NULL,
    sender_id INTEGER NOT NULL,
    recipient_id INTEGER NOT NULL,
    content TEXT NOT NULL,
    media_ref TEXT,
    status TEXT NOT NULL DEFAULT 'sent',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON messages (conversation_id, created_at);
"#;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if missing) the database at `url` and applies the
    /// schema.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Database(format!("invalid database url: {e}")))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database. A single pooled connection keeps it
    /// alive for the store's lifetime.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Database(format!("invalid database url: {e}")))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        debug!("database schema applied");
        Ok(())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database(err.to_string())
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Database(format!("malformed timestamp '{raw}': {e}")))
}

fn parse_status(raw: &str) -> Result<MessageStatus, StoreError> {
    raw.parse()
        .map_err(|e| StoreError::Database(format!("{e}")))
}

/// Presence is persisted as its kind only; a stale `typing` row rehydrates
/// as online since the typing target is transient state.
fn presence_from_column(raw: &str) -> Presence {
    match raw {
        "online" | "typing" => Presence::Online,
        _ => Presence::Offline,
    }
}

fn row_to_message(row: &SqliteRow) -> Result<Message, StoreError> {
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(Message {
        id: MessageId(row.try_get("id")?),
        conversation_id: ConversationId(row.try_get("conversation_id")?),
        sender_id: UserId(row.try_get("sender_id")?),
        recipient_id: UserId(row.try_get("recipient_id")?),
        content: row.try_get("content")?,
        media_ref: row.try_get("media_ref")?,
        status: parse_status(&status)?,
        created_at: parse_timestamp(&created_at)?,
    })
}

fn row_to_conversation(row: &SqliteRow) -> Result<Conversation, StoreError> {
    let created_at: String = row.try_get("created_at")?;
    Ok(Conversation {
        id: ConversationId(row.try_get("id")?),
        user_a: UserId(row.try_get("user_a")?),
        user_b: UserId(row.try_get("user_b")?),
        created_at: parse_timestamp(&created_at)?,
    })
}

fn row_to_user(row: &SqliteRow) -> Result<User, StoreError> {
    let status: String = row.try_get("status")?;
    let last_active: String = row.try_get("last_active")?;
    let created_at: String = row.try_get("created_at")?;
    Ok(User {
        id: UserId(row.try_get("id")?),
        username: row.try_get("username")?,
        email: row.try_get("email")?,
        google_id: row.try_get("google_id")?,
        image_url: row.try_get("image_url")?,
        status: presence_from_column(&status),
        last_active: parse_timestamp(&last_active)?,
        created_at: parse_timestamp(&created_at)?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_message(&self, new: NewMessage) -> Result<Message, StoreError> {
        let created_at = Utc::now();
        let result = sqlx::query(
            "INSERT INTO messages (conversation_id, sender_id, recipient_id, content, media_ref, status, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(new.conversation_id.0)
        .bind(new.sender_id.0)
        .bind(new.recipient_id.0)
        .bind(&new.content)
        .bind(&new.media_ref)
        .bind(MessageStatus::Sent.as_str())
        .bind(created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        let id = MessageId(result.last_insert_rowid());
        debug!(message = %id, conversation = %new.conversation_id, "message persisted");

        Ok(Message {
            id,
            conversation_id: new.conversation_id,
            sender_id: new.sender_id,
            recipient_id: new.recipient_id,
            content: new.content,
            media_ref: new.media_ref,
            status: MessageStatus::Sent,
            created_at,
        })
    }

    async fn update_message_status(
        &self,
        id: MessageId,
        status: MessageStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE messages SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id.0)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("message {id}")));
        }
        Ok(())
    }

    async fn fetch_message(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query(
            "SELECT id, conversation_id, sender_id, recipient_id, content, media_ref, status, created_at \
             FROM messages WHERE id = ?",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_message).transpose()
    }

    async fn fetch_messages_by_conversation(
        &self,
        conversation: ConversationId,
    ) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, sender_id, recipient_id, content, media_ref, status, created_at \
             FROM messages WHERE conversation_id = ? \
             ORDER BY created_at ASC, id ASC",
        )
        .bind(conversation.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_message).collect()
    }

    async fn find_or_create_conversation(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<Conversation, StoreError> {
        let existing = sqlx::query(
            "SELECT id, user_a, user_b, created_at FROM conversations \
             WHERE (user_a = ? AND user_b = ?) OR (user_a = ? AND user_b = ?)",
        )
        .bind(a.0)
        .bind(b.0)
        .bind(b.0)
        .bind(a.0)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = existing {
            return row_to_conversation(&row);
        }

        let created_at = Utc::now();
        let result =
            sqlx::query("INSERT INTO conversations (user_a, user_b, created_at) VALUES (?, ?, ?)")
                .bind(a.0)
                .bind(b.0)
                .bind(created_at.to_rfc3339())
                .execute(&self.pool)
                .await?;

        let id = ConversationId(result.last_insert_rowid());
        debug!(conversation = %id, user_a = %a, user_b = %b, "conversation created");

        Ok(Conversation {
            id,
            user_a: a,
            user_b: b,
            created_at,
        })
    }

    async fn fetch_conversation(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query("SELECT id, user_a, user_b, created_at FROM conversations WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_conversation).transpose()
    }

    async fn upsert_user_status(
        &self,
        user: UserId,
        status: Presence,
        last_active: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        // Users that never went through HTTP sign-up (identity arrives
        // verified from the auth provider) get a stub row; the status
        // columns are what the relay cares about.
        sqlx::query(
            "INSERT INTO users (id, username, email, status, last_active, created_at) \
             VALUES (?, 'user-' || ?, 'user-' || ? || '@unprovisioned.invalid', ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET status = excluded.status, last_active = excluded.last_active",
        )
        .bind(user.0)
        .bind(user.0)
        .bind(user.0)
        .bind(status.as_str())
        .bind(last_active.to_rfc3339())
        .bind(last_active.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn create_user(&self, new: NewUser) -> Result<User, StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO users (username, email, google_id, image_url, status, last_active, created_at) \
             VALUES (?, ?, ?, ?, 'offline', ?, ?)",
        )
        .bind(&new.username)
        .bind(&new.email)
        .bind(&new.google_id)
        .bind(&new.image_url)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(User {
            id: UserId(result.last_insert_rowid()),
            username: new.username,
            email: new.email,
            google_id: new.google_id,
            image_url: new.image_url,
            status: Presence::Offline,
            last_active: now,
            created_at: now,
        })
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(
            "SELECT id, username, email, google_id, image_url, status, last_active, created_at \
             FROM users WHERE email = ?",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_user).transpose()
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, username, email, google_id, image_url, status, last_active, created_at \
             FROM users ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_user).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteStore {
        SqliteStore::in_memory().await.expect("in-memory store")
    }

    fn new_message(conversation: i64, sender: i64, recipient: i64, content: &str) -> NewMessage {
        NewMessage {
            conversation_id: ConversationId(conversation),
            sender_id: UserId(sender),
            recipient_id: UserId(recipient),
            content: content.to_string(),
            media_ref: None,
        }
    }

    #[tokio::test]
    async fn insert_and_fetch_message() {
        let store = store().await;
        let msg = store
            .insert_message(new_message(100, 1, 2, "hi"))
            .await
            .unwrap();

        assert_eq!(msg.status, MessageStatus::Sent);

        let fetched = store.fetch_message(msg.id).await.unwrap().unwrap();
        assert_eq!(fetched, msg);
        assert!(store
            .fetch_message(MessageId(9999))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn history_preserves_send_order() {
        let store = store().await;
        // Back-to-back inserts land in the same instant; the id tiebreak
        // must keep them in send order.
        for i in 0..5 {
            store
                .insert_message(new_message(100, 1, 2, &format!("m{i}")))
                .await
                .unwrap();
        }
        store
            .insert_message(new_message(200, 3, 4, "other room"))
            .await
            .unwrap();

        let history = store
            .fetch_messages_by_conversation(ConversationId(100))
            .await
            .unwrap();
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["m0", "m1", "m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn update_status_and_not_found() {
        let store = store().await;
        let msg = store
            .insert_message(new_message(100, 1, 2, "hi"))
            .await
            .unwrap();

        store
            .update_message_status(msg.id, MessageStatus::Delivered)
            .await
            .unwrap();
        let fetched = store.fetch_message(msg.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, MessageStatus::Delivered);

        let err = store
            .update_message_status(MessageId(9999), MessageStatus::Read)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn conversation_lookup_is_order_independent() {
        let store = store().await;
        let first = store
            .find_or_create_conversation(UserId(1), UserId(2))
            .await
            .unwrap();
        let swapped = store
            .find_or_create_conversation(UserId(2), UserId(1))
            .await
            .unwrap();
        assert_eq!(first.id, swapped.id);

        let other = store
            .find_or_create_conversation(UserId(1), UserId(3))
            .await
            .unwrap();
        assert_ne!(first.id, other.id);

        let fetched = store.fetch_conversation(first.id).await.unwrap().unwrap();
        assert!(fetched.is_participant(UserId(1)));
        assert!(fetched.is_participant(UserId(2)));
    }

    #[tokio::test]
    async fn upsert_status_creates_stub_then_updates() {
        let store = store().await;
        let now = Utc::now();

        store
            .upsert_user_status(UserId(7), Presence::Online, now)
            .await
            .unwrap();
        store
            .upsert_user_status(UserId(7), Presence::Offline, now)
            .await
            .unwrap();

        let users = store.list_users().await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id, UserId(7));
        assert_eq!(users[0].status, Presence::Offline);
    }

    #[tokio::test]
    async fn signup_round_trip() {
        let store = store().await;
        let user = store
            .create_user(NewUser {
                username: "alice".into(),
                email: "alice@example.com".into(),
                google_id: None,
                image_url: Some("https://example.com/a.png".into()),
            })
            .await
            .unwrap();

        let found = store
            .find_user_by_email("alice@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, user.id);
        assert_eq!(found.image_url.as_deref(), Some("https://example.com/a.png"));

        assert!(store
            .find_user_by_email("nobody@example.com")
            .await
            .unwrap()
            .is_none());

        // Duplicate email is a database-level conflict; the route checks
        // find-by-email first, mirroring the sign-up contract.
        assert!(store
            .create_user(NewUser {
                username: "alice2".into(),
                email: "alice@example.com".into(),
                google_id: None,
                image_url: None,
            })
            .await
            .is_err());
    }
}
