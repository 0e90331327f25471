//! Persistence boundary for the relay.
//!
//! The relay only ever talks to the [`Store`] trait: durable writes are the
//! engine's sole suspension points, and every state transition is persisted
//! before it becomes observable. [`SqliteStore`] is the production
//! implementation; [`MemoryStore`] backs tests and can simulate write
//! failures for the rollback paths.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use courier_core::error::RelayError;
use courier_core::model::{
    Conversation, ConversationId, Message, MessageId, MessageStatus, Presence, User, UserId,
};

/// Store-level errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl From<StoreError> for RelayError {
    fn from(err: StoreError) -> Self {
        RelayError::Persistence(err.to_string())
    }
}

/// Insert payload for a new message. Status and timestamp are assigned by
/// the store (`sent`, now).
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
    pub media_ref: Option<String>,
}

/// Insert payload for account sign-up.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub google_id: Option<String>,
    pub image_url: Option<String>,
}

/// The persistence collaborator.
///
/// Implementations must provide read-after-write consistency for a single
/// row; the relay awaits each write before acknowledging the transition it
/// backs.
#[async_trait]
pub trait Store: Send + Sync {
    /// Persists a message with status `sent` and a store-assigned id and
    /// timestamp.
    async fn insert_message(&self, new: NewMessage) -> Result<Message, StoreError>;

    /// Overwrites a message's status. `NotFound` if no such row.
    async fn update_message_status(
        &self,
        id: MessageId,
        status: MessageStatus,
    ) -> Result<(), StoreError>;

    async fn fetch_message(&self, id: MessageId) -> Result<Option<Message>, StoreError>;

    /// Full history of a conversation, `created_at` ascending (id as the
    /// tiebreak, so back-to-back sends keep their order).
    async fn fetch_messages_by_conversation(
        &self,
        conversation: ConversationId,
    ) -> Result<Vec<Message>, StoreError>;

    /// Looks up the conversation for an unordered user pair, creating it on
    /// first contact. `{a,b}` and `{b,a}` resolve to the same row.
    async fn find_or_create_conversation(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<Conversation, StoreError>;

    async fn fetch_conversation(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, StoreError>;

    /// Records a presence change and its `last_active` timestamp.
    async fn upsert_user_status(
        &self,
        user: UserId,
        status: Presence,
        last_active: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn create_user(&self, new: NewUser) -> Result<User, StoreError>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;

    async fn list_users(&self) -> Result<Vec<User>, StoreError>;
}
