//! In-memory [`Store`] used as test support.
//!
//! Behaviorally equivalent to the SQLite store for everything the relay
//! exercises, plus a write-failure toggle so tests can drive the
//! `PersistenceFailure` rollback paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use courier_core::model::{
    Conversation, ConversationId, Message, MessageId, MessageStatus, Presence, User, UserId,
};

use super::{NewMessage, NewUser, Store, StoreError};

#[derive(Debug, Default)]
struct Inner {
    users: HashMap<i64, User>,
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
    next_user_id: i64,
    next_conversation_id: i64,
    next_message_id: i64,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every write returns `StoreError::Database`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(StoreError::Database("simulated write failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_message(&self, new: NewMessage) -> Result<Message, StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        inner.next_message_id += 1;
        let message = Message {
            id: MessageId(inner.next_message_id),
            conversation_id: new.conversation_id,
            sender_id: new.sender_id,
            recipient_id: new.recipient_id,
            content: new.content,
            media_ref: new.media_ref,
            status: MessageStatus::Sent,
            created_at: Utc::now(),
        };
        inner.messages.push(message.clone());
        Ok(message)
    }

    async fn update_message_status(
        &self,
        id: MessageId,
        status: MessageStatus,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        let message = inner
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("message {id}")))?;
        message.status = status;
        Ok(())
    }

    async fn fetch_message(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.messages.iter().find(|m| m.id == id).cloned())
    }

    async fn fetch_messages_by_conversation(
        &self,
        conversation: ConversationId,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.lock().await;
        let mut history: Vec<Message> = inner
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation)
            .cloned()
            .collect();
        history.sort_by_key(|m| (m.created_at, m.id));
        Ok(history)
    }

    async fn find_or_create_conversation(
        &self,
        a: UserId,
        b: UserId,
    ) -> Result<Conversation, StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner
            .conversations
            .iter()
            .find(|c| (c.user_a == a && c.user_b == b) || (c.user_a == b && c.user_b == a))
        {
            return Ok(*existing);
        }
        self.check_writable()?;
        inner.next_conversation_id += 1;
        let conversation = Conversation {
            id: ConversationId(inner.next_conversation_id),
            user_a: a,
            user_b: b,
            created_at: Utc::now(),
        };
        inner.conversations.push(conversation);
        Ok(conversation)
    }

    async fn fetch_conversation(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.conversations.iter().find(|c| c.id == id).copied())
    }

    async fn upsert_user_status(
        &self,
        user: UserId,
        status: Presence,
        last_active: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        let entry = inner.users.entry(user.0).or_insert_with(|| User {
            id: user,
            username: format!("user-{user}"),
            email: format!("user-{user}@unprovisioned.invalid"),
            google_id: None,
            image_url: None,
            status: Presence::Offline,
            last_active,
            created_at: last_active,
        });
        entry.status = status;
        entry.last_active = last_active;
        Ok(())
    }

    async fn create_user(&self, new: NewUser) -> Result<User, StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        if inner.users.values().any(|u| u.email == new.email) {
            return Err(StoreError::Database(format!(
                "unique constraint violated: email {}",
                new.email
            )));
        }
        inner.next_user_id += 1;
        let now = Utc::now();
        let user = User {
            id: UserId(inner.next_user_id),
            username: new.username,
            email: new.email,
            google_id: new.google_id,
            image_url: new.image_url,
            status: Presence::Offline,
            last_active: now,
            created_at: now,
        };
        inner.users.insert(user.id.0, user.clone());
        Ok(user)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.users.values().find(|u| u.email == email).cloned())
    }

    async fn list_users(&self) -> Result<Vec<User>, StoreError> {
        let inner = self.inner.lock().await;
        let mut users: Vec<User> = inner.users.values().cloned().collect();
        users.sort_by_key(|u| u.id);
        Ok(users)
    }
}
