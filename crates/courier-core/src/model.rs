//! Domain types for the Courier relay.
//!
//! Identifiers are newtypes over the persisted integer keys, except
//! [`ConnectionId`], which names one live transport session and never
//! touches the store. [`MessageStatus`] is forward-only; the relay engine
//! enforces the progression, the type encodes it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum message content length, in characters.
pub const MAX_CONTENT_LENGTH: usize = 4000;

/// Stable account identifier, assigned at provisioning and immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a two-party conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub i64);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a persisted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One live transport session. A user may hold several at once
/// (multi-device); the id is minted at WebSocket accept and dies with the
/// socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-message delivery lifecycle marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
        }
    }

    /// A status only ever moves one step forward: `sent → delivered → read`.
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        matches!(
            (self, next),
            (MessageStatus::Sent, MessageStatus::Delivered)
                | (MessageStatus::Delivered, MessageStatus::Read)
        )
    }

    /// The next stage in the lifecycle, if any.
    pub fn next(self) -> Option<MessageStatus> {
        match self {
            MessageStatus::Sent => Some(MessageStatus::Delivered),
            MessageStatus::Delivered => Some(MessageStatus::Read),
            MessageStatus::Read => None,
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing a persisted status string fails.
#[derive(Debug, thiserror::Error)]
#[error("unknown message status: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for MessageStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(MessageStatus::Sent),
            "delivered" => Ok(MessageStatus::Delivered),
            "read" => Ok(MessageStatus::Read),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// A user's live status as broadcast in `statusUpdate` events.
///
/// Typing is scoped to the peer being typed at, so a contact list can show
/// "typing..." only in the right conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum Presence {
    Online,
    Offline,
    Typing { target: UserId },
}

impl Presence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Presence::Online => "online",
            Presence::Offline => "offline",
            Presence::Typing { .. } => "typing",
        }
    }

    /// Online and typing both mean a live connection exists.
    pub fn is_online(&self) -> bool {
        !matches!(self, Presence::Offline)
    }

    pub fn is_typing_to(&self, user: UserId) -> bool {
        matches!(self, Presence::Typing { target } if *target == user)
    }
}

impl Default for Presence {
    fn default() -> Self {
        Presence::Offline
    }
}

impl fmt::Display for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted message. `status` is the only field mutated after insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
    /// Durable URL of an attached media blob, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_ref: Option<String>,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
}

/// A two-party conversation. The participant pair is immutable and
/// unordered: lookups treat {A,B} and {B,A} as the same conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub user_a: UserId,
    pub user_b: UserId,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn participants(&self) -> [UserId; 2] {
        [self.user_a, self.user_b]
    }

    pub fn is_participant(&self, user: UserId) -> bool {
        self.user_a == user || self.user_b == user
    }

    /// The other party, if `user` is a participant.
    pub fn peer_of(&self, user: UserId) -> Option<UserId> {
        if user == self.user_a {
            Some(self.user_b)
        } else if user == self.user_b {
            Some(self.user_a)
        } else {
            None
        }
    }
}

/// An account row as served by the sign-up/lookup endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub status: Presence,
    pub last_active: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
