//! Relay error taxonomy.
//!
//! None of these are fatal to the process: one connection's or
//! conversation's failure never affects unrelated ones. Retries are the
//! client's business; the relay never retries a persistence call on its own
//! (that would risk duplicate side effects).

use thiserror::Error;

use crate::event::ServerEvent;
use crate::model::{ConnectionId, ConversationId, UserId};

/// The universal error type of the relay engine.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Malformed or semantically inconsistent inbound event. Reported to
    /// the originating connection only, never broadcast.
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// Room join by a user who is not one of the conversation's two
    /// parties.
    #[error("user {user} is not a participant of conversation {conversation}")]
    NotParticipant {
        user: UserId,
        conversation: ConversationId,
    },

    /// A durable write or read failed. The attempted state transition did
    /// not occur and nothing was broadcast.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// The connection's outbound queue is closed or full. Internal signal
    /// that triggers teardown; never surfaced to a client.
    #[error("connection {0} lost")]
    ConnectionLost(ConnectionId),
}

impl RelayError {
    /// Stable wire code carried by the `error` event.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::InvalidEvent(_) => "invalidEvent",
            RelayError::NotParticipant { .. } => "notParticipant",
            RelayError::Persistence(_) => "persistenceFailure",
            RelayError::ConnectionLost(_) => "connectionLost",
        }
    }

    /// Whether the error is answered to the originating connection.
    /// `ConnectionLost` is cleanup, not a reply.
    pub fn is_reportable(&self) -> bool {
        !matches!(self, RelayError::ConnectionLost(_))
    }

    /// The `error` event sent back to the origin.
    pub fn to_event(&self) -> ServerEvent {
        ServerEvent::Error {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

/// A specialized Result for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
