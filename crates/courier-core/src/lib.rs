//! Core domain for the Courier messaging relay.
//!
//! This crate is I/O-free: it defines the identifiers and entities shared by
//! the relay engine and its collaborators, the JSON wire vocabulary spoken
//! over the WebSocket, and the relay error taxonomy.

pub mod error;
pub mod event;
pub mod model;

pub use error::RelayError;
pub use event::{ClientEvent, ServerEvent};
pub use model::{
    ConnectionId, Conversation, ConversationId, Message, MessageId, MessageStatus, Presence, User,
    UserId,
};
