//! Delivery engine: the message status ladder.
//!
//! A message only ever moves forward, `sent` to `delivered` to `read`, one
//! rung at a time. Every rung is persisted before the matching
//! `messageStatus` event is broadcast, so a crash between the two leaves the
//! store ahead of the clients, never behind.

use std::sync::Arc;

use tracing::debug;

use courier_core::error::Result;
use courier_core::event::ServerEvent;
use courier_core::model::{ConnectionId, Message, MessageStatus, UserId};

use crate::store::Store;

use super::registry::ConnectionRegistry;
use super::rooms::RoomMultiplexer;

pub struct DeliveryEngine {
    store: Arc<dyn Store>,
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomMultiplexer>,
}

impl DeliveryEngine {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomMultiplexer>,
    ) -> Self {
        Self {
            store,
            registry,
            rooms,
        }
    }

    /// True when the recipient has the message's conversation open on some
    /// live connection, i.e. a send can be acknowledged as delivered
    /// immediately.
    pub fn recipient_present(&self, message: &Message) -> bool {
        self.registry
            .connections_of(message.recipient_id)
            .into_iter()
            .any(|conn| self.rooms.open_room_of(conn) == Some(message.conversation_id))
    }

    /// Walks the message up to `target`, persisting and broadcasting each
    /// rung. Regression and same-status targets are a no-op. Returns the
    /// connections that stalled during the broadcasts.
    ///
    /// Callers hold the conversation guard.
    pub async fn advance(&self, message: &mut Message, target: MessageStatus) -> Result<Vec<ConnectionId>> {
        let mut stalled = Vec::new();
        while message.status < target {
            let Some(next) = message.status.next() else {
                break;
            };
            self.store.update_message_status(message.id, next).await?;
            message.status = next;
            debug!(message = %message.id, status = next.as_str(), "message status advanced");
            let event = ServerEvent::MessageStatus {
                message_id: message.id,
                status: next,
            };
            stalled.extend(self.rooms.broadcast(
                &self.registry,
                message.conversation_id,
                &event,
                None,
            ));
        }
        Ok(stalled)
    }

    /// Join-triggered delivery: everything still `sent` to the joining user
    /// becomes `delivered` now that they can see it. The replayed slice is
    /// updated in place so the joiner's history already carries the new
    /// statuses.
    pub async fn deliver_replayed(
        &self,
        joining_user: UserId,
        messages: &mut [Message],
    ) -> Result<Vec<ConnectionId>> {
        let mut stalled = Vec::new();
        for message in messages {
            if message.recipient_id == joining_user && message.status == MessageStatus::Sent {
                stalled.extend(self.advance(message, MessageStatus::Delivered).await?);
            }
        }
        Ok(stalled)
    }

    /// Read receipt. No-op when the reader sent the message themselves or
    /// when it is already read; a message still `sent` passes through
    /// `delivered` first so no rung is skipped.
    pub async fn mark_read(
        &self,
        reader: UserId,
        message: &mut Message,
    ) -> Result<Vec<ConnectionId>> {
        if message.sender_id == reader || message.status == MessageStatus::Read {
            return Ok(Vec::new());
        }
        self.advance(message, MessageStatus::Read).await
    }
}
