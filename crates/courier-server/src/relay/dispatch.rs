//! Event dispatcher: the single entry point for inbound client events.
//!
//! The transport layer parses frames into [`ClientEvent`]s and hands them
//! here; the dispatcher validates them against the connection's bound
//! identity, serializes conversation work under the room guard, and drives
//! the store, delivery engine and presence coordinator. All persist calls
//! happen before the broadcasts they back.
//!
//! Stalled connections discovered during fan-out are torn down after the
//! room guard is released, so one slow client cannot hold a conversation
//! lock hostage.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use courier_core::error::{RelayError, Result};
use courier_core::event::{ClientEvent, ServerEvent};
use courier_core::model::{
    ConnectionId, Conversation, ConversationId, MessageId, MessageStatus, UserId,
    MAX_CONTENT_LENGTH,
};

use crate::store::{NewMessage, Store};

use super::delivery::DeliveryEngine;
use super::presence::PresenceCoordinator;
use super::registry::{ConnectionHandle, ConnectionRegistry};
use super::rooms::RoomMultiplexer;

pub struct Dispatcher {
    store: Arc<dyn Store>,
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomMultiplexer>,
    presence: PresenceCoordinator,
    delivery: DeliveryEngine,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Store>, typing_ttl: Duration) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomMultiplexer::new());
        let presence = PresenceCoordinator::new(store.clone(), registry.clone(), typing_ttl);
        let delivery = DeliveryEngine::new(store.clone(), registry.clone(), rooms.clone());
        Arc::new(Self {
            store,
            registry,
            rooms,
            presence,
            delivery,
        })
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Routes one inbound event for a connection. `outbound` is the
    /// connection's own queue, needed to register the identity binding.
    pub async fn dispatch(
        &self,
        conn: ConnectionId,
        outbound: &mpsc::Sender<ServerEvent>,
        event: ClientEvent,
    ) -> Result<()> {
        debug!(connection = %conn, event = event.kind(), "dispatching");
        match event {
            ClientEvent::UserConnected { user_id } => {
                self.handle_user_connected(conn, outbound, user_id).await
            }
            ClientEvent::Join { conversation_id } => self.handle_join(conn, conversation_id).await,
            ClientEvent::SendMessage {
                sender_id,
                recipient_id,
                conversation_id,
                content,
                media_ref,
            } => {
                self.handle_send_message(conn, sender_id, recipient_id, conversation_id, content, media_ref)
                    .await
            }
            ClientEvent::MarkAsRead {
                message_id,
                conversation_id,
            } => self.handle_mark_read(conn, message_id, conversation_id).await,
            ClientEvent::Typing {
                user_id,
                recipient_id,
            } => self.handle_typing(conn, user_id, recipient_id, true).await,
            ClientEvent::StopTyping {
                user_id,
                recipient_id,
            } => self.handle_typing(conn, user_id, recipient_id, false).await,
        }
    }

    fn require_user(&self, conn: ConnectionId) -> Result<UserId> {
        self.registry.user_of(conn).ok_or_else(|| {
            RelayError::InvalidEvent("no identity bound to this connection; send userConnected first".into())
        })
    }

    async fn fetch_known_conversation(&self, id: ConversationId) -> Result<Conversation> {
        self.store
            .fetch_conversation(id)
            .await?
            .ok_or_else(|| RelayError::InvalidEvent(format!("unknown conversation {id}")))
    }

    async fn handle_user_connected(
        &self,
        conn: ConnectionId,
        outbound: &mpsc::Sender<ServerEvent>,
        user_id: UserId,
    ) -> Result<()> {
        if user_id.0 <= 0 {
            return Err(RelayError::InvalidEvent(format!("invalid user id {user_id}")));
        }
        if let Some(bound) = self.registry.user_of(conn) {
            // Rebinding to the same user is an idempotent retry; to another
            // user it is a protocol violation.
            return if bound == user_id {
                Ok(())
            } else {
                Err(RelayError::InvalidEvent(format!(
                    "connection already bound to user {bound}"
                )))
            };
        }

        let handle = ConnectionHandle::new(conn, user_id, outbound.clone());
        let came_online = self.registry.register(handle);
        if came_online {
            let stalled = self.presence.set_online(user_id).await?;
            self.teardown_stalled(stalled).await;
        }
        Ok(())
    }

    async fn handle_join(&self, conn: ConnectionId, conversation_id: ConversationId) -> Result<()> {
        let user = self.require_user(conn)?;
        let conversation = self.fetch_known_conversation(conversation_id).await?;
        if !conversation.is_participant(user) {
            return Err(RelayError::NotParticipant {
                user,
                conversation: conversation.id,
            });
        }

        let mut stalled = Vec::new();
        let result = self.join_locked(conn, user, conversation.id, &mut stalled).await;
        self.teardown_stalled(stalled).await;
        result
    }

    /// Replay and room entry under the conversation guard, so live sends
    /// cannot interleave with the history snapshot.
    async fn join_locked(
        &self,
        conn: ConnectionId,
        user: UserId,
        conversation: ConversationId,
        stalled: &mut Vec<ConnectionId>,
    ) -> Result<()> {
        let guard = self.rooms.guard(conversation);
        let _lock = guard.lock().await;

        let mut messages = self.store.fetch_messages_by_conversation(conversation).await?;
        stalled.extend(self.delivery.deliver_replayed(user, &mut messages).await?);
        self.rooms.join(conn, conversation);
        self.registry
            .send_to(conn, ServerEvent::LoadMessages { messages })?;
        Ok(())
    }

    async fn handle_send_message(
        &self,
        conn: ConnectionId,
        sender_id: UserId,
        recipient_id: UserId,
        conversation_id: ConversationId,
        content: String,
        media_ref: Option<String>,
    ) -> Result<()> {
        let user = self.require_user(conn)?;
        if sender_id != user {
            return Err(RelayError::InvalidEvent(format!(
                "sender {sender_id} does not match connection user {user}"
            )));
        }
        if content.trim().is_empty() && media_ref.is_none() {
            return Err(RelayError::InvalidEvent("message has no content".into()));
        }
        if content.chars().count() > MAX_CONTENT_LENGTH {
            return Err(RelayError::InvalidEvent(format!(
                "content exceeds {MAX_CONTENT_LENGTH} characters"
            )));
        }

        let conversation = self.fetch_known_conversation(conversation_id).await?;
        if !conversation.is_participant(sender_id) {
            return Err(RelayError::NotParticipant {
                user: sender_id,
                conversation: conversation.id,
            });
        }
        if conversation.peer_of(sender_id) != Some(recipient_id) {
            return Err(RelayError::InvalidEvent(format!(
                "recipient {recipient_id} is not the other party of conversation {conversation_id}"
            )));
        }

        let mut stalled = Vec::new();
        let result = self
            .send_locked(
                conversation.id,
                NewMessage {
                    conversation_id: conversation.id,
                    sender_id,
                    recipient_id,
                    content,
                    media_ref,
                },
                &mut stalled,
            )
            .await;
        self.teardown_stalled(stalled).await;
        result
    }

    async fn send_locked(
        &self,
        conversation: ConversationId,
        new: NewMessage,
        stalled: &mut Vec<ConnectionId>,
    ) -> Result<()> {
        let guard = self.rooms.guard(conversation);
        let _lock = guard.lock().await;

        let mut message = self.store.insert_message(new).await?;
        // Everyone in the room sees the message, the sender included; that
        // echo is the sender's acknowledgement.
        let event = ServerEvent::NewMessage {
            message: message.clone(),
        };
        stalled.extend(self.rooms.broadcast(&self.registry, conversation, &event, None));

        if self.delivery.recipient_present(&message) {
            stalled.extend(self.delivery.advance(&mut message, MessageStatus::Delivered).await?);
        }
        Ok(())
    }

    async fn handle_mark_read(
        &self,
        conn: ConnectionId,
        message_id: MessageId,
        conversation_id: ConversationId,
    ) -> Result<()> {
        let user = self.require_user(conn)?;
        let conversation = self.fetch_known_conversation(conversation_id).await?;
        if !conversation.is_participant(user) {
            return Err(RelayError::NotParticipant {
                user,
                conversation: conversation.id,
            });
        }

        let mut stalled = Vec::new();
        let result = self
            .read_locked(user, message_id, conversation.id, &mut stalled)
            .await;
        self.teardown_stalled(stalled).await;
        result
    }

    async fn read_locked(
        &self,
        user: UserId,
        message_id: MessageId,
        conversation: ConversationId,
        stalled: &mut Vec<ConnectionId>,
    ) -> Result<()> {
        let guard = self.rooms.guard(conversation);
        let _lock = guard.lock().await;

        let mut message = self
            .store
            .fetch_message(message_id)
            .await?
            .ok_or_else(|| RelayError::InvalidEvent(format!("unknown message {message_id}")))?;
        if message.conversation_id != conversation {
            return Err(RelayError::InvalidEvent(format!(
                "message {message_id} does not belong to conversation {conversation}"
            )));
        }
        stalled.extend(self.delivery.mark_read(user, &mut message).await?);
        Ok(())
    }

    async fn handle_typing(
        &self,
        conn: ConnectionId,
        user_id: UserId,
        recipient_id: UserId,
        start: bool,
    ) -> Result<()> {
        let user = self.require_user(conn)?;
        if user_id != user {
            return Err(RelayError::InvalidEvent(format!(
                "typing user {user_id} does not match connection user {user}"
            )));
        }

        let stalled = if start {
            self.presence.set_typing(user, recipient_id).await?
        } else {
            self.presence.clear_typing(user, recipient_id).await?
        };
        self.teardown_stalled(stalled).await;
        Ok(())
    }

    /// Full teardown of one connection: leave its room, drop it from the
    /// registry, and if that drained the user's last connection, flip them
    /// offline. Idempotent; safe to call on an already-gone connection.
    pub async fn connection_closed(&self, conn: ConnectionId) {
        self.rooms.leave(conn);
        let Some((user, went_offline)) = self.registry.unregister(conn) else {
            return;
        };
        debug!(connection = %conn, user = %user, went_offline, "connection closed");
        if went_offline {
            match self.presence.set_offline(user).await {
                Ok(stalled) => self.teardown_stalled(stalled).await,
                Err(e) => warn!(user = %user, error = %e, "failed to persist offline status"),
            }
        }
    }

    async fn teardown_stalled(&self, stalled: Vec<ConnectionId>) {
        for conn in stalled {
            warn!(connection = %conn, "tearing down stalled connection");
            // connection_closed can surface more stalled connections, hence
            // the indirection through Box::pin.
            Box::pin(self.connection_closed(conn)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::store::MemoryStore;

    struct Client {
        conn: ConnectionId,
        tx: mpsc::Sender<ServerEvent>,
        rx: mpsc::Receiver<ServerEvent>,
    }

    impl Client {
        fn new() -> Self {
            let (tx, rx) = mpsc::channel(32);
            Self {
                conn: ConnectionId::new(),
                tx,
                rx,
            }
        }

        fn drain(&mut self) -> Vec<ServerEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.rx.try_recv() {
                events.push(event);
            }
            events
        }
    }

    async fn bind(dispatcher: &Dispatcher, client: &Client, user: i64) {
        dispatcher
            .dispatch(
                client.conn,
                &client.tx,
                ClientEvent::UserConnected { user_id: UserId(user) },
            )
            .await
            .unwrap();
    }

    fn setup() -> (Arc<Dispatcher>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Dispatcher::new(store.clone() as Arc<dyn Store>, Duration::from_secs(1));
        (dispatcher, store)
    }

    #[tokio::test]
    async fn events_before_user_connected_are_rejected() {
        let (dispatcher, _store) = setup();
        let client = Client::new();

        let err = dispatcher
            .dispatch(
                client.conn,
                &client.tx,
                ClientEvent::Join {
                    conversation_id: ConversationId(1),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidEvent(_)));
    }

    #[tokio::test]
    async fn rebinding_to_another_user_is_rejected() {
        let (dispatcher, _store) = setup();
        let client = Client::new();
        bind(&dispatcher, &client, 1).await;

        // Same user again: fine.
        bind(&dispatcher, &client, 1).await;

        let err = dispatcher
            .dispatch(
                client.conn,
                &client.tx,
                ClientEvent::UserConnected { user_id: UserId(2) },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidEvent(_)));
        assert_eq!(dispatcher.registry().user_of(client.conn), Some(UserId(1)));
    }

    #[tokio::test]
    async fn join_validates_membership() {
        let (dispatcher, store) = setup();
        let conv = store
            .find_or_create_conversation(UserId(1), UserId(2))
            .await
            .unwrap();

        let outsider = Client::new();
        bind(&dispatcher, &outsider, 3).await;
        let err = dispatcher
            .dispatch(
                outsider.conn,
                &outsider.tx,
                ClientEvent::Join {
                    conversation_id: conv.id,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::NotParticipant { user: UserId(3), .. }));

        let member = Client::new();
        bind(&dispatcher, &member, 1).await;
        let err = dispatcher
            .dispatch(
                member.conn,
                &member.tx,
                ClientEvent::Join {
                    conversation_id: ConversationId(999),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidEvent(_)));
    }

    #[tokio::test]
    async fn send_message_validates_sender_content_and_peer() {
        let (dispatcher, store) = setup();
        let conv = store
            .find_or_create_conversation(UserId(1), UserId(2))
            .await
            .unwrap();
        let client = Client::new();
        bind(&dispatcher, &client, 1).await;

        // Spoofed sender.
        let err = dispatcher
            .dispatch(
                client.conn,
                &client.tx,
                ClientEvent::SendMessage {
                    sender_id: UserId(2),
                    recipient_id: UserId(1),
                    conversation_id: conv.id,
                    content: "hi".into(),
                    media_ref: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidEvent(_)));

        // Empty and oversized bodies.
        for content in ["   ".to_string(), "x".repeat(MAX_CONTENT_LENGTH + 1)] {
            let err = dispatcher
                .dispatch(
                    client.conn,
                    &client.tx,
                    ClientEvent::SendMessage {
                        sender_id: UserId(1),
                        recipient_id: UserId(2),
                        conversation_id: conv.id,
                        content,
                        media_ref: None,
                    },
                )
                .await
                .unwrap_err();
            assert!(matches!(err, RelayError::InvalidEvent(_)));
        }

        // Recipient who is not the conversation peer.
        let err = dispatcher
            .dispatch(
                client.conn,
                &client.tx,
                ClientEvent::SendMessage {
                    sender_id: UserId(1),
                    recipient_id: UserId(3),
                    conversation_id: conv.id,
                    content: "hi".into(),
                    media_ref: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidEvent(_)));

        // Media-only message is allowed.
        dispatcher
            .dispatch(
                client.conn,
                &client.tx,
                ClientEvent::SendMessage {
                    sender_id: UserId(1),
                    recipient_id: UserId(2),
                    conversation_id: conv.id,
                    content: String::new(),
                    media_ref: Some("/api/files/cat-1.png".into()),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn content_limit_counts_characters_not_bytes() {
        let (dispatcher, store) = setup();
        let conv = store
            .find_or_create_conversation(UserId(1), UserId(2))
            .await
            .unwrap();
        let client = Client::new();
        bind(&dispatcher, &client, 1).await;

        // Exactly at the limit in characters, well past it in bytes.
        let content = "é".repeat(MAX_CONTENT_LENGTH);
        assert!(content.len() > MAX_CONTENT_LENGTH);
        dispatcher
            .dispatch(
                client.conn,
                &client.tx,
                ClientEvent::SendMessage {
                    sender_id: UserId(1),
                    recipient_id: UserId(2),
                    conversation_id: conv.id,
                    content,
                    media_ref: None,
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn mark_read_rejects_conversation_mismatch() {
        let (dispatcher, store) = setup();
        let conv_a = store
            .find_or_create_conversation(UserId(1), UserId(2))
            .await
            .unwrap();
        let conv_b = store
            .find_or_create_conversation(UserId(1), UserId(3))
            .await
            .unwrap();
        let message = store
            .insert_message(NewMessage {
                conversation_id: conv_a.id,
                sender_id: UserId(2),
                recipient_id: UserId(1),
                content: "hi".into(),
                media_ref: None,
            })
            .await
            .unwrap();

        let client = Client::new();
        bind(&dispatcher, &client, 1).await;

        let err = dispatcher
            .dispatch(
                client.conn,
                &client.tx,
                ClientEvent::MarkAsRead {
                    message_id: message.id,
                    conversation_id: conv_b.id,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidEvent(_)));

        let stored = store.fetch_message(message.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn typing_for_someone_else_is_rejected() {
        let (dispatcher, _store) = setup();
        let client = Client::new();
        bind(&dispatcher, &client, 1).await;

        let err = dispatcher
            .dispatch(
                client.conn,
                &client.tx,
                ClientEvent::Typing {
                    user_id: UserId(9),
                    recipient_id: UserId(2),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidEvent(_)));
    }

    #[tokio::test]
    async fn connection_closed_is_idempotent() {
        let (dispatcher, _store) = setup();
        let mut client = Client::new();
        bind(&dispatcher, &client, 1).await;
        assert!(dispatcher.registry().is_online(UserId(1)));
        client.drain();

        dispatcher.connection_closed(client.conn).await;
        assert!(!dispatcher.registry().is_online(UserId(1)));
        // Second teardown of the same connection: no panic, no effect.
        dispatcher.connection_closed(client.conn).await;
    }
}
