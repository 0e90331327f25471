//! Wire event vocabulary spoken over the persistent channel.
//!
//! Events are JSON objects tagged by a `type` field, camelCase throughout,
//! e.g. `{"type":"sendMessage","senderId":1,...}`. [`ClientEvent`] is the
//! inbound half, [`ServerEvent`] the outbound half. Parsing happens at the
//! transport edge; the dispatcher only ever sees well-formed variants and
//! applies its own semantic validation on top.

use serde::{Deserialize, Serialize};

use crate::model::{ConversationId, Message, MessageId, MessageStatus, Presence, UserId};

/// Inbound events, client → relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientEvent {
    /// Binds the verified user identity to this connection and brings the
    /// user online. Must precede every other event on the connection.
    #[serde(rename_all = "camelCase")]
    UserConnected { user_id: UserId },

    /// Opens a conversation room; triggers synchronous history replay.
    #[serde(rename_all = "camelCase")]
    Join { conversation_id: ConversationId },

    #[serde(rename_all = "camelCase")]
    SendMessage {
        sender_id: UserId,
        recipient_id: UserId,
        conversation_id: ConversationId,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_ref: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    MarkAsRead {
        message_id: MessageId,
        conversation_id: ConversationId,
    },

    #[serde(rename_all = "camelCase")]
    Typing { user_id: UserId, recipient_id: UserId },

    #[serde(rename_all = "camelCase")]
    StopTyping { user_id: UserId, recipient_id: UserId },
}

impl ClientEvent {
    /// Event kind as it appears in the `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEvent::UserConnected { .. } => "userConnected",
            ClientEvent::Join { .. } => "join",
            ClientEvent::SendMessage { .. } => "sendMessage",
            ClientEvent::MarkAsRead { .. } => "markAsRead",
            ClientEvent::Typing { .. } => "typing",
            ClientEvent::StopTyping { .. } => "stopTyping",
        }
    }
}

/// Outbound events, relay → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Room history replay on join, `createdAt` ascending.
    #[serde(rename_all = "camelCase")]
    LoadMessages { messages: Vec<Message> },

    #[serde(rename_all = "camelCase")]
    NewMessage { message: Message },

    #[serde(rename_all = "camelCase")]
    MessageStatus {
        message_id: MessageId,
        status: MessageStatus,
    },

    /// Process-wide presence change; any client may be rendering any
    /// user's status in its contact list.
    #[serde(rename_all = "camelCase")]
    StatusUpdate { user_id: UserId, status: Presence },

    /// Reported only to the originating connection, never broadcast.
    #[serde(rename_all = "camelCase")]
    Error { code: String, message: String },
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::LoadMessages { .. } => "loadMessages",
            ServerEvent::NewMessage { .. } => "newMessage",
            ServerEvent::MessageStatus { .. } => "messageStatus",
            ServerEvent::StatusUpdate { .. } => "statusUpdate",
            ServerEvent::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_send_message_from_wire() {
        let raw = r#"{
            "type": "sendMessage",
            "senderId": 1,
            "recipientId": 2,
            "conversationId": 100,
            "content": "hi"
        }"#;

        let event: ClientEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(
            event,
            ClientEvent::SendMessage {
                sender_id: UserId(1),
                recipient_id: UserId(2),
                conversation_id: ConversationId(100),
                content: "hi".to_string(),
                media_ref: None,
            }
        );
        assert_eq!(event.kind(), "sendMessage");
    }

    #[test]
    fn parses_join_and_mark_as_read() {
        let join: ClientEvent = serde_json::from_str(r#"{"type":"join","conversationId":100}"#).unwrap();
        assert_eq!(
            join,
            ClientEvent::Join {
                conversation_id: ConversationId(100)
            }
        );

        let read: ClientEvent =
            serde_json::from_str(r#"{"type":"markAsRead","messageId":5,"conversationId":100}"#)
                .unwrap();
        assert_eq!(
            read,
            ClientEvent::MarkAsRead {
                message_id: MessageId(5),
                conversation_id: ConversationId(100)
            }
        );
    }

    #[test]
    fn rejects_missing_fields_and_unknown_kinds() {
        // sendMessage without a recipient is structurally invalid.
        assert!(serde_json::from_str::<ClientEvent>(
            r#"{"type":"sendMessage","senderId":1,"conversationId":100,"content":"hi"}"#
        )
        .is_err());

        assert!(serde_json::from_str::<ClientEvent>(r#"{"type":"selfDestruct"}"#).is_err());
        assert!(serde_json::from_str::<ClientEvent>(r#"{"content":"no tag"}"#).is_err());
    }

    #[test]
    fn message_status_wire_form() {
        let event = ServerEvent::MessageStatus {
            message_id: MessageId(5),
            status: MessageStatus::Delivered,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "messageStatus",
                "messageId": 5,
                "status": "delivered"
            })
        );
    }

    #[test]
    fn status_update_wire_form() {
        let event = ServerEvent::StatusUpdate {
            user_id: UserId(1),
            status: Presence::Typing { target: UserId(2) },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "statusUpdate",
                "userId": 1,
                "status": { "state": "typing", "target": 2 }
            })
        );
    }

    #[test]
    fn typing_events_round_trip() {
        for event in [
            ClientEvent::Typing {
                user_id: UserId(1),
                recipient_id: UserId(2),
            },
            ClientEvent::StopTyping {
                user_id: UserId(1),
                recipient_id: UserId(2),
            },
        ] {
            let raw = serde_json::to_string(&event).unwrap();
            let back: ClientEvent = serde_json::from_str(&raw).unwrap();
            assert_eq!(back, event);
        }
    }
}
