//! Room multiplexer: conversation membership and per-conversation locks.
//!
//! A connection is in at most one room at a time; joining a new room leaves
//! the previous one. The per-conversation mutex serializes join, send and
//! read handling so that history replay and live delivery cannot interleave
//! for the same conversation.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use courier_core::event::ServerEvent;
use courier_core::model::{ConnectionId, ConversationId};

use super::registry::ConnectionRegistry;

#[derive(Debug, Default)]
pub struct RoomMultiplexer {
    members: DashMap<ConversationId, HashSet<ConnectionId>>,
    open_room: DashMap<ConnectionId, ConversationId>,
    guards: DashMap<ConversationId, Arc<Mutex<()>>>,
}

impl RoomMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The conversation lock. Callers hold the returned mutex across the
    /// whole persist-then-broadcast sequence for that conversation.
    pub fn guard(&self, conversation: ConversationId) -> Arc<Mutex<()>> {
        self.guards
            .entry(conversation)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Adds the connection to a room, leaving its previous room if any.
    pub fn join(&self, conn: ConnectionId, conversation: ConversationId) {
        if let Some(previous) = self.open_room.insert(conn, conversation) {
            if previous != conversation {
                self.remove_member(previous, conn);
            }
        }
        self.members.entry(conversation).or_default().insert(conn);
    }

    /// Removes the connection from whatever room it has open.
    pub fn leave(&self, conn: ConnectionId) {
        if let Some((_, conversation)) = self.open_room.remove(&conn) {
            self.remove_member(conversation, conn);
        }
    }

    fn remove_member(&self, conversation: ConversationId, conn: ConnectionId) {
        if let Some(mut set) = self.members.get_mut(&conversation) {
            set.remove(&conn);
        }
        self.members.remove_if(&conversation, |_, set| set.is_empty());
    }

    pub fn open_room_of(&self, conn: ConnectionId) -> Option<ConversationId> {
        self.open_room.get(&conn).map(|entry| *entry.value())
    }

    pub fn members_of(&self, conversation: ConversationId) -> Vec<ConnectionId> {
        self.members
            .get(&conversation)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Fan-out to every connection with this conversation open. Targets are
    /// snapshotted before sending so a teardown during the loop cannot
    /// invalidate iteration. Returns the stalled connections.
    pub fn broadcast(
        &self,
        registry: &ConnectionRegistry,
        conversation: ConversationId,
        event: &ServerEvent,
        exclude: Option<ConnectionId>,
    ) -> Vec<ConnectionId> {
        let targets = self.members_of(conversation);
        let mut stalled = Vec::new();
        for conn in targets {
            if Some(conn) == exclude {
                continue;
            }
            if registry.send_to(conn, event.clone()).is_err() {
                stalled.push(conn);
            }
        }
        stalled
    }
}
