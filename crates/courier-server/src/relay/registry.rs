//! Connection registry: who is live, on which connections.
//!
//! Source of truth for presence derivation. One user may own several
//! simultaneous connections (multi-device); the user counts as online while
//! the set is non-empty. Each handle carries the connection's bounded
//! outbound sender, so fan-out is a non-blocking `try_send` and a stalled
//! client backs up only its own queue.

use std::collections::HashSet;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use courier_core::error::{RelayError, Result};
use courier_core::event::ServerEvent;
use courier_core::model::{ConnectionId, UserId};

/// Handle to one live connection's outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub user_id: UserId,
    tx: mpsc::Sender<ServerEvent>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, user_id: UserId, tx: mpsc::Sender<ServerEvent>) -> Self {
        Self { id, user_id, tx }
    }

    /// Non-blocking push into the outbound queue. A full queue means the
    /// client stopped draining; both full and closed map to
    /// `ConnectionLost` so the caller tears the connection down.
    fn push(&self, event: ServerEvent) -> Result<()> {
        self.tx.try_send(event).map_err(|err| {
            if matches!(err, TrySendError::Full(_)) {
                warn!(connection = %self.id, user = %self.user_id, "outbound queue full");
            }
            RelayError::ConnectionLost(self.id)
        })
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionHandle>,
    by_user: DashMap<UserId, HashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection. Idempotent per connection id. Returns true
    /// when this is the user's first live connection, i.e. the user just
    /// came online.
    pub fn register(&self, handle: ConnectionHandle) -> bool {
        let id = handle.id;
        let user = handle.user_id;
        if self.connections.contains_key(&id) {
            return false;
        }
        self.connections.insert(id, handle);
        let mut set = self.by_user.entry(user).or_default();
        let came_online = set.is_empty();
        set.insert(id);
        came_online
    }

    /// Unregisters a connection. Unknown ids are a no-op, since disconnect
    /// races are expected. Returns the owning user and whether their
    /// connection set drained (the user went offline).
    pub fn unregister(&self, id: ConnectionId) -> Option<(UserId, bool)> {
        let (_, handle) = self.connections.remove(&id)?;
        let user = handle.user_id;
        let mut went_offline = false;
        if let Some(mut set) = self.by_user.get_mut(&user) {
            set.remove(&id);
            went_offline = set.is_empty();
        }
        if went_offline {
            self.by_user.remove_if(&user, |_, set| set.is_empty());
        }
        Some((user, went_offline))
    }

    pub fn is_online(&self, user: UserId) -> bool {
        self.by_user
            .get(&user)
            .map_or(false, |set| !set.is_empty())
    }

    pub fn connections_of(&self, user: UserId) -> Vec<ConnectionId> {
        self.by_user
            .get(&user)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn user_of(&self, id: ConnectionId) -> Option<UserId> {
        self.connections.get(&id).map(|handle| handle.user_id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Fire-and-forget send to one connection.
    pub fn send_to(&self, id: ConnectionId, event: ServerEvent) -> Result<()> {
        match self.connections.get(&id) {
            Some(handle) => handle.push(event),
            None => Err(RelayError::ConnectionLost(id)),
        }
    }

    /// Process-wide fan-out (presence updates go to every live connection,
    /// not just one room). Returns the connections whose queues overflowed
    /// or closed, for teardown by the caller.
    pub fn broadcast_all(
        &self,
        event: &ServerEvent,
        exclude: Option<ConnectionId>,
    ) -> Vec<ConnectionId> {
        let mut stalled = Vec::new();
        for entry in self.connections.iter() {
            let id = *entry.key();
            if Some(id) == exclude {
                continue;
            }
            if entry.value().push(event.clone()).is_err() {
                stalled.push(id);
            }
        }
        stalled
    }
}
