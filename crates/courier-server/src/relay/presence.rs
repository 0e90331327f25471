//! Presence coordinator: online, offline and the typing indicator.
//!
//! Presence is derived from the connection registry (online while at least
//! one connection is live) and layered with a transient typing state that
//! expires on its own. Every transition is persisted, then announced to all
//! live connections as a `statusUpdate`.
//!
//! Typing expiry uses epochs: each `typing`/`stopTyping` bumps a counter for
//! the (user, target) pair, and the timer spawned at `typing` time only
//! fires if its epoch is still current and the user is still typing to that
//! target. A later transition, including going offline, silently wins over
//! a stale timer.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use courier_core::error::Result;
use courier_core::event::ServerEvent;
use courier_core::model::{ConnectionId, Presence, UserId};

use crate::store::Store;

use super::registry::ConnectionRegistry;

#[derive(Clone)]
pub struct PresenceCoordinator {
    store: Arc<dyn Store>,
    registry: Arc<ConnectionRegistry>,
    states: Arc<DashMap<UserId, Presence>>,
    user_guards: Arc<DashMap<UserId, Arc<Mutex<()>>>>,
    typing_epochs: Arc<DashMap<(UserId, UserId), u64>>,
    typing_ttl: Duration,
}

impl PresenceCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<ConnectionRegistry>,
        typing_ttl: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            states: Arc::new(DashMap::new()),
            user_guards: Arc::new(DashMap::new()),
            typing_epochs: Arc::new(DashMap::new()),
            typing_ttl,
        }
    }

    pub fn presence_of(&self, user: UserId) -> Presence {
        self.states
            .get(&user)
            .map(|entry| *entry.value())
            .unwrap_or_default()
    }

    fn guard(&self, user: UserId) -> Arc<Mutex<()>> {
        self.user_guards
            .entry(user)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn bump_epoch(&self, user: UserId, target: UserId) -> u64 {
        let mut entry = self.typing_epochs.entry((user, target)).or_insert(0);
        *entry += 1;
        *entry
    }

    fn current_epoch(&self, user: UserId, target: UserId) -> u64 {
        self.typing_epochs
            .get(&(user, target))
            .map_or(0, |entry| *entry)
    }

    /// Persist-then-broadcast for one presence transition. Must be called
    /// with the user's guard held.
    async fn apply_locked(&self, user: UserId, status: Presence) -> Result<Vec<ConnectionId>> {
        self.store
            .upsert_user_status(user, status, Utc::now())
            .await?;
        self.states.insert(user, status);
        debug!(user = %user, status = status.as_str(), "presence changed");
        let event = ServerEvent::StatusUpdate {
            user_id: user,
            status,
        };
        Ok(self.registry.broadcast_all(&event, None))
    }

    async fn apply(&self, user: UserId, status: Presence) -> Result<Vec<ConnectionId>> {
        let guard = self.guard(user);
        let _lock = guard.lock().await;
        self.apply_locked(user, status).await
    }

    pub async fn set_online(&self, user: UserId) -> Result<Vec<ConnectionId>> {
        self.apply(user, Presence::Online).await
    }

    pub async fn set_offline(&self, user: UserId) -> Result<Vec<ConnectionId>> {
        self.apply(user, Presence::Offline).await
    }

    /// Marks the user as typing to `target` and arms the expiry timer. The
    /// epoch is bumped and captured under the user's guard, so a concurrent
    /// `stopTyping` cannot slip in between the bump and the state change
    /// and leave the timer pointing at a dead epoch.
    pub async fn set_typing(&self, user: UserId, target: UserId) -> Result<Vec<ConnectionId>> {
        let guard = self.guard(user);
        let _lock = guard.lock().await;
        let epoch = self.bump_epoch(user, target);
        let stalled = self.apply_locked(user, Presence::Typing { target }).await?;

        let coordinator = self.clone();
        let ttl = self.typing_ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            coordinator.expire_typing(user, target, epoch).await;
        });
        Ok(stalled)
    }

    /// Explicit `stopTyping`. Reverts to online only if the user is still
    /// typing to that target; any other state is left alone.
    pub async fn clear_typing(&self, user: UserId, target: UserId) -> Result<Vec<ConnectionId>> {
        let guard = self.guard(user);
        let _lock = guard.lock().await;
        self.bump_epoch(user, target);
        if self.presence_of(user).is_typing_to(target) {
            self.apply_locked(user, Presence::Online).await
        } else {
            Ok(Vec::new())
        }
    }

    /// Timer body. The epoch check discards timers superseded by a newer
    /// `typing` or `stopTyping`; the state check discards them when the user
    /// moved on (offline wins over a pending revert to online).
    async fn expire_typing(&self, user: UserId, target: UserId, epoch: u64) {
        let guard = self.guard(user);
        let _lock = guard.lock().await;
        if self.current_epoch(user, target) != epoch {
            return;
        }
        if !self.presence_of(user).is_typing_to(target) {
            return;
        }
        match self.apply_locked(user, Presence::Online).await {
            Ok(stalled) => {
                if !stalled.is_empty() {
                    warn!(user = %user, count = stalled.len(), "stalled connections during typing expiry");
                }
            }
            Err(e) => warn!(user = %user, error = %e, "failed to expire typing state"),
        }
    }
}
