//! The relay engine.
//!
//! Five collaborators, wired together by [`Dispatcher::new`]:
//!
//! - [`ConnectionRegistry`]: live connections and their outbound queues,
//!   the source of truth for who is online.
//! - [`RoomMultiplexer`]: which connection has which conversation open,
//!   plus the per-conversation lock.
//! - [`DeliveryEngine`]: the sent → delivered → read ladder, persisted a
//!   rung at a time.
//! - [`PresenceCoordinator`]: online/offline/typing with self-expiring
//!   typing state.
//! - [`Dispatcher`]: validates inbound events and drives the other four.

mod delivery;
mod dispatch;
mod presence;
mod registry;
mod rooms;

pub use delivery::DeliveryEngine;
pub use dispatch::Dispatcher;
pub use presence::PresenceCoordinator;
pub use registry::{ConnectionHandle, ConnectionRegistry};
pub use rooms::RoomMultiplexer;
