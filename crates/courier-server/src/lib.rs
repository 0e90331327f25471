//! Courier relay server.
//!
//! A one-to-one messaging relay: clients connect over WebSocket, bind an
//! identity, open conversation rooms, and exchange messages whose delivery
//! lifecycle (`sent` → `delivered` → `read`) and presence are synchronized
//! by the relay engine. A small REST surface handles account sign-up,
//! conversation provisioning and media uploads.

pub mod config;
pub mod relay;
pub mod server;
pub mod store;
