//! Glint signaling server.
//!
//! Coordinates WebRTC screen-share sessions: rooms of users over
//! WebSocket, a single hub task owning all state, and per-session TURN
//! credentials from a co-located or external relay.

#![forbid(unsafe_code)]

pub mod auth;
pub mod client;
pub mod config;
pub mod event;
pub mod hub;
pub mod names;
pub mod relay;
pub mod room;
pub mod server;
