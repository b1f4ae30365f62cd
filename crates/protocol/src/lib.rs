//! Tether Protocol
//!
//! Shared types for communication between a Tether server and its clients.
//! These types are serialized as JSON over WebSocket.

use uuid::Uuid;

pub mod client;
pub mod server;
pub mod types;

pub use client::{ClientMessage, TurnCommand};
pub use server::{
    commands, ResumeStreamData, RpcResult, ServerMessage, StateProbeData, SubscribeData,
};
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
