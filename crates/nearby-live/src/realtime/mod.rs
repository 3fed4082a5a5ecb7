//! Thin Supabase Realtime client over Phoenix Channels v1 protocol.
//!
//! Handles heartbeats, channel join/leave, presence tracking, row-change
//! streams, and auto-reconnect with backoff using `tokio-tungstenite`.

mod client;
mod connection;
mod handler;
mod types;

pub use client::RealtimeClient;
#[cfg(test)]
pub(crate) use types::RealtimeCommand;
pub use types::{ChannelConfig, PhoenixMessage, PostgresChange, RealtimeConfig, RealtimeEvent};
