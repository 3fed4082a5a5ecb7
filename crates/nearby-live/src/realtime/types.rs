//! Configuration, protocol types, and event/command enums for the realtime client.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use nearby_config::NearbyConfig;

use crate::backend::{ChangeKind, RowFilter};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for connecting to Supabase Realtime.
#[derive(Clone)]
pub struct RealtimeConfig {
    /// Supabase project reference (e.g., "ojmqzagktzkualzgpcbq").
    pub project_ref: String,
    /// Supabase anon key (publishable).
    pub api_key: String,
    /// Optional access token (JWT) for authenticated connections.
    pub access_token: Option<String>,
    /// Heartbeat interval in seconds (default: 25).
    pub heartbeat_interval_secs: u64,
    /// Seconds without any inbound frame before the socket counts as dead.
    pub heartbeat_timeout_secs: u64,
    /// Reconnect base delay in seconds.
    pub reconnect_delay_secs: u64,
    /// Maximum reconnect delay in seconds.
    pub max_reconnect_delay_secs: u64,
}

impl std::fmt::Debug for RealtimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeConfig")
            .field("project_ref", &self.project_ref)
            .field("api_key", &"[REDACTED]")
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("heartbeat_interval_secs", &self.heartbeat_interval_secs)
            .field("heartbeat_timeout_secs", &self.heartbeat_timeout_secs)
            .field("reconnect_delay_secs", &self.reconnect_delay_secs)
            .field("max_reconnect_delay_secs", &self.max_reconnect_delay_secs)
            .finish()
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            project_ref: String::new(),
            api_key: String::new(),
            access_token: None,
            heartbeat_interval_secs: 25,
            heartbeat_timeout_secs: 60,
            reconnect_delay_secs: 1,
            max_reconnect_delay_secs: 30,
        }
    }
}

impl RealtimeConfig {
    pub fn from_config(config: &NearbyConfig, access_token: Option<String>) -> Self {
        Self {
            project_ref: config.backend.project_ref.clone(),
            api_key: config.backend.api_key.clone(),
            access_token,
            heartbeat_interval_secs: config.realtime.heartbeat_interval_secs,
            heartbeat_timeout_secs: config.realtime.heartbeat_timeout_secs,
            reconnect_delay_secs: config.realtime.reconnect_delay_secs,
            max_reconnect_delay_secs: config.realtime.max_reconnect_delay_secs,
        }
    }

    /// Build the WebSocket URL for Supabase Realtime.
    pub(crate) fn ws_url(&self) -> String {
        format!(
            "wss://{}.supabase.co/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            self.project_ref, self.api_key
        )
    }
}

// ---------------------------------------------------------------------------
// Phoenix Protocol Types
// ---------------------------------------------------------------------------

/// A Phoenix protocol message envelope (v1 JSON format).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    pub payload: serde_json::Value,
    #[serde(rename = "ref")]
    pub msg_ref: Option<String>,
}

impl PhoenixMessage {
    pub(crate) fn new(topic: &str, event: &str, payload: serde_json::Value, msg_ref: String) -> Self {
        Self {
            topic: format!("realtime:{topic}"),
            event: event.to_string(),
            payload,
            msg_ref: Some(msg_ref),
        }
    }
}

// ---------------------------------------------------------------------------
// Channel Configuration
// ---------------------------------------------------------------------------

/// Configuration for a Supabase Realtime channel.
#[derive(Debug, Clone, Default)]
pub struct ChannelConfig {
    /// The key used to identify this client in presence state. Empty for
    /// channels that never track presence.
    pub presence_key: String,
    /// Row changes to stream on this channel.
    pub postgres_changes: Vec<RowFilter>,
}

impl ChannelConfig {
    /// Serialize to the JSON payload expected by Supabase phx_join.
    pub(crate) fn to_join_payload(&self, access_token: Option<&str>) -> serde_json::Value {
        let changes: Vec<serde_json::Value> = self
            .postgres_changes
            .iter()
            .map(|filter| {
                let mut change = serde_json::json!({
                    "event": filter.event.as_str(),
                    "schema": "public",
                    "table": filter.table,
                });
                if let Some(expr) = filter.filter_expr() {
                    change["filter"] = serde_json::Value::String(expr);
                }
                change
            })
            .collect();

        let mut payload = serde_json::json!({
            "config": {
                "broadcast": { "self": false, "ack": false },
                "presence": { "key": self.presence_key },
                "postgres_changes": changes,
            }
        });
        if let Some(token) = access_token {
            payload["access_token"] = serde_json::Value::String(token.to_string());
        }
        payload
    }
}

// ---------------------------------------------------------------------------
// Events & Commands
// ---------------------------------------------------------------------------

/// A row change streamed on a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PostgresChange {
    pub table: String,
    pub kind: ChangeKind,
    pub record: serde_json::Value,
    pub old_record: serde_json::Value,
}

/// Events emitted by the realtime client.
#[derive(Debug, Clone)]
pub enum RealtimeEvent {
    /// WebSocket connection established.
    Connected,
    /// WebSocket connection lost. Server-side presence is gone with it.
    Disconnected,
    /// Successfully joined a channel.
    ChannelJoined { topic: String },
    /// Join refused, or channel closed or errored.
    ChannelError { topic: String, message: String },
    /// Full presence state snapshot (received after joining).
    PresenceState {
        topic: String,
        state: HashMap<String, Vec<serde_json::Value>>,
    },
    /// Incremental presence changes.
    PresenceDiff {
        topic: String,
        joins: HashMap<String, Vec<serde_json::Value>>,
        leaves: HashMap<String, Vec<serde_json::Value>>,
    },
    /// Row change on a channel joined with `postgres_changes`.
    PostgresChange { topic: String, change: PostgresChange },
    /// Error.
    Error(String),
}

/// Commands sent to the realtime client from the application layer.
#[derive(Debug)]
pub(crate) enum RealtimeCommand {
    JoinChannel {
        topic: String,
        config: ChannelConfig,
    },
    LeaveChannel {
        topic: String,
    },
    PresenceTrack {
        topic: String,
        payload: serde_json::Value,
    },
    PresenceUntrack {
        topic: String,
    },
    Disconnect,
}
