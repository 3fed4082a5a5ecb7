use serde::{Deserialize, Serialize};

/// Realtime socket settings (Phoenix Channels transport).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Socket heartbeat interval in seconds (valid range: 5-120).
    pub heartbeat_interval_secs: u64,
    /// Inbound silence after which the socket is considered dead.
    pub heartbeat_timeout_secs: u64,
    /// Reconnect base delay in seconds.
    pub reconnect_delay_secs: u64,
    /// Maximum reconnect delay in seconds.
    pub max_reconnect_delay_secs: u64,
    /// How long to wait for a channel join reply.
    pub join_timeout_secs: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 25,
            heartbeat_timeout_secs: 60,
            reconnect_delay_secs: 1,
            max_reconnect_delay_secs: 30,
            join_timeout_secs: 10,
        }
    }
}
