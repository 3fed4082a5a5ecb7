//! Presence configuration types.

use serde::{Deserialize, Serialize};

/// Presence system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub enabled: bool,
    /// Shared topic every client announces itself on.
    pub topic: String,
    /// Re-announce interval in seconds (valid range: 5-300).
    pub heartbeat_interval_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            topic: "presence:neighborhood".into(),
            heartbeat_interval_secs: 30,
        }
    }
}
