//! Ephemeral status ("open to hang") configuration.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    /// Table holding one status row per user.
    pub table: String,
    /// TTL used when the caller does not pick one, in minutes.
    pub default_ttl_mins: u32,
    /// Upper bound on any requested TTL, in minutes (valid range: 1-1440).
    pub max_ttl_mins: u32,
    /// When false, location requests fail with a permission error.
    pub share_location: bool,
    /// Fixed position reported by the static geolocator.
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            table: "user_status".into(),
            default_ttl_mins: 60,
            max_ttl_mins: 480,
            share_location: true,
            latitude: None,
            longitude: None,
        }
    }
}
