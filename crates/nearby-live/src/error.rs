//! Error taxonomy for the live engine.

use serde::{Deserialize, Serialize};

/// Why a geolocation request did not produce a position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum GeoError {
    #[error("location permission denied")]
    PermissionDenied,
    #[error("position unavailable")]
    PositionUnavailable,
    #[error("location request timed out")]
    Timeout,
    #[error("location error: {0}")]
    Generic(String),
}

impl GeoError {
    /// Message suitable for showing to the user as a non-blocking notice.
    pub fn user_message(&self) -> &str {
        match self {
            GeoError::PermissionDenied => {
                "Location access was denied. Allow location sharing to let neighbors find you."
            }
            GeoError::PositionUnavailable => {
                "Your position could not be determined right now. Try again in a moment."
            }
            GeoError::Timeout => "Getting your location took too long. Try again.",
            GeoError::Generic(_) => "Something went wrong while getting your location.",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LiveError {
    /// Initial or ongoing topic connection failure. Not fatal.
    #[error("subscription failed: {0}")]
    SubscriptionFailure(String),

    /// The backend refused a write (ownership or constraint violation).
    #[error("write rejected: {0}")]
    WriteRejected(String),

    #[error("capability denied: {0}")]
    CapabilityDenied(#[from] GeoError),

    #[error("ttl must be positive and at most {max_mins} minutes")]
    InvalidTtl { max_mins: u32 },

    #[error("invalid coordinates: lat {lat}, lon {lon}")]
    InvalidCoordinates { lat: f64, lon: f64 },

    #[error("presence registry has not joined")]
    NotJoined,

    #[error("network error: {0}")]
    Network(String),

    #[error("decode error: {0}")]
    Decode(String),
}

impl LiveError {
    /// Whether the failure should be shown as an actionable notice
    /// rather than silently degraded.
    pub fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            LiveError::WriteRejected(_)
                | LiveError::CapabilityDenied(_)
                | LiveError::InvalidTtl { .. }
                | LiveError::InvalidCoordinates { .. }
        )
    }
}

impl From<serde_json::Error> for LiveError {
    fn from(e: serde_json::Error) -> Self {
        LiveError::Decode(e.to_string())
    }
}

impl From<LiveError> for nearby_common::NearbyError {
    fn from(e: LiveError) -> Self {
        match e {
            LiveError::Network(msg) => nearby_common::NearbyError::Network(msg),
            other => nearby_common::NearbyError::Live(other.to_string()),
        }
    }
}
