//! Ephemeral status records and events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LiveError;

/// What the user is currently broadcasting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    #[default]
    Normal,
    OpenToHang,
}

impl StatusKind {
    /// Value of the `status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKind::Normal => "normal",
            StatusKind::OpenToHang => "open_to_hang",
        }
    }
}

/// A position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    pub fn validate(&self) -> Result<(), LiveError> {
        let lat_ok = (-90.0..=90.0).contains(&self.lat);
        let lon_ok = (-180.0..=180.0).contains(&self.lon);
        if lat_ok && lon_ok {
            Ok(())
        } else {
            Err(LiveError::InvalidCoordinates {
                lat: self.lat,
                lon: self.lon,
            })
        }
    }
}

/// The single status row a user owns.
#[derive(Debug, Clone, PartialEq)]
pub struct EphemeralStatus {
    pub user_id: String,
    pub kind: StatusKind,
    pub coordinates: Option<Coordinates>,
    pub expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl EphemeralStatus {
    pub fn normal(user_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            kind: StatusKind::Normal,
            coordinates: None,
            expires_at: None,
            updated_at: now,
        }
    }

    /// A non-normal status whose expiry has passed (or was never set).
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.kind != StatusKind::Normal && self.expires_at.map_or(true, |at| at <= now)
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.kind != StatusKind::Normal && !self.is_expired_at(now)
    }

    pub(crate) fn to_row(&self) -> serde_json::Value {
        let row = StatusRow {
            user_id: self.user_id.clone(),
            status: self.kind,
            latitude: self.coordinates.map(|c| c.lat),
            longitude: self.coordinates.map(|c| c.lon),
            expires_at: self.expires_at,
            updated_at: self.updated_at,
        };
        serde_json::to_value(row).unwrap_or(serde_json::Value::Null)
    }

    pub(crate) fn from_row(value: serde_json::Value) -> Result<Self, LiveError> {
        let row: StatusRow = serde_json::from_value(value)?;
        let coordinates = match (row.latitude, row.longitude) {
            (Some(lat), Some(lon)) => Some(Coordinates { lat, lon }),
            _ => None,
        };
        Ok(Self {
            user_id: row.user_id,
            kind: row.status,
            coordinates,
            expires_at: row.expires_at,
            updated_at: row.updated_at,
        })
    }
}

/// Persisted shape: flat columns, coordinates split in two.
#[derive(Debug, Serialize, Deserialize)]
struct StatusRow {
    user_id: String,
    #[serde(default)]
    status: StatusKind,
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

/// Status changes observed by this session.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    Updated(EphemeralStatus),
    Cleared { user_id: String },
    /// The local expiry timer fired.
    Expired { user_id: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn normal_is_never_expired() {
        let now = Utc::now();
        assert!(!EphemeralStatus::normal("u", now).is_expired_at(now));
    }

    #[test]
    fn open_status_expires_at_deadline() {
        let now = Utc::now();
        let status = EphemeralStatus {
            user_id: "u".into(),
            kind: StatusKind::OpenToHang,
            coordinates: None,
            expires_at: Some(now + Duration::seconds(10)),
            updated_at: now,
        };
        assert!(status.is_active_at(now));
        assert!(status.is_expired_at(now + Duration::seconds(10)));
    }

    #[test]
    fn open_status_without_expiry_counts_as_expired() {
        let now = Utc::now();
        let status = EphemeralStatus {
            expires_at: None,
            kind: StatusKind::OpenToHang,
            ..EphemeralStatus::normal("u", now)
        };
        assert!(status.is_expired_at(now));
    }

    #[test]
    fn row_uses_flat_columns() {
        let now = Utc::now();
        let status = EphemeralStatus {
            user_id: "u".into(),
            kind: StatusKind::OpenToHang,
            coordinates: Some(Coordinates { lat: 1.5, lon: -2.5 }),
            expires_at: Some(now),
            updated_at: now,
        };
        let row = status.to_row();
        assert_eq!(row["status"], "open_to_hang");
        assert_eq!(row["latitude"], 1.5);
        assert_eq!(row["longitude"], -2.5);
        assert_eq!(EphemeralStatus::from_row(row).unwrap(), status);
    }

    #[test]
    fn from_row_rejects_garbage() {
        let err = EphemeralStatus::from_row(serde_json::json!({"status": 7})).unwrap_err();
        assert!(matches!(err, LiveError::Decode(_)));
    }

    #[test]
    fn coordinate_bounds() {
        assert!(Coordinates { lat: 90.0, lon: -180.0 }.validate().is_ok());
        assert!(Coordinates { lat: 90.1, lon: 0.0 }.validate().is_err());
        assert!(Coordinates { lat: 0.0, lon: 181.0 }.validate().is_err());
    }
}
