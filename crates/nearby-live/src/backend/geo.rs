//! Geolocation capability.

use async_trait::async_trait;

use nearby_config::schema::StatusConfig;

use crate::error::GeoError;
use crate::status::Coordinates;

/// Source of the device's current position.
#[async_trait]
pub trait Geolocator: Send + Sync {
    async fn current_position(&self) -> Result<Coordinates, GeoError>;
}

/// Reports a fixed, configured position.
///
/// Used where no positioning hardware is reachable (CLI, servers). When
/// location sharing is off every request is denied.
#[derive(Debug, Clone)]
pub struct StaticGeolocator {
    position: Option<Coordinates>,
    allowed: bool,
}

impl StaticGeolocator {
    pub fn new(position: Option<Coordinates>, allowed: bool) -> Self {
        Self { position, allowed }
    }

    pub fn from_config(config: &StatusConfig) -> Self {
        let position = match (config.latitude, config.longitude) {
            (Some(lat), Some(lon)) => Some(Coordinates { lat, lon }),
            _ => None,
        };
        Self::new(position, config.share_location)
    }
}

#[async_trait]
impl Geolocator for StaticGeolocator {
    async fn current_position(&self) -> Result<Coordinates, GeoError> {
        if !self.allowed {
            return Err(GeoError::PermissionDenied);
        }
        self.position.ok_or(GeoError::PositionUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn denied_when_sharing_disabled() {
        let geo = StaticGeolocator::new(Some(Coordinates { lat: 1.0, lon: 2.0 }), false);
        assert_eq!(geo.current_position().await, Err(GeoError::PermissionDenied));
    }

    #[tokio::test]
    async fn unavailable_without_position() {
        let geo = StaticGeolocator::from_config(&StatusConfig::default());
        assert_eq!(
            geo.current_position().await,
            Err(GeoError::PositionUnavailable)
        );
    }

    #[tokio::test]
    async fn reports_configured_position() {
        let config = StatusConfig {
            latitude: Some(40.4168),
            longitude: Some(-3.7038),
            ..Default::default()
        };
        let pos = StaticGeolocator::from_config(&config)
            .current_position()
            .await
            .unwrap();
        assert_eq!(pos, Coordinates { lat: 40.4168, lon: -3.7038 });
    }
}
