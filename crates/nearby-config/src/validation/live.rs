//! Validation for the live engine sections: realtime, presence, status,
//! and notifications.

use crate::schema::NearbyConfig;

use super::helpers::{validate_non_empty, validate_range, validate_range_f64};

/// Validate realtime socket timing.
pub(crate) fn validate_realtime(errors: &mut Vec<String>, config: &NearbyConfig) {
    let rt = &config.realtime;
    validate_range(
        errors,
        "realtime.heartbeat_interval_secs",
        rt.heartbeat_interval_secs,
        5,
        120,
    );
    if rt.heartbeat_timeout_secs <= rt.heartbeat_interval_secs {
        errors.push(format!(
            "realtime.heartbeat_timeout_secs = {} must exceed realtime.heartbeat_interval_secs = {}",
            rt.heartbeat_timeout_secs, rt.heartbeat_interval_secs
        ));
    }
    validate_range(errors, "realtime.join_timeout_secs", rt.join_timeout_secs, 1, 60);
    if rt.reconnect_delay_secs == 0 {
        errors.push("realtime.reconnect_delay_secs must be at least 1".into());
    }
    if rt.max_reconnect_delay_secs < rt.reconnect_delay_secs {
        errors.push(format!(
            "realtime.max_reconnect_delay_secs = {} is below realtime.reconnect_delay_secs = {}",
            rt.max_reconnect_delay_secs, rt.reconnect_delay_secs
        ));
    }
}

/// Validate presence constraints.
pub(crate) fn validate_presence(errors: &mut Vec<String>, config: &NearbyConfig) {
    validate_non_empty(errors, "presence.topic", &config.presence.topic);
    validate_range(
        errors,
        "presence.heartbeat_interval_secs",
        config.presence.heartbeat_interval_secs,
        5,
        300,
    );
}

/// Validate ephemeral status constraints.
pub(crate) fn validate_status(errors: &mut Vec<String>, config: &NearbyConfig) {
    let status = &config.status;
    validate_non_empty(errors, "status.table", &status.table);
    validate_range(
        errors,
        "status.max_ttl_mins",
        status.max_ttl_mins as u64,
        1,
        1440,
    );
    validate_range(
        errors,
        "status.default_ttl_mins",
        status.default_ttl_mins as u64,
        1,
        (status.max_ttl_mins as u64).max(1),
    );
    match (status.latitude, status.longitude) {
        (Some(lat), Some(lon)) => {
            validate_range_f64(errors, "status.latitude", lat, -90.0, 90.0);
            validate_range_f64(errors, "status.longitude", lon, -180.0, 180.0);
        }
        (None, None) => {}
        _ => errors.push("status.latitude and status.longitude must be set together".into()),
    }
}

/// Validate notification feed constraints.
pub(crate) fn validate_notifications(errors: &mut Vec<String>, config: &NearbyConfig) {
    validate_non_empty(errors, "notifications.table", &config.notifications.table);
    validate_non_empty(
        errors,
        "notifications.profiles_table",
        &config.notifications.profiles_table,
    );
}
