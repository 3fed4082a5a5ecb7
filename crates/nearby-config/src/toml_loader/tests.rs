//! Tests for TOML config loading, creation, and path resolution.

use super::*;
use crate::schema::FeedOrder;
use std::path::Path;

#[test]
fn load_from_nonexistent_returns_file_not_found() {
    let result = load_from_path(Path::new("/tmp/nonexistent_nearby_config.toml"));
    let err = result.unwrap_err();
    assert!(matches!(err, nearby_common::ConfigError::FileNotFound(_)));
}

#[test]
fn load_valid_partial_toml() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[presence]
topic = "presence:barrio-norte"
heartbeat_interval_secs = 45

[notifications]
order = "desc"
"#,
    )
    .unwrap();

    let config = load_from_path(&path).unwrap();
    assert_eq!(config.presence.topic, "presence:barrio-norte");
    assert_eq!(config.presence.heartbeat_interval_secs, 45);
    assert_eq!(config.notifications.order, FeedOrder::Desc);
    // Defaults preserved
    assert!(config.presence.enabled);
    assert_eq!(config.status.table, "user_status");
    assert_eq!(config.realtime.heartbeat_timeout_secs, 60);
}

#[test]
fn load_invalid_toml_returns_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "this is not valid toml {{{").unwrap();

    let err = load_from_path(&path).unwrap_err();
    assert!(matches!(err, nearby_common::ConfigError::ParseError(_)));
}

#[test]
fn load_config_with_invalid_values_keeps_parsed_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[status]
max_ttl_mins = 0
"#,
    )
    .unwrap();

    let config = load_from_path(&path).unwrap();
    assert_eq!(config.status.max_ttl_mins, 0);
}

#[test]
fn create_and_load_default_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nearby").join("config.toml");

    create_default_config(&path).unwrap();
    assert!(path.exists());

    let config = load_from_path(&path).unwrap();
    assert_eq!(config.presence.heartbeat_interval_secs, 30);
    assert_eq!(config.status.default_ttl_mins, 60);
    assert_eq!(config.notifications.table, "notifications");
}

#[test]
fn default_config_path_ends_with_nearby_config() {
    let path = default_config_path().unwrap();
    assert!(path.ends_with("nearby/config.toml"));
}

#[test]
fn optional_coordinates_parse() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[status]
latitude = 40.4168
longitude = -3.7038
"#,
    )
    .unwrap();

    let config = load_from_path(&path).unwrap();
    assert_eq!(config.status.latitude, Some(40.4168));
    assert_eq!(config.status.longitude, Some(-3.7038));
}
