//! Full configuration validation.
//!
//! Each domain has its own submodule; this orchestrator calls them all
//! and collects errors into a single `ConfigError`.

mod helpers;
mod live;


use crate::schema::NearbyConfig;
use nearby_common::ConfigError;

/// Run all validations on a config, collecting all errors.
pub fn validate(config: &NearbyConfig) -> Result<(), ConfigError> {
    let mut errors: Vec<String> = Vec::new();

    live::validate_realtime(&mut errors, config);
    live::validate_presence(&mut errors, config);
    live::validate_status(&mut errors, config);
    live::validate_notifications(&mut errors, config);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(errors.join("; ")))
    }
}
