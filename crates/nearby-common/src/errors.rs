use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ParseError(String),

    #[error("config validation error: {0}")]
    ValidationError(String),
}

#[derive(Debug, thiserror::Error)]
pub enum NearbyError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("network error: {0}")]
    Network(String),

    #[error("live error: {0}")]
    Live(String),

    #[error("{0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let err = ConfigError::FileNotFound(PathBuf::from("/tmp/missing.toml"));
        assert_eq!(err.to_string(), "config file not found: /tmp/missing.toml");

        let err = ConfigError::ParseError("unexpected token".into());
        assert_eq!(err.to_string(), "config parse error: unexpected token");

        let err = ConfigError::ValidationError("presence.heartbeat_interval_secs".into());
        assert_eq!(
            err.to_string(),
            "config validation error: presence.heartbeat_interval_secs"
        );
    }

    #[test]
    fn nearby_error_from_config() {
        let config_err = ConfigError::ParseError("bad toml".into());
        let err: NearbyError = config_err.into();
        assert!(matches!(err, NearbyError::Config(_)));
        assert!(err.to_string().contains("bad toml"));
    }

    #[test]
    fn nearby_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err: NearbyError = io_err.into();
        assert!(matches!(err, NearbyError::Io(_)));
        assert!(err.to_string().contains("file missing"));
    }

    #[test]
    fn nearby_error_other_variants() {
        let err = NearbyError::Network("timeout".into());
        assert_eq!(err.to_string(), "network error: timeout");

        let err = NearbyError::Live("write rejected".into());
        assert_eq!(err.to_string(), "live error: write rejected");

        let err = NearbyError::Other("something went wrong".into());
        assert_eq!(err.to_string(), "something went wrong");
    }
}
