use super::{types::Config, ConfigError};

/// Validate configuration
/// Currently validates:
/// - Backend URL is http(s) and the timeout is not 0
/// - Poll interval is not 0
/// - Images-per-part bounds are ordered and include the default
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let url = config.backend.base_url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ConfigError::ValidationError(format!(
            "backend.base_url must be an http(s) URL, got {:?}",
            config.backend.base_url
        )));
    }

    if config.backend.timeout_secs == 0 {
        return Err(ConfigError::ValidationError(
            "backend.timeout_secs cannot be 0".to_string(),
        ));
    }

    if config.session.poll_interval_ms == 0 {
        return Err(ConfigError::ValidationError(
            "session.poll_interval_ms cannot be 0".to_string(),
        ));
    }

    let s = &config.session;
    if s.min_images_per_part == 0
        || s.min_images_per_part > s.max_images_per_part
        || !(s.min_images_per_part..=s.max_images_per_part).contains(&s.default_images_per_part)
    {
        return Err(ConfigError::ValidationError(format!(
            "session images per part must satisfy 1 <= min ({}) <= default ({}) <= max ({})",
            s.min_images_per_part, s.default_images_per_part, s.max_images_per_part
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, LoggingConfig, OutputConfig, SessionConfig};

    fn config() -> Config {
        Config {
            backend: BackendConfig::new("http://localhost:8001/api"),
            session: SessionConfig::default(),
            output: OutputConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(validate_config(&config()).is_ok());
    }

    #[test]
    fn test_validate_non_http_url_fails() {
        let mut config = config();
        config.backend.base_url = "localhost:8001".to_string();
        let err = validate_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_validate_zero_timeout_fails() {
        let mut config = config();
        config.backend.timeout_secs = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_zero_poll_interval_fails() {
        let mut config = config();
        config.session.poll_interval_ms = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_default_outside_bounds_fails() {
        let mut config = config();
        config.session.default_images_per_part = 9;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("images per part"));
    }

    #[test]
    fn test_validate_zero_minimum_fails() {
        let mut config = config();
        config.session.min_images_per_part = 0;
        assert!(validate_config(&config).is_err());
    }
}
