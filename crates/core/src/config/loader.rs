use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use std::path::Path;

use super::{types::Config, ConfigError};

/// Load configuration from file with environment variable overrides.
///
/// Environment keys use the `PARTPIX_` prefix and `__` as the section
/// separator, e.g. `PARTPIX_BACKEND__BASE_URL`.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()));
    }

    let config: Config = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed("PARTPIX_").split("__"))
        .extract()
        .map_err(|e| ConfigError::ParseError(e.to_string()))?;

    Ok(config)
}

/// Load configuration from TOML string (useful for testing)
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    toml::from_str(toml_str).map_err(|e| ConfigError::ParseError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config_from_str_valid() {
        let toml = r#"
[backend]
base_url = "http://localhost:8001/api"

[session]
poll_interval_ms = 500
"#;
        let config = load_config_from_str(toml).unwrap();
        assert_eq!(config.backend.base_url, "http://localhost:8001/api");
        assert_eq!(config.session.poll_interval_ms, 500);
    }

    #[test]
    fn test_load_config_from_str_missing_backend() {
        let toml = r#"
[session]
poll_interval_ms = 500
"#;
        let result = load_config_from_str(toml);
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/partpix.toml"));
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
[backend]
base_url = "https://parts.example.com/api"
timeout_secs = 15

[output]
dir = "/tmp/archives"
"#
        )
        .unwrap();

        let config = load_config(temp_file.path()).unwrap();
        assert_eq!(config.backend.base_url, "https://parts.example.com/api");
        assert_eq!(config.backend.timeout_secs, 15);
        assert_eq!(config.output.dir.to_str().unwrap(), "/tmp/archives");
        assert_eq!(config.session.poll_interval_ms, 2000);
    }
}
