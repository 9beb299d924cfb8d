use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub backend: BackendConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Remote search/download service configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// API base, e.g. "http://localhost:8001/api". Operation paths are
    /// appended to it.
    pub base_url: String,
    /// Per-request timeout in seconds (default: 60)
    #[serde(default = "default_timeout")]
    pub timeout_secs: u32,
}

impl BackendConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_secs: default_timeout(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs as u64)
    }
}

fn default_timeout() -> u32 {
    60
}

/// Acquisition session behaviour.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Delay between the end of one status poll and the start of the next
    /// (milliseconds).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Images per part used when the caller does not pick a value.
    #[serde(default = "default_images_per_part")]
    pub default_images_per_part: u32,

    #[serde(default = "default_min_images_per_part")]
    pub min_images_per_part: u32,

    #[serde(default = "default_max_images_per_part")]
    pub max_images_per_part: u32,
}

impl SessionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_poll_interval() -> u64 {
    2000 // 2 seconds
}

fn default_images_per_part() -> u32 {
    4
}

fn default_min_images_per_part() -> u32 {
    3
}

fn default_max_images_per_part() -> u32 {
    5
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            default_images_per_part: default_images_per_part(),
            min_images_per_part: default_min_images_per_part(),
            max_images_per_part: default_max_images_per_part(),
        }
    }
}

/// Where fetched archives are saved.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}

/// Log output settings for the binary.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Emit JSON lines instead of human readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_minimal_config() {
        let toml = r#"
[backend]
base_url = "http://127.0.0.1:8001/api"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.backend.base_url, "http://127.0.0.1:8001/api");
        assert_eq!(config.backend.timeout_secs, 60);
        assert_eq!(config.session.poll_interval_ms, 2000);
        assert_eq!(config.session.default_images_per_part, 4);
        assert_eq!(config.session.min_images_per_part, 3);
        assert_eq!(config.session.max_images_per_part, 5);
        assert_eq!(config.output.dir.to_str().unwrap(), ".");
        assert_eq!(config.logging.filter, "info");
        assert!(!config.logging.json);
    }

    #[test]
    fn test_deserialize_missing_backend_fails() {
        let toml = r#"
[session]
poll_interval_ms = 100
"#;
        let result: Result<Config, _> = toml::from_str(toml);
        assert!(result.is_err());
    }

    #[test]
    fn test_deserialize_full_config() {
        let toml = r#"
[backend]
base_url = "https://parts.example.com/api/"
timeout_secs = 10

[session]
poll_interval_ms = 750
default_images_per_part = 3
min_images_per_part = 1
max_images_per_part = 8

[output]
dir = "/data/parts"

[logging]
filter = "partpix_core=debug"
json = true
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.backend.timeout(), Duration::from_secs(10));
        assert_eq!(config.session.poll_interval(), Duration::from_millis(750));
        assert_eq!(config.session.min_images_per_part, 1);
        assert_eq!(config.session.max_images_per_part, 8);
        assert_eq!(config.output.dir.to_str().unwrap(), "/data/parts");
        assert_eq!(config.logging.filter, "partpix_core=debug");
        assert!(config.logging.json);
    }
}
