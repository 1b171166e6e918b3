use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub binding: BindingConfig,
    pub logging: LoggingConfig,
}

/// Identity of the local node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub server_type: String,
    pub frontend: bool,
    pub metadata: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            server_type: "connector".to_string(),
            frontend: true,
            metadata: HashMap::new(),
        }
    }
}

/// Binding storage (coordination store) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BindingConfig {
    /// Store endpoints, e.g. `localhost:2379`
    pub endpoints: Vec<String>,
    pub dial_timeout_secs: u64,
    /// Key namespace shared by every key the registry reads or writes
    pub prefix: String,
    pub lease_ttl_secs: u64,
    /// Delay between lease re-grant attempts after the keep-alive stream dies
    pub lease_retry_backoff_ms: u64,
    /// Delay before re-opening a failed binding watch
    pub watch_retry_backoff_ms: u64,
    /// Upper bound of the random jitter added to both backoffs
    pub max_jitter_ms: u64,
    /// Timeout applied to each individual store call
    pub operation_timeout_secs: u64,
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["localhost:2379".to_string()],
            dial_timeout_secs: 5,
            prefix: "tether/".to_string(),
            lease_ttl_secs: 5,
            lease_retry_backoff_ms: 5000,
            watch_retry_backoff_ms: 1000,
            max_jitter_ms: 0,
            operation_timeout_secs: 5,
        }
    }
}

impl BindingConfig {
    #[must_use]
    pub const fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    #[must_use]
    pub const fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    #[must_use]
    pub const fn lease_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.lease_retry_backoff_ms)
    }

    #[must_use]
    pub const fn watch_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.watch_retry_backoff_ms)
    }

    #[must_use]
    pub const fn max_jitter(&self) -> Duration {
        Duration::from_millis(self.max_jitter_ms)
    }

    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Reject settings the registry cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.iter().all(|e| e.trim().is_empty()) {
            return Err(ConfigError::Message(
                "binding.endpoints must contain at least one address".to_string(),
            ));
        }
        if self.lease_ttl_secs == 0 {
            return Err(ConfigError::Message(
                "binding.lease_ttl_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // TETHER_BINDING__LEASE_TTL_SECS=10, TETHER_BINDING__ENDPOINTS=a:2379,b:2379
        builder = builder.add_source(
            Environment::with_prefix("TETHER")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("binding.endpoints")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.binding.validate()?;
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert!(config.server.frontend);
        assert_eq!(config.binding.prefix, "tether/");
        assert_eq!(config.binding.lease_ttl(), Duration::from_secs(5));
        assert_eq!(config.binding.lease_retry_backoff(), Duration::from_secs(5));
        assert_eq!(config.binding.watch_retry_backoff(), Duration::from_secs(1));
        assert!(config.binding.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_endpoints() {
        let binding = BindingConfig {
            endpoints: vec![String::new()],
            ..Default::default()
        };
        assert!(binding.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_ttl() {
        let binding = BindingConfig {
            lease_ttl_secs: 0,
            ..Default::default()
        };
        assert!(binding.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            r#"
[server]
id = "connector-7"
type = "connector"
frontend = true

[binding]
endpoints = ["etcd-0:2379", "etcd-1:2379"]
prefix = "game/"
lease_ttl_secs = 30
"#
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.id, "connector-7");
        assert_eq!(config.server.server_type, "connector");
        assert_eq!(config.binding.endpoints.len(), 2);
        assert_eq!(config.binding.prefix, "game/");
        assert_eq!(config.binding.lease_ttl_secs, 30);
        // Unset fields keep their defaults
        assert_eq!(config.binding.dial_timeout_secs, 5);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = Config::from_file("/nonexistent/tether.toml").unwrap();
        assert_eq!(config.binding.lease_ttl_secs, 5);
    }
}
