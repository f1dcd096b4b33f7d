//! Configuration management for Bulwark.
//!
//! Settings come from an optional file (format picked by extension) layered
//! under `BULWARK__`-prefixed environment variables, e.g.
//! `BULWARK__SWEEPER__INTERVAL_SECS=60`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{BulwarkError, Result};
use crate::ratelimit::PolicyRegistry;

/// Main configuration for the Bulwark service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulwarkConfig {
    /// Sweeper configuration
    #[serde(default)]
    pub sweeper: SweeperConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for BulwarkConfig {
    fn default() -> Self {
        Self {
            sweeper: SweeperConfig::default(),
            rate_limiting: RateLimitingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Sweeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Seconds between sweeps
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    300
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path to a YAML policy table; the built-in table is used when unset
    pub policies_path: Option<String>,

    /// Where counter state is restored from at startup and saved at shutdown
    pub snapshot_path: Option<String>,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl BulwarkConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path));
        }

        builder
            .add_source(::config::Environment::with_prefix("BULWARK").separator("__"))
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| BulwarkError::Config(e.to_string()))
    }

    /// Sweep period as a duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweeper.interval_secs.max(1))
    }

    /// Load the configured policy table, or the built-in one.
    pub fn load_policies(&self) -> Result<PolicyRegistry> {
        match &self.rate_limiting.policies_path {
            Some(path) => PolicyRegistry::from_file(path),
            None => Ok(PolicyRegistry::defaults()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = BulwarkConfig::default();
        assert_eq!(config.sweep_interval(), Duration::from_secs(300));
        assert_eq!(config.logging.format, LogFormat::Text);
        assert_eq!(config.load_policies().unwrap().len(), 3);
    }

    #[test]
    fn test_load_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let policies_path = dir.path().join("policies.yaml");
        std::fs::write(
            &policies_path,
            "policies:\n  SEND_GIFT:\n    max_requests: 10\n    window_ms: 60000\n",
        )
        .unwrap();

        let config_path = dir.path().join("bulwark.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            "sweeper:\n  interval_secs: 30\nrate_limiting:\n  policies_path: {}\nlogging:\n  format: json\n",
            policies_path.display()
        )
        .unwrap();

        let config = BulwarkConfig::load(Some(config_path.as_path())).unwrap();
        assert_eq!(config.sweep_interval(), Duration::from_secs(30));
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "info");

        let policies = config.load_policies().unwrap();
        assert_eq!(policies.len(), 1);
        assert!(policies.get("SEND_GIFT").is_some());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = BulwarkConfig::load(Some(Path::new("/nonexistent/bulwark.yaml"))).unwrap_err();
        assert!(matches!(err, BulwarkError::Config(_)));
    }
}
