/*!
 * Configuration management for lightsim.
 *
 * This module provides functionality to load, validate, and access configuration
 * settings for simulated devices and their sessions.
 */
use std::path::Path;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Core configuration for lightsim
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Device session configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Clean cycle configuration
    #[serde(default)]
    pub clean: CleanConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Application environment (development, testing, etc.)
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to include event targets in log lines
    #[serde(default = "default_with_target")]
    pub with_target: bool,
}

/// Settings shared by every IO session a device opens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Capacity of each IO channel's receive queue
    #[serde(default = "default_receive_queue_capacity")]
    pub receive_queue_capacity: usize,

    /// How long finishing a session waits for in-flight work, in milliseconds
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

/// Clean (HEV) cycle configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanConfig {
    /// Cycle length used when a request asks for zero seconds
    #[serde(default = "default_clean_duration_s")]
    pub default_duration_s: u32,

    /// Longest cycle a device accepts
    #[serde(default = "default_clean_max_duration_s")]
    pub max_duration_s: u32,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            environment: default_environment(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            with_target: default_with_target(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            receive_queue_capacity: default_receive_queue_capacity(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl SessionConfig {
    /// The shutdown timeout as a duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for CleanConfig {
    fn default() -> Self {
        Self {
            default_duration_s: default_clean_duration_s(),
            max_duration_s: default_clean_max_duration_s(),
        }
    }
}

fn default_app_name() -> String {
    "lightsim".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_with_target() -> bool {
    true
}

fn default_receive_queue_capacity() -> usize {
    100
}

fn default_shutdown_timeout_ms() -> u64 {
    2000
}

fn default_clean_duration_s() -> u32 {
    7200
}

fn default_clean_max_duration_s() -> u32 {
    86400
}

impl Config {
    /// Render the configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check that the values make sense together
    pub fn validate(&self) -> Result<()> {
        if self.session.receive_queue_capacity == 0 {
            return Err(Error::config("session.receive_queue_capacity must be positive"));
        }
        if self.clean.default_duration_s > self.clean.max_duration_s {
            return Err(Error::config(format!(
                "clean.default_duration_s ({}) exceeds clean.max_duration_s ({})",
                self.clean.default_duration_s, self.clean.max_duration_s
            )));
        }
        Ok(())
    }
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
    override_with: Option<Config>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Override with an existing config
    pub fn override_with(mut self, config: Config) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        if let Some(config) = self.override_with {
            config.validate()?;
            return Ok(config);
        }

        let mut config_builder = ConfigLib::builder().add_source(
            ConfigLib::try_from(&Config::default())
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            if Path::new(&config_file).exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config: Config = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        config.validate()?;
        info!("Configuration loaded successfully");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.app_name, "lightsim");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.session.receive_queue_capacity, 100);
        assert_eq!(config.clean.default_duration_s, 7200);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder_defaults() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config.general.app_name, "lightsim");
        assert_eq!(config.session.shutdown_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_config_builder_with_file() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("lightsim.toml");

        {
            let mut file = File::create(&file_path)?;
            file.write_all(
                br#"
                [general]
                environment = "testing"

                [session]
                receive_queue_capacity = 8

                [clean]
                default_duration_s = 60
            "#,
            )?;
        }

        let config = ConfigBuilder::new().with_config_file(file_path).build()?;

        assert_eq!(config.general.environment, "testing");
        assert_eq!(config.session.receive_queue_capacity, 8);
        assert_eq!(config.clean.default_duration_s, 60);
        assert_eq!(config.clean.max_duration_s, 86400);

        Ok(())
    }

    #[test]
    fn test_config_builder_with_env() -> Result<()> {
        env::set_var("LIGHTSIM_ENV_TEST__LOGGING__LEVEL", "trace");

        let config = ConfigBuilder::new()
            .with_environment_prefix("lightsim_env_test")
            .build()?;

        assert_eq!(config.logging.level, "trace");

        env::remove_var("LIGHTSIM_ENV_TEST__LOGGING__LEVEL");
        Ok(())
    }

    #[test]
    fn test_validate_rejects_inverted_clean_bounds() {
        let mut config = Config::default();
        config.clean.default_duration_s = 10;
        config.clean.max_duration_s = 5;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let result = ConfigBuilder::new().override_with(config).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_to_toml_renders_sections() -> Result<()> {
        let mut config = Config::default();
        config.session.receive_queue_capacity = 3;
        let rendered = config.to_toml()?;
        assert!(rendered.contains("receive_queue_capacity = 3"));
        Ok(())
    }
}
