use std::path::Path;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Application configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub ingest: IngestConfig,
    pub sync: SyncConfig,
    pub recommendations: RecommendationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file_path: Option<String>,
    pub format: String, // "json" or "text"
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub batch_size: usize,
    pub skip_existing: bool,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub structured_fallback: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub default_strategy: String,
    pub compress: bool,
    pub backup_before_import: bool,
    pub backup_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationConfig {
    pub enabled: bool,
    /// Forward origins of unknown kind with an absolute id below this are
    /// not treated as channels
    pub min_channel_id: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                path: "data/coordinates.db".to_string(),
                max_connections: 4,
                busy_timeout_ms: 5_000,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                file_path: None,
                format: "text".to_string(),
            },
            ingest: IngestConfig {
                batch_size: 100,
                skip_existing: false,
                max_retries: 3,
                retry_base_delay_ms: 1_000,
                structured_fallback: true,
            },
            sync: SyncConfig {
                default_strategy: "smart".to_string(),
                compress: true,
                backup_before_import: true,
                backup_dir: None,
            },
            recommendations: RecommendationConfig {
                enabled: true,
                min_channel_id: 1_000_000_000,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from the default locations
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration from multiple sources with precedence.
    ///
    /// Built-in defaults, then `config/default.*`, `config/local.*` and
    /// `channel-coords.*`, then `explicit` if given, then `CHANNEL_COORDS__*`
    /// environment variables (`CHANNEL_COORDS__DATABASE__PATH=...`).
    pub fn load_from(explicit: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            // Start with default values
            .add_source(Config::try_from(&Self::default())?)
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(File::with_name("channel-coords").required(false));

        if let Some(path) = explicit {
            builder = builder.add_source(File::from(path).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("CHANNEL_COORDS")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let app_config: Self = config.try_deserialize()?;

        // Validate configuration
        app_config.validate()?;

        Ok(app_config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.database.path.trim().is_empty() {
            return Err(invalid("database.path must not be empty"));
        }
        if self.database.max_connections == 0 {
            return Err(invalid("database.max_connections must be greater than 0"));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(invalid(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level, valid_levels
            )));
        }

        let valid_formats = ["text", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(invalid(format!(
                "Invalid log format: {}. Must be one of: {:?}",
                self.logging.format, valid_formats
            )));
        }

        if self.ingest.batch_size == 0 {
            return Err(invalid("ingest.batch_size must be greater than 0"));
        }
        if self.ingest.retry_base_delay_ms == 0 {
            return Err(invalid("ingest.retry_base_delay_ms must be greater than 0"));
        }

        let valid_strategies = ["conservative", "aggressive", "smart"];
        if !valid_strategies.contains(&self.sync.default_strategy.to_lowercase().as_str()) {
            return Err(invalid(format!(
                "Invalid merge strategy: {}. Must be one of: {:?}",
                self.sync.default_strategy, valid_strategies
            )));
        }

        if self.recommendations.min_channel_id < 0 {
            return Err(invalid("recommendations.min_channel_id must not be negative"));
        }

        Ok(())
    }

    /// Get log level from environment or config
    #[must_use]
    pub fn get_log_level(&self) -> String {
        std::env::var("RUST_LOG").unwrap_or_else(|_| self.logging.level.clone())
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::InvalidConfig(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.database.path, "data/coordinates.db");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.ingest.batch_size, 100);
        assert_eq!(config.recommendations.min_channel_id, 1_000_000_000);
    }

    #[test]
    fn test_config_validation() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config() {
        let mut config = AppConfig::default();
        config.database.max_connections = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let mut config = AppConfig::default();
        config.sync.default_strategy = "newest".to_string();
        assert!(config.validate().is_err());
    }
}
