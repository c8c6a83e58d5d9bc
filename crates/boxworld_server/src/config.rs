//! Engine configuration.

use derive_getters::Getters;
use derive_more::{Display, Error};
use derive_setters::Setters;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Environment variable overriding [`EngineConfig::rng_secret`].
pub const RNG_SECRET_ENV: &str = "BOXWORLD_RNG_SECRET";
/// Environment variable selecting SQLite storage at the given path.
pub const DB_PATH_ENV: &str = "BOXWORLD_DB_PATH";

/// Where actor state is persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Process memory; lost on exit.
    #[default]
    Memory,
    /// A SQLite database file.
    Sqlite {
        /// Database file path.
        path: String,
    },
}

/// Debounce delays per fan-out family, in milliseconds.
#[derive(Debug, Clone, Getters, Setters, Serialize, Deserialize)]
#[setters(prefix = "with_")]
pub struct DebounceConfig {
    /// Game state, adjacency counts and balances.
    #[serde(default = "default_debounce_ms")]
    default_ms: u64,

    /// Checkbox page subscriptions.
    #[serde(default = "default_checkbox_ms")]
    checkbox_ms: u64,

    /// Global statistics.
    #[serde(default = "default_stats_ms")]
    stats_ms: u64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            default_ms: default_debounce_ms(),
            checkbox_ms: default_checkbox_ms(),
            stats_ms: default_stats_ms(),
        }
    }
}

/// Runtime configuration for the actor engine.
#[derive(Debug, Clone, Getters, Setters, Serialize, Deserialize)]
#[setters(prefix = "with_")]
pub struct EngineConfig {
    /// Hex-encoded secret keying layout generation.
    #[serde(default)]
    rng_secret: String,

    /// Persistence backend.
    #[serde(default)]
    storage: StorageConfig,

    /// Fan-out debounce delays.
    #[serde(default)]
    debounce: DebounceConfig,

    /// How often local stat deltas flush to the aggregator.
    #[serde(default = "default_stats_flush_ms")]
    stats_flush_ms: u64,

    /// Activations idle this long are dropped.
    #[serde(default = "default_actor_idle_secs")]
    actor_idle_secs: u64,

    /// How often idle activations are swept.
    #[serde(default = "default_actor_sweep_secs")]
    actor_sweep_secs: u64,

    /// Per-topic pub/sub buffer.
    #[serde(default = "default_pubsub_capacity")]
    pubsub_capacity: usize,
}

fn default_debounce_ms() -> u64 {
    250
}

fn default_checkbox_ms() -> u64 {
    500
}

fn default_stats_ms() -> u64 {
    1000
}

fn default_stats_flush_ms() -> u64 {
    1000
}

fn default_actor_idle_secs() -> u64 {
    600
}

fn default_actor_sweep_secs() -> u64 {
    60
}

fn default_pubsub_capacity() -> usize {
    1024
}

impl EngineConfig {
    /// Creates a configuration with defaults and the given secret.
    #[instrument(skip(rng_secret))]
    pub fn new(rng_secret: impl Into<String>) -> Self {
        Self {
            rng_secret: rng_secret.into(),
            storage: StorageConfig::default(),
            debounce: DebounceConfig::default(),
            stats_flush_ms: default_stats_flush_ms(),
            actor_idle_secs: default_actor_idle_secs(),
            actor_sweep_secs: default_actor_sweep_secs(),
            pubsub_capacity: default_pubsub_capacity(),
        }
    }

    /// Loads configuration from a TOML file.
    #[instrument(skip(path), fields(path = %path.as_ref().display()))]
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        debug!("Loading config from file");
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::new(format!("Failed to read config file: {}", e)))?;
        let config = Self::from_toml_str(&content)?;
        info!(storage = ?config.storage, "Config loaded successfully");
        Ok(config)
    }

    /// Parses configuration from TOML text.
    #[instrument(skip(content))]
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content)
            .map_err(|e| ConfigError::new(format!("Failed to parse config: {}", e)))
    }

    /// Applies `BOXWORLD_RNG_SECRET` and `BOXWORLD_DB_PATH` if set.
    ///
    /// Call `dotenvy::dotenv()` first to pick them up from a `.env` file.
    #[instrument(skip(self))]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(secret) = std::env::var(RNG_SECRET_ENV) {
            debug!("RNG secret taken from environment");
            self.rng_secret = secret;
        }
        if let Ok(path) = std::env::var(DB_PATH_ENV) {
            debug!(path = %path, "SQLite path taken from environment");
            self.storage = StorageConfig::Sqlite { path };
        }
        self
    }

    /// Checks values that serde cannot.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the secret is missing or not hex, or a
    /// period is zero.
    #[instrument(skip(self))]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rng_secret.trim().is_empty() {
            return Err(ConfigError::new(format!(
                "rng_secret is empty; set it in the config file or {}",
                RNG_SECRET_ENV
            )));
        }
        hex::decode(self.rng_secret.trim())
            .map_err(|e| ConfigError::new(format!("rng_secret is not hex: {}", e)))?;
        if self.stats_flush_ms == 0 || self.actor_sweep_secs == 0 || self.pubsub_capacity == 0 {
            return Err(ConfigError::new(
                "stats_flush_ms, actor_sweep_secs and pubsub_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Default fan-out delay.
    pub fn default_delay(&self) -> Duration {
        Duration::from_millis(self.debounce.default_ms)
    }

    /// Checkbox fan-out delay.
    pub fn checkbox_delay(&self) -> Duration {
        Duration::from_millis(self.debounce.checkbox_ms)
    }

    /// Statistics fan-out delay.
    pub fn stats_delay(&self) -> Duration {
        Duration::from_millis(self.debounce.stats_ms)
    }

    /// Stats flush period.
    pub fn stats_flush_period(&self) -> Duration {
        Duration::from_millis(self.stats_flush_ms)
    }

    /// Idle time before deactivation.
    pub fn actor_idle(&self) -> Duration {
        Duration::from_secs(self.actor_idle_secs)
    }

    /// Idle sweep period.
    pub fn actor_sweep_period(&self) -> Duration {
        Duration::from_secs(self.actor_sweep_secs)
    }
}

/// Configuration error.
#[derive(Debug, Clone, Display, Error)]
#[display("Config error: {} at {}:{}", message, file, line)]
pub struct ConfigError {
    /// Error message.
    pub message: String,
    /// Line number where error occurred.
    pub line: u32,
    /// Source file where error occurred.
    pub file: &'static str,
}

impl ConfigError {
    /// Creates a new configuration error.
    #[track_caller]
    pub fn new(message: String) -> Self {
        let loc = std::panic::Location::caller();
        Self {
            message,
            line: loc.line(),
            file: loc.file(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_toml() {
        let config = EngineConfig::from_toml_str(r#"rng_secret = "00ff""#).unwrap();
        assert_eq!(*config.stats_flush_ms(), 1000);
        assert_eq!(*config.debounce().default_ms(), 250);
        assert_eq!(*config.debounce().checkbox_ms(), 500);
        assert_eq!(*config.debounce().stats_ms(), 1000);
        assert_eq!(config.storage(), &StorageConfig::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sqlite_storage_table() {
        let config = EngineConfig::from_toml_str(
            r#"
            rng_secret = "abcd"

            [storage]
            kind = "sqlite"
            path = "boxworld.db"

            [debounce]
            checkbox_ms = 100
            "#,
        )
        .unwrap();
        assert_eq!(
            config.storage(),
            &StorageConfig::Sqlite {
                path: "boxworld.db".to_string()
            }
        );
        assert_eq!(config.checkbox_delay(), Duration::from_millis(100));
        assert_eq!(config.default_delay(), Duration::from_millis(250));
    }

    #[test]
    fn test_empty_secret_is_invalid() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert!(config.validate().is_err());
        assert!(EngineConfig::new("not hex").validate().is_err());
    }

    #[test]
    fn test_setters_chain() {
        let config = EngineConfig::new("01").with_stats_flush_ms(5).with_pubsub_capacity(8);
        assert_eq!(*config.stats_flush_ms(), 5);
        assert_eq!(*config.pubsub_capacity(), 8);
    }
}
