//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables. Consumed
//! once at broker startup.

mod accounts;
mod limits;
mod server;
mod stream;

pub use accounts::{AccountConfig, ExportConfig, UserConfig};
pub use limits::{
    AccountLimits, SourcingConfig, DEFAULT_BATCH_SIZE, DEFAULT_CHANNEL_CAPACITY,
    DEFAULT_MAX_BACKOFF_MS, DEFAULT_MIN_BACKOFF_MS,
};
pub use server::{ConfigError, ServerConfig};
pub use stream::{
    limit, DiscardPolicy, ExternalSourceConfig, RetentionPolicy, SourceConfig, StorageType,
    StreamConfig, DEFAULT_DUPLICATE_WINDOW_NS,
};

use std::collections::HashSet;

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "SOURCING_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "SOURCING";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "SOURCING_LOG";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,
    /// Sourcing consumer tuning.
    pub sourcing: SourcingConfig,
    /// Accounts, their users, limits and exports.
    pub accounts: Vec<AccountConfig>,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, File, FileFormat};

        let config: Config = ConfigLib::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-references the type system cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut accounts = HashSet::new();
        let mut users = HashSet::new();

        for account in &self.accounts {
            if !accounts.insert(account.name.as_str()) {
                return Err(ConfigError::DuplicateAccount(account.name.clone()));
            }
            for user in &account.users {
                if !users.insert(user.user.as_str()) {
                    return Err(ConfigError::DuplicateUser(user.user.clone()));
                }
            }
        }

        for account in &self.accounts {
            for export in &account.exports {
                if let Some(importer) = export.to.iter().find(|a| !accounts.contains(a.as_str())) {
                    return Err(ConfigError::UnknownImporter {
                        account: account.name.clone(),
                        importer: importer.clone(),
                    });
                }
            }
        }

        if self.sourcing.batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: "sourcing.batch_size".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.sourcing.channel_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "sourcing.channel_capacity".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(())
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }

    pub fn with_account(mut self, account: AccountConfig) -> Self {
        self.accounts.push(account);
        self
    }

    pub fn with_store_dir(mut self, dir: impl Into<String>) -> Self {
        self.server.store_dir = Some(dir.into());
        self
    }
}
