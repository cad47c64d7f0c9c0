//! Server configuration and configuration errors.

use serde::Deserialize;

/// Errors detected while validating loaded configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Duplicate account '{0}'")]
    DuplicateAccount(String),

    #[error("User '{0}' is declared by more than one account")]
    DuplicateUser(String),

    #[error("Account '{account}' exports unknown importer '{importer}'")]
    UnknownImporter { account: String, importer: String },

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host clients connect to.
    pub host: String,
    /// Port clients connect to.
    pub port: u16,
    /// Directory for file-backed streams and cursors.
    /// `None` keeps everything in memory.
    pub store_dir: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4222,
            store_dir: None,
        }
    }
}

impl ServerConfig {
    /// Client-reachable address, e.g. `nats://127.0.0.1:4222`.
    pub fn client_url(&self) -> String {
        format!("nats://{}:{}", self.host, self.port)
    }
}
