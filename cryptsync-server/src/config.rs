//! Server configuration file handling.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level TOML configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP listen address for the WebSocket endpoint.
    pub listen_addr: String,
    /// Maximum accepted payload size, announced to clients in `Identify`.
    pub upload_limit: u32,
    pub database: DatabaseConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:4242".to_string(),
            upload_limit: 10 * 1024 * 1024,
            database: DatabaseConfig::default(),
        }
    }
}

/// The `[database]` section. The full key set of the original deployment
/// format is accepted; the sqlite driver only consumes `driver` and `name`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub driver: String,
    /// Database file path for the sqlite driver.
    pub name: PathBuf,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub options: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: "sqlite".to_string(),
            name: PathBuf::from("cryptsync.db"),
            host: String::new(),
            port: 0,
            username: String::new(),
            password: String::new(),
            options: String::new(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        if config.database.driver != "sqlite" {
            anyhow::bail!("unsupported database driver: {}", config.database.driver);
        }
        Ok(config)
    }
}
