use anyhow::{Context, Result};
use roster_core::JsonUserStore;
use roster_mcp::users::user_capabilities;
use roster_mcp::CapabilityRegistry;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::session::SessionRegistry;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub sampling: SamplingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_users_file")]
    pub users_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Bounded wait for an agent's reply to a sampling request, in seconds
    #[serde(default = "default_sampling_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_users_file() -> String {
    "users.json".to_string()
}

fn default_sampling_timeout_secs() -> u64 {
    60
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            users_file: default_users_file(),
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_sampling_timeout_secs(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &PathBuf, data_dir: PathBuf) -> Result<Self> {
        // Create data directory if it doesn't exist
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        // Load config file if it exists, otherwise use defaults
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self {
                data_dir: data_dir.clone(),
                storage: Default::default(),
                sampling: Default::default(),
            }
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    /// Path to the user document
    pub fn users_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.users_file)
    }

    pub fn sampling_timeout(&self) -> Duration {
        Duration::from_secs(self.sampling.timeout_secs)
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionRegistry>,
    pub capabilities: Arc<CapabilityRegistry>,
    pub sampling_timeout: Duration,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let store = Arc::new(JsonUserStore::new(config.users_path()));
        let capabilities = Arc::new(user_capabilities(store));

        Ok(Self {
            sessions: Arc::new(SessionRegistry::new()),
            capabilities,
            sampling_timeout: config.sampling_timeout(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_config_file_absent() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = ServerConfig::load(
            &temp_dir.path().join("missing.toml"),
            temp_dir.path().to_path_buf(),
        )
        .unwrap();

        assert_eq!(config.users_path(), temp_dir.path().join("users.json"));
        assert_eq!(config.sampling_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_config_file_overrides() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("roster.toml");
        std::fs::write(
            &path,
            "[storage]\nusers_file = \"people.json\"\n\n[sampling]\ntimeout_secs = 5\n",
        )
        .unwrap();

        let config = ServerConfig::load(&path, temp_dir.path().to_path_buf()).unwrap();
        assert_eq!(config.users_path(), temp_dir.path().join("people.json"));
        assert_eq!(config.sampling_timeout(), Duration::from_secs(5));
    }
}
