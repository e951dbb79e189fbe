//! Daemon configuration
//! Loading, saving and validation of the TOML file

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use stated_core::ClientConfig;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Main daemon configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub client: ClientConfig,
    pub provision: ProvisionConfig,
    pub logging: LoggingConfig,
}

/// How the shared namespace root is prepared
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    /// Mount a tmpfs of this many bytes on the shared root
    pub tmpfs_size: Option<u64>,
    /// Permission bits of the shared root
    pub shared_mode: u32,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Also log to this file
    pub file: Option<PathBuf>,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            tmpfs_size: None,
            shared_mode: 0o755,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Holds the active configuration and where it came from
pub struct ConfigManager {
    config: RwLock<DaemonConfig>,
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    pub fn new() -> Self {
        Self {
            config: RwLock::new(DaemonConfig::default()),
            config_path: None,
        }
    }

    /// Load configuration from file
    pub async fn load_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let config_str = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let new_config: DaemonConfig =
            toml::from_str(&config_str).with_context(|| "Failed to parse config file")?;
        debug!("Parsed configuration: {:?}", new_config);

        *self.config.write().await = new_config;
        self.config_path = Some(path.to_path_buf());

        info!("Loaded configuration from: {}", path.display());
        Ok(())
    }

    /// Save current configuration to file
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let config_str = toml::to_string_pretty(&*self.config.read().await)?;

        tokio::fs::write(path.as_ref(), config_str)
            .await
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        info!("Saved configuration to: {}", path.as_ref().display());
        Ok(())
    }

    pub async fn get_config(&self) -> DaemonConfig {
        self.config.read().await.clone()
    }

    /// File the active configuration was loaded from
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Validate configuration
    pub fn validate(config: &DaemonConfig) -> Result<()> {
        config
            .client
            .validate()
            .with_context(|| "Invalid [client] section")?;

        if config.provision.shared_mode & !0o7777 != 0 {
            anyhow::bail!(
                "shared_mode {:o} is not a permission mask",
                config.provision.shared_mode
            );
        }
        if config.provision.tmpfs_size == Some(0) {
            anyhow::bail!("tmpfs_size must be > 0");
        }

        config
            .logging
            .level
            .parse::<tracing::Level>()
            .map_err(|_| anyhow::anyhow!("Invalid log level: {}", config.logging.level))?;

        Ok(())
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
