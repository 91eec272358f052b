//! Configuration Management Module
//!
//! Loads idevkit settings from TOML or YAML files, applies `IDEVKIT_*`
//! environment overrides and validates the result.

use crate::{DeviceKitError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::info;

/// Native toolchain configuration section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ToolchainConfig {
    /// Directory holding the libimobiledevice binaries; PATH lookup when unset
    pub bin_dir: Option<PathBuf>,
    pub command_timeout_secs: u64,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            bin_dir: None,
            command_timeout_secs: 30,
        }
    }
}

impl ToolchainConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Log monitor configuration section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    /// Grace period between SIGTERM and SIGKILL for the log process
    pub kill_grace_ms: u64,
    /// Optional cap on retained records
    pub max_records: Option<usize>,
    /// Capacity of the live tail channel
    pub tail_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            kill_grace_ms: 500,
            max_records: None,
            tail_capacity: 1024,
        }
    }
}

impl MonitorConfig {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// Automation agent (WebDriverAgent) configuration section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
    /// Create a session on the first action when none is open
    pub implicit_session: bool,
    /// Application to launch when a session is created
    pub bundle_id: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8100".to_string(),
            request_timeout_secs: 30,
            implicit_session: false,
            bundle_id: None,
        }
    }
}

impl AgentConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Logging configuration section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub toolchain: ToolchainConfig,
    pub monitor: MonitorConfig,
    pub agent: AgentConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.toolchain.command_timeout_secs == 0 {
            return Err(DeviceKitError::config("Command timeout must be greater than 0"));
        }

        if self.agent.request_timeout_secs == 0 {
            return Err(DeviceKitError::config("Agent request timeout must be greater than 0"));
        }

        if !(self.agent.base_url.starts_with("http://") || self.agent.base_url.starts_with("https://")) {
            return Err(DeviceKitError::config(format!(
                "Agent base URL must be http(s): {}",
                self.agent.base_url
            )));
        }

        if self.monitor.tail_capacity == 0 {
            return Err(DeviceKitError::config("Tail capacity must be greater than 0"));
        }

        if self.monitor.max_records == Some(0) {
            return Err(DeviceKitError::config("max_records must be greater than 0 when set"));
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(DeviceKitError::config(format!(
                    "Invalid logging level: {}",
                    self.logging.level
                )))
            }
        }

        Ok(())
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(bin_dir) = std::env::var("IDEVKIT_BIN_DIR") {
            self.toolchain.bin_dir = Some(PathBuf::from(bin_dir));
        }

        if let Ok(timeout_str) = std::env::var("IDEVKIT_COMMAND_TIMEOUT") {
            if let Ok(timeout) = timeout_str.parse::<u64>() {
                self.toolchain.command_timeout_secs = timeout;
            }
        }

        if let Ok(url) = std::env::var("IDEVKIT_AGENT_URL") {
            self.agent.base_url = url;
        }

        if let Ok(implicit) = std::env::var("IDEVKIT_IMPLICIT_SESSION") {
            if let Ok(implicit) = implicit.parse::<bool>() {
                self.agent.implicit_session = implicit;
            }
        }

        if let Ok(log_level) = std::env::var("IDEVKIT_LOG_LEVEL") {
            self.logging.level = log_level;
        }
    }
}

/// Configuration format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Yaml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Toml,
        }
    }
}

/// Holds the active configuration and the file it came from
#[derive(Debug, Default)]
pub struct ConfigManager {
    config: Arc<RwLock<AppConfig>>,
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Create a configuration manager with default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration manager and load from file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut manager = Self::new();
        manager.load_from_file(path).await?;
        Ok(manager)
    }

    /// Load configuration from file
    pub async fn load_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        info!("Loading configuration from: {}", path.display());

        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            DeviceKitError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let mut config = parse_config(&content, ConfigFormat::from_path(&path))?;
        config.apply_env_overrides();
        config.validate()?;

        {
            let mut current = self
                .config
                .write()
                .map_err(|_| DeviceKitError::config("Configuration lock poisoned"))?;
            *current = config;
        }

        self.config_path = Some(path);
        info!("Configuration loaded successfully");
        Ok(())
    }

    /// Save current configuration to file
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let config = self.get_config();

        let content = match ConfigFormat::from_path(path) {
            ConfigFormat::Toml => toml::to_string_pretty(&config).map_err(|e| {
                DeviceKitError::config(format!("Failed to serialize config to TOML: {}", e))
            })?,
            ConfigFormat::Yaml => serde_yaml::to_string(&config).map_err(|e| {
                DeviceKitError::config(format!("Failed to serialize config to YAML: {}", e))
            })?,
        };

        tokio::fs::write(path, content).await.map_err(|e| {
            DeviceKitError::config(format!("Failed to write config file {}: {}", path.display(), e))
        })?;

        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Get a copy of the current configuration
    pub fn get_config(&self) -> AppConfig {
        match self.config.read() {
            Ok(config) => config.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Update configuration; rejected changes leave the old value in place
    pub fn update_config<F>(&self, updater: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig) -> Result<()>,
    {
        let mut config = self
            .config
            .write()
            .map_err(|_| DeviceKitError::config("Configuration lock poisoned"))?;

        let mut candidate = config.clone();
        updater(&mut candidate)?;
        candidate.validate()?;
        *config = candidate;

        info!("Configuration updated");
        Ok(())
    }

    /// Path of the file last loaded, if any
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Reload configuration from the file it was loaded from
    pub async fn reload(&mut self) -> Result<()> {
        let path = self
            .config_path
            .clone()
            .ok_or_else(|| DeviceKitError::config("No configuration file to reload"))?;
        self.load_from_file(path).await
    }
}

/// Parse configuration text in the given format
pub fn parse_config(content: &str, format: ConfigFormat) -> Result<AppConfig> {
    match format {
        ConfigFormat::Toml => toml::from_str(content)
            .map_err(|e| DeviceKitError::config(format!("Failed to parse TOML config: {}", e))),
        ConfigFormat::Yaml => serde_yaml::from_str(content)
            .map_err(|e| DeviceKitError::config(format!("Failed to parse YAML config: {}", e))),
    }
}
