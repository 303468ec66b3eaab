// =============================================================================
// CONFIGURATION - Load settings from blit-protected.toml
// =============================================================================
//
// Every table has defaults, so a missing file or a partial file both work.
// Command-line flags are applied on top via `apply_overrides`.

use anyhow::{Context, Result};
use log::LevelFilter;
use serde::Deserialize;
use std::path::Path;

use crate::cli::Cli;

/// Default config file name, looked up in the working directory
pub const DEFAULT_CONFIG_PATH: &str = "blit-protected.toml";

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub logging: LoggingConfig,
    pub blit: BlitConfig,
}

/// Physical device selection
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Index into vkEnumeratePhysicalDevices
    pub index: usize,
    pub validation_layers: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            index: 0,
            validation_layers: false,
        }
    }
}

/// Logging settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub log_to_file: bool,
    pub log_file: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_to_file: false,
            log_file: "blit-protected.log".to_string(),
        }
    }
}

/// What the blit itself does
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BlitConfig {
    /// Passed to VkApplicationInfo
    pub app_name: String,
    /// Route the pixels through protected memory. When false an ordinary
    /// device-local image is used instead.
    pub protected: bool,
    /// Compare the read-back pixels against the input
    pub verify: bool,
}

impl Default for BlitConfig {
    fn default() -> Self {
        Self {
            app_name: "protected blit".to_string(),
            protected: true,
            verify: true,
        }
    }
}

impl Config {
    /// Load configuration, falling back to defaults on any error.
    ///
    /// The logger is configured from the result, so the fallback warning is
    /// handed back for the caller to log once logging is up.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> (Self, Option<String>) {
        let path = path.as_ref();
        match Self::load_from_path(path) {
            Ok(config) => (config, None),
            Err(e) => (
                Config::default(),
                Some(format!("Failed to load {:?}: {:#}. Using defaults.", path, e)),
            ),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Command-line flags win over the file
    pub fn apply_overrides(&mut self, cli: &Cli) {
        if let Some(index) = cli.device {
            self.device.index = index;
        }
        if cli.validation {
            self.device.validation_layers = true;
        }
        if cli.unprotected {
            self.blit.protected = false;
        }
        if cli.no_verify {
            self.blit.verify = false;
        }
    }
}

impl LoggingConfig {
    /// Parse the configured level name
    pub fn level_filter(&self) -> Result<LevelFilter> {
        let filter = match self.level.to_lowercase().as_str() {
            "off" => LevelFilter::Off,
            "error" => LevelFilter::Error,
            "warn" | "warning" => LevelFilter::Warn,
            "info" => LevelFilter::Info,
            "debug" => LevelFilter::Debug,
            "trace" => LevelFilter::Trace,
            _ => anyhow::bail!("Unknown log level '{}', defaulting to info", self.level),
        };
        Ok(filter)
    }
}
