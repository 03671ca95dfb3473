//! Configuration file handling for epc

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the CLI tool
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Default CAN interface
    pub interface: Option<String>,
    /// Default device manifest
    pub manifest: Option<PathBuf>,
    /// Disable colored output
    pub no_color: Option<bool>,
}

impl Config {
    /// Load configuration from the default config file
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Get the default config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("epc");

        Ok(config_dir.join("config.toml"))
    }

    /// Merge CLI arguments over config file values
    pub fn merge_with_args(
        &self,
        interface: Option<&str>,
        manifest: Option<&Path>,
        no_color: bool,
    ) -> MergedConfig {
        MergedConfig {
            interface: interface
                .map(String::from)
                .or_else(|| self.interface.clone()),
            manifest: manifest
                .map(Path::to_path_buf)
                .or_else(|| self.manifest.clone()),
            no_color: no_color || self.no_color.unwrap_or(false),
        }
    }
}

/// Fully resolved configuration after merging CLI args
#[derive(Debug, Clone)]
pub struct MergedConfig {
    pub interface: Option<String>,
    pub manifest: Option<PathBuf>,
    pub no_color: bool,
}

impl MergedConfig {
    pub fn require_manifest(&self) -> Result<&Path> {
        self.manifest
            .as_deref()
            .context("No device manifest given (use --manifest or set it in the config file)")
    }

    pub fn require_interface(&self) -> Result<&str> {
        self.interface
            .as_deref()
            .context("No CAN interface given (use --interface or set it in the config file)")
    }
}
