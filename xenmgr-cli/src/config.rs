//! Configuration management for the xenmgr CLI.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use xenmgr_hypervisor::{ControllerConfig, HypervisorError};

use crate::cli::Args;

/// Location tried when no `--config` is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/xenmgr/xenmgr.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hypervisor tool and controller settings
    pub xen: ControllerConfig,
    /// Machine name -> label
    pub machines: BTreeMap<String, String>,
    /// Logging settings
    pub logging: LoggingConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Emit JSON lines
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

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).with_context(|| "Failed to parse config file")
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref xm_path) = args.xm_path {
            self.xen.xm_path = xm_path.clone();
        }

        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }

        if args.json_logs {
            self.logging.json = true;
        }

        self
    }

    /// Raw label of a configured machine.
    pub fn label(&self, machine: &str) -> std::result::Result<&str, HypervisorError> {
        self.machines
            .get(machine)
            .map(String::as_str)
            .ok_or_else(|| HypervisorError::MachineNotFound(machine.to_string()))
    }
}
