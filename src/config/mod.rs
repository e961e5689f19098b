//! Configuration management for ipc-dylink
//!
//! Handles loading the TOML config shared by client processes, module hosts
//! and the admin tool. Every field has a serde default, so an empty file is a
//! valid configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::module::traits::{ModuleError, CALLING_CONVENTION};
use crate::module::tables::MANDATORY_EXPORTS;
use crate::utils::RetryConfig;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DylinkConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: Option<LoggingConfig>,

    /// Client-side registry and loader settings
    #[serde(default)]
    pub loader: LoaderConfig,

    /// Module-side service settings
    #[serde(default)]
    pub service: ServiceConfig,

    /// Per-identity spawn settings
    #[serde(default)]
    pub modules: HashMap<String, ModuleEntry>,
}

impl DylinkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ModuleError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ModuleError::ConfigError(format!(
                "Failed to read config file {:?}: {}",
                path.as_ref(),
                e
            ))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, ModuleError> {
        let config: DylinkConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ModuleError> {
        self.loader.validate()?;
        self.service.validate()
    }

    /// Filter from the `[logging]` section, if one is set
    pub fn log_filter(&self) -> Option<&str> {
        self.logging.as_ref().and_then(|l| l.filter.as_deref())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter (e.g. "info", "ipc_dylink=debug"); RUST_LOG takes precedence
    #[serde(default)]
    pub filter: Option<String>,

    /// Emit JSON lines (requires the `json-logging` feature)
    #[serde(default)]
    pub json_format: bool,
}

/// Bounded poll budget as written in config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    pub max_attempts: u32,
    pub delay_millis: u64,
}

impl PollConfig {
    pub fn to_retry(&self) -> RetryConfig {
        RetryConfig::fixed(self.max_attempts, Duration::from_millis(self.delay_millis))
    }
}

fn default_discovery_poll() -> PollConfig {
    PollConfig {
        max_attempts: 50,
        delay_millis: 100,
    }
}

fn default_release_poll() -> PollConfig {
    PollConfig {
        max_attempts: 10,
        delay_millis: 50,
    }
}

fn default_channel_dir() -> String {
    std::env::temp_dir()
        .join("ipc-dylink")
        .to_string_lossy()
        .to_string()
}

fn default_modules_dir() -> String {
    "modules".to_string()
}

fn default_calling_convention() -> u32 {
    CALLING_CONVENTION
}

fn default_mandatory_capabilities() -> Vec<String> {
    MANDATORY_EXPORTS.iter().map(|s| s.to_string()).collect()
}

fn default_max_modules() -> usize {
    32
}

/// Client registry and loader configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Directory holding the rendezvous sockets
    #[serde(default = "default_channel_dir")]
    pub channel_dir: String,

    /// Directory searched for module executables without an explicit entry
    #[serde(default = "default_modules_dir")]
    pub modules_dir: String,

    /// Tag sent with every Open
    #[serde(default = "default_calling_convention")]
    pub calling_convention: u32,

    /// Capabilities every module must export to be loadable
    #[serde(default = "default_mandatory_capabilities")]
    pub mandatory_capabilities: Vec<String>,

    /// Registry slot capacity
    #[serde(default = "default_max_modules")]
    pub max_modules: usize,

    /// Budget for a spawned module to publish its channel
    #[serde(default = "default_discovery_poll")]
    pub discovery: PollConfig,

    /// Budget for Close/Kill acknowledgments
    #[serde(default = "default_release_poll")]
    pub release: PollConfig,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            channel_dir: default_channel_dir(),
            modules_dir: default_modules_dir(),
            calling_convention: CALLING_CONVENTION,
            mandatory_capabilities: default_mandatory_capabilities(),
            max_modules: default_max_modules(),
            discovery: default_discovery_poll(),
            release: default_release_poll(),
        }
    }
}

impl LoaderConfig {
    /// Loader defaults rooted at `channel_dir`
    pub fn with_channel_dir<P: AsRef<Path>>(channel_dir: P) -> Self {
        Self {
            channel_dir: channel_dir.as_ref().to_string_lossy().to_string(),
            ..Self::default()
        }
    }

    pub fn channel_dir(&self) -> PathBuf {
        PathBuf::from(&self.channel_dir)
    }

    pub fn validate(&self) -> Result<(), ModuleError> {
        if self.max_modules == 0 {
            return Err(ModuleError::ConfigError(
                "loader.max_modules must be at least 1".to_string(),
            ));
        }
        if self.discovery.max_attempts == 0 || self.release.max_attempts == 0 {
            return Err(ModuleError::ConfigError(
                "loader poll budgets need at least one attempt".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_max_open_count() -> u32 {
    1024
}

fn default_queue_depth() -> usize {
    64
}

fn default_reply_timeout_millis() -> u64 {
    1000
}

/// Module service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Tag this module accepts at Open
    #[serde(default = "default_calling_convention")]
    pub calling_convention: u32,

    /// Open references beyond this are rejected as resource exhaustion
    #[serde(default = "default_max_open_count")]
    pub max_open_count: u32,

    /// Inbound request queue between connection readers and the loop
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Upper bound on writing one reply
    #[serde(default = "default_reply_timeout_millis")]
    pub reply_timeout_millis: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            calling_convention: CALLING_CONVENTION,
            max_open_count: default_max_open_count(),
            queue_depth: default_queue_depth(),
            reply_timeout_millis: default_reply_timeout_millis(),
        }
    }
}

impl ServiceConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_millis)
    }

    pub fn validate(&self) -> Result<(), ModuleError> {
        if self.queue_depth == 0 {
            return Err(ModuleError::ConfigError(
                "service.queue_depth must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// How to start the module for one identity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleEntry {
    /// Executable path; defaults to `<modules_dir>/<identity>`
    #[serde(default)]
    pub executable: Option<String>,

    /// Extra arguments appended after the standard ones
    #[serde(default)]
    pub args: Vec<String>,
}
