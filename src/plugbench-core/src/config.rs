use crate::paths::AppDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const CURRENT_CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_config_version")]
    pub config_version: u32,
    /// Directory scanned for plugin folders; the `--plugins-dir` flag takes precedence.
    #[serde(default)]
    pub plugins_dir: Option<PathBuf>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub validator: ValidatorSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            plugins_dir: None,
            logging: LoggingConfig::default(),
            engine: EngineSettings::default(),
            validator: ValidatorSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    #[serde(default = "default_max_log_files")]
    pub max_log_files: usize,
    /// Mirror log lines to stderr in addition to the rolling file.
    #[serde(default)]
    pub console: bool,
    #[serde(default)]
    pub file_name: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_log_files: default_max_log_files(),
            console: false,
            file_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Engine knobs. Durations are in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    pub timeout_ms: u64,
    pub watch_plugins: bool,
    pub watch_interval_ms: u64,
    pub watch_debounce_ms: u64,
    pub max_turns: u32,
    pub mcp_grace_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            watch_plugins: true,
            watch_interval_ms: 2_000,
            watch_debounce_ms: 1_000,
            max_turns: 3,
            mcp_grace_ms: 5_000,
        }
    }
}

/// Validator windows and call budgets. Durations are in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ValidatorSettings {
    pub heartbeat_window_ms: u64,
    pub ping_interval_ms: u64,
    pub repeat_calls: u32,
    pub rapid_calls: u32,
    pub sustained_window_ms: u64,
    pub sustained_pace_ms: u64,
    pub mcp_discovery_wait_ms: u64,
    pub call_timeout_ms: u64,
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        Self {
            heartbeat_window_ms: 10_000,
            ping_interval_ms: 1_000,
            repeat_calls: 3,
            rapid_calls: 10,
            sustained_window_ms: 10_000,
            sustained_pace_ms: 300,
            mcp_discovery_wait_ms: 10_000,
            call_timeout_ms: 15_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("config validation failed: {0}")]
    Validation(ValidationError),
    #[error("failed to prepare configuration directories: {0}")]
    Directories(#[from] crate::paths::DirsError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unsupported config_version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("{field} must be greater than zero")]
    NonPositive { field: &'static str },
}

impl Config {
    pub fn load_or_default(dirs: &AppDirs) -> Result<Self, ConfigError> {
        dirs.ensure_exists()?;
        let path = Self::config_path(dirs);
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate().map_err(ConfigError::Validation)?;
        Ok(config)
    }

    pub fn config_path(dirs: &AppDirs) -> PathBuf {
        dirs.config_dir().join("config.toml")
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.config_version != CURRENT_CONFIG_VERSION {
            return Err(ValidationError::UnsupportedVersion {
                found: self.config_version,
                expected: CURRENT_CONFIG_VERSION,
            });
        }

        let engine = &self.engine;
        let validator = &self.validator;
        let positive = [
            ("engine.timeout_ms", engine.timeout_ms),
            ("engine.watch_interval_ms", engine.watch_interval_ms),
            ("engine.max_turns", u64::from(engine.max_turns)),
            ("validator.ping_interval_ms", validator.ping_interval_ms),
            ("validator.repeat_calls", u64::from(validator.repeat_calls)),
            ("validator.rapid_calls", u64::from(validator.rapid_calls)),
            ("validator.sustained_pace_ms", validator.sustained_pace_ms),
            ("validator.call_timeout_ms", validator.call_timeout_ms),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ValidationError::NonPositive { field: *field });
        }
        Ok(())
    }
}

fn default_config_version() -> u32 {
    CURRENT_CONFIG_VERSION
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_max_log_files() -> usize {
    7
}
