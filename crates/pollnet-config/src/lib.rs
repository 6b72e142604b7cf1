//! # pollnet-config
//!
//! Configuration management for pollnet.
//!
//! Loads configuration from:
//! 1. `~/.pollnet/config.toml` (global)
//! 2. `.pollnet/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;

/// Classic `FD_SETSIZE`: the readiness primitive's per-call descriptor cap
pub const DEFAULT_MAX_SET_SIZE: usize = 1024;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap_or_else(|e| e.into_inner())
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap_or_else(|e| e.into_inner()) = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub reactor: ReactorConfig,
    pub buffer: BufferConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Global config (~/.pollnet/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                config = Self::load_file(&global_path)?;
            }
        }

        // 2. Project config (.pollnet/config.toml) - overrides global
        let project_path = Path::new(".pollnet/config.toml");
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            config.merge_toml(&std::fs::read_to_string(project_path)?)?;
        }

        // 3. Environment variable overrides
        config.apply_env_overrides();

        Ok(config)
    }

    /// Parse a single config file, defaults filling whatever it omits
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Global config path: ~/.pollnet/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".pollnet/config.toml"))
    }

    /// Overlay the keys present in `contents` onto this config.
    ///
    /// Absent keys keep their current value, so a project file only needs to
    /// name what it changes.
    pub fn merge_toml(&mut self, contents: &str) -> Result<(), ConfigError> {
        let overlay: ConfigOverlay = toml::from_str(contents)?;

        if let Some(reactor) = overlay.reactor {
            if let Some(v) = reactor.max_set_size {
                self.reactor.max_set_size = v;
            }
            if let Some(v) = reactor.idle_sleep_us {
                self.reactor.idle_sleep_us = v;
            }
            if let Some(v) = reactor.recv_chunk {
                self.reactor.recv_chunk = v;
            }
            if let Some(v) = reactor.listen_backlog {
                self.reactor.listen_backlog = v;
            }
        }
        if let Some(v) = overlay.buffer.and_then(|b| b.block_size) {
            self.buffer.block_size = v;
        }
        if let Some(v) = overlay.logging.and_then(|l| l.level) {
            self.logging.level = v;
        }
        Ok(())
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup; unparseable values are
    /// ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(n) = lookup("POLLNET_MAX_SET_SIZE").and_then(|v| v.parse().ok()) {
            self.reactor.max_set_size = n;
        }
        if let Some(n) = lookup("POLLNET_IDLE_SLEEP_US").and_then(|v| v.parse().ok()) {
            self.reactor.idle_sleep_us = n;
        }
        if let Some(n) = lookup("POLLNET_RECV_CHUNK").and_then(|v| v.parse().ok()) {
            self.reactor.recv_chunk = n;
        }
        if let Some(n) = lookup("POLLNET_BLOCK_SIZE").and_then(|v| v.parse().ok()) {
            self.buffer.block_size = n;
        }
        if let Some(level) = lookup("POLLNET_LOG") {
            if level.parse::<logging::LogLevel>().is_ok() {
                self.logging.level = level;
            }
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

/// Reactor tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    /// Max descriptors per readiness wait (clamped to FD_SETSIZE)
    pub max_set_size: usize,
    /// Upper bound on the idle sleep when nothing is registered
    pub idle_sleep_us: u64,
    /// Bytes requested per recv call
    pub recv_chunk: usize,
    /// Default listen backlog
    pub listen_backlog: i32,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            max_set_size: DEFAULT_MAX_SET_SIZE,
            idle_sleep_us: 1000,
            recv_chunk: 8 * 1024,
            listen_backlog: 5,
        }
    }
}

/// Socket buffer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Growth block size in bytes
    pub block_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            block_size: 4 * 1024,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// error, warn, info, debug or trace
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Parsed level, falling back to `Info` for unknown names
    pub fn log_level(&self) -> logging::LogLevel {
        self.level.parse().unwrap_or(logging::LogLevel::Info)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigOverlay {
    reactor: Option<ReactorOverlay>,
    buffer: Option<BufferOverlay>,
    logging: Option<LoggingOverlay>,
}

#[derive(Debug, Default, Deserialize)]
struct ReactorOverlay {
    max_set_size: Option<usize>,
    idle_sleep_us: Option<u64>,
    recv_chunk: Option<usize>,
    listen_backlog: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
struct BufferOverlay {
    block_size: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingOverlay {
    level: Option<String>,
}
