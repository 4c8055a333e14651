//! # warden-config
//!
//! Configuration management for warden.
//!
//! Loads configuration from:
//! 1. `~/.warden/config.toml` (global)
//! 2. `.warden/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap()
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap() = new_config;
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
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub queue: QueueConfig,
    pub tracker: TrackerConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Load global config (~/.warden/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                config = Self::load_file(&global_path)?;
            }
        }

        // 2. Load project config (.warden/config.toml) - overrides global
        let project_path = Path::new(".warden/config.toml");
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            config = Self::load_file(project_path)?;
        }

        // 3. Apply environment variable overrides
        config.apply_env_overrides();

        Ok(config)
    }

    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Global config path: ~/.warden/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".warden/config.toml"))
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(mb) = std::env::var("WARDEN_QUEUE_MB") {
            if let Ok(mb) = mb.parse() {
                self.queue.size_mb = mb;
            }
        }
        if let Ok(count) = std::env::var("WARDEN_QUEUES_PER_CLIENT") {
            if let Ok(count) = count.parse() {
                self.queue.queues_per_client = count;
            }
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap()
    }
}

/// Report queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Per-queue memory budget in MiB
    pub size_mb: u32,
    /// Queues allocated per connecting client
    pub queues_per_client: u32,
}

impl QueueConfig {
    /// Upper bound a client may request
    pub const MAX_SIZE_MB: u32 = 2048;
    pub const DEFAULT_SIZE_MB: u32 = 16;

    /// Effective memory budget: zero or oversized requests fall back to the
    /// default, as the client cannot be trusted to size kernel memory.
    pub fn effective_size_mb(&self) -> u32 {
        if self.size_mb == 0 || self.size_mb > Self::MAX_SIZE_MB {
            Self::DEFAULT_SIZE_MB
        } else {
            self.size_mb
        }
    }

    /// Number of fixed-size records the budget holds.
    pub fn entry_count(&self, entry_size: usize) -> u32 {
        ((self.effective_size_mb() as usize * 1024 * 1024) / entry_size) as u32
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            size_mb: Self::DEFAULT_SIZE_MB,
            queues_per_client: 1,
        }
    }
}

/// Process tracker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Emit process-lifetime reports (fork/exec/exit) in addition to file
    /// accesses
    pub report_process_lifetime: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            report_process_lifetime: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.queue.size_mb, QueueConfig::DEFAULT_SIZE_MB);
        assert_eq!(config.queue.queues_per_client, 1);
        assert!(config.tracker.report_process_lifetime);
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(toml_str.contains("[queue]"));
        assert!(toml_str.contains("[tracker]"));
        assert!(toml_str.contains("size_mb"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.queue.size_mb, parsed.queue.size_mb);
    }

    #[test]
    fn test_size_clamping() {
        let mut queue = QueueConfig::default();
        queue.size_mb = 0;
        assert_eq!(queue.effective_size_mb(), QueueConfig::DEFAULT_SIZE_MB);
        queue.size_mb = QueueConfig::MAX_SIZE_MB + 1;
        assert_eq!(queue.effective_size_mb(), QueueConfig::DEFAULT_SIZE_MB);
        queue.size_mb = 256;
        assert_eq!(queue.effective_size_mb(), 256);
    }

    #[test]
    fn test_entry_count_from_budget() {
        let queue = QueueConfig {
            size_mb: 16,
            queues_per_client: 1,
        };
        // 16 MiB of 1064-byte records.
        assert_eq!(queue.entry_count(1064), (16 * 1024 * 1024 / 1064) as u32);
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[queue]\nsize_mb = 64\nqueues_per_client = 3\n").unwrap();
        let config = Config::load_file(&path).unwrap();
        assert_eq!(config.queue.size_mb, 64);
        assert_eq!(config.queue.queues_per_client, 3);
        // Unspecified sections keep their defaults.
        assert!(config.tracker.report_process_lifetime);
    }
}
