//! Configuration management.

use crate::error::{Result, StagecraftError};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Persistent configuration for the stage conveyor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Container engine: "docker" or "buildah".
    pub backend: String,
    /// Stage storage address; a directory path or ":memory:".
    pub storage_address: String,
    pub lock_dir: String,
    /// How long a builder waits for a stage lock before giving up.
    pub lock_timeout_secs: u64,
    /// Age past which a held lock file is reported as stale.
    pub lock_stale_secs: u64,
    pub max_concurrent_stages: u32,
    /// Include file mode bits in context checksums.
    pub checksum_mode_bits: bool,
    pub introspect_before_error: bool,
    pub introspect_after_error: bool,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: "docker".to_string(),
            storage_address: paths::data_dir().join("stages").to_string_lossy().to_string(),
            lock_dir: paths::locks_dir().to_string_lossy().to_string(),
            lock_timeout_secs: 300,
            lock_stale_secs: 3600,
            max_concurrent_stages: 4,
            checksum_mode_bits: false,
            introspect_before_error: false,
            introspect_after_error: false,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        paths::config_dir().join("config.json")
    }

    /// Load configuration from disk.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| StagecraftError::InvalidConfig {
            reason: format!("Failed to read config: {}", e),
        })?;
        let config: Config =
            serde_json::from_str(&content).map_err(|e| StagecraftError::InvalidConfig {
                reason: format!("Failed to parse config: {}", e),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to disk.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StagecraftError::Io { path: parent.to_path_buf(), source: e })?;
        }
        let content =
            serde_json::to_string_pretty(self).map_err(|e| StagecraftError::InvalidConfig {
                reason: format!("Failed to serialize config: {}", e),
            })?;
        std::fs::write(&path, content).map_err(|e| StagecraftError::Io { path, source: e })
    }

    pub fn validate(&self) -> Result<()> {
        match self.backend.as_str() {
            "docker" | "buildah" => {}
            other => {
                return Err(StagecraftError::InvalidConfig {
                    reason: format!("unknown backend {other:?}, expected docker or buildah"),
                })
            }
        }
        if self.lock_timeout_secs == 0 {
            return Err(StagecraftError::InvalidConfig {
                reason: "lock_timeout_secs must be positive".to_string(),
            });
        }
        if self.max_concurrent_stages == 0 {
            return Err(StagecraftError::InvalidConfig {
                reason: "max_concurrent_stages must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_secs)
    }
}
