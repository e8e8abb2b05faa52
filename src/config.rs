use crate::error::{QuotaLockError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_DIR_NAME: &str = "quota-dirlock";
const CONFIG_FILE_NAME: &str = "config.toml";
const DEFAULT_BLOCKED_WARNING_THRESHOLD: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct QuotaLockConfig {
    #[serde(default)]
    pub locking: LockingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockingConfig {
    /// Enables the local storage client; without it `ls` locks are rejected.
    #[serde(default = "default_next_gen_local_storage")]
    pub next_gen_local_storage: bool,

    /// A lock blocked on at least this many others is logged as a warning.
    #[serde(default = "default_blocked_warning_threshold")]
    pub blocked_warning_threshold: usize,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            next_gen_local_storage: default_next_gen_local_storage(),
            blocked_warning_threshold: DEFAULT_BLOCKED_WARNING_THRESHOLD,
        }
    }
}

fn default_next_gen_local_storage() -> bool {
    true
}

fn default_blocked_warning_threshold() -> usize {
    DEFAULT_BLOCKED_WARNING_THRESHOLD
}

/// `<config dir>/quota-dirlock/config.toml`, or a relative path when the
/// platform has no configuration directory.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join(CONFIG_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(format!(".{CONFIG_DIR_NAME}")))
        .join(CONFIG_FILE_NAME)
}

impl QuotaLockConfig {
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            log::debug!("Config file not found at {config_path:?}, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(config_path)?;
        let config: QuotaLockConfig = toml::from_str(&contents).map_err(|e| {
            QuotaLockError::ConfigError(format!(
                "Failed to parse {}: {e}",
                config_path.display()
            ))
        })?;

        if config.locking.blocked_warning_threshold == 0 {
            return Err(QuotaLockError::ConfigError(
                "locking.blocked_warning_threshold must be at least 1".to_string(),
            ));
        }

        log::debug!("Loaded config from {config_path:?}");
        Ok(config)
    }

    pub fn save(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| QuotaLockError::ConfigError(format!("Failed to serialize config: {e}")))?;

        fs::write(config_path, contents)?;
        log::debug!("Saved config to {config_path:?}");
        Ok(())
    }
}
