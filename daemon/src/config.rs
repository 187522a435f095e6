// Daemon configuration.
//
// Defaults first, then an optional JSON file (FIREWALLD_CONFIG), then
// individual FIREWALLD_* environment variables on top.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{DaemonError, DaemonResult};
use crate::refresh::SchedulerConfig;

pub const DEFAULT_ADMIN_CHANNEL_SIZE: usize = 64;
pub const DEFAULT_RESOLUTION_CHANNEL_SIZE: usize = 256;

// ================================================================================================
// STORAGE CONFIGURATION
// ================================================================================================

/// Where profile snapshots are kept
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the snapshot database (SQLite)
    pub snapshot_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            snapshot_path: PathBuf::from("./var/data/firewall_profiles.db"),
        }
    }
}

// ================================================================================================
// DAEMON CONFIGURATION
// ================================================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
    /// Block list file, one entry per line
    pub block_list_path: Option<PathBuf>,
    /// Allow list file, one entry per line
    pub allow_list_path: Option<PathBuf>,
    /// Extra list files merged into the block list at startup
    pub extra_block_lists: Vec<PathBuf>,
    pub admin_channel_size: usize,
    pub resolution_channel_size: usize,
    /// Disabled rules older than this are removed by an aggressive cleanup
    pub stale_rule_retention_days: i64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            scheduler: SchedulerConfig::default(),
            block_list_path: None,
            allow_list_path: None,
            extra_block_lists: Vec::new(),
            admin_channel_size: DEFAULT_ADMIN_CHANNEL_SIZE,
            resolution_channel_size: DEFAULT_RESOLUTION_CHANNEL_SIZE,
            stale_rule_retention_days: policy_core::DEFAULT_STALE_RETENTION_DAYS,
        }
    }
}

impl DaemonConfig {
    /// Reads a JSON config file; absent keys keep their defaults
    pub fn from_file(path: impl AsRef<Path>) -> DaemonResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: DaemonConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Builds the configuration from the process environment
    pub fn from_env() -> DaemonResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> DaemonResult<Self> {
        let mut config = match lookup("FIREWALLD_CONFIG") {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        if let Some(path) = lookup("FIREWALLD_SNAPSHOT_PATH") {
            config.storage.snapshot_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("FIREWALLD_BLOCK_LIST") {
            config.block_list_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("FIREWALLD_ALLOW_LIST") {
            config.allow_list_path = Some(PathBuf::from(path));
        }
        if let Some(secs) = lookup("FIREWALLD_REFRESH_SECS") {
            config.scheduler.refresh_interval =
                std::time::Duration::from_secs(parse_var("FIREWALLD_REFRESH_SECS", &secs)?);
        }
        if let Some(secs) = lookup("FIREWALLD_SNAPSHOT_SECS") {
            config.scheduler.snapshot_interval =
                std::time::Duration::from_secs(parse_var("FIREWALLD_SNAPSHOT_SECS", &secs)?);
        }
        if let Some(enabled) = lookup("FIREWALLD_SCHEDULER_ENABLED") {
            config.scheduler.enabled = parse_var("FIREWALLD_SCHEDULER_ENABLED", &enabled)?;
        }
        if let Some(days) = lookup("FIREWALLD_RETENTION_DAYS") {
            config.stale_rule_retention_days = parse_var("FIREWALLD_RETENTION_DAYS", &days)?;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> DaemonResult<()> {
        if self.scheduler.refresh_interval.is_zero() || self.scheduler.snapshot_interval.is_zero() {
            return Err(DaemonError::Config("scheduler intervals must be non-zero".to_string()));
        }
        if self.admin_channel_size == 0 || self.resolution_channel_size == 0 {
            return Err(DaemonError::Config("channel sizes must be non-zero".to_string()));
        }
        if self.stale_rule_retention_days < 0 {
            return Err(DaemonError::Config("retention must not be negative".to_string()));
        }
        Ok(())
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.stale_rule_retention_days)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> DaemonResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| DaemonError::Config(format!("{}={:?} is not valid", key, value)))
}
