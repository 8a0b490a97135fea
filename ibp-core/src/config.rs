//! Resource configuration
//!
//! Supports loading from TOML files and environment variables. Sizes are given
//! in megabytes and converted to bytes by [`ResourceConfig::limits`].

use crate::allocation::Reliability;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

const MB: u64 = 1024 * 1024;

/// Largest accepted checksum block size in KB
pub const MAX_CHKSUM_BLOCKSIZE_KB: u32 = 32 * 1024;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for crate::error::IbpError {
    fn from(err: ConfigError) -> Self {
        crate::error::IbpError::Configuration(err.to_string())
    }
}

/// One depot resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Resource id
    pub rid: String,

    /// Directory holding the allocations
    #[serde(default = "default_device")]
    pub device: PathBuf,

    /// Aggregate quota in MB
    #[serde(default)]
    pub max_size_mb: u64,

    /// Soft quota in MB
    #[serde(default)]
    pub soft_size_mb: u64,

    /// Hard quota in MB
    #[serde(default)]
    pub hard_size_mb: u64,

    /// Free space kept in reserve on the device, in MB
    #[serde(default)]
    pub minfree_mb: u64,

    /// Longest duration a client may request, in seconds
    #[serde(default)]
    pub max_duration: u64,

    /// Seconds between trash rescans
    #[serde(default = "default_rescan_interval")]
    pub rescan_interval: u64,

    /// Seconds between janitor passes
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,

    /// Seconds deleted allocations stay in trash
    #[serde(default = "default_delete_grace")]
    pub delete_grace_period: u64,

    /// Seconds expired allocations stay in trash
    #[serde(default = "default_expire_grace")]
    pub expire_grace_period: u64,

    /// Grace window after startup before expired allocations are trashed
    #[serde(default = "default_preexpire_grace")]
    pub preexpire_grace_period: u64,

    /// Enabled operations, e.g. "read,write,manage"
    #[serde(default = "default_mode")]
    pub mode: String,

    /// Rewrite the on-device header whenever the record changes
    #[serde(default = "default_true")]
    pub update_alloc: bool,

    /// Reserve physical space at creation
    #[serde(default)]
    pub preallocate: bool,

    #[serde(default = "default_true")]
    pub enable_read_history: bool,

    #[serde(default = "default_true")]
    pub enable_write_history: bool,

    #[serde(default = "default_true")]
    pub enable_manage_history: bool,

    #[serde(default = "default_true")]
    pub enable_alias_history: bool,

    #[serde(default)]
    pub checksum: ChecksumSettings,

    #[serde(default)]
    pub cache: CacheSettings,

    /// Byte-level limits taking precedence over the MB fields
    #[serde(skip)]
    pub limits_override: Option<ResourceLimits>,
}

/// Default checksum applied to new allocations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecksumSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_chksum_type")]
    pub kind: String,

    #[serde(default = "default_chksum_blocksize")]
    pub block_size_kb: u32,
}

impl Default for ChecksumSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: default_chksum_type(),
            block_size_kb: default_chksum_blocksize(),
        }
    }
}

/// Record cache sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_n_cache")]
    pub n_cache: u64,

    /// Seconds a cached record stays valid
    #[serde(default = "default_cache_expire")]
    pub cache_expire: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            n_cache: default_n_cache(),
            cache_expire: default_cache_expire(),
        }
    }
}

fn default_device() -> PathBuf {
    PathBuf::from("./ibp_resource")
}
fn default_rescan_interval() -> u64 {
    86400
}
fn default_cleanup_interval() -> u64 {
    500
}
fn default_delete_grace() -> u64 {
    3600
}
fn default_expire_grace() -> u64 {
    7 * 24 * 3600
}
fn default_preexpire_grace() -> u64 {
    24 * 3600
}
fn default_mode() -> String {
    "read,write,manage".to_string()
}
fn default_true() -> bool {
    true
}
fn default_chksum_type() -> String {
    "SHA256".to_string()
}
fn default_chksum_blocksize() -> u32 {
    64
}
fn default_n_cache() -> u64 {
    100_000
}
fn default_cache_expire() -> u64 {
    30
}

/// Byte quotas of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceLimits {
    pub max_total: u64,
    pub max_soft: u64,
    pub max_hard: u64,
    pub minfree: u64,
}

impl ResourceLimits {
    /// Quota of one reliability class
    pub fn class_max(&self, class: Reliability) -> u64 {
        match class {
            Reliability::Soft => self.max_soft,
            Reliability::Hard => self.max_hard,
        }
    }
}

/// Operations enabled on a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceMode {
    pub read: bool,
    pub write: bool,
    pub manage: bool,
}

impl ResourceMode {
    /// Parse a list separated by any of ` ,:|`
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut mode = Self {
            read: false,
            write: false,
            manage: false,
        };
        for token in text
            .split(|c: char| matches!(c, ' ' | ',' | ':' | '|'))
            .filter(|t| !t.is_empty())
        {
            match token.to_ascii_lowercase().as_str() {
                "read" => mode.read = true,
                "write" => mode.write = true,
                "manage" => mode.manage = true,
                other => {
                    return Err(ConfigError::ValidationError(format!(
                        "unknown mode '{}'",
                        other
                    )))
                }
            }
        }
        Ok(mode)
    }
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            rid: "0".to_string(),
            device: default_device(),
            max_size_mb: 0,
            soft_size_mb: 0,
            hard_size_mb: 0,
            minfree_mb: 0,
            max_duration: 0,
            rescan_interval: default_rescan_interval(),
            cleanup_interval: default_cleanup_interval(),
            delete_grace_period: default_delete_grace(),
            expire_grace_period: default_expire_grace(),
            preexpire_grace_period: default_preexpire_grace(),
            mode: default_mode(),
            update_alloc: true,
            preallocate: false,
            enable_read_history: true,
            enable_write_history: true,
            enable_manage_history: true,
            enable_alias_history: true,
            checksum: ChecksumSettings::default(),
            cache: CacheSettings::default(),
            limits_override: None,
        }
    }
}

impl ResourceConfig {
    /// Create a config for the given resource id and device directory
    pub fn new(rid: impl Into<String>, device: impl Into<PathBuf>) -> Self {
        Self {
            rid: rid.into(),
            device: device.into(),
            ..Default::default()
        }
    }

    /// Defaults used when formatting a new resource: 30 day duration, 10 GB minfree
    pub fn for_mkfs(rid: impl Into<String>, device: impl Into<PathBuf>, size_mb: u64) -> Self {
        Self {
            max_size_mb: size_mb,
            soft_size_mb: size_mb,
            hard_size_mb: size_mb,
            minfree_mb: 10 * 1024,
            max_duration: 30 * 24 * 3600,
            ..Self::new(rid, device)
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ResourceConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with fallback to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load resource config, using defaults");
                Self::default()
            }
        }
    }

    /// Serialize back to TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rid.is_empty() {
            return Err(ConfigError::ValidationError(
                "rid cannot be empty".to_string(),
            ));
        }

        if self.max_duration == 0 {
            return Err(ConfigError::ValidationError(
                "max_duration must be set".to_string(),
            ));
        }

        if self.checksum.block_size_kb == 0
            || self.checksum.block_size_kb > MAX_CHKSUM_BLOCKSIZE_KB
        {
            return Err(ConfigError::ValidationError(format!(
                "checksum block size {}KB outside 1..={}KB",
                self.checksum.block_size_kb, MAX_CHKSUM_BLOCKSIZE_KB
            )));
        }

        if self.cleanup_interval == 0 {
            return Err(ConfigError::ValidationError(
                "cleanup_interval cannot be 0".to_string(),
            ));
        }

        ResourceMode::parse(&self.mode)?;
        Ok(())
    }

    /// Apply environment variable overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("IBP_RESOURCE_MAX_DURATION") {
            if let Ok(secs) = v.parse::<u64>() {
                self.max_duration = secs;
            }
        }

        if let Ok(v) = std::env::var("IBP_RESOURCE_MINFREE_MB") {
            if let Ok(mb) = v.parse::<u64>() {
                self.minfree_mb = mb;
            }
        }

        if let Ok(v) = std::env::var("IBP_RESOURCE_CLEANUP_INTERVAL") {
            if let Ok(secs) = v.parse::<u64>() {
                self.cleanup_interval = secs;
            }
        }

        self
    }

    /// Byte quotas
    pub fn limits(&self) -> ResourceLimits {
        self.limits_override.unwrap_or(ResourceLimits {
            max_total: self.max_size_mb * MB,
            max_soft: self.soft_size_mb * MB,
            max_hard: self.hard_size_mb * MB,
            minfree: self.minfree_mb * MB,
        })
    }

    /// Parsed mode bits; falls back to everything enabled on a bad string
    pub fn mode(&self) -> ResourceMode {
        ResourceMode::parse(&self.mode).unwrap_or(ResourceMode {
            read: true,
            write: true,
            manage: true,
        })
    }

    /// Trash grace periods as (delete, expire)
    pub fn grace_periods(&self) -> (u64, u64) {
        (self.delete_grace_period, self.expire_grace_period)
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits_override = Some(limits);
        self
    }

    pub fn with_max_duration(mut self, secs: u64) -> Self {
        self.max_duration = secs;
        self
    }

    pub fn with_preexpire_grace(mut self, secs: u64) -> Self {
        self.preexpire_grace_period = secs;
        self
    }

    pub fn with_grace_periods(mut self, delete: u64, expire: u64) -> Self {
        self.delete_grace_period = delete;
        self.expire_grace_period = expire;
        self
    }

    pub fn with_cleanup_interval(mut self, secs: u64) -> Self {
        self.cleanup_interval = secs;
        self
    }

    pub fn with_preallocate(mut self, enabled: bool) -> Self {
        self.preallocate = enabled;
        self
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }

    /// Turn every history table on or off
    pub fn with_history(mut self, enabled: bool) -> Self {
        self.enable_read_history = enabled;
        self.enable_write_history = enabled;
        self.enable_manage_history = enabled;
        self.enable_alias_history = enabled;
        self
    }
}
