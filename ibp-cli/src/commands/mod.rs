//! CLI Commands

pub mod alloc;
pub mod mkfs;
pub mod rebuild;
pub mod trash;
pub mod usage;

use anyhow::{bail, Context, Result};
use ibp_core::ResourceConfig;
use ibp_storage::{MountOptions, Resource};
use std::path::PathBuf;
use std::sync::Arc;

/// Load the resource config named on the command line
pub fn load_config(path: Option<PathBuf>) -> Result<ResourceConfig> {
    let Some(path) = path else {
        bail!("no resource config given; pass --config or set IBP_RESOURCE_CONFIG");
    };
    let config = ResourceConfig::from_file(&path)
        .with_context(|| format!("failed to load {}", path.display()))?
        .with_env_overrides();
    Ok(config)
}

/// Mount for offline maintenance; the janitor stays off
pub fn mount(config: ResourceConfig, opts: MountOptions) -> Result<Arc<Resource>> {
    let rid = config.rid.clone();
    Resource::mount_dir(config, opts.without_janitor())
        .with_context(|| format!("failed to mount resource {}", rid))
}

/// Format bytes to human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Render an epoch timestamp in UTC
pub fn format_time(secs: u64) -> String {
    match chrono::DateTime::from_timestamp(secs as i64, 0) {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => secs.to_string(),
    }
}
